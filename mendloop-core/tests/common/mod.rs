#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mendloop_core::config::{EngineConfig, MetricsConfig};
use mendloop_core::history::MemoryHistoryStore;
use mendloop_core::lock::LocalLockManager;
use mendloop_core::test_helpers::{processor, RecordingHost};
use mendloop_core::{
    ActorService, ControlLoopEvent, EngineServices, EventManager, Policy, TransactionMetrics,
};
use mendloop_sim::{register_all, Scenario, SimulatedActor};

pub use mendloop_core::test_helpers::{vm_event, vm_event_for, vm_policy, vnf_name_event, VM_NAME};

/// Engine wired to simulated actors, a shared lock table and an in-memory history.
pub struct TestEngine {
    pub services: EngineServices,
    pub history: Arc<MemoryHistoryStore>,
    pub locks: LocalLockManager,
    pub metrics: Arc<TransactionMetrics>,
    calls: HashMap<String, Arc<AtomicUsize>>,
}

impl TestEngine {
    pub fn new(scenario: &Scenario, guard_enabled: bool) -> Self {
        let mut actors = ActorService::new();
        let mut calls = HashMap::new();
        for script in &scenario.actors {
            let actor = Arc::new(SimulatedActor::new(script));
            calls.insert(script.name.clone(), actor.calls());
            actors.register_arc(actor).unwrap();
        }
        let rest = Scenario {
            actors: Vec::new(),
            ..scenario.clone()
        };
        register_all(&mut actors, &rest).unwrap();

        let history = Arc::new(MemoryHistoryStore::new());
        let locks = LocalLockManager::new();
        let metrics = Arc::new(TransactionMetrics::new(&MetricsConfig::default()).unwrap());
        let services = EngineServices::new(actors)
            .with_history(history.clone())
            .with_lock_manager(Arc::new(locks.clone()))
            .with_metrics(metrics.clone())
            .with_config(EngineConfig {
                guard_enabled,
                ..EngineConfig::default()
            });

        Self {
            services,
            history,
            locks,
            metrics,
            calls,
        }
    }

    /// Calls started through a scripted actor.
    pub fn calls(&self, actor: &str) -> usize {
        self.calls
            .get(actor)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Creates, registers and starts a manager for `event`.
    pub fn launch(
        &self,
        policies: Vec<Policy>,
        event: ControlLoopEvent,
        timeout: Option<u64>,
    ) -> (Arc<EventManager>, Arc<RecordingHost>) {
        let manager = EventManager::new(
            self.services.clone(),
            Box::new(processor(policies, timeout)),
            event,
        )
        .unwrap();
        let host = RecordingHost::new();
        manager.register(host.clone());
        manager.start().unwrap();
        (manager, host)
    }
}
