//! Test helpers for engine tests
//!
//! Available to this crate's unit tests and, through the `test-helpers`
//! feature, to downstream crates.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::actor::{Actor, Operation, OperationParams};
use crate::error::{MendloopError, MendloopResult};
use crate::event::{keys, ControlLoopEvent};
use crate::notification::{ControlLoopHost, ControlLoopNotification};
use crate::outcome::OperationOutcome;
use crate::policy::{ControlLoopDefinition, ControlLoopProcessor, ControlLoopSpec, Policy};
use crate::types::{NotificationType, TargetType};

pub const CONTROL_LOOP: &str = "cl-test";
pub const VM_NAME: &str = "vm-01";
pub const VNF_NAME: &str = "vnf-name-01";

/// Onset for a VM identified by vserver name.
pub fn vm_event() -> ControlLoopEvent {
    vm_event_for(Uuid::new_v4(), VM_NAME)
}

pub fn vm_event_for(request_id: Uuid, vm_name: &str) -> ControlLoopEvent {
    let mut aai = BTreeMap::new();
    aai.insert(keys::VSERVER_VSERVER_NAME.to_string(), vm_name.to_string());
    ControlLoopEvent::onset(
        CONTROL_LOOP,
        request_id,
        keys::VSERVER_VSERVER_NAME,
        TargetType::Vm,
        aai,
    )
}

/// Onset for a VNF known only by name, so the id has to be queried.
pub fn vnf_name_event() -> ControlLoopEvent {
    let mut aai = BTreeMap::new();
    aai.insert(keys::GENERIC_VNF_VNF_NAME.to_string(), VNF_NAME.to_string());
    ControlLoopEvent::onset(
        CONTROL_LOOP,
        Uuid::new_v4(),
        keys::GENERIC_VNF_VNF_NAME,
        TargetType::Vnf,
        aai,
    )
}

/// `APPC Restart` on a VM.
pub fn vm_policy(retries: i32) -> Policy {
    Policy::new("restart", "APPC", "Restart")
        .with_target(TargetType::Vm)
        .with_retries(retries)
        .with_timeout(60)
}

/// Processor whose chain is the given policies, triggered by the first.
pub fn processor(policies: Vec<Policy>, timeout: Option<u64>) -> ControlLoopProcessor {
    let trigger = policies
        .first()
        .map(|p| p.id.clone())
        .unwrap_or_else(|| "final_success".to_string());
    let definition = ControlLoopDefinition {
        control_loop: ControlLoopSpec {
            name: CONTROL_LOOP.to_string(),
            version: Some("1.0.0".to_string()),
            timeout,
            trigger_policy: trigger,
            abatement: false,
        },
        policies,
    };
    match ControlLoopProcessor::new(definition) {
        Ok(processor) => processor,
        Err(e) => panic!("invalid test definition: {}", e),
    }
}

/// Host that records every notification and state change.
#[derive(Default)]
pub struct RecordingHost {
    notifications: Mutex<Vec<ControlLoopNotification>>,
    state_changes: AtomicUsize,
    changed: Notify,
    fail_delivery: bool,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A host whose deliveries always fail.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_delivery: true,
            ..Self::default()
        })
    }

    pub fn notifications(&self) -> Vec<ControlLoopNotification> {
        self.notifications.lock().clone()
    }

    pub fn types(&self) -> Vec<NotificationType> {
        self.notifications
            .lock()
            .iter()
            .map(|n| n.notification)
            .collect()
    }

    pub fn state_changes(&self) -> usize {
        self.state_changes.load(Ordering::SeqCst)
    }

    /// Waits until a notification matching `pred` has been delivered.
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> Option<ControlLoopNotification>
    where
        F: Fn(&ControlLoopNotification) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(found) = self.notifications.lock().iter().find(|n| pred(n)) {
                    return found.clone();
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Waits for the FINAL_* notification.
    pub async fn wait_for_final(&self) -> Option<ControlLoopNotification> {
        self.wait_for(|n| n.notification.is_final(), Duration::from_secs(30))
            .await
    }
}

impl ControlLoopHost for RecordingHost {
    fn deliver(&self, notification: ControlLoopNotification) -> MendloopResult<()> {
        if self.fail_delivery {
            self.changed.notify_waiters();
            return Err(MendloopError::Internal {
                message: "delivery refused".to_string(),
            });
        }
        self.notifications.lock().push(notification);
        self.changed.notify_waiters();
        Ok(())
    }

    fn state_changed(&self, _request_id: Uuid) {
        self.state_changes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Behaviour of one scripted operation.
#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed,
    Fail,
    Error(String),
    /// Never completes.
    Hang,
    /// Succeeds carrying a response body.
    Respond(serde_json::Value),
    /// Completes as `Succeed`/`Fail` after a delay.
    After(Duration, bool),
}

/// Actor that plays back a script, one entry per built operation.
pub struct ScriptedActor {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    starts: Arc<AtomicUsize>,
}

impl ScriptedActor {
    /// Succeeds every time.
    pub fn new(name: &str) -> Self {
        Self::always(name, Scripted::Succeed)
    }

    pub fn always(name: &str, behaviour: Scripted) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: behaviour,
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queues `behaviour` ahead of the fallback.
    pub fn then(self, behaviour: Scripted) -> Self {
        self.script.lock().push_back(behaviour);
        self
    }

    /// Counter of operations started through this actor.
    pub fn starts(&self) -> Arc<AtomicUsize> {
        self.starts.clone()
    }
}

impl Actor for ScriptedActor {
    fn name(&self) -> &str {
        &self.name
    }

    fn operation_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn build_operation(&self, params: OperationParams) -> MendloopResult<Arc<dyn Operation>> {
        let behaviour = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(Arc::new(ScriptedOperation {
            params,
            behaviour,
            starts: self.starts.clone(),
        }))
    }
}

struct ScriptedOperation {
    params: OperationParams,
    behaviour: Scripted,
    starts: Arc<AtomicUsize>,
}

#[async_trait]
impl Operation for ScriptedOperation {
    fn actor_name(&self) -> &str {
        &self.params.actor
    }

    fn name(&self) -> &str {
        &self.params.operation
    }

    fn target_entity(&self) -> &str {
        &self.params.target_entity
    }

    async fn start(&self) -> MendloopResult<OperationOutcome> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.params.make_outcome();
        match &self.behaviour {
            Scripted::Succeed => Ok(outcome.succeeded()),
            Scripted::Fail => Ok(outcome.failed()),
            Scripted::Error(details) => Err(MendloopError::OperationFailed {
                actor: self.params.actor.clone(),
                operation: self.params.operation.clone(),
                details: details.clone(),
            }),
            Scripted::Hang => {
                futures::future::pending::<()>().await;
                Ok(outcome.failed())
            }
            Scripted::Respond(body) => Ok(outcome.with_response(body.clone()).succeeded()),
            Scripted::After(delay, succeed) => {
                tokio::time::sleep(*delay).await;
                Ok(if *succeed {
                    outcome.succeeded()
                } else {
                    outcome.failed()
                })
            }
        }
    }
}
