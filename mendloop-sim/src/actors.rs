//! Simulated remediation actors, guard and enrichment query

use async_trait::async_trait;
use mendloop_core::actor::{
    Actor, Operation, OperationParams, AAI_ACTOR, CUSTOM_QUERY_OPERATION, GUARD_ACTOR,
    GUARD_OPERATION,
};
use mendloop_core::error::{MendloopError, MendloopResult};
use mendloop_core::event::keys;
use mendloop_core::outcome::OperationOutcome;
use mendloop_core::types::OperationResult;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::scenario::{ActorScript, AaiScript, Decision, GuardScript, SimResult, SimStep};

/// Plays back one sequence per key, repeating the last entry.
struct Playback<T: Clone> {
    sequences: Mutex<HashMap<String, VecDeque<T>>>,
}

impl<T: Clone> Playback<T> {
    fn new(sequences: impl IntoIterator<Item = (String, Vec<T>)>) -> Self {
        Self {
            sequences: Mutex::new(
                sequences
                    .into_iter()
                    .map(|(key, steps)| (key, steps.into_iter().collect()))
                    .collect(),
            ),
        }
    }

    fn next(&self, key: &str) -> Option<T> {
        let mut sequences = self.sequences.lock();
        let steps = sequences.get_mut(key)?;
        if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        }
    }
}

/// Actor whose operations follow a scenario script.
pub struct SimulatedActor {
    name: String,
    operations: Vec<String>,
    playback: Playback<SimStep>,
    default: SimStep,
    calls: Arc<AtomicUsize>,
}

impl SimulatedActor {
    pub fn new(script: &ActorScript) -> Self {
        Self {
            name: script.name.clone(),
            operations: script.operations.keys().cloned().collect(),
            playback: Playback::new(script.operations.clone()),
            default: script.default.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of started calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Actor for SimulatedActor {
    fn name(&self) -> &str {
        &self.name
    }

    fn operation_names(&self) -> Vec<String> {
        self.operations.clone()
    }

    fn build_operation(&self, params: OperationParams) -> MendloopResult<Arc<dyn Operation>> {
        let step = self
            .playback
            .next(&params.operation)
            .unwrap_or_else(|| self.default.clone());
        Ok(Arc::new(SimulatedOperation {
            params,
            step,
            calls: self.calls.clone(),
        }))
    }
}

struct SimulatedOperation {
    params: OperationParams,
    step: SimStep,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Operation for SimulatedOperation {
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
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            actor = %self.params.actor,
            operation = %self.params.operation,
            target = %self.params.target_entity,
            call,
            result = ?self.step.result,
            "Simulated call"
        );
        if let Some(delay) = self.step.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .params
            .make_outcome()
            .with_subrequest_id(call.to_string());
        let outcome = match self.step.result {
            SimResult::Success => outcome.succeeded(),
            SimResult::Failure => outcome.failed(),
            SimResult::Error => {
                return Err(MendloopError::OperationFailed {
                    actor: self.params.actor.clone(),
                    operation: self.params.operation.clone(),
                    details: self
                        .step
                        .message
                        .clone()
                        .unwrap_or_else(|| "simulated error".to_string()),
                })
            }
            SimResult::Hang => {
                std::future::pending::<()>().await;
                outcome.failed()
            }
        };
        Ok(match &self.step.message {
            Some(message) => outcome.complete(outcome_result(self.step.result), message.clone()),
            None => outcome,
        })
    }
}

fn outcome_result(result: SimResult) -> OperationResult {
    match result {
        SimResult::Success => OperationResult::Success,
        _ => OperationResult::Failure,
    }
}

/// Guard answering from a scripted decision list.
pub struct SimulatedGuard {
    playback: Playback<Decision>,
    delay: Option<Duration>,
}

impl SimulatedGuard {
    pub fn new(script: &GuardScript) -> Self {
        let decisions = if script.decisions.is_empty() {
            vec![Decision::Permit]
        } else {
            script.decisions.clone()
        };
        Self {
            playback: Playback::new([(GUARD_OPERATION.to_string(), decisions)]),
            delay: script.delay,
        }
    }
}

impl Actor for SimulatedGuard {
    fn name(&self) -> &str {
        GUARD_ACTOR
    }

    fn operation_names(&self) -> Vec<String> {
        vec![GUARD_OPERATION.to_string()]
    }

    fn build_operation(&self, params: OperationParams) -> MendloopResult<Arc<dyn Operation>> {
        let decision = self
            .playback
            .next(&params.operation)
            .ok_or_else(|| MendloopError::OperationNotSupported {
                actor: params.actor.clone(),
                operation: params.operation.clone(),
            })?;
        Ok(Arc::new(GuardDecision {
            params,
            decision,
            delay: self.delay,
        }))
    }
}

struct GuardDecision {
    params: OperationParams,
    decision: Decision,
    delay: Option<Duration>,
}

#[async_trait]
impl Operation for GuardDecision {
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
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.params.make_outcome();
        debug!(
            actor = ?self.params.payload.get("actor"),
            operation = ?self.params.payload.get("operation"),
            decision = ?self.decision,
            "Guard decision"
        );
        Ok(match self.decision {
            Decision::Permit => outcome.complete(OperationResult::Success, "Permit"),
            Decision::Deny => outcome.complete(OperationResult::Failure, "Deny"),
        })
    }
}

/// Enrichment service answering VNF custom queries.
pub struct SimulatedAai {
    vnf_id: Option<String>,
}

impl SimulatedAai {
    pub fn new(script: &AaiScript) -> Self {
        Self {
            vnf_id: script.vnf_id.clone(),
        }
    }
}

impl Actor for SimulatedAai {
    fn name(&self) -> &str {
        AAI_ACTOR
    }

    fn operation_names(&self) -> Vec<String> {
        vec![CUSTOM_QUERY_OPERATION.to_string()]
    }

    fn build_operation(&self, params: OperationParams) -> MendloopResult<Arc<dyn Operation>> {
        if params.operation != CUSTOM_QUERY_OPERATION {
            return Err(MendloopError::OperationNotSupported {
                actor: params.actor,
                operation: params.operation,
            });
        }
        Ok(Arc::new(CustomQuery {
            params,
            vnf_id: self.vnf_id.clone(),
        }))
    }
}

struct CustomQuery {
    params: OperationParams,
    vnf_id: Option<String>,
}

#[async_trait]
impl Operation for CustomQuery {
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
        let mut response = BTreeMap::new();
        if let Some(vnf_name) = self.params.enrichment.get(keys::GENERIC_VNF_VNF_NAME) {
            response.insert(keys::GENERIC_VNF_VNF_NAME.to_string(), vnf_name.clone());
        }
        if let Some(vnf_id) = &self.vnf_id {
            response.insert(keys::GENERIC_VNF_VNF_ID.to_string(), vnf_id.clone());
        }
        Ok(self
            .params
            .make_outcome()
            .with_response(json!(response))
            .succeeded())
    }
}
