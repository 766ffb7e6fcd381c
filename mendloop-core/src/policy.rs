//! Policies and the processor that walks a control-loop's policy chain

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{MendloopError, MendloopResult};
use crate::types::{FinalResult, OperationResult, TargetType};

/// Target an operation acts on, as declared by a policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyTarget {
    #[serde(rename = "type")]
    pub target_type: Option<TargetType>,
    #[serde(default, rename = "resourceID", alias = "resource_id")]
    pub resource_id: Option<String>,
}

/// One step of a remediation chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub actor: String,
    #[serde(alias = "recipe")]
    pub operation: String,
    #[serde(default)]
    pub target: PolicyTarget,
    /// Number of retries after the first attempt. Values below one mean none.
    #[serde(default)]
    pub retries: i32,
    /// Per-operation timeout in seconds
    #[serde(default = "default_policy_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    #[serde(default = "final_success")]
    pub success: String,
    #[serde(default = "final_failure")]
    pub failure: String,
    #[serde(default = "final_failure_timeout")]
    pub failure_timeout: String,
    #[serde(default = "final_failure_retries")]
    pub failure_retries: String,
    #[serde(default = "final_failure_exception")]
    pub failure_exception: String,
    #[serde(default = "final_failure_guard")]
    pub failure_guard: String,
}

fn default_policy_timeout() -> u64 {
    300
}
fn final_success() -> String {
    FinalResult::FinalSuccess.as_str().to_string()
}
fn final_failure() -> String {
    FinalResult::FinalFailure.as_str().to_string()
}
fn final_failure_timeout() -> String {
    FinalResult::FinalFailureTimeout.as_str().to_string()
}
fn final_failure_retries() -> String {
    FinalResult::FinalFailureRetries.as_str().to_string()
}
fn final_failure_exception() -> String {
    FinalResult::FinalFailureException.as_str().to_string()
}
fn final_failure_guard() -> String {
    FinalResult::FinalFailureGuard.as_str().to_string()
}

impl Policy {
    pub fn new(id: impl Into<String>, actor: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            actor: actor.into(),
            operation: operation.into(),
            target: PolicyTarget::default(),
            retries: 0,
            timeout: default_policy_timeout(),
            payload: BTreeMap::new(),
            success: final_success(),
            failure: final_failure(),
            failure_timeout: final_failure_timeout(),
            failure_retries: final_failure_retries(),
            failure_exception: final_failure_exception(),
            failure_guard: final_failure_guard(),
        }
    }

    pub fn with_target(mut self, target_type: TargetType) -> Self {
        self.target.target_type = Some(target_type);
        self
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.retries.max(0) as u32
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Transition taken after the policy finishes with `result`.
    pub fn next_for(&self, result: OperationResult) -> &str {
        match result {
            OperationResult::Success => &self.success,
            OperationResult::Failure => &self.failure,
            OperationResult::FailureTimeout => &self.failure_timeout,
            OperationResult::FailureRetries => &self.failure_retries,
            OperationResult::FailureException => &self.failure_exception,
            OperationResult::FailureGuard => &self.failure_guard,
        }
    }

    fn transitions(&self) -> [&str; 6] {
        [
            &self.success,
            &self.failure,
            &self.failure_timeout,
            &self.failure_retries,
            &self.failure_exception,
            &self.failure_guard,
        ]
    }
}

/// Header of a control-loop definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLoopSpec {
    #[serde(alias = "controlLoopName")]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Overall budget in seconds; the engine default applies when unset or zero
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(alias = "triggerPolicy")]
    pub trigger_policy: String,
    #[serde(default)]
    pub abatement: bool,
}

/// A control loop and its policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLoopDefinition {
    pub control_loop: ControlLoopSpec,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl ControlLoopDefinition {
    pub fn from_yaml(yaml: &str) -> MendloopResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MendloopResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Checks that ids are unique and every transition resolves.
    pub fn validate(&self) -> MendloopResult<()> {
        let mut ids = HashSet::new();
        for policy in &self.policies {
            if FinalResult::from_policy_id(&policy.id).is_some() {
                return Err(MendloopError::processor(format!(
                    "policy id '{}' collides with a final result",
                    policy.id
                )));
            }
            if !ids.insert(policy.id.as_str()) {
                return Err(MendloopError::processor(format!(
                    "duplicate policy id '{}'",
                    policy.id
                )));
            }
        }

        let resolves = |id: &str| ids.contains(id) || FinalResult::from_policy_id(id).is_some();

        if !resolves(&self.control_loop.trigger_policy) {
            return Err(MendloopError::processor(format!(
                "trigger policy '{}' is not defined",
                self.control_loop.trigger_policy
            )));
        }
        for policy in &self.policies {
            if let Some(bad) = policy.transitions().into_iter().find(|t| !resolves(t)) {
                return Err(MendloopError::processor(format!(
                    "policy '{}' refers to undefined policy '{}'",
                    policy.id, bad
                )));
            }
        }
        Ok(())
    }
}

/// Walks a policy chain. Consumed by the event manager.
pub trait PolicyProcessor: Send {
    /// The policy at the current position, if the position names one.
    fn current_policy(&self) -> MendloopResult<Option<Policy>>;

    /// Advances past the current policy using its result.
    fn next_policy_for_result(&mut self, result: OperationResult) -> MendloopResult<()>;

    /// Final result when the current position is terminal.
    fn check_is_current_policy_final(&self) -> Option<FinalResult>;

    /// Overall control-loop budget, if the chain defines one.
    fn control_loop_timeout(&self) -> Option<Duration>;

    fn control_loop_name(&self) -> &str;

    fn policy_version(&self) -> Option<&str> {
        None
    }
}

/// Processor over a [`ControlLoopDefinition`].
#[derive(Debug, Clone)]
pub struct ControlLoopProcessor {
    definition: ControlLoopDefinition,
    current_policy_id: String,
}

impl ControlLoopProcessor {
    pub fn new(definition: ControlLoopDefinition) -> MendloopResult<Self> {
        definition.validate()?;
        let current_policy_id = definition.control_loop.trigger_policy.clone();
        Ok(Self {
            definition,
            current_policy_id,
        })
    }

    pub fn from_yaml(yaml: &str) -> MendloopResult<Self> {
        Self::new(ControlLoopDefinition::from_yaml(yaml)?)
    }

    pub fn definition(&self) -> &ControlLoopDefinition {
        &self.definition
    }

    pub fn current_policy_id(&self) -> &str {
        &self.current_policy_id
    }
}

impl PolicyProcessor for ControlLoopProcessor {
    fn current_policy(&self) -> MendloopResult<Option<Policy>> {
        if self.definition.policies.is_empty() {
            return Err(MendloopError::processor("There are no policies defined."));
        }
        Ok(self
            .definition
            .policies
            .iter()
            .find(|p| p.id == self.current_policy_id)
            .cloned())
    }

    fn next_policy_for_result(&mut self, result: OperationResult) -> MendloopResult<()> {
        let current = match self.current_policy() {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                self.current_policy_id = FinalResult::FinalFailureException.as_str().to_string();
                return Err(MendloopError::processor(
                    "There is no current policy to determine where to go to.",
                ));
            }
            Err(e) => {
                self.current_policy_id = FinalResult::FinalFailureException.as_str().to_string();
                return Err(e);
            }
        };

        let next = current.next_for(result).to_string();
        debug!(
            from = %current.id,
            to = %next,
            %result,
            "Advancing policy chain"
        );
        self.current_policy_id = next;
        Ok(())
    }

    fn check_is_current_policy_final(&self) -> Option<FinalResult> {
        FinalResult::from_policy_id(&self.current_policy_id)
    }

    fn control_loop_timeout(&self) -> Option<Duration> {
        self.definition
            .control_loop
            .timeout
            .filter(|t| *t > 0)
            .map(Duration::from_secs)
    }

    fn control_loop_name(&self) -> &str {
        &self.definition.control_loop.name
    }

    fn policy_version(&self) -> Option<&str> {
        self.definition.control_loop.version.as_deref()
    }
}
