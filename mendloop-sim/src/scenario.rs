//! Scenario files describing how simulated actors behave
//!
//! ```yaml
//! actors:
//!   - name: APPC
//!     operations:
//!       Restart:
//!         - result: failure
//!         - result: success
//!           delay: 2s
//! guard:
//!   decisions: [deny, permit]
//! aai:
//!   vnf_id: vnf-42
//! ```
//!
//! Each operation plays its list in order, one entry per attempt. The last
//! entry repeats once the list is exhausted.

use mendloop_core::error::{MendloopError, MendloopResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// How a simulated call ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimResult {
    #[default]
    Success,
    Failure,
    /// The call returns an error instead of an outcome
    Error,
    /// The call never returns
    Hang,
}

/// One scripted call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimStep {
    pub result: SimResult,
    #[serde(with = "humantime_serde")]
    pub delay: Option<Duration>,
    pub message: Option<String>,
}

impl SimStep {
    pub fn new(result: SimResult) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorScript {
    pub name: String,
    /// Per-operation call sequences
    #[serde(default)]
    pub operations: BTreeMap<String, Vec<SimStep>>,
    /// Used for operations without a sequence
    #[serde(default)]
    pub default: SimStep,
}

impl ActorScript {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: BTreeMap::new(),
            default: SimStep::default(),
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>, steps: Vec<SimStep>) -> Self {
        self.operations.insert(operation.into(), steps);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Permit,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardScript {
    pub decisions: Vec<Decision>,
    #[serde(with = "humantime_serde")]
    pub delay: Option<Duration>,
}

impl Default for GuardScript {
    fn default() -> Self {
        Self {
            decisions: vec![Decision::Permit],
            delay: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AaiScript {
    /// VNF id returned by custom queries. Without one the query answers
    /// with an empty object.
    pub vnf_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub actors: Vec<ActorScript>,
    pub guard: GuardScript,
    pub aai: AaiScript,
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> MendloopResult<Self> {
        let scenario: Scenario = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MendloopResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    pub fn with_actor(mut self, actor: ActorScript) -> Self {
        self.actors.push(actor);
        self
    }

    pub fn with_guard(mut self, decisions: Vec<Decision>) -> Self {
        self.guard.decisions = decisions;
        self
    }

    pub fn with_vnf_id(mut self, vnf_id: impl Into<String>) -> Self {
        self.aai.vnf_id = Some(vnf_id.into());
        self
    }

    pub fn validate(&self) -> MendloopResult<()> {
        let mut seen = std::collections::HashSet::new();
        for actor in &self.actors {
            if actor.name.trim().is_empty() {
                return Err(MendloopError::config("scenario actor without a name"));
            }
            if !seen.insert(actor.name.as_str()) {
                return Err(MendloopError::config(format!(
                    "scenario actor '{}' is defined twice",
                    actor.name
                )));
            }
            if let Some((operation, _)) = actor.operations.iter().find(|(_, steps)| steps.is_empty()) {
                return Err(MendloopError::config(format!(
                    "scenario operation {}.{} has no steps",
                    actor.name, operation
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_yaml(
            r#"
actors:
  - name: APPC
    operations:
      Restart:
        - result: failure
        - result: success
          delay: 2s
          message: restarted
guard:
  decisions: [deny, permit]
aai:
  vnf_id: vnf-42
"#,
        )
        .unwrap();

        let appc = &scenario.actors[0];
        assert_eq!(appc.name, "APPC");
        let restart = &appc.operations["Restart"];
        assert_eq!(restart[0].result, SimResult::Failure);
        assert_eq!(restart[1].delay, Some(Duration::from_secs(2)));
        assert_eq!(restart[1].message.as_deref(), Some("restarted"));
        assert_eq!(appc.default, SimStep::default());
        assert_eq!(scenario.guard.decisions, vec![Decision::Deny, Decision::Permit]);
        assert_eq!(scenario.aai.vnf_id.as_deref(), Some("vnf-42"));
    }

    #[test]
    fn test_empty_scenario_permits() {
        let scenario = Scenario::from_yaml("{}").unwrap();
        assert!(scenario.actors.is_empty());
        assert_eq!(scenario.guard.decisions, vec![Decision::Permit]);
    }

    #[test]
    fn test_validation() {
        let duplicate = Scenario::default()
            .with_actor(ActorScript::new("SO"))
            .with_actor(ActorScript::new("SO"));
        assert!(duplicate.validate().is_err());

        let empty = Scenario::default().with_actor(ActorScript::new("SO").with_operation("Scale", vec![]));
        assert!(matches!(
            empty.validate(),
            Err(MendloopError::Configuration { .. })
        ));
    }
}
