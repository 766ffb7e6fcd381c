//! Operation outcomes and the history records derived from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::OperationResult;

pub const SUCCESS_MSG: &str = "Success";
pub const FAILED_MSG: &str = "Failed";

/// Outcome reported by a lock, guard or actor operation.
///
/// A "start" outcome has no `end` time; a completion always has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub actor: String,
    pub operation: String,
    pub target: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub subrequest_id: Option<String>,
    pub result: OperationResult,
    pub message: Option<String>,
    /// Set on the completion of the last Step of a policy.
    pub final_outcome: bool,
    /// Structured response data, e.g. from a custom query.
    pub response: Option<serde_json::Value>,
}

impl OperationOutcome {
    pub fn new(
        actor: impl Into<String>,
        operation: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            operation: operation.into(),
            target: target.into(),
            start: Some(Utc::now()),
            end: None,
            subrequest_id: None,
            result: OperationResult::Success,
            message: None,
            final_outcome: false,
            response: None,
        }
    }

    pub fn is_for(&self, actor: &str, operation: &str) -> bool {
        self.actor == actor && self.operation == operation
    }

    pub fn is_started(&self) -> bool {
        self.end.is_none()
    }

    /// Marks the outcome as complete with the given result.
    pub fn complete(mut self, result: OperationResult, message: impl Into<String>) -> Self {
        self.end = Some(Utc::now());
        self.result = result;
        self.message = Some(message.into());
        self
    }

    pub fn succeeded(self) -> Self {
        self.complete(OperationResult::Success, SUCCESS_MSG)
    }

    pub fn failed(self) -> Self {
        self.complete(OperationResult::Failure, FAILED_MSG)
    }

    pub fn with_subrequest_id(mut self, id: impl Into<String>) -> Self {
        self.subrequest_id = Some(id.into());
        self
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn to_record(&self) -> ControlLoopOperation {
        ControlLoopOperation {
            actor: self.actor.clone(),
            operation: self.operation.clone(),
            target: self.target.clone(),
            start: self.start,
            end: self.end,
            subrequest_id: self.subrequest_id.clone(),
            outcome: self.end.map(|_| self.result.to_string()),
            message: self.message.clone(),
        }
    }
}

/// History record of one operation as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLoopOperation {
    pub actor: String,
    pub operation: String,
    pub target: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub subrequest_id: Option<String>,
    pub outcome: Option<String>,
    pub message: Option<String>,
}

impl ControlLoopOperation {
    pub fn to_message(&self) -> String {
        format!(
            "actor={},operation={},target={},subRequestId={}",
            self.actor,
            self.operation,
            self.target,
            self.subrequest_id.as_deref().unwrap_or("null")
        )
    }

    pub fn to_history(&self) -> String {
        format!(
            "{},start={},end={},outcome={},message={}",
            self.to_message(),
            fmt_time(self.start),
            fmt_time(self.end),
            self.outcome.as_deref().unwrap_or("null"),
            self.message.as_deref().unwrap_or("null")
        )
    }
}

fn fmt_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "null".to_string())
}

/// One entry in an operation manager's history.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationAttempt {
    /// 1-based attempt number within the policy.
    pub attempt: u32,
    pub result: OperationResult,
    pub record: ControlLoopOperation,
}

impl OperationAttempt {
    pub fn is_started(&self) -> bool {
        self.record.end.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_complete() {
        let outcome = OperationOutcome::new("APPC", "Restart", "vm-01");
        assert!(outcome.is_started());
        assert!(outcome.is_for("APPC", "Restart"));
        assert!(!outcome.is_for("APPC", "Migrate"));
        assert_eq!(outcome.to_record().outcome, None);

        let done = outcome.failed();
        assert!(!done.is_started());
        assert_eq!(done.result, OperationResult::Failure);
        assert_eq!(done.to_record().outcome.as_deref(), Some("FAILURE"));
    }

    #[test]
    fn test_record_message() {
        let record = OperationOutcome::new("APPC", "Restart", "vm-01")
            .with_subrequest_id("1")
            .succeeded()
            .to_record();
        assert_eq!(
            record.to_message(),
            "actor=APPC,operation=Restart,target=vm-01,subRequestId=1"
        );
        assert!(record.to_history().ends_with("outcome=SUCCESS,message=Success"));
    }
}
