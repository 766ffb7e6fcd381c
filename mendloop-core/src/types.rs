//! Shared enumerations used across the engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status carried by an incoming control-loop event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Onset,
    Abated,
}

/// Kind of resource a control loop acts upon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    #[serde(rename = "VM")]
    Vm,
    #[serde(rename = "VNF")]
    Vnf,
    #[serde(rename = "VFMODULE")]
    VfModule,
    #[serde(rename = "PNF")]
    Pnf,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Vm => "VM",
            TargetType::Vnf => "VNF",
            TargetType::VfModule => "VFMODULE",
            TargetType::Pnf => "PNF",
        };
        f.write_str(s)
    }
}

/// Classification of a new event against the one already being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewEventStatus {
    FirstOnset,
    SubsequentOnset,
    FirstAbatement,
    SubsequentAbatement,
    SyntaxError,
}

/// Result classification of a single operation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationResult {
    Success,
    Failure,
    FailureRetries,
    FailureTimeout,
    FailureException,
    FailureGuard,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationResult::Success => "SUCCESS",
            OperationResult::Failure => "FAILURE",
            OperationResult::FailureRetries => "FAILURE_RETRIES",
            OperationResult::FailureTimeout => "FAILURE_TIMEOUT",
            OperationResult::FailureException => "FAILURE_EXCEPTION",
            OperationResult::FailureGuard => "FAILURE_GUARD",
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a whole control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalResult {
    FinalSuccess,
    FinalOpenloop,
    FinalFailure,
    FinalFailureTimeout,
    FinalFailureRetries,
    FinalFailureException,
    FinalFailureGuard,
}

impl FinalResult {
    const ALL: [FinalResult; 7] = [
        FinalResult::FinalSuccess,
        FinalResult::FinalOpenloop,
        FinalResult::FinalFailure,
        FinalResult::FinalFailureTimeout,
        FinalResult::FinalFailureRetries,
        FinalResult::FinalFailureException,
        FinalResult::FinalFailureGuard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FinalResult::FinalSuccess => "final_success",
            FinalResult::FinalOpenloop => "final_openloop",
            FinalResult::FinalFailure => "final_failure",
            FinalResult::FinalFailureTimeout => "final_failure_timeout",
            FinalResult::FinalFailureRetries => "final_failure_retries",
            FinalResult::FinalFailureException => "final_failure_exception",
            FinalResult::FinalFailureGuard => "final_failure_guard",
        }
    }

    /// Interprets a policy-chain transition id as a final result, if it names one.
    pub fn from_policy_id(id: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|result| result.as_str().eq_ignore_ascii_case(id))
    }

    /// Notification type reported when a control loop ends with this result.
    pub fn notification_type(&self) -> NotificationType {
        match self {
            FinalResult::FinalSuccess => NotificationType::FinalSuccess,
            FinalResult::FinalOpenloop => NotificationType::FinalOpenloop,
            _ => NotificationType::FinalFailure,
        }
    }
}

impl fmt::Display for FinalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of an externally delivered notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Active,
    Rejected,
    Operation,
    OperationSuccess,
    OperationFailure,
    FinalFailure,
    FinalSuccess,
    FinalOpenloop,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Active => "ACTIVE",
            NotificationType::Rejected => "REJECTED",
            NotificationType::Operation => "OPERATION",
            NotificationType::OperationSuccess => "OPERATION_SUCCESS",
            NotificationType::OperationFailure => "OPERATION_FAILURE",
            NotificationType::FinalFailure => "FINAL_FAILURE",
            NotificationType::FinalSuccess => "FINAL_SUCCESS",
            NotificationType::FinalOpenloop => "FINAL_OPENLOOP",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            NotificationType::FinalFailure
                | NotificationType::FinalSuccess
                | NotificationType::FinalOpenloop
        )
    }

    /// Ends a transaction: a final result or a rejection.
    pub fn is_terminal(&self) -> bool {
        self.is_final() || *self == NotificationType::Rejected
    }

    /// Numeric response code reported with transaction metrics.
    pub fn response_code(&self) -> &'static str {
        match self {
            NotificationType::Active => "100",
            NotificationType::Rejected => "200",
            NotificationType::Operation => "300",
            NotificationType::OperationSuccess => "301",
            NotificationType::OperationFailure => "302",
            NotificationType::FinalFailure => "400",
            NotificationType::FinalSuccess => "401",
            NotificationType::FinalOpenloop => "402",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("final_success", Some(FinalResult::FinalSuccess) ; "success")]
    #[test_case("FINAL_OPENLOOP", Some(FinalResult::FinalOpenloop) ; "upper case")]
    #[test_case("final_failure_guard", Some(FinalResult::FinalFailureGuard) ; "guard")]
    #[test_case("restart-vm", None ; "policy id")]
    fn test_final_result_from_policy_id(id: &str, expected: Option<FinalResult>) {
        assert_eq!(FinalResult::from_policy_id(id), expected);
    }

    #[test_case(FinalResult::FinalSuccess, NotificationType::FinalSuccess)]
    #[test_case(FinalResult::FinalOpenloop, NotificationType::FinalOpenloop)]
    #[test_case(FinalResult::FinalFailure, NotificationType::FinalFailure)]
    #[test_case(FinalResult::FinalFailureRetries, NotificationType::FinalFailure)]
    #[test_case(FinalResult::FinalFailureTimeout, NotificationType::FinalFailure)]
    #[test_case(FinalResult::FinalFailureGuard, NotificationType::FinalFailure)]
    #[test_case(FinalResult::FinalFailureException, NotificationType::FinalFailure)]
    fn test_final_notification_type(result: FinalResult, expected: NotificationType) {
        assert_eq!(result.notification_type(), expected);
    }

    #[test_case(NotificationType::Active, "100", false)]
    #[test_case(NotificationType::Rejected, "200", true)]
    #[test_case(NotificationType::OperationFailure, "302", false)]
    #[test_case(NotificationType::FinalSuccess, "401", true)]
    #[test_case(NotificationType::FinalOpenloop, "402", true)]
    fn test_notification_response_codes(kind: NotificationType, code: &str, terminal: bool) {
        assert_eq!(kind.response_code(), code);
        assert_eq!(kind.is_terminal(), terminal);
        assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{}\"", kind));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&OperationResult::FailureRetries).unwrap();
        assert_eq!(json, "\"FAILURE_RETRIES\"");
        let target: TargetType = serde_json::from_str("\"VFMODULE\"").unwrap();
        assert_eq!(target, TargetType::VfModule);
    }
}
