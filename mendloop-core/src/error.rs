//! Error types for the Mendloop engine
//!
//! Runtime conditions of a control loop (lock denial, guard denial, actor
//! failure, timeouts, exhausted retries) are never reported through these
//! types. They are captured as [`OperationResult`](crate::types::OperationResult)
//! classifications on history entries and surface as notifications.
//!
//! What remains here are the conditions a caller has to act on:
//!
//! - **Precondition violations**: starting a manager twice, starting a step
//!   whose operation was never built, pushing past the step queue cap
//! - **Boundary rejections**: malformed events, unsupported targets,
//!   disabled control loops
//! - **Construction failures**: bad configuration, broken policy chains,
//!   unknown actors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MendloopError {
    #[error("Syntax error in event: {message}")]
    Syntax { message: String },

    #[error("Unsupported target type: {target_type}")]
    UnsupportedTargetType { target_type: String },

    #[error("Invalid target: {message}")]
    InvalidTarget { message: String },

    #[error("Illegal state for '{operation}': {reason}")]
    IllegalState { operation: String, reason: String },

    #[error("Policy processor error: {message}")]
    PolicyProcessor { message: String },

    #[error("Actor not found: {actor}")]
    ActorNotFound { actor: String },

    #[error("Operation '{operation}' not supported by actor '{actor}'")]
    OperationNotSupported { actor: String, operation: String },

    #[error("Operation {actor}.{operation} failed: {details}")]
    OperationFailed {
        actor: String,
        operation: String,
        details: String,
    },

    #[error("Step queue is full (max {max})")]
    StepQueueFull { max: usize },

    #[error("Lock manager error: {message}")]
    LockManager { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type MendloopResult<T> = std::result::Result<T, MendloopError>;

impl MendloopError {
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::InvalidTarget {
            message: message.into(),
        }
    }

    pub fn illegal_state(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IllegalState {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn processor(message: impl Into<String>) -> Self {
        Self::PolicyProcessor {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True for errors that indicate a caller sequencing bug.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. } | Self::StepQueueFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MendloopError::illegal_state("start", "manager already started");
        assert_eq!(
            err.to_string(),
            "Illegal state for 'start': manager already started"
        );
        assert!(err.is_illegal_state());

        let err = MendloopError::syntax("No request ID");
        assert_eq!(err.to_string(), "Syntax error in event: No request ID");
        assert!(!err.is_illegal_state());
    }

    #[test]
    fn test_from_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MendloopError = json_err.into();
        assert!(matches!(err, MendloopError::Json(_)));
    }
}
