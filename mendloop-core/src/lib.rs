pub mod actor;
pub mod config;
pub mod error;
pub mod event;
pub mod event_manager;
pub mod history;
pub mod lock;
pub mod lock_coordinator;
pub mod metrics;
pub mod notification;
pub mod observability;
pub mod operation_manager;
pub mod outcome;
pub mod policy;
pub mod step;
pub mod target;
pub mod types;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use actor::{Actor, ActorService, Operation, OperationParams};
pub use config::{Config, EngineConfig};
pub use error::{MendloopError, MendloopResult};
pub use event::ControlLoopEvent;
pub use event_manager::{EngineServices, EventManager, EventState};
pub use metrics::TransactionMetrics;
pub use notification::{ControlLoopHost, ControlLoopNotification};
pub use operation_manager::{OperationManager, OperationState};
pub use outcome::{ControlLoopOperation, OperationOutcome};
pub use policy::{ControlLoopDefinition, ControlLoopProcessor, Policy, PolicyProcessor};
pub use types::{EventStatus, FinalResult, NewEventStatus, NotificationType, OperationResult, TargetType};
