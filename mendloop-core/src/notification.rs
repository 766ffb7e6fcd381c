//! Notifications pushed to the host and the host-facing hooks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{MendloopError, MendloopResult};
use crate::event::ControlLoopEvent;
use crate::outcome::ControlLoopOperation;
use crate::types::{NotificationType, TargetType};

/// Denormalized view of an event and its progress, built fresh on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLoopNotification {
    pub closed_loop_control_name: String,
    #[serde(rename = "requestID")]
    pub request_id: Option<Uuid>,
    pub target: Option<String>,
    #[serde(rename = "target_type")]
    pub target_type: Option<TargetType>,
    #[serde(rename = "AAI")]
    pub aai: BTreeMap<String, String>,
    pub closed_loop_alarm_start: Option<DateTime<Utc>>,
    pub closed_loop_alarm_end: Option<DateTime<Utc>>,
    pub from: String,
    pub policy_name: Option<String>,
    pub policy_scope: Option<String>,
    pub policy_version: Option<String>,
    pub notification: NotificationType,
    pub message: Option<String>,
    pub notification_time: DateTime<Utc>,
    pub history: Vec<ControlLoopOperation>,
}

impl ControlLoopNotification {
    pub fn for_event(event: &ControlLoopEvent, notification: NotificationType) -> Self {
        Self {
            closed_loop_control_name: event.control_loop_name().to_string(),
            request_id: event.request_id,
            target: event.target.clone(),
            target_type: event.target_type,
            aai: event.aai.clone().unwrap_or_default(),
            closed_loop_alarm_start: event.closed_loop_alarm_start,
            closed_loop_alarm_end: event.closed_loop_alarm_end,
            from: "policy".to_string(),
            policy_name: event.policy_name.clone(),
            policy_scope: None,
            policy_version: event.version.clone(),
            notification,
            message: None,
            notification_time: Utc::now(),
            history: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ControlLoopOperation>) -> Self {
        self.history = history;
        self
    }
}

/// The surrounding host: receives notifications and re-invocation signals.
pub trait ControlLoopHost: Send + Sync {
    /// Delivers a notification. Errors are logged by the engine, never fatal.
    fn deliver(&self, notification: ControlLoopNotification) -> MendloopResult<()>;

    /// Signals that an event's state changed and orchestration may be re-run.
    fn state_changed(&self, _request_id: Uuid) {}
}

/// Delivers to a host, logging and swallowing failures.
pub(crate) fn deliver_logged(host: &dyn ControlLoopHost, notification: ControlLoopNotification) {
    let request_id = notification.request_id;
    let kind = notification.notification;
    if let Err(e) = host.deliver(notification) {
        warn!(
            request_id = ?request_id,
            notification = ?kind,
            "Failed to deliver notification: {}",
            e
        );
    }
}

/// Host that forwards notifications into an mpsc channel.
#[derive(Clone)]
pub struct ChannelHost {
    tx: mpsc::UnboundedSender<ControlLoopNotification>,
}

impl ChannelHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlLoopNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ControlLoopHost for ChannelHost {
    fn deliver(&self, notification: ControlLoopNotification) -> MendloopResult<()> {
        self.tx.send(notification).map_err(|_| MendloopError::Internal {
            message: "notification receiver dropped".to_string(),
        })
    }
}
