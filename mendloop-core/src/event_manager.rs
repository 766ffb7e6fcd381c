//! Lifecycle of one control-loop event
//!
//! The [`EventManager`] is the single point of truth for an event's progress
//! through its policy chain. It owns the onset, classifies later events for
//! the same request, walks the policy processor, and keeps exactly one
//! current [`OperationManager`]. Every observable change produces a
//! [`ControlLoopNotification`] for the host.
//!
//! ```text
//! LOAD_POLICY -> POLICY_LOADED -> AWAITING_OUTCOME -> LOAD_POLICY | DONE
//! ```
//!
//! Notifications are built under the manager lock and delivered after it is
//! released, so hosts may call back into the manager from `deliver` or
//! `state_changed`.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Span};
use uuid::Uuid;

use crate::actor::ActorService;
use crate::config::EngineConfig;
use crate::error::{MendloopError, MendloopResult};
use crate::event::{check_activation, check_event_syntax, ControlLoopEvent};
use crate::history::{HistoryStore, NoopHistoryStore};
use crate::lock::{LocalLockManager, LockManager};
use crate::lock_coordinator::{LockCoordinator, LockFuture, UnavailableListener};
use crate::metrics::TransactionMetrics;
use crate::notification::{deliver_logged, ControlLoopHost, ControlLoopNotification};
use crate::observability::event_span;
use crate::operation_manager::{OperationContext, OperationManager, OperationState};
use crate::outcome::ControlLoopOperation;
use crate::policy::{Policy, PolicyProcessor};
use crate::step::{deadline_after, CL_TIMEOUT_MSG};
use crate::types::{FinalResult, NewEventStatus, NotificationType, OperationResult};

pub const POLICY_ERROR_MSG: &str = "Policy processing aborted due to policy error";
pub const EXCEPTION_MSG: &str = "Exception in processing closed loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    LoadPolicy,
    PolicyLoaded,
    AwaitingOutcome,
    Done,
}

/// Collaborators shared by every event the engine processes.
#[derive(Clone)]
pub struct EngineServices {
    pub actors: Arc<ActorService>,
    pub lock_manager: Arc<dyn LockManager>,
    pub history: Arc<dyn HistoryStore>,
    pub metrics: Option<Arc<TransactionMetrics>>,
    pub config: EngineConfig,
}

impl EngineServices {
    /// In-process lock table and default settings. History and metrics are off.
    pub fn new(actors: ActorService) -> Self {
        Self {
            actors: Arc::new(actors),
            lock_manager: Arc::new(LocalLockManager::new()),
            history: Arc::new(NoopHistoryStore),
            metrics: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<TransactionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = lock_manager;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}

struct EventInner {
    state: EventState,
    processor: Box<dyn PolicyProcessor>,
    host: Option<Arc<dyn ControlLoopHost>>,
    started: bool,
    deadline: Option<Instant>,
    current: Option<Arc<OperationManager>>,
    /// Records of every finished policy, in order
    history: Vec<ControlLoopOperation>,
    final_result: Option<FinalResult>,
    final_message: Option<String>,
    num_onsets: u32,
    num_abatements: u32,
    abatement: Option<ControlLoopEvent>,
    last_notification: Option<ControlLoopNotification>,
}

/// Work to do once the manager lock is released.
#[derive(Default)]
struct Outbox {
    host: Option<Arc<dyn ControlLoopHost>>,
    notifications: Vec<ControlLoopNotification>,
    free_locks: bool,
}

enum Next {
    Nothing,
    Retry(Arc<OperationManager>),
    LoadPolicy,
}

/// Drives one fault event through its policy chain.
pub struct EventManager {
    request_id: Uuid,
    onset: ControlLoopEvent,
    services: EngineServices,
    locks: LockCoordinator,
    span: Span,
    self_ref: Weak<EventManager>,
    inner: Mutex<EventInner>,
}

impl EventManager {
    /// Creates a manager for an onset.
    ///
    /// Rejects malformed events, abatements, and targets whose enrichment
    /// marks them as disabled or not active.
    pub fn new(
        services: EngineServices,
        processor: Box<dyn PolicyProcessor>,
        event: ControlLoopEvent,
    ) -> MendloopResult<Arc<Self>> {
        check_event_syntax(&event)?;
        if !event.is_onset() {
            return Err(MendloopError::syntax("Event is not an onset"));
        }
        check_activation(&event)?;
        let request_id = event
            .request_id
            .ok_or_else(|| MendloopError::syntax("No request ID"))?;

        let owner_key = format!("{}{}", services.config.owner_id_prefix, request_id);
        let locks = LockCoordinator::new(services.lock_manager.clone(), owner_key);
        let span = event_span(event.control_loop_name(), request_id);

        Ok(Arc::new_cyclic(|self_ref| Self {
            request_id,
            onset: event,
            services,
            locks,
            span,
            self_ref: self_ref.clone(),
            inner: Mutex::new(EventInner {
                state: EventState::LoadPolicy,
                processor,
                host: None,
                started: false,
                deadline: None,
                current: None,
                history: Vec::new(),
                final_result: None,
                final_message: None,
                num_onsets: 1,
                num_abatements: 0,
                abatement: None,
                last_notification: None,
            }),
        }))
    }

    /// Registers the host that receives notifications.
    pub fn register(&self, host: Arc<dyn ControlLoopHost>) {
        self.inner.lock().host = Some(host);
    }

    /// Classifies another event carrying this manager's request id.
    pub fn on_new_event(&self, event: &ControlLoopEvent) -> NewEventStatus {
        if let Err(e) = check_event_syntax(event) {
            warn!(request_id = %self.request_id, "Rejecting event: {}", e);
            return NewEventStatus::SyntaxError;
        }

        let mut inner = self.inner.lock();
        if event.is_onset() {
            if *event == self.onset {
                return NewEventStatus::FirstOnset;
            }
            inner.num_onsets += 1;
            debug!(request_id = %self.request_id, onsets = inner.num_onsets, "Subsequent onset");
            return NewEventStatus::SubsequentOnset;
        }

        inner.num_abatements += 1;
        if inner.abatement.is_none() {
            info!(request_id = %self.request_id, "Abatement received");
            inner.abatement = Some(event.clone());
            NewEventStatus::FirstAbatement
        } else {
            NewEventStatus::SubsequentAbatement
        }
    }

    /// Activates the control loop and starts the trigger policy.
    pub fn start(&self) -> MendloopResult<()> {
        let _enter = self.span.enter();
        let outbox = {
            let mut inner = self.inner.lock();
            if inner.started {
                return Err(MendloopError::illegal_state("start", "manager already started"));
            }
            let host = inner.host.clone().ok_or_else(|| {
                MendloopError::illegal_state("start", "manager is not registered with a host")
            })?;
            Handle::try_current()
                .map_err(|_| MendloopError::illegal_state("start", "no tokio runtime available"))?;

            let timeout = inner
                .processor
                .control_loop_timeout()
                .unwrap_or(self.services.config.default_control_loop_timeout);
            inner.deadline = Some(deadline_after(timeout));
            inner.started = true;
            info!(?timeout, "Control loop activated");

            let notification = self.notification(&inner, NotificationType::Active);
            inner.last_notification = Some(notification.clone());
            Outbox {
                host: Some(host),
                notifications: vec![notification],
                free_locks: false,
            }
        };
        self.flush(outbox);
        self.load_policy();
        Ok(())
    }

    /// Advances the policy chain past the finished policy and loads the next one.
    pub fn load_next_policy(&self, result: OperationResult) -> MendloopResult<()> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.lock();
            if !inner.started {
                return Err(MendloopError::illegal_state("load_next_policy", "manager not started"));
            }
            if inner.state == EventState::Done {
                return Err(MendloopError::illegal_state(
                    "load_next_policy",
                    "control loop already finished",
                ));
            }
            self.advance_chain(&mut inner, result, &mut outbox);
        }
        self.flush(outbox);
        self.load_policy();
        Ok(())
    }

    fn advance_chain(&self, inner: &mut EventInner, result: OperationResult, outbox: &mut Outbox) {
        if let Err(e) = inner.processor.next_policy_for_result(result) {
            warn!(request_id = %self.request_id, %result, "Policy processor failed: {}", e);
            self.finalize(
                inner,
                EventState::Done,
                FinalResult::FinalFailureException,
                Some(POLICY_ERROR_MSG.to_string()),
                outbox,
            );
        }
    }

    fn load_policy(&self) {
        let _enter = self.span.enter();
        let mut outbox = Outbox::default();
        let loaded = {
            let mut inner = self.inner.lock();
            if inner.state == EventState::Done {
                return;
            }
            inner.state = EventState::LoadPolicy;

            if let Some(result) = inner.processor.check_is_current_policy_final() {
                self.finalize(&mut inner, EventState::Done, result, None, &mut outbox);
                None
            } else {
                let policy = match inner.processor.current_policy() {
                    Ok(Some(policy)) => Ok(policy),
                    Ok(None) => Err(MendloopError::processor("current policy is not defined")),
                    Err(e) => Err(e),
                };
                match policy.and_then(|policy| self.create_operation(&inner, policy)) {
                    Ok(manager) => {
                        info!(policy = %manager.policy().id, "Policy loaded");
                        inner.current = Some(manager.clone());
                        inner.state = EventState::PolicyLoaded;
                        Some(manager)
                    }
                    Err(e) => {
                        warn!("Cannot load policy: {}", e);
                        self.finalize(
                            &mut inner,
                            EventState::Done,
                            FinalResult::FinalFailureException,
                            Some(POLICY_ERROR_MSG.to_string()),
                            &mut outbox,
                        );
                        None
                    }
                }
            }
        };
        self.flush(outbox);

        if let Some(manager) = loaded {
            self.start_operation(manager);
        }
    }

    fn create_operation(&self, inner: &EventInner, policy: Policy) -> MendloopResult<Arc<OperationManager>> {
        let context: Arc<dyn OperationContext> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| MendloopError::illegal_state("load policy", "event manager dropped"))?;
        let deadline = inner
            .deadline
            .ok_or_else(|| MendloopError::illegal_state("load policy", "manager not started"))?;
        OperationManager::new(
            &context,
            self.onset.clone(),
            policy,
            &self.services.config,
            deadline,
        )
    }

    fn start_operation(&self, manager: Arc<OperationManager>) {
        {
            let mut inner = self.inner.lock();
            if inner.state == EventState::Done || !is_current(&inner, &manager) {
                return;
            }
            inner.state = EventState::AwaitingOutcome;
        }
        if let Err(e) = manager.start() {
            warn!(policy = %manager.policy().id, "Cannot start operation: {}", e);
            self.abort(EventState::Done, FinalResult::FinalFailureException, EXCEPTION_MSG);
        }
    }

    /// Reacts to a state change of the current operation.
    fn operation_updated(&self, manager: &OperationManager) {
        let _enter = self.span.enter();
        let mut outbox = Outbox::default();
        let next = {
            let mut inner = self.inner.lock();
            if inner.state == EventState::Done {
                debug!("Ignoring operation update after completion");
                return;
            }
            if !is_current(&inner, manager) {
                debug!(policy = %manager.policy().id, "Ignoring update from stale operation");
                return;
            }
            outbox.host = inner.host.clone();

            if let Some(notification) = self.operation_notification(&inner, manager) {
                inner.last_notification = Some(notification.clone());
                outbox.notifications.push(notification);
            }

            if manager.is_timed_out() {
                inner.history.extend(manager.history_records());
                self.finalize(
                    &mut inner,
                    EventState::Done,
                    FinalResult::FinalFailureTimeout,
                    Some(CL_TIMEOUT_MSG.to_string()),
                    &mut outbox,
                );
                Next::Nothing
            } else if !manager.is_attempt_done() {
                Next::Nothing
            } else if !manager.is_complete() {
                match inner.current.clone() {
                    Some(current) => Next::Retry(current),
                    None => Next::Nothing,
                }
            } else {
                inner.history.extend(manager.history_records());
                let result = manager.operation_result();
                info!(policy = %manager.policy().id, %result, "Policy finished");
                self.advance_chain(&mut inner, result, &mut outbox);
                Next::LoadPolicy
            }
        };
        self.flush(outbox);

        match next {
            Next::Nothing => {}
            Next::Retry(current) => {
                info!(policy = %current.policy().id, attempt = current.attempt() + 1, "Retrying operation");
                if let Err(e) = current.start() {
                    warn!("Cannot retry operation: {}", e);
                    self.abort(EventState::Done, FinalResult::FinalFailureException, EXCEPTION_MSG);
                }
            }
            Next::LoadPolicy => self.load_policy(),
        }
    }

    fn operation_notification(
        &self,
        inner: &EventInner,
        manager: &OperationManager,
    ) -> Option<ControlLoopNotification> {
        let policy = manager.policy();
        let target = manager
            .target_entity()
            .unwrap_or_else(|| self.onset.target_name().to_string());

        let (kind, message) = match manager.state() {
            OperationState::Starting => return None,
            OperationState::LockDenied => (
                NotificationType::Rejected,
                format!("The target {} is already locked", target),
            ),
            OperationState::LockLost => (
                NotificationType::OperationFailure,
                format!("The target {} is no longer locked", target),
            ),
            OperationState::GuardStarted => (
                NotificationType::Operation,
                format!("Sending guard query for {} {}", policy.actor, policy.operation),
            ),
            OperationState::GuardPermitted => (
                NotificationType::Operation,
                format!("Guard result for {} {} is Permit", policy.actor, policy.operation),
            ),
            OperationState::GuardDenied => (
                NotificationType::Operation,
                format!("Guard result for {} {} is Deny", policy.actor, policy.operation),
            ),
            OperationState::OperationStarted => (
                NotificationType::Operation,
                manager.operation_message().unwrap_or_default(),
            ),
            OperationState::OperationSuccess => (
                NotificationType::OperationSuccess,
                manager.operation_history().unwrap_or_default(),
            ),
            OperationState::OperationFailure | OperationState::OperationFinalFailure => (
                NotificationType::OperationFailure,
                manager.operation_history().unwrap_or_default(),
            ),
        };

        let mut history = inner.history.clone();
        history.extend(manager.history_records());
        Some(
            self.notification(inner, kind)
                .with_message(message)
                .with_history(history),
        )
    }

    /// Sets the final result unless one is already set.
    fn finalize(
        &self,
        inner: &mut EventInner,
        state: EventState,
        result: FinalResult,
        message: Option<String>,
        outbox: &mut Outbox,
    ) {
        if inner.final_result.is_some() {
            debug!(%result, "Final result already set");
            inner.state = state;
            return;
        }

        inner.state = state;
        inner.final_result = Some(result);
        inner.final_message = message.or_else(|| default_final_message(result).map(str::to_string));
        if let Some(current) = &inner.current {
            current.cancel();
        }
        info!(%result, message = ?inner.final_message, "Control loop finished");

        let notification = self.final_notification(inner, result, inner.final_message.clone());
        inner.last_notification = Some(notification.clone());
        outbox.host = inner.host.clone();
        outbox.notifications.push(notification);
        outbox.free_locks = state == EventState::Done;
    }

    fn final_notification(
        &self,
        inner: &EventInner,
        result: FinalResult,
        message: Option<String>,
    ) -> ControlLoopNotification {
        let mut notification = self
            .notification(inner, result.notification_type())
            .with_history(inner.history.clone());
        notification.message = message;
        notification
    }

    fn notification(&self, inner: &EventInner, kind: NotificationType) -> ControlLoopNotification {
        let mut notification = ControlLoopNotification::for_event(&self.onset, kind);
        if let Some(version) = inner.processor.policy_version() {
            notification.policy_version = Some(version.to_string());
        }
        if notification.policy_name.is_none() {
            notification.policy_name = Some(inner.processor.control_loop_name().to_string());
        }
        if let Some(abatement) = &inner.abatement {
            notification.closed_loop_alarm_end = abatement.closed_loop_alarm_end;
        }
        notification
    }

    fn flush(&self, outbox: Outbox) {
        if outbox.free_locks {
            self.locks.free_all();
        }
        if let Some(metrics) = &self.services.metrics {
            for notification in &outbox.notifications {
                metrics.transaction_event(notification);
            }
        }
        let Some(host) = outbox.host else {
            return;
        };
        if outbox.notifications.is_empty() {
            return;
        }
        for notification in outbox.notifications {
            deliver_logged(host.as_ref(), notification);
        }
        host.state_changed(self.request_id);
    }

    /// Final notification if the control loop has ended, or if the policy
    /// processor already sits on a final result.
    pub fn is_final(&self) -> Option<ControlLoopNotification> {
        let inner = self.inner.lock();
        if let Some(result) = inner.final_result {
            return Some(self.final_notification(&inner, result, inner.final_message.clone()));
        }
        let result = inner.processor.check_is_current_policy_final()?;
        let message = default_final_message(result).map(str::to_string);
        Some(self.final_notification(&inner, result, message))
    }

    /// Short-circuits the control loop. An already set final result is kept.
    pub fn abort(&self, state: EventState, result: FinalResult, message: impl Into<String>) {
        let _enter = self.span.enter();
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.lock();
            self.finalize(&mut inner, state, result, Some(message.into()), &mut outbox);
        }
        self.flush(outbox);
    }

    /// Cancels any running operation and releases every lock.
    pub fn destroy(&self) {
        let current = {
            let mut inner = self.inner.lock();
            inner.state = EventState::Done;
            inner.current.take()
        };
        if let Some(current) = current {
            current.cancel();
        }
        self.locks.free_all();
        debug!(request_id = %self.request_id, "Event manager destroyed");
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn onset(&self) -> &ControlLoopEvent {
        &self.onset
    }

    pub fn state(&self) -> EventState {
        self.inner.lock().state
    }

    /// Started and not yet done.
    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock();
        inner.started && inner.state != EventState::Done
    }

    pub fn num_onsets(&self) -> u32 {
        self.inner.lock().num_onsets
    }

    pub fn num_abatements(&self) -> u32 {
        self.inner.lock().num_abatements
    }

    pub fn abatement(&self) -> Option<ControlLoopEvent> {
        self.inner.lock().abatement.clone()
    }

    pub fn final_result(&self) -> Option<FinalResult> {
        self.inner.lock().final_result
    }

    pub fn final_message(&self) -> Option<String> {
        self.inner.lock().final_message.clone()
    }

    /// History of every finished policy.
    pub fn history(&self) -> Vec<ControlLoopOperation> {
        self.inner.lock().history.clone()
    }

    pub fn current_operation(&self) -> Option<Arc<OperationManager>> {
        self.inner.lock().current.clone()
    }

    pub fn last_notification(&self) -> Option<ControlLoopNotification> {
        self.inner.lock().last_notification.clone()
    }

    /// Time left before the control loop times out.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .lock()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_locked(&self, target_entity: &str) -> bool {
        self.locks.is_locked(target_entity)
    }

    pub fn lock_owner_key(&self) -> &str {
        self.locks.owner_key()
    }
}

impl OperationContext for EventManager {
    fn actors(&self) -> Arc<ActorService> {
        self.services.actors.clone()
    }

    fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.services.history.clone()
    }

    fn request_lock(
        &self,
        target_entity: &str,
        hold: Duration,
        on_unavailable: UnavailableListener,
    ) -> LockFuture {
        self.locks.request_lock(target_entity, hold, on_unavailable)
    }

    fn updated(&self, manager: &OperationManager) {
        self.operation_updated(manager);
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        self.locks.free_all();
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventManager")
            .field("request_id", &self.request_id)
            .field("control_loop", &self.onset.control_loop_name())
            .field("state", &inner.state)
            .field("final_result", &inner.final_result)
            .finish()
    }
}

fn is_current(inner: &EventInner, manager: &OperationManager) -> bool {
    inner
        .current
        .as_ref()
        .map(|current| std::ptr::eq(current.as_ref(), manager))
        .unwrap_or(false)
}

fn default_final_message(result: FinalResult) -> Option<&'static str> {
    match result {
        FinalResult::FinalFailureException => Some(EXCEPTION_MSG),
        FinalResult::FinalFailureTimeout => Some(CL_TIMEOUT_MSG),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::keys;
    use crate::history::MemoryHistoryStore;
    use crate::test_helpers::{
        processor, vm_event, vm_policy, RecordingHost, Scripted, ScriptedActor, VM_NAME,
    };
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn services(actors: Vec<ScriptedActor>) -> EngineServices {
        let mut service = ActorService::new();
        for actor in actors {
            service.register(actor).unwrap();
        }
        EngineServices::new(service).with_config(EngineConfig {
            guard_enabled: false,
            ..EngineConfig::default()
        })
    }

    fn manager_for(services: EngineServices, policies: Vec<Policy>) -> (Arc<EventManager>, Arc<RecordingHost>) {
        let manager =
            EventManager::new(services, Box::new(processor(policies, None)), vm_event()).unwrap();
        let host = RecordingHost::new();
        manager.register(host.clone());
        (manager, host)
    }

    #[test]
    fn test_new_rejects_bad_events() {
        let svc = services(vec![]);
        let mut event = vm_event();
        event.request_id = None;
        assert!(matches!(
            EventManager::new(svc.clone(), Box::new(processor(vec![vm_policy(0)], None)), event),
            Err(MendloopError::Syntax { .. })
        ));

        let abatement = vm_event().abatement();
        assert!(EventManager::new(
            svc.clone(),
            Box::new(processor(vec![vm_policy(0)], None)),
            abatement
        )
        .is_err());

        let mut disabled = vm_event();
        disabled
            .aai
            .get_or_insert_with(Default::default)
            .insert(keys::VSERVER_IS_CLOSED_LOOP_DISABLED.into(), "true".into());
        assert!(matches!(
            EventManager::new(svc, Box::new(processor(vec![vm_policy(0)], None)), disabled),
            Err(MendloopError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let manager = EventManager::new(
            services(vec![ScriptedActor::new("APPC")]),
            Box::new(processor(vec![vm_policy(0)], None)),
            vm_event(),
        )
        .unwrap();
        assert!(manager.start().unwrap_err().is_illegal_state());

        manager.register(RecordingHost::new());
        manager.start().unwrap();
        assert!(manager.start().unwrap_err().is_illegal_state());
    }

    #[test]
    fn test_on_new_event_classification() {
        let (manager, _host) = manager_for(services(vec![]), vec![vm_policy(0)]);
        let onset = manager.onset().clone();

        assert_eq!(manager.on_new_event(&onset), NewEventStatus::FirstOnset);
        assert_eq!(manager.on_new_event(&onset), NewEventStatus::FirstOnset);
        assert_eq!(manager.num_onsets(), 1);

        let mut other = onset.clone();
        other.payload = Some("again".into());
        assert_eq!(manager.on_new_event(&other), NewEventStatus::SubsequentOnset);
        assert_eq!(manager.num_onsets(), 2);

        let abatement = onset.abatement();
        assert_eq!(manager.on_new_event(&abatement), NewEventStatus::FirstAbatement);
        assert_eq!(manager.on_new_event(&abatement), NewEventStatus::SubsequentAbatement);
        assert_eq!(manager.num_abatements(), 2);
        assert_eq!(manager.abatement(), Some(abatement));

        let mut broken = onset;
        broken.closed_loop_control_name = None;
        assert_eq!(manager.on_new_event(&broken), NewEventStatus::SyntaxError);
    }

    proptest! {
        #[test]
        fn prop_onset_dedup(payloads in proptest::collection::vec("[a-z]{1,8}", 0..20)) {
            let (manager, _host) = manager_for(services(vec![]), vec![vm_policy(0)]);
            let onset = manager.onset().clone();
            prop_assert_eq!(manager.on_new_event(&onset), NewEventStatus::FirstOnset);

            for (i, payload) in payloads.iter().enumerate() {
                let mut other = onset.clone();
                other.payload = Some(payload.clone());
                prop_assert_eq!(manager.on_new_event(&other), NewEventStatus::SubsequentOnset);
                prop_assert_eq!(manager.on_new_event(&onset), NewEventStatus::FirstOnset);
                prop_assert_eq!(manager.num_onsets(), i as u32 + 2);
            }
        }
    }

    #[tokio::test]
    async fn test_single_policy_success() {
        let history = Arc::new(MemoryHistoryStore::new());
        let lock_manager = LocalLockManager::new();
        let svc = services(vec![ScriptedActor::new("APPC")])
            .with_history(history.clone())
            .with_lock_manager(Arc::new(lock_manager.clone()));
        let (manager, host) = manager_for(svc, vec![vm_policy(0)]);

        manager.start().unwrap();
        let last = host.wait_for_final().await.expect("no final notification");

        assert_eq!(last.notification, NotificationType::FinalSuccess);
        assert_eq!(last.history.len(), 1);
        assert_eq!(
            host.types(),
            vec![
                NotificationType::Active,
                NotificationType::Operation,
                NotificationType::OperationSuccess,
                NotificationType::FinalSuccess,
            ]
        );
        assert_eq!(manager.state(), EventState::Done);
        assert_eq!(manager.final_result(), Some(FinalResult::FinalSuccess));
        assert!(!manager.is_active());
        assert!(lock_manager.is_empty());
        assert_eq!(history.records_for(manager.request_id()).len(), 1);
        assert_eq!(history.records()[0].target_entity, VM_NAME);
        assert!(host.state_changes() >= 4);
    }

    #[tokio::test]
    async fn test_policy_chain_advances_on_failure() {
        let appc = ScriptedActor::new("APPC").then(Scripted::Fail);
        let mut restart = vm_policy(0);
        restart.failure = "rebuild".into();
        let mut rebuild = vm_policy(0);
        rebuild.id = "rebuild".into();
        rebuild.operation = "Rebuild".into();

        let (manager, host) = manager_for(services(vec![appc]), vec![restart, rebuild]);
        manager.start().unwrap();
        let last = host.wait_for_final().await.unwrap();

        assert_eq!(last.notification, NotificationType::FinalSuccess);
        let operations: Vec<_> = last.history.iter().map(|h| h.operation.as_str()).collect();
        assert_eq!(operations, vec!["Restart", "Rebuild"]);
        assert_eq!(last.history[0].outcome.as_deref(), Some("FAILURE"));
    }

    #[tokio::test]
    async fn test_trigger_is_final_result() {
        let mut definition_policy = vm_policy(0);
        definition_policy.id = "unused".into();
        let mut processor = processor(vec![definition_policy], Some(120));
        processor.next_policy_for_result(OperationResult::Success).unwrap();

        let manager =
            EventManager::new(services(vec![]), Box::new(processor), vm_event()).unwrap();
        let host = RecordingHost::new();
        manager.register(host.clone());

        assert_eq!(
            manager.is_final().map(|n| n.notification),
            Some(NotificationType::FinalSuccess)
        );
        manager.start().unwrap();
        assert_eq!(
            host.types(),
            vec![NotificationType::Active, NotificationType::FinalSuccess]
        );
    }

    struct BrokenProcessor {
        policy: Policy,
    }

    impl PolicyProcessor for BrokenProcessor {
        fn current_policy(&self) -> MendloopResult<Option<Policy>> {
            Ok(Some(self.policy.clone()))
        }

        fn next_policy_for_result(&mut self, _result: OperationResult) -> MendloopResult<()> {
            Err(MendloopError::processor("chain is corrupt"))
        }

        fn check_is_current_policy_final(&self) -> Option<FinalResult> {
            None
        }

        fn control_loop_timeout(&self) -> Option<Duration> {
            None
        }

        fn control_loop_name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_processor_error_aborts() {
        let manager = EventManager::new(
            services(vec![ScriptedActor::new("APPC")]),
            Box::new(BrokenProcessor {
                policy: vm_policy(0),
            }),
            vm_event(),
        )
        .unwrap();
        let host = RecordingHost::new();
        manager.register(host.clone());
        manager.start().unwrap();

        let last = host.wait_for_final().await.unwrap();
        assert_eq!(last.notification, NotificationType::FinalFailure);
        assert_eq!(last.message.as_deref(), Some(POLICY_ERROR_MSG));
        assert_eq!(manager.final_result(), Some(FinalResult::FinalFailureException));
    }

    #[tokio::test]
    async fn test_abort_keeps_first_final_result() {
        let (manager, host) = manager_for(
            services(vec![ScriptedActor::always("APPC", Scripted::Hang)]),
            vec![vm_policy(0)],
        );
        manager.start().unwrap();

        manager.abort(EventState::Done, FinalResult::FinalFailure, "operator abort");
        manager.abort(EventState::Done, FinalResult::FinalSuccess, "too late");

        assert_eq!(manager.final_result(), Some(FinalResult::FinalFailure));
        assert_eq!(manager.final_message().as_deref(), Some("operator abort"));
        let finals: Vec<_> = host
            .types()
            .into_iter()
            .filter(NotificationType::is_final)
            .collect();
        assert_eq!(finals, vec![NotificationType::FinalFailure]);
        assert_eq!(
            manager.is_final().and_then(|n| n.message),
            Some("operator abort".to_string())
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_delivery_failures_are_logged() {
        let manager = EventManager::new(
            services(vec![ScriptedActor::new("APPC")]),
            Box::new(processor(vec![vm_policy(0)], None)),
            vm_event(),
        )
        .unwrap();
        manager.register(RecordingHost::failing());
        manager.start().unwrap();

        for _ in 0..100 {
            if manager.final_result().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.final_result(), Some(FinalResult::FinalSuccess));
        assert!(logs_contain("Failed to deliver notification"));
    }

    #[tokio::test]
    async fn test_destroy_releases_locks() {
        let lock_manager = LocalLockManager::new();
        let svc = services(vec![ScriptedActor::always("APPC", Scripted::Hang)])
            .with_lock_manager(Arc::new(lock_manager.clone()));
        let (manager, host) = manager_for(svc, vec![vm_policy(0)]);
        manager.start().unwrap();

        host.wait_for(
            |n| n.notification == NotificationType::Operation,
            Duration::from_secs(5),
        )
        .await
        .expect("operation never started");
        assert!(manager.is_locked(VM_NAME));
        assert!(manager.lock_owner_key().ends_with(&manager.request_id().to_string()));

        manager.destroy();
        assert_eq!(manager.state(), EventState::Done);
        assert!(lock_manager.is_empty());
    }
}
