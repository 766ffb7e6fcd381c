//! Orchestration of one policy's operation
//!
//! An [`OperationManager`] drives a single policy through target resolution,
//! locking, the guard decision and the actor operation, one attempt at a
//! time. Each attempt is a queue of [`Step`]s; only the front step runs.
//!
//! Outcomes reach the manager from several tasks at once (step tasks, lock
//! callbacks). They are queued and processed strictly one at a time, in
//! arrival order, by whichever caller finds the queue idle. Side effects of
//! processing an outcome (cancelling steps, storing history, starting the
//! next step, notifying the event) run after the manager lock is released.
//!
//! Every outcome is tagged with the attempt that produced it. Outcomes from
//! an earlier attempt, or arriving after the current attempt already reached
//! its terminal disposition, are discarded.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::{
    ActorService, Operation, OperationParams, AAI_ACTOR, CL_TIMEOUT_ACTOR, CUSTOM_QUERY_OPERATION,
    GUARD_ACTOR, GUARD_OPERATION, LOCK_ACTOR, LOCK_OPERATION,
};
use crate::config::EngineConfig;
use crate::error::{MendloopError, MendloopResult};
use crate::event::{keys, ControlLoopEvent};
use crate::history::HistoryStore;
use crate::lock_coordinator::{LockFuture, UnavailableListener};
use crate::observability::operation_span;
use crate::outcome::{ControlLoopOperation, OperationAttempt, OperationOutcome};
use crate::policy::Policy;
use crate::step::{Step, StepContext, StepQueue};
use crate::target::{extract_vnf_id, resolve_target, TargetResolution};
use crate::types::OperationResult;

pub const LOCK_DENIED_MSG: &str = "Operation denied by Lock";
pub const LOCK_LOST_MSG: &str = "Operation aborted by Lock";
pub const GUARD_DENIED_MSG: &str = "Operation denied by Guard";

/// State of the in-flight operation. Reset to `Starting` on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Starting,
    LockDenied,
    LockLost,
    GuardStarted,
    GuardPermitted,
    GuardDenied,
    OperationStarted,
    OperationSuccess,
    OperationFailure,
    OperationFinalFailure,
}

impl OperationState {
    /// States that end the policy no matter how many retries remain.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OperationState::LockDenied
                | OperationState::LockLost
                | OperationState::GuardDenied
                | OperationState::OperationFinalFailure
        )
    }
}

/// Services an [`OperationManager`] needs from the event that owns it.
pub trait OperationContext: Send + Sync {
    fn actors(&self) -> Arc<ActorService>;

    fn history_store(&self) -> Arc<dyn HistoryStore>;

    /// Requests or extends the lock on `target_entity`.
    fn request_lock(
        &self,
        target_entity: &str,
        hold: Duration,
        on_unavailable: UnavailableListener,
    ) -> LockFuture;

    /// Called after every outcome that changed the manager's state.
    fn updated(&self, manager: &OperationManager);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutcomeKind {
    Start,
    Complete,
    Abort,
}

struct QueuedOutcome {
    attempt: u32,
    kind: OutcomeKind,
    outcome: OperationOutcome,
}

#[derive(Default)]
struct Effects {
    cancel: Vec<Arc<Step>>,
    record: Option<(String, ControlLoopOperation)>,
    start_next: bool,
    notify: bool,
}

struct Inner {
    state: OperationState,
    attempt: u32,
    attempt_done: bool,
    /// An actor operation has started at some point during this policy.
    operation_started: bool,
    timed_out: bool,
    target_entity: Option<String>,
    history: Vec<OperationAttempt>,
    steps: StepQueue,
    outcomes: VecDeque<QueuedOutcome>,
    draining: bool,
}

/// Drives one policy's operation to a terminal result.
pub struct OperationManager {
    context: Weak<dyn OperationContext>,
    actors: Arc<ActorService>,
    history_store: Arc<dyn HistoryStore>,
    event: ControlLoopEvent,
    request_id: Uuid,
    policy: Policy,
    guard_enabled: bool,
    lock_safety_margin: Duration,
    max_steps: usize,
    deadline: Instant,
    executor: Handle,
    self_ref: Weak<OperationManager>,
    inner: Mutex<Inner>,
}

impl OperationManager {
    /// Creates a manager for `policy`. Must be called within a tokio runtime.
    pub fn new(
        context: &Arc<dyn OperationContext>,
        event: ControlLoopEvent,
        policy: Policy,
        config: &EngineConfig,
        deadline: Instant,
    ) -> MendloopResult<Arc<Self>> {
        let request_id = event
            .request_id
            .ok_or_else(|| MendloopError::syntax("No request ID"))?;
        let executor = Handle::try_current().map_err(|_| {
            MendloopError::illegal_state("operation manager", "no tokio runtime available")
        })?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            context: Arc::downgrade(context),
            actors: context.actors(),
            history_store: context.history_store(),
            event,
            request_id,
            policy,
            guard_enabled: config.guard_enabled,
            lock_safety_margin: config.lock_safety_margin,
            max_steps: config.max_steps,
            deadline,
            executor,
            self_ref: self_ref.clone(),
            inner: Mutex::new(Inner {
                state: OperationState::Starting,
                attempt: 0,
                attempt_done: false,
                operation_started: false,
                timed_out: false,
                target_entity: None,
                history: Vec::new(),
                steps: StepQueue::new(config.max_steps),
                outcomes: VecDeque::new(),
                draining: false,
            }),
        }))
    }

    /// Starts the next attempt.
    ///
    /// Fails if an attempt is still running or the policy is already
    /// complete.
    pub fn start(&self) -> MendloopResult<()> {
        let (attempt, cancelled, queued) = {
            let mut inner = self.inner.lock();
            if inner.attempt > 0 && !inner.attempt_done {
                return Err(MendloopError::illegal_state(
                    "start",
                    format!("attempt {} is still in progress", inner.attempt),
                ));
            }
            if inner.attempt > 0 && inner.state != OperationState::OperationFailure {
                return Err(MendloopError::illegal_state(
                    "start",
                    format!("operation already complete in state {:?}", inner.state),
                ));
            }

            let cancelled = inner.steps.clear();
            inner.attempt += 1;
            inner.attempt_done = false;
            inner.state = OperationState::Starting;

            let context: Arc<dyn StepContext> = Arc::new(AttemptContext {
                manager: self.self_ref.clone(),
                attempt: inner.attempt,
                deadline: self.deadline,
                executor: self.executor.clone(),
            });
            let queued = self.queue_steps(&mut inner, &context);
            (inner.attempt, cancelled, queued)
        };

        for step in cancelled {
            step.cancel();
        }

        let span = operation_span(&self.policy.actor, &self.policy.operation, self.request_id);
        span.record("attempt", attempt);
        let _enter = span.enter();
        info!(retries = self.policy.max_retries(), "Starting operation attempt");

        match queued {
            Ok(()) => self.start_front(),
            Err(e) => {
                warn!("Cannot run operation: {}", e);
                self.report_exception(attempt, e);
            }
        }
        Ok(())
    }

    fn queue_steps(&self, inner: &mut Inner, context: &Arc<dyn StepContext>) -> MendloopResult<()> {
        let mut steps = StepQueue::new(self.max_steps);
        if inner.target_entity.is_none() {
            match resolve_target(&self.policy, &self.event)? {
                TargetResolution::Resolved(target) => inner.target_entity = Some(target),
                TargetResolution::NeedsCustomQuery => steps.push(self.custom_query_step(context))?,
            }
        }
        steps.push(self.lock_step(context))?;
        if self.guard_enabled {
            steps.push(self.guard_step(context))?;
        }
        steps.push(self.policy_step(context))?;
        inner.steps = steps;
        Ok(())
    }

    fn custom_query_step(&self, context: &Arc<dyn StepContext>) -> Step {
        let manager = self.self_ref.clone();
        Step::new(
            AAI_ACTOR,
            CUSTOM_QUERY_OPERATION,
            false,
            context.clone(),
            Box::new(move || {
                let m = upgrade(&manager)?;
                let vnf_name = m
                    .event
                    .aai_value(keys::GENERIC_VNF_VNF_NAME)
                    .unwrap_or_else(|| m.event.target_name())
                    .to_string();
                let params = m
                    .params_for(vnf_name)
                    .for_actor(AAI_ACTOR, CUSTOM_QUERY_OPERATION);
                m.actors.build_operation(params)
            }),
        )
    }

    fn lock_step(&self, context: &Arc<dyn StepContext>) -> Step {
        let manager = self.self_ref.clone();
        let lock_context = context.clone();
        Step::new(
            LOCK_ACTOR,
            LOCK_OPERATION,
            false,
            context.clone(),
            Box::new(move || {
                let m = upgrade(&manager)?;
                Ok(Arc::new(LockOperation {
                    target: m.resolved_target()?,
                    hold: m.lock_hold(),
                    context: lock_context,
                }) as Arc<dyn Operation>)
            }),
        )
    }

    fn guard_step(&self, context: &Arc<dyn StepContext>) -> Step {
        let manager = self.self_ref.clone();
        Step::new(
            GUARD_ACTOR,
            GUARD_OPERATION,
            false,
            context.clone(),
            Box::new(move || {
                let m = upgrade(&manager)?;
                let params = m.params()?.guard_params();
                m.actors.build_operation(params)
            }),
        )
    }

    fn policy_step(&self, context: &Arc<dyn StepContext>) -> Step {
        let manager = self.self_ref.clone();
        Step::new(
            self.policy.actor.clone(),
            self.policy.operation.clone(),
            true,
            context.clone(),
            Box::new(move || {
                let m = upgrade(&manager)?;
                m.actors.build_operation(m.params()?)
            }),
        )
    }

    fn params_for(&self, target_entity: String) -> OperationParams {
        OperationParams {
            actor: self.policy.actor.clone(),
            operation: self.policy.operation.clone(),
            request_id: self.request_id,
            closed_loop_control_name: self.event.control_loop_name().to_string(),
            target_entity,
            target_type: self.policy.target.target_type,
            payload: self.policy.payload.clone(),
            enrichment: self.event.aai.clone().unwrap_or_default(),
            retries: self.policy.max_retries(),
            timeout: self.policy.timeout_duration(),
        }
    }

    fn params(&self) -> MendloopResult<OperationParams> {
        Ok(self.params_for(self.resolved_target()?))
    }

    fn resolved_target(&self) -> MendloopResult<String> {
        self.inner
            .lock()
            .target_entity
            .clone()
            .ok_or_else(|| MendloopError::invalid_target("target entity has not been resolved"))
    }

    /// How long the lock must be held to cover every attempt of the policy.
    pub fn lock_hold(&self) -> Duration {
        self.policy
            .timeout_duration()
            .saturating_mul(1 + self.policy.max_retries())
            .saturating_add(self.lock_safety_margin)
    }

    /// Builds and starts the step at the front of the queue.
    fn start_front(&self) {
        let (step, attempt) = {
            let inner = self.inner.lock();
            (inner.steps.front(), inner.attempt)
        };
        let Some(step) = step else {
            return;
        };

        if let Err(e) = step.init() {
            warn!(actor = %step.actor(), operation = %step.operation(), "Cannot build operation: {}", e);
            self.report_exception(attempt, e);
            return;
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        debug!(actor = %step.actor(), operation = %step.operation(), ?remaining, "Starting step");
        if let Err(e) = step.start(remaining) {
            debug!(actor = %step.actor(), "Step not started: {}", e);
        }
    }

    /// Turns a pre-execution error into a FAILURE_EXCEPTION outcome for the
    /// policy operation. Delivered from a separate task so callers holding
    /// their own locks never see a re-entrant `updated`.
    fn report_exception(&self, attempt: u32, error: MendloopError) {
        let target = self
            .inner
            .lock()
            .target_entity
            .clone()
            .unwrap_or_else(|| self.event.target_name().to_string());
        let mut outcome = OperationOutcome::new(&self.policy.actor, &self.policy.operation, target)
            .complete(OperationResult::FailureException, error.to_string());
        outcome.final_outcome = true;

        let manager = self.self_ref.clone();
        self.executor.spawn(async move {
            if let Some(m) = manager.upgrade() {
                m.enqueue(attempt, OutcomeKind::Complete, outcome);
            }
        });
    }

    fn request_lock(&self, attempt: u32, target_entity: &str, hold: Duration) -> LockFuture {
        let Some(context) = self.context.upgrade() else {
            let outcome = OperationOutcome::new(LOCK_ACTOR, LOCK_OPERATION, target_entity).failed();
            return async move { outcome }.boxed();
        };

        let manager = self.self_ref.clone();
        let on_unavailable: UnavailableListener = Box::new(move |outcome| {
            if let Some(m) = manager.upgrade() {
                m.enqueue(attempt, OutcomeKind::Complete, outcome);
            }
        });
        context.request_lock(target_entity, hold, on_unavailable)
    }

    fn enqueue(&self, attempt: u32, kind: OutcomeKind, outcome: OperationOutcome) {
        {
            let mut inner = self.inner.lock();
            inner.outcomes.push_back(QueuedOutcome {
                attempt,
                kind,
                outcome,
            });
            if inner.draining {
                return;
            }
            inner.draining = true;
        }

        loop {
            let effects = {
                let mut inner = self.inner.lock();
                match inner.outcomes.pop_front() {
                    Some(queued) => self.process(&mut inner, queued),
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };
            self.apply(effects);
        }
    }

    fn apply(&self, effects: Effects) {
        for step in effects.cancel {
            step.cancel();
        }
        if let Some((target, record)) = effects.record {
            self.history_store
                .store(self.request_id, &self.event, &target, &record);
        }
        if effects.start_next {
            self.start_front();
        }
        if effects.notify {
            if let Some(context) = self.context.upgrade() {
                context.updated(self);
            }
        }
    }

    fn process(&self, inner: &mut Inner, queued: QueuedOutcome) -> Effects {
        let mut effects = Effects::default();
        if queued.attempt != inner.attempt || inner.attempt_done {
            debug!(
                attempt = queued.attempt,
                current = inner.attempt,
                actor = %queued.outcome.actor,
                "Discarding stale outcome"
            );
            return effects;
        }

        let outcome = queued.outcome;
        match queued.kind {
            OutcomeKind::Abort => self.on_abort(inner, outcome, &mut effects),
            OutcomeKind::Start => self.on_start(inner, outcome, &mut effects),
            OutcomeKind::Complete => self.on_complete(inner, outcome, &mut effects),
        }
        effects
    }

    fn on_abort(&self, inner: &mut Inner, outcome: OperationOutcome, effects: &mut Effects) {
        if outcome.actor != CL_TIMEOUT_ACTOR {
            warn!(actor = %outcome.actor, "Unexpected abort outcome");
        }
        inner.timed_out = true;
        self.complete_attempt(inner, OperationState::OperationFinalFailure, outcome, effects);
    }

    fn on_start(&self, inner: &mut Inner, outcome: OperationOutcome, effects: &mut Effects) {
        if outcome.is_for(&self.policy.actor, &self.policy.operation) {
            inner.state = OperationState::OperationStarted;
            inner.operation_started = true;
            let entry = OperationAttempt {
                attempt: inner.attempt,
                result: outcome.result,
                record: outcome.to_record(),
            };
            inner.history.push(entry);
            effects.notify = true;
            return;
        }

        match outcome.actor.as_str() {
            GUARD_ACTOR => {
                inner.state = OperationState::GuardStarted;
                effects.notify = true;
            }
            LOCK_ACTOR | AAI_ACTOR => {}
            other => warn!(actor = %other, operation = %outcome.operation, "Start from unknown actor"),
        }
    }

    fn on_complete(&self, inner: &mut Inner, outcome: OperationOutcome, effects: &mut Effects) {
        if outcome.is_for(&self.policy.actor, &self.policy.operation) {
            let state = match outcome.result {
                OperationResult::Success => OperationState::OperationSuccess,
                OperationResult::Failure if inner.attempt <= self.policy.max_retries() => {
                    OperationState::OperationFailure
                }
                _ => OperationState::OperationFinalFailure,
            };
            self.complete_attempt(inner, state, outcome, effects);
            return;
        }

        match outcome.actor.as_str() {
            LOCK_ACTOR => self.on_lock_complete(inner, outcome, effects),
            GUARD_ACTOR => {
                if outcome.result.is_success() {
                    inner.state = OperationState::GuardPermitted;
                    self.advance(inner, GUARD_ACTOR, effects);
                    effects.notify = true;
                } else {
                    let denied = outcome.complete(OperationResult::FailureGuard, GUARD_DENIED_MSG);
                    self.complete_attempt(inner, OperationState::GuardDenied, denied, effects);
                }
            }
            AAI_ACTOR if outcome.operation == CUSTOM_QUERY_OPERATION => {
                self.on_query_complete(inner, outcome, effects)
            }
            other => warn!(actor = %other, operation = %outcome.operation, "Outcome from unknown actor"),
        }
    }

    fn on_lock_complete(&self, inner: &mut Inner, outcome: OperationOutcome, effects: &mut Effects) {
        if outcome.result.is_success() {
            self.advance(inner, LOCK_ACTOR, effects);
            return;
        }

        if outcome.result == OperationResult::FailureException {
            self.complete_attempt(inner, OperationState::OperationFinalFailure, outcome, effects);
            return;
        }

        let (state, failed) = if inner.operation_started {
            (
                OperationState::LockLost,
                outcome.complete(OperationResult::Failure, LOCK_LOST_MSG),
            )
        } else {
            (
                OperationState::LockDenied,
                outcome.complete(OperationResult::FailureGuard, LOCK_DENIED_MSG),
            )
        };
        self.complete_attempt(inner, state, failed, effects);
    }

    fn on_query_complete(&self, inner: &mut Inner, outcome: OperationOutcome, effects: &mut Effects) {
        if !outcome.result.is_success() {
            let message = outcome
                .message
                .clone()
                .unwrap_or_else(|| "custom query failed".to_string());
            let failed = outcome.complete(OperationResult::FailureException, message);
            self.complete_attempt(inner, OperationState::OperationFinalFailure, failed, effects);
            return;
        }

        match extract_vnf_id(outcome.response.as_ref()) {
            Ok(vnf_id) => {
                debug!(vnf_id = %vnf_id, "Resolved target from custom query");
                inner.target_entity = Some(vnf_id);
                self.advance(inner, AAI_ACTOR, effects);
            }
            Err(e) => {
                let failed = outcome.complete(OperationResult::FailureException, e.to_string());
                self.complete_attempt(inner, OperationState::OperationFinalFailure, failed, effects);
            }
        }
    }

    /// Discards the completed front step and schedules the next one.
    fn advance(&self, inner: &mut Inner, actor: &str, effects: &mut Effects) {
        match inner.steps.front() {
            Some(step) if step.actor() == actor => {
                inner.steps.next_step();
                effects.start_next = true;
            }
            _ => debug!(actor, "Completed step is not at the front of the queue"),
        }
    }

    /// Records the attempt's terminal disposition, replacing its start entry.
    fn complete_attempt(
        &self,
        inner: &mut Inner,
        state: OperationState,
        outcome: OperationOutcome,
        effects: &mut Effects,
    ) {
        inner.state = state;
        inner.attempt_done = true;

        let record = outcome.to_record();
        let entry = OperationAttempt {
            attempt: inner.attempt,
            result: outcome.result,
            record: record.clone(),
        };
        match inner.history.last_mut() {
            Some(last) if last.attempt == entry.attempt && last.is_started() => *last = entry,
            _ => inner.history.push(entry),
        }

        info!(
            request_id = %self.request_id,
            actor = %outcome.actor,
            operation = %outcome.operation,
            attempt = inner.attempt,
            result = %outcome.result,
            ?state,
            "Operation attempt finished"
        );

        effects.cancel.extend(inner.steps.clear());
        let target = inner
            .target_entity
            .clone()
            .unwrap_or_else(|| outcome.target.clone());
        effects.record = Some((target, record));
        effects.notify = true;
    }

    /// Stops the current attempt. Outcomes arriving afterwards are discarded.
    pub fn cancel(&self) {
        let steps = {
            let mut inner = self.inner.lock();
            inner.attempt_done = true;
            inner.steps.clear()
        };
        for step in steps {
            step.cancel();
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    /// Number of the current attempt, 0 before the first start.
    pub fn attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    pub fn is_attempt_done(&self) -> bool {
        self.inner.lock().attempt_done
    }

    /// True once no further attempt will be made.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.attempt_done && inner.state != OperationState::OperationFailure
    }

    pub fn is_timed_out(&self) -> bool {
        self.inner.lock().timed_out
    }

    pub fn target_entity(&self) -> Option<String> {
        self.inner.lock().target_entity.clone()
    }

    pub fn history(&self) -> Vec<OperationAttempt> {
        self.inner.lock().history.clone()
    }

    pub fn history_records(&self) -> Vec<ControlLoopOperation> {
        self.inner
            .lock()
            .history
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Last history entry in short form.
    pub fn operation_message(&self) -> Option<String> {
        self.inner
            .lock()
            .history
            .last()
            .map(|entry| entry.record.to_message())
    }

    /// Last history entry including outcome and timestamps.
    pub fn operation_history(&self) -> Option<String> {
        self.inner
            .lock()
            .history
            .last()
            .map(|entry| entry.record.to_history())
    }

    /// Result the policy chain advances on.
    pub fn operation_result(&self) -> OperationResult {
        let inner = self.inner.lock();
        let Some(last) = inner.history.last() else {
            return OperationResult::FailureException;
        };
        if last.result == OperationResult::Failure
            && inner.state == OperationState::OperationFinalFailure
            && self.policy.retries >= 1
        {
            OperationResult::FailureRetries
        } else {
            last.result
        }
    }
}

impl std::fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OperationManager")
            .field("request_id", &self.request_id)
            .field("policy", &self.policy.id)
            .field("state", &inner.state)
            .field("attempt", &inner.attempt)
            .field("target_entity", &inner.target_entity)
            .finish()
    }
}

fn upgrade(manager: &Weak<OperationManager>) -> MendloopResult<Arc<OperationManager>> {
    manager.upgrade().ok_or_else(|| MendloopError::Internal {
        message: "operation manager dropped".to_string(),
    })
}

/// Step context for one attempt. Tags every outcome with the attempt number.
struct AttemptContext {
    manager: Weak<OperationManager>,
    attempt: u32,
    deadline: Instant,
    executor: Handle,
}

impl AttemptContext {
    fn deliver(&self, kind: OutcomeKind, outcome: OperationOutcome) {
        if let Some(manager) = self.manager.upgrade() {
            manager.enqueue(self.attempt, kind, outcome);
        }
    }
}

impl StepContext for AttemptContext {
    fn deadline(&self) -> Instant {
        self.deadline
    }

    fn executor(&self) -> Handle {
        self.executor.clone()
    }

    fn on_start(&self, outcome: OperationOutcome) {
        self.deliver(OutcomeKind::Start, outcome);
    }

    fn on_complete(&self, outcome: OperationOutcome) {
        self.deliver(OutcomeKind::Complete, outcome);
    }

    fn abort(&self, outcome: OperationOutcome) {
        self.deliver(OutcomeKind::Abort, outcome);
    }

    fn request_lock(&self, target_entity: &str, hold: Duration) -> LockFuture {
        match self.manager.upgrade() {
            Some(manager) => manager.request_lock(self.attempt, target_entity, hold),
            None => {
                let outcome =
                    OperationOutcome::new(LOCK_ACTOR, LOCK_OPERATION, target_entity).failed();
                async move { outcome }.boxed()
            }
        }
    }
}

/// Acquires or extends the target lock as an ordinary step.
struct LockOperation {
    target: String,
    hold: Duration,
    context: Arc<dyn StepContext>,
}

#[async_trait]
impl Operation for LockOperation {
    fn actor_name(&self) -> &str {
        LOCK_ACTOR
    }

    fn name(&self) -> &str {
        LOCK_OPERATION
    }

    fn target_entity(&self) -> &str {
        &self.target
    }

    async fn start(&self) -> MendloopResult<OperationOutcome> {
        Ok(self.context.request_lock(&self.target, self.hold).await)
    }
}
