//! Execution of single operation attempts
//!
//! A [`Step`] wraps one remote operation. It builds the operation lazily,
//! runs it on the context's executor under the control-loop deadline, and
//! reports through the [`StepContext`] callbacks:
//!
//! - `on_start` when the operation begins
//! - `on_complete` with the operation's outcome, or a synthetic
//!   FAILURE_EXCEPTION outcome if it returned an error or panicked
//! - `abort` with a synthetic [`CL_TIMEOUT_ACTOR`] outcome if the deadline
//!   passes first; the operation future is dropped at that point
//!
//! Retry bookkeeping is not a Step concern; see
//! [`OperationManager`](crate::operation_manager::OperationManager).

use futures::FutureExt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn, Instrument};

use crate::actor::{Operation, CL_TIMEOUT_ACTOR};
use crate::error::{MendloopError, MendloopResult};
use crate::lock_coordinator::LockFuture;
use crate::outcome::OperationOutcome;
use crate::types::OperationResult;

/// Hard cap on the number of steps queued for one policy.
pub const MAX_STEPS: usize = 30;

pub const CL_TIMEOUT_MSG: &str = "Control Loop timed out";

/// Roughly thirty years; stands in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `Instant::now() + timeout`, clamped instead of overflowing.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Environment a [`Step`] executes within. Implemented by the orchestrator.
pub trait StepContext: Send + Sync {
    /// The single control-loop deadline.
    fn deadline(&self) -> Instant;

    /// Time left until the deadline.
    fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    /// Runtime on which step tasks are spawned.
    fn executor(&self) -> Handle;

    fn on_start(&self, outcome: OperationOutcome);

    fn on_complete(&self, outcome: OperationOutcome);

    /// Short-circuits the control loop, e.g. on deadline expiry.
    fn abort(&self, outcome: OperationOutcome);

    /// Requests the lock on a target; loss is reported via `on_complete`.
    fn request_lock(&self, target_entity: &str, hold: Duration) -> LockFuture;
}

pub type OperationBuilder = Box<dyn FnOnce() -> MendloopResult<Arc<dyn Operation>> + Send>;

/// One queued operation attempt.
pub struct Step {
    actor: String,
    operation: String,
    final_step: bool,
    builder: Mutex<Option<OperationBuilder>>,
    built: OnceCell<Arc<dyn Operation>>,
    context: Arc<dyn StepContext>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl Step {
    /// `final_step` marks the step whose completion ends the policy.
    pub fn new(
        actor: impl Into<String>,
        operation: impl Into<String>,
        final_step: bool,
        context: Arc<dyn StepContext>,
        builder: OperationBuilder,
    ) -> Self {
        Self {
            actor: actor.into(),
            operation: operation.into(),
            final_step,
            builder: Mutex::new(Some(builder)),
            built: OnceCell::new(),
            context,
            task: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_final(&self) -> bool {
        self.final_step
    }

    pub fn is_initialized(&self) -> bool {
        self.built.get().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Builds the operation. Building happens at most once per step.
    pub fn init(&self) -> MendloopResult<Arc<dyn Operation>> {
        self.built
            .get_or_try_init(|| {
                let builder = self.builder.lock().take().ok_or_else(|| {
                    MendloopError::illegal_state(
                        "step init",
                        format!("{}.{} already failed to build", self.actor, self.operation),
                    )
                })?;
                debug!(actor = %self.actor, operation = %self.operation, "Building operation");
                builder()
            })
            .cloned()
    }

    /// Starts the operation with `remaining` time before the control-loop deadline.
    pub fn start(&self, remaining: Duration) -> MendloopResult<()> {
        let operation = self.built.get().cloned().ok_or_else(|| {
            MendloopError::illegal_state(
                "step start",
                format!("{}.{} has not been initialized", self.actor, self.operation),
            )
        })?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(MendloopError::illegal_state(
                "step start",
                format!("{}.{} was cancelled", self.actor, self.operation),
            ));
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return Err(MendloopError::illegal_state(
                "step start",
                format!("{}.{} already started", self.actor, self.operation),
            ));
        }

        let span = tracing::debug_span!(
            "step",
            actor = %self.actor,
            operation = %self.operation,
            target = %operation.target_entity(),
        );
        let fut = run_operation(self.context.clone(), operation, remaining, self.final_step);
        *task = Some(self.context.executor().spawn(fut.instrument(span)));
        Ok(())
    }

    /// Best-effort cancellation. Safe to call repeatedly or when idle.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            if !handle.is_finished() {
                debug!(actor = %self.actor, operation = %self.operation, "Cancelling step");
            }
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("actor", &self.actor)
            .field("operation", &self.operation)
            .field("final_step", &self.final_step)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

async fn run_operation(
    context: Arc<dyn StepContext>,
    operation: Arc<dyn Operation>,
    remaining: Duration,
    final_step: bool,
) {
    let mut started = OperationOutcome::new(
        operation.actor_name(),
        operation.name(),
        operation.target_entity(),
    );
    started.final_outcome = final_step;
    context.on_start(started.clone());

    let run = AssertUnwindSafe(operation.start()).catch_unwind();
    match tokio::time::timeout(remaining, run).await {
        Ok(Ok(Ok(mut outcome))) => {
            if outcome.end.is_none() {
                outcome.end = Some(chrono::Utc::now());
            }
            outcome.final_outcome = final_step;
            context.on_complete(outcome);
        }
        Ok(Ok(Err(e))) => {
            warn!("Exception starting operation: {}", e);
            context.on_complete(started.complete(OperationResult::FailureException, e.to_string()));
        }
        Ok(Err(_)) => {
            error!("Operation panicked");
            context.on_complete(
                started.complete(OperationResult::FailureException, "operation panicked"),
            );
        }
        Err(_) => {
            warn!(?remaining, "Control loop timeout");
            let mut timeout = OperationOutcome::new(
                CL_TIMEOUT_ACTOR,
                operation.name(),
                operation.target_entity(),
            )
            .complete(OperationResult::FailureTimeout, CL_TIMEOUT_MSG);
            timeout.start = started.start;
            timeout.final_outcome = true;
            context.abort(timeout);
        }
    }
}

/// Bounded queue of steps. Only the front step is ever started.
#[derive(Debug)]
pub struct StepQueue {
    steps: VecDeque<Arc<Step>>,
    max_steps: usize,
}

impl StepQueue {
    pub fn new(max_steps: usize) -> Self {
        Self {
            steps: VecDeque::new(),
            max_steps,
        }
    }

    pub fn push(&mut self, step: Step) -> MendloopResult<()> {
        if self.steps.len() >= self.max_steps {
            return Err(MendloopError::StepQueueFull {
                max: self.max_steps,
            });
        }
        self.steps.push_back(Arc::new(step));
        Ok(())
    }

    pub fn front(&self) -> Option<Arc<Step>> {
        self.steps.front().cloned()
    }

    /// Discards the front step.
    pub fn next_step(&mut self) -> Option<Arc<Step>> {
        self.steps.pop_front()
    }

    /// Removes every step, returning them so the caller can cancel them.
    pub fn clear(&mut self) -> Vec<Arc<Step>> {
        self.steps.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }
}

impl Default for StepQueue {
    fn default() -> Self {
        Self::new(MAX_STEPS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start(OperationOutcome),
        Complete(OperationOutcome),
        Abort(OperationOutcome),
    }

    struct TestContext {
        deadline: Instant,
        tx: mpsc::UnboundedSender<Call>,
    }

    impl TestContext {
        fn new(budget: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    deadline: Instant::now() + budget,
                    tx,
                }),
                rx,
            )
        }
    }

    impl StepContext for TestContext {
        fn deadline(&self) -> Instant {
            self.deadline
        }

        fn executor(&self) -> Handle {
            Handle::current()
        }

        fn on_start(&self, outcome: OperationOutcome) {
            let _ = self.tx.send(Call::Start(outcome));
        }

        fn on_complete(&self, outcome: OperationOutcome) {
            let _ = self.tx.send(Call::Complete(outcome));
        }

        fn abort(&self, outcome: OperationOutcome) {
            let _ = self.tx.send(Call::Abort(outcome));
        }

        fn request_lock(&self, target_entity: &str, _hold: Duration) -> LockFuture {
            let outcome = OperationOutcome::new("LOCK", "Lock", target_entity).succeeded();
            async move { outcome }.boxed()
        }
    }

    enum Behavior {
        Succeed,
        Fail,
        Error,
        Hang,
    }

    struct TestOperation {
        behavior: Behavior,
    }

    #[async_trait]
    impl Operation for TestOperation {
        fn actor_name(&self) -> &str {
            "APPC"
        }

        fn name(&self) -> &str {
            "Restart"
        }

        fn target_entity(&self) -> &str {
            "vm-01"
        }

        async fn start(&self) -> MendloopResult<OperationOutcome> {
            let outcome = OperationOutcome::new("APPC", "Restart", "vm-01");
            match self.behavior {
                Behavior::Succeed => Ok(outcome.succeeded()),
                Behavior::Fail => Ok(outcome.failed()),
                Behavior::Error => Err(MendloopError::OperationFailed {
                    actor: "APPC".into(),
                    operation: "Restart".into(),
                    details: "connection refused".into(),
                }),
                Behavior::Hang => {
                    futures::future::pending::<()>().await;
                    Ok(outcome.succeeded())
                }
            }
        }
    }

    fn step(ctx: Arc<TestContext>, behavior: Behavior, builds: Arc<AtomicUsize>) -> Step {
        Step::new(
            "APPC",
            "Restart",
            true,
            ctx,
            Box::new(move || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(TestOperation { behavior }) as Arc<dyn Operation>)
            }),
        )
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let (ctx, _rx) = TestContext::new(Duration::from_secs(60));
        let step = step(ctx, Behavior::Succeed, Arc::new(AtomicUsize::new(0)));
        let err = step.start(Duration::from_secs(1)).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[tokio::test]
    async fn test_builds_once_and_completes() {
        let (ctx, mut rx) = TestContext::new(Duration::from_secs(60));
        let builds = Arc::new(AtomicUsize::new(0));
        let step = step(ctx, Behavior::Succeed, builds.clone());

        step.init().unwrap();
        step.init().unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(step.is_initialized());

        step.start(Duration::from_secs(10)).unwrap();
        assert!(step.start(Duration::from_secs(10)).is_err());

        match rx.recv().await.unwrap() {
            Call::Start(outcome) => assert!(outcome.is_started()),
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Call::Complete(outcome) => {
                assert_eq!(outcome.result, OperationResult::Success);
                assert!(outcome.final_outcome);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_is_delivered_as_completion() {
        let (ctx, mut rx) = TestContext::new(Duration::from_secs(60));
        let step = step(ctx, Behavior::Fail, Arc::new(AtomicUsize::new(0)));
        step.init().unwrap();
        step.start(Duration::from_secs(10)).unwrap();

        rx.recv().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Call::Complete(OperationOutcome { result: OperationResult::Failure, .. })
        ));
    }

    #[tokio::test]
    async fn test_error_becomes_exception_outcome() {
        let (ctx, mut rx) = TestContext::new(Duration::from_secs(60));
        let step = step(ctx, Behavior::Error, Arc::new(AtomicUsize::new(0)));
        step.init().unwrap();
        step.start(Duration::from_secs(10)).unwrap();

        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            Call::Complete(outcome) => {
                assert_eq!(outcome.result, OperationResult::FailureException);
                assert!(outcome.message.unwrap().contains("connection refused"));
                assert_eq!(outcome.actor, "APPC");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_with_timeout_outcome() {
        let (ctx, mut rx) = TestContext::new(Duration::from_secs(5));
        let step = step(ctx.clone(), Behavior::Hang, Arc::new(AtomicUsize::new(0)));
        step.init().unwrap();
        step.start(ctx.remaining()).unwrap();

        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            Call::Abort(outcome) => {
                assert_eq!(outcome.actor, CL_TIMEOUT_ACTOR);
                assert_eq!(outcome.result, OperationResult::FailureTimeout);
                assert_eq!(outcome.message.as_deref(), Some(CL_TIMEOUT_MSG));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_outcome() {
        let (ctx, mut rx) = TestContext::new(Duration::from_secs(5));
        let step = step(ctx, Behavior::Hang, Arc::new(AtomicUsize::new(0)));
        step.init().unwrap();
        step.start(Duration::from_secs(5)).unwrap();

        assert!(matches!(rx.recv().await.unwrap(), Call::Start(_)));
        step.cancel();
        step.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert!(step.start(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_cancel_when_idle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(TestContext {
            deadline: Instant::now(),
            tx,
        });
        let step = step(ctx, Behavior::Succeed, Arc::new(AtomicUsize::new(0)));
        step.cancel();
        assert!(!step.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_clamps_huge_timeouts() {
        let now = Instant::now();
        assert_eq!(deadline_after(Duration::from_secs(5)), now + Duration::from_secs(5));

        let far = deadline_after(Duration::MAX);
        assert!(far > now + Duration::from_secs(86_400 * 365));
        assert_eq!(deadline_after(Duration::from_secs(u64::MAX)), far);
    }

    proptest! {
        #[test]
        fn prop_queue_never_exceeds_cap(max in 1usize..40, pushes in 0usize..80) {
            let (tx, _rx) = mpsc::unbounded_channel();
            let ctx = Arc::new(TestContext { deadline: Instant::now(), tx });
            let mut queue = StepQueue::new(max);
            let mut accepted = 0;
            for _ in 0..pushes {
                let s = step(ctx.clone(), Behavior::Succeed, Arc::new(AtomicUsize::new(0)));
                match queue.push(s) {
                    Ok(()) => accepted += 1,
                    Err(MendloopError::StepQueueFull { max: m }) => prop_assert_eq!(m, max),
                    Err(e) => prop_assert!(false, "unexpected error {}", e),
                }
                prop_assert!(queue.len() <= max);
            }
            prop_assert_eq!(accepted, pushes.min(max));

            let mut popped = 0;
            while queue.next_step().is_some() {
                popped += 1;
            }
            prop_assert_eq!(popped, accepted);
        }
    }
}
