//! Control-loop transaction metrics
//!
//! Every notification an event emits passes through [`TransactionMetrics`].
//! The first notification for a request id opens a transaction; a final
//! notification or a rejection closes it and records the elapsed time.
//!
//! In-flight transactions are bounded by count and by age. Those pushed out
//! before they finish are closed as [`TransactionStatus::Evicted`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MetricsConfig;
use crate::error::{MendloopError, MendloopResult};
use crate::notification::ControlLoopNotification;
use crate::types::NotificationType;

const EVICTED_MSG: &str = "EVICTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Success,
    Failure,
    Evicted,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "success",
            TransactionStatus::Failure => "failure",
            TransactionStatus::Evicted => "evicted",
        }
    }
}

/// A closed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub request_id: Uuid,
    pub control_loop_name: String,
    pub target: Option<String>,
    /// Notification that closed the transaction, or the opening one if evicted
    pub notification: NotificationType,
    pub response_code: &'static str,
    pub status: TransactionStatus,
    pub message: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub elapsed: Duration,
}

impl TransactionRecord {
    fn new(
        notification: &ControlLoopNotification,
        request_id: Uuid,
        status: TransactionStatus,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            control_loop_name: notification.closed_loop_control_name.clone(),
            target: notification.target.clone(),
            notification: notification.notification,
            response_code: notification.notification.response_code(),
            status,
            message: notification.message.clone(),
            start,
            end,
            elapsed: (end - start).to_std().unwrap_or_default(),
        }
    }
}

struct InFlight {
    first: ControlLoopNotification,
    opened_at: Instant,
    seq: u64,
}

struct Cache {
    max_transactions: usize,
    transaction_timeout: Duration,
    entries: HashMap<Uuid, InFlight>,
    /// Opening order; entries whose sequence no longer matches are stale
    order: VecDeque<(u64, Uuid)>,
    next_seq: u64,
    completed: VecDeque<TransactionRecord>,
}

impl Cache {
    fn new(max_transactions: usize, transaction_timeout: Duration) -> Self {
        Self {
            max_transactions,
            transaction_timeout,
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            completed: VecDeque::new(),
        }
    }

    /// Removes and returns the oldest live entry.
    fn pop_oldest(&mut self) -> Option<InFlight> {
        while let Some((seq, id)) = self.order.pop_front() {
            if self.entries.get(&id).map(|e| e.seq) == Some(seq) {
                return self.entries.remove(&id);
            }
        }
        None
    }

    fn oldest(&mut self) -> Option<&InFlight> {
        while let Some(&(seq, id)) = self.order.front() {
            if self.entries.get(&id).map(|e| e.seq) == Some(seq) {
                return self.entries.get(&id);
            }
            self.order.pop_front();
        }
        None
    }
}

/// Tracks control-loop transactions and exports them as Prometheus metrics.
pub struct TransactionMetrics {
    registry: Registry,
    in_flight: IntGauge,
    notifications: IntCounterVec,
    transactions: IntCounterVec,
    operations: IntCounterVec,
    duration: Histogram,
    cache: Mutex<Cache>,
}

impl TransactionMetrics {
    pub fn new(config: &MetricsConfig) -> MendloopResult<Self> {
        let registry = Registry::new();

        let in_flight = IntGauge::new(
            "mendloop_transactions_in_flight",
            "Control loops currently being tracked",
        )?;
        let notifications = IntCounterVec::new(
            Opts::new(
                "mendloop_notifications_total",
                "Notifications emitted by notification type",
            ),
            &["notification"],
        )?;
        let transactions = IntCounterVec::new(
            Opts::new(
                "mendloop_transactions_total",
                "Closed control-loop transactions by status",
            ),
            &["status"],
        )?;
        let operations = IntCounterVec::new(
            Opts::new(
                "mendloop_operations_total",
                "Finished operation attempts by actor, operation and outcome",
            ),
            &["actor", "operation", "outcome"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "mendloop_transaction_duration_seconds",
                "Elapsed time of closed control-loop transactions",
            )
            .buckets(vec![
                0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0,
            ]),
        )?;

        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(notifications.clone()))?;
        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            in_flight,
            notifications,
            transactions,
            operations,
            duration,
            cache: Mutex::new(Cache::new(
                config.max_transactions.max(1),
                config.transaction_timeout,
            )),
        })
    }

    /// Accounts for one emitted notification.
    pub fn transaction_event(&self, notification: &ControlLoopNotification) {
        let Some(request_id) = notification.request_id else {
            warn!(notification = %notification.notification, "Notification without request id");
            return;
        };
        self.notifications
            .with_label_values(&[notification.notification.as_str()])
            .inc();

        let mut cache = self.cache.lock();
        self.expire(&mut cache);

        if notification.notification.is_terminal() {
            let start = match cache.entries.remove(&request_id) {
                Some(open) => open.first.notification_time,
                None => notification.notification_time,
            };
            let status = match notification.notification {
                NotificationType::FinalSuccess | NotificationType::FinalOpenloop => {
                    TransactionStatus::Success
                }
                _ => TransactionStatus::Failure,
            };
            let record = TransactionRecord::new(
                notification,
                request_id,
                status,
                start,
                notification.notification_time,
            );
            self.close(&mut cache, record);
        } else {
            if !cache.entries.contains_key(&request_id) {
                self.open(&mut cache, request_id, notification);
            }
            self.operation(notification);
        }

        self.in_flight.set(cache.entries.len() as i64);
    }

    fn open(&self, cache: &mut Cache, request_id: Uuid, notification: &ControlLoopNotification) {
        let seq = cache.next_seq;
        cache.next_seq += 1;
        cache.entries.insert(
            request_id,
            InFlight {
                first: notification.clone(),
                opened_at: Instant::now(),
                seq,
            },
        );
        cache.order.push_back((seq, request_id));
        debug!(%request_id, "Transaction opened");

        while cache.entries.len() > cache.max_transactions {
            match cache.pop_oldest() {
                Some(evicted) => self.evict(cache, evicted),
                None => break,
            }
        }
    }

    fn operation(&self, notification: &ControlLoopNotification) {
        if !matches!(
            notification.notification,
            NotificationType::OperationSuccess | NotificationType::OperationFailure
        ) {
            return;
        }
        if let Some(last) = notification.history.last() {
            let outcome = last.outcome.as_deref().unwrap_or("UNKNOWN");
            self.operations
                .with_label_values(&[last.actor.as_str(), last.operation.as_str(), outcome])
                .inc();
        }
    }

    fn expire(&self, cache: &mut Cache) {
        let now = Instant::now();
        let timeout = cache.transaction_timeout;
        loop {
            let expired = match cache.oldest() {
                Some(oldest) => now.duration_since(oldest.opened_at) >= timeout,
                None => false,
            };
            if !expired {
                return;
            }
            if let Some(evicted) = cache.pop_oldest() {
                self.evict(cache, evicted);
            }
        }
    }

    fn evict(&self, cache: &mut Cache, evicted: InFlight) {
        let first = evicted.first;
        let Some(request_id) = first.request_id else {
            return;
        };
        let mut record = TransactionRecord::new(
            &first,
            request_id,
            TransactionStatus::Evicted,
            first.notification_time,
            Utc::now(),
        );
        record.message = Some(EVICTED_MSG.to_string());
        self.close(cache, record);
    }

    fn close(&self, cache: &mut Cache, record: TransactionRecord) {
        self.transactions
            .with_label_values(&[record.status.as_str()])
            .inc();
        self.duration.observe(record.elapsed.as_secs_f64());
        info!(
            request_id = %record.request_id,
            control_loop = %record.control_loop_name,
            notification = %record.notification,
            code = record.response_code,
            status = record.status.as_str(),
            elapsed = ?record.elapsed,
            "Transaction closed"
        );

        if cache.completed.len() >= cache.max_transactions {
            cache.completed.pop_front();
        }
        cache.completed.push_back(record);
    }

    /// Evicts transactions that outlived the timeout.
    pub fn refresh(&self) {
        let mut cache = self.cache.lock();
        self.expire(&mut cache);
        self.in_flight.set(cache.entries.len() as i64);
    }

    /// Drops every in-flight transaction and applies new limits.
    pub fn reset(&self, max_transactions: usize, transaction_timeout: Duration) {
        let mut cache = self.cache.lock();
        *cache = Cache::new(max_transactions.max(1), transaction_timeout);
        self.in_flight.set(0);
    }

    pub fn transaction_ids(&self) -> Vec<Uuid> {
        self.cache.lock().entries.keys().copied().collect()
    }

    /// First notification of each in-flight transaction.
    pub fn transactions(&self) -> Vec<ControlLoopNotification> {
        self.cache
            .lock()
            .entries
            .values()
            .map(|e| e.first.clone())
            .collect()
    }

    pub fn transaction(&self, request_id: Uuid) -> Option<ControlLoopNotification> {
        self.cache
            .lock()
            .entries
            .get(&request_id)
            .map(|e| e.first.clone())
    }

    /// Stops tracking a transaction without closing it.
    pub fn remove_transaction(&self, request_id: Uuid) -> bool {
        let mut cache = self.cache.lock();
        let removed = cache.entries.remove(&request_id).is_some();
        self.in_flight.set(cache.entries.len() as i64);
        removed
    }

    pub fn cache_occupancy(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn max_transactions(&self) -> usize {
        self.cache.lock().max_transactions
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.cache.lock().transaction_timeout
    }

    /// Most recently closed transactions, oldest first.
    pub fn completed(&self) -> Vec<TransactionRecord> {
        self.cache.lock().completed.iter().cloned().collect()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric.
    pub fn encode(&self) -> MendloopResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MendloopError::Internal {
            message: format!("metrics are not valid UTF-8: {}", e),
        })
    }
}

impl std::fmt::Debug for TransactionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("TransactionMetrics")
            .field("max_transactions", &cache.max_transactions)
            .field("transaction_timeout", &cache.transaction_timeout)
            .field("occupancy", &cache.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OperationOutcome;
    use crate::test_helpers::vm_event;
    use pretty_assertions::assert_eq;

    fn metrics(max_transactions: usize, timeout_secs: u64) -> TransactionMetrics {
        TransactionMetrics::new(&MetricsConfig {
            enabled: true,
            max_transactions,
            transaction_timeout: Duration::from_secs(timeout_secs),
        })
        .unwrap()
    }

    fn notification_at(
        event: &crate::event::ControlLoopEvent,
        kind: NotificationType,
        seconds: i64,
    ) -> ControlLoopNotification {
        let mut notification = ControlLoopNotification::for_event(event, kind);
        notification.notification_time =
            DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0).unwrap();
        notification
    }

    #[tokio::test]
    async fn test_transaction_elapsed_from_first_notification() {
        let m = metrics(10, 3600);
        let event = vm_event();
        let request_id = event.request_id.unwrap();

        m.transaction_event(&notification_at(&event, NotificationType::Active, 0));
        m.transaction_event(&notification_at(&event, NotificationType::Operation, 5));
        assert_eq!(m.cache_occupancy(), 1);
        assert_eq!(m.transaction_ids(), vec![request_id]);
        assert_eq!(
            m.transaction(request_id).unwrap().notification,
            NotificationType::Active
        );

        m.transaction_event(&notification_at(&event, NotificationType::FinalSuccess, 42));
        assert_eq!(m.cache_occupancy(), 0);
        assert_eq!(m.in_flight.get(), 0);

        let completed = m.completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, TransactionStatus::Success);
        assert_eq!(completed[0].response_code, "401");
        assert_eq!(completed[0].elapsed, Duration::from_secs(42));
        assert_eq!(m.transactions.with_label_values(&["success"]).get(), 1);
        assert_eq!(m.duration.get_sample_count(), 1);
        assert_eq!(m.notifications.with_label_values(&["OPERATION"]).get(), 1);
    }

    #[tokio::test]
    async fn test_rejection_without_open_transaction() {
        let m = metrics(10, 3600);
        let event = vm_event();
        m.transaction_event(&notification_at(&event, NotificationType::Rejected, 7));

        let completed = m.completed();
        assert_eq!(completed[0].status, TransactionStatus::Failure);
        assert_eq!(completed[0].elapsed, Duration::ZERO);
        assert_eq!(completed[0].response_code, "200");
        assert_eq!(m.cache_occupancy(), 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let m = metrics(2, 3600);
        let events: Vec<_> = (0..3).map(|_| vm_event()).collect();
        for event in &events {
            m.transaction_event(&notification_at(event, NotificationType::Active, 0));
        }

        assert_eq!(m.cache_occupancy(), 2);
        assert!(m.transaction(events[0].request_id.unwrap()).is_none());
        assert!(m.transaction(events[2].request_id.unwrap()).is_some());

        let completed = m.completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].request_id, events[0].request_id.unwrap());
        assert_eq!(completed[0].status, TransactionStatus::Evicted);
        assert_eq!(completed[0].message.as_deref(), Some(EVICTED_MSG));
        assert_eq!(m.transactions.with_label_values(&["evicted"]).get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_transactions_are_evicted() {
        let m = metrics(10, 60);
        let stale = vm_event();
        let fresh = vm_event();
        m.transaction_event(&notification_at(&stale, NotificationType::Active, 0));
        tokio::time::advance(Duration::from_secs(30)).await;
        m.transaction_event(&notification_at(&fresh, NotificationType::Active, 30));

        tokio::time::advance(Duration::from_secs(31)).await;
        m.refresh();

        assert_eq!(m.transaction_ids(), vec![fresh.request_id.unwrap()]);
        assert_eq!(m.completed()[0].request_id, stale.request_id.unwrap());
        assert_eq!(m.in_flight.get(), 1);

        // a late final for the evicted loop closes a fresh transaction
        m.transaction_event(&notification_at(&stale, NotificationType::FinalFailure, 90));
        assert_eq!(m.completed().len(), 2);
        assert_eq!(m.completed()[1].elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_operation_outcomes_counted() {
        let m = metrics(10, 3600);
        let event = vm_event();
        let record = OperationOutcome::new("APPC", "Restart", "vm-01")
            .failed()
            .to_record();
        let notification = notification_at(&event, NotificationType::OperationFailure, 3)
            .with_history(vec![record]);
        m.transaction_event(&notification);

        assert_eq!(
            m.operations
                .with_label_values(&["APPC", "Restart", "FAILURE"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_request_id_is_ignored() {
        let m = metrics(10, 3600);
        let mut notification = notification_at(&vm_event(), NotificationType::Active, 0);
        notification.request_id = None;
        m.transaction_event(&notification);

        assert_eq!(m.cache_occupancy(), 0);
        assert_eq!(m.notifications.with_label_values(&["ACTIVE"]).get(), 0);
    }

    #[tokio::test]
    async fn test_reset_and_encode() {
        let m = metrics(10, 3600);
        let event = vm_event();
        m.transaction_event(&notification_at(&event, NotificationType::Active, 0));
        assert!(m.remove_transaction(event.request_id.unwrap()));
        assert!(!m.remove_transaction(event.request_id.unwrap()));

        m.transaction_event(&notification_at(&event, NotificationType::Active, 0));
        m.reset(5, Duration::from_secs(10));
        assert_eq!(m.cache_occupancy(), 0);
        assert_eq!(m.max_transactions(), 5);
        assert_eq!(m.transaction_timeout(), Duration::from_secs(10));
        assert!(m.completed().is_empty());

        let text = m.encode().unwrap();
        assert!(text.contains("mendloop_notifications_total"));
        assert!(text.contains("mendloop_transactions_in_flight 0"));
    }
}
