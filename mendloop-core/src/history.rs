//! Operation history persistence
//!
//! The engine hands every terminal disposition to a [`HistoryStore`]. Stores
//! are fire-and-forget: they must not block the caller and never report
//! failure back into orchestration.
//!
//! [`HistoryDataManager`] is the production store. It keeps a bounded queue
//! that a background task drains in batches into a [`HistoryBackend`]. When
//! the queue is full the oldest record is discarded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::error::{MendloopError, MendloopResult};
use crate::event::ControlLoopEvent;
use crate::outcome::ControlLoopOperation;

/// A persisted history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub request_id: Uuid,
    pub closed_loop_name: String,
    pub target_entity: String,
    pub actor: String,
    pub operation: String,
    pub subrequest_id: Option<String>,
    pub outcome: Option<String>,
    pub message: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn new(
        request_id: Uuid,
        event: &ControlLoopEvent,
        target_entity: &str,
        operation: &ControlLoopOperation,
    ) -> Self {
        Self {
            request_id,
            closed_loop_name: event.control_loop_name().to_string(),
            target_entity: target_entity.to_string(),
            actor: operation.actor.clone(),
            operation: operation.operation.clone(),
            subrequest_id: operation.subrequest_id.clone(),
            outcome: operation.outcome.clone(),
            message: operation.message.clone(),
            start: operation.start,
            end: operation.end,
        }
    }
}

/// Sink for terminal operation records.
pub trait HistoryStore: Send + Sync {
    fn store(
        &self,
        request_id: Uuid,
        event: &ControlLoopEvent,
        target_entity: &str,
        operation: &ControlLoopOperation,
    );
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistoryStore;

impl HistoryStore for NoopHistoryStore {
    fn store(&self, _: Uuid, _: &ControlLoopEvent, _: &str, _: &ControlLoopOperation) {}
}

/// Keeps records in memory. Usable directly as a store or as a manager backend.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, request_id: Uuid) -> Vec<HistoryRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn store(
        &self,
        request_id: Uuid,
        event: &ControlLoopEvent,
        target_entity: &str,
        operation: &ControlLoopOperation,
    ) {
        self.records
            .lock()
            .push(HistoryRecord::new(request_id, event, target_entity, operation));
    }
}

/// Destination the history manager writes batches to.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn write_batch(&self, batch: &[HistoryRecord]) -> MendloopResult<()>;
}

#[async_trait]
impl HistoryBackend for MemoryHistoryStore {
    async fn write_batch(&self, batch: &[HistoryRecord]) -> MendloopResult<()> {
        self.records.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Appends records to a JSON-lines file.
pub struct JsonlHistoryBackend {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JsonlHistoryBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryBackend for JsonlHistoryBackend {
    async fn write_batch(&self, batch: &[HistoryRecord]) -> MendloopResult<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let file = guard.as_mut().ok_or_else(|| MendloopError::Internal {
            message: "history file not open".to_string(),
        })?;

        let mut buf = Vec::new();
        for record in batch {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

struct Shared {
    queue: Mutex<VecDeque<HistoryRecord>>,
    notify: Notify,
    stopped: AtomicBool,
    dropped: AtomicU64,
}

/// Asynchronous, bounded history store.
pub struct HistoryDataManager {
    shared: Arc<Shared>,
    max_queue_length: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryDataManager {
    /// Creates the manager and spawns its writer task on the current runtime.
    pub fn new(config: &HistoryConfig, backend: Arc<dyn HistoryBackend>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let batch_size = config.batch_size.max(1);
        let worker = tokio::spawn(Self::run(shared.clone(), backend, batch_size));

        info!(
            max_queue_length = config.max_queue_length,
            batch_size, "Started operation history manager"
        );

        Self {
            shared,
            max_queue_length: config.max_queue_length.max(1),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Number of records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stops accepting records, flushes what is queued, and waits for the writer.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("History writer task failed: {}", e);
            }
        }
        info!("Stopped operation history manager");
    }

    async fn run(shared: Arc<Shared>, backend: Arc<dyn HistoryBackend>, batch_size: usize) {
        loop {
            let batch: Vec<HistoryRecord> = {
                let mut queue = shared.queue.lock();
                let n = queue.len().min(batch_size);
                queue.drain(..n).collect()
            };

            if batch.is_empty() {
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                shared.notify.notified().await;
                continue;
            }

            debug!("Writing {} history records", batch.len());
            if let Err(e) = backend.write_batch(&batch).await {
                error!("Failed to store {} history records: {}", batch.len(), e);
            }
        }
    }
}

impl HistoryStore for HistoryDataManager {
    fn store(
        &self,
        request_id: Uuid,
        event: &ControlLoopEvent,
        target_entity: &str,
        operation: &ControlLoopOperation,
    ) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            warn!(%request_id, "History manager stopped, discarding record");
            return;
        }

        let record = HistoryRecord::new(request_id, event, target_entity, operation);
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.max_queue_length {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%request_id, "History queue full, discarded oldest record");
            }
            queue.push_back(record);
        }
        self.shared.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::keys;
    use crate::outcome::OperationOutcome;
    use crate::types::TargetType;
    use std::collections::BTreeMap;

    fn event() -> ControlLoopEvent {
        let mut aai = BTreeMap::new();
        aai.insert(keys::VSERVER_VSERVER_NAME.to_string(), "vm-01".to_string());
        ControlLoopEvent::onset(
            "cl-1",
            Uuid::new_v4(),
            keys::VSERVER_VSERVER_NAME,
            TargetType::Vm,
            aai,
        )
    }

    fn record(n: usize) -> ControlLoopOperation {
        OperationOutcome::new("APPC", format!("op-{}", n), "vm-01")
            .succeeded()
            .to_record()
    }

    struct FailingBackend;

    #[async_trait]
    impl HistoryBackend for FailingBackend {
        async fn write_batch(&self, _: &[HistoryRecord]) -> MendloopResult<()> {
            Err(MendloopError::Internal {
                message: "disk full".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_manager_flushes_on_stop() {
        let backend = Arc::new(MemoryHistoryStore::new());
        let manager = HistoryDataManager::new(&HistoryConfig::default(), backend.clone());
        let event = event();
        let request_id = event.request_id.unwrap();

        for n in 0..5 {
            manager.store(request_id, &event, "vm-01", &record(n));
        }
        manager.stop().await;

        let records = backend.records_for(request_id);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].operation, "op-0");
        assert_eq!(records[4].operation, "op-4");
        assert_eq!(records[0].closed_loop_name, "cl-1");
    }

    #[tokio::test]
    async fn test_queue_discards_oldest() {
        let config = HistoryConfig {
            max_queue_length: 3,
            batch_size: 2,
            ..Default::default()
        };
        let backend = Arc::new(MemoryHistoryStore::new());
        let manager = HistoryDataManager::new(&config, backend.clone());
        let event = event();
        let request_id = event.request_id.unwrap();

        // The writer cannot run until this task yields, so the queue overflows.
        for n in 0..5 {
            manager.store(request_id, &event, "vm-01", &record(n));
        }
        assert_eq!(manager.dropped(), 2);
        assert_eq!(manager.pending(), 3);

        manager.stop().await;
        let ops: Vec<_> = backend.records().into_iter().map(|r| r.operation).collect();
        assert_eq!(ops, vec!["op-2", "op-3", "op-4"]);
    }

    #[tokio::test]
    async fn test_backend_errors_are_swallowed() {
        let manager = HistoryDataManager::new(&HistoryConfig::default(), Arc::new(FailingBackend));
        let event = event();
        manager.store(event.request_id.unwrap(), &event, "vm-01", &record(0));
        manager.stop().await;
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_jsonl_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history").join("ops.jsonl");
        let backend = Arc::new(JsonlHistoryBackend::new(&path));
        let manager = HistoryDataManager::new(&HistoryConfig::default(), backend);
        let event = event();
        let request_id = event.request_id.unwrap();

        manager.store(request_id, &event, "vm-01", &record(0));
        manager.store(request_id, &event, "vm-01", &record(1));
        manager.stop().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<HistoryRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].operation, "op-1");
        assert_eq!(rows[1].outcome.as_deref(), Some("SUCCESS"));
    }
}
