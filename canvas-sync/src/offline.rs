//! # Offline Operation Queue
//!
//! Durable FIFO of writes that could not be sent immediately.
//!
//! ## Usage
//!
//! ```text
//! 1. When online and the queue is empty: writes go straight to the store
//! 2. Otherwise: writes are enqueued and persisted synchronously
//! 3. On reconnect: flush() replays entries in submission order
//! ```
//!
//! Backoff between flushes is owned by the connection monitor; the queue
//! only bounds how many times a single entry is attempted.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::element::{CanvasObject, ObjectId, ObjectPatch};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::{load_versioned, save_versioned, KeyValueStorage, QUEUE_STORAGE_KEY};
use crate::{current_timestamp_ms, SyncError, SyncResult};

/// Payload of a queued write, one variant per operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    /// Insert a new object. The payload is the full object.
    Create {
        /// Object to insert.
        object: ObjectPatch,
    },
    /// Patch an existing object.
    Update {
        /// Changed fields.
        changes: ObjectPatch,
    },
    /// Delete an object.
    Delete,
}

/// Type of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Insert.
    Create,
    /// Patch.
    Update,
    /// Delete.
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A write waiting to be applied to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Unique operation ID.
    pub id: Uuid,
    /// When the operation was issued (ms since epoch).
    pub timestamp: u64,
    /// Resource scope (board/document) the operation belongs to.
    pub scope: String,
    /// Object the operation targets.
    pub target_id: ObjectId,
    /// Failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// What to do.
    pub kind: OperationKind,
}

impl QueuedOperation {
    fn new(scope: impl Into<String>, target_id: ObjectId, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: current_timestamp_ms(),
            scope: scope.into(),
            target_id,
            retry_count: 0,
            kind,
        }
    }

    /// Queue the creation of `object`.
    #[must_use]
    pub fn create(scope: impl Into<String>, object: &CanvasObject) -> Self {
        Self::new(
            scope,
            object.id,
            OperationKind::Create {
                object: ObjectPatch::from(object),
            },
        )
    }

    /// Queue a patch of `target_id`.
    #[must_use]
    pub fn update(scope: impl Into<String>, target_id: ObjectId, changes: ObjectPatch) -> Self {
        Self::new(scope, target_id, OperationKind::Update { changes })
    }

    /// Queue the deletion of `target_id`.
    #[must_use]
    pub fn delete(scope: impl Into<String>, target_id: ObjectId) -> Self {
        Self::new(scope, target_id, OperationKind::Delete)
    }

    /// The operation's type.
    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        match self.kind {
            OperationKind::Create { .. } => OperationType::Create,
            OperationKind::Update { .. } => OperationType::Update,
            OperationKind::Delete => OperationType::Delete,
        }
    }

    /// Check the fields required by the operation's type.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for a create without identity, kind
    /// or coordinates (or whose identity differs from the target), and for an
    /// update that changes nothing.
    pub fn validate(&self) -> SyncResult<()> {
        match &self.kind {
            OperationKind::Create { object } => {
                let object = object.clone().into_object()?;
                if object.id != self.target_id {
                    return Err(SyncError::Validation(format!(
                        "create payload id {} does not match target {}",
                        object.id, self.target_id
                    )));
                }
                Ok(())
            }
            OperationKind::Update { changes } if changes.is_empty() => Err(
                SyncError::Validation(format!("update of {} carries no changes", self.target_id)),
            ),
            OperationKind::Update { .. } | OperationKind::Delete => Ok(()),
        }
    }
}

/// Aggregate outcome of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entries applied (including idempotent replays).
    pub succeeded: usize,
    /// Entries dropped permanently.
    pub failed: usize,
    /// Entries re-inserted at the tail for a later pass, including entries
    /// held back behind an earlier failed write to the same object.
    pub retried: usize,
    /// Entries left in the queue after the pass.
    pub remaining: usize,
    /// True when another flush was already running and nothing was done.
    pub skipped: bool,
}

impl FlushReport {
    fn skipped(remaining: usize) -> Self {
        Self {
            remaining,
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether every attempted entry landed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.failed == 0 && self.retried == 0
    }
}

/// Persisted layout: `{ version, operations, lastFlushTime }`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedQueue<Ops> {
    operations: Ops,
    last_flush_time: Option<u64>,
}

#[derive(Debug, Default)]
struct QueueState {
    operations: VecDeque<QueuedOperation>,
    last_flush_time: Option<u64>,
}

/// Result of applying a single entry.
enum Applied {
    Landed,
    Invalid(String),
    Rejected(RemoteError),
    Transient(RemoteError),
}

/// Resets the flushing flag however the flush future ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable, bounded FIFO of pending remote writes.
pub struct OperationQueue {
    state: Mutex<QueueState>,
    flushing: AtomicBool,
    storage: Arc<dyn KeyValueStorage>,
    config: QueueConfig,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("len", &self.len())
            .field("flushing", &self.is_flushing())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Create a queue, restoring any entries persisted by a previous session.
    #[must_use]
    pub fn new(config: QueueConfig, storage: Arc<dyn KeyValueStorage>) -> Self {
        let mut state = QueueState::default();
        if let Some(persisted) = load_versioned::<PersistedQueue<VecDeque<QueuedOperation>>>(
            storage.as_ref(),
            QUEUE_STORAGE_KEY,
        ) {
            state.operations = persisted.operations;
            state.last_flush_time = persisted.last_flush_time;
            let capacity = config.max_size.max(1);
            while state.operations.len() > capacity {
                state.operations.pop_front();
            }
            tracing::info!(
                restored = state.operations.len(),
                "Restored persisted operation queue"
            );
        }
        Self {
            state: Mutex::new(state),
            flushing: AtomicBool::new(false),
            storage,
            config,
        }
    }

    /// Append an operation, evicting the oldest entry when full.
    ///
    /// The queue is persisted before returning; persistence failures are
    /// logged and never surface to the caller.
    pub fn enqueue(&self, op: QueuedOperation) -> Uuid {
        let id = op.id;
        let mut state = self.lock_state();
        let capacity = self.config.max_size.max(1);
        while state.operations.len() >= capacity {
            if let Some(evicted) = state.operations.pop_front() {
                tracing::warn!(
                    evicted_id = %evicted.id,
                    target_id = %evicted.target_id,
                    operation = %evicted.operation_type(),
                    capacity,
                    "Operation queue full, dropping oldest entry"
                );
            }
        }
        tracing::debug!(
            op_id = %id,
            target_id = %op.target_id,
            operation = %op.operation_type(),
            scope = %op.scope,
            "Enqueued operation"
        );
        state.operations.push_back(op);
        self.persist(&state);
        id
    }

    /// Replay queued operations against `remote` in FIFO order.
    ///
    /// Returns immediately with [`FlushReport::skipped`] set if a flush is
    /// already running. Each entry is attempted at most once per pass:
    /// transient failures go back to the tail until the retry budget is
    /// spent, validation failures and permanent rejections are dropped.
    ///
    /// Once an entry goes back to the tail, later entries for the same object
    /// follow it there unattempted, so one object's writes never reorder.
    pub async fn flush(&self, remote: &dyn RemoteStore) -> FlushReport {
        if self.flushing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Flush already in progress, skipping");
            return FlushReport::skipped(self.len());
        }
        let _guard = FlushGuard(&self.flushing);

        let mut report = FlushReport::default();
        let mut attempted = HashSet::new();
        let mut held_back = HashSet::new();

        while let Some(op) = self.front() {
            if !attempted.insert(op.id) {
                // Head was re-inserted earlier in this pass.
                break;
            }

            if held_back.contains(&op.target_id) {
                self.defer(op.id);
                report.retried += 1;
                tracing::debug!(
                    op_id = %op.id,
                    target_id = %op.target_id,
                    operation = %op.operation_type(),
                    "Holding back operation behind an earlier failed write"
                );
                continue;
            }

            match Self::apply(remote, &op).await {
                Applied::Landed => {
                    self.remove(op.id);
                    report.succeeded += 1;
                }
                Applied::Invalid(reason) => {
                    self.remove(op.id);
                    report.failed += 1;
                    tracing::warn!(
                        op_id = %op.id,
                        target_id = %op.target_id,
                        operation = %op.operation_type(),
                        reason = %reason,
                        "Dropping invalid queued operation"
                    );
                }
                Applied::Rejected(error) => {
                    self.remove(op.id);
                    report.failed += 1;
                    tracing::warn!(
                        op_id = %op.id,
                        target_id = %op.target_id,
                        operation = %op.operation_type(),
                        error = %error,
                        "Remote permanently rejected queued operation"
                    );
                }
                Applied::Transient(error) => {
                    if self.requeue(op.clone()) {
                        held_back.insert(op.target_id);
                        report.retried += 1;
                        tracing::debug!(
                            op_id = %op.id,
                            retry_count = op.retry_count + 1,
                            error = %error,
                            "Queued operation failed, moved to tail"
                        );
                    } else {
                        report.failed += 1;
                        tracing::warn!(
                            op_id = %op.id,
                            target_id = %op.target_id,
                            operation = %op.operation_type(),
                            max_retry = self.config.max_retry,
                            error = %error,
                            "Queued operation exhausted its retries"
                        );
                    }
                }
            }
        }

        {
            let mut state = self.lock_state();
            state.last_flush_time = Some(current_timestamp_ms());
            report.remaining = state.operations.len();
            self.persist(&state);
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            retried = report.retried,
            remaining = report.remaining,
            "Operation queue flushed"
        );
        report
    }

    async fn apply(remote: &dyn RemoteStore, op: &QueuedOperation) -> Applied {
        if let Err(e) = op.validate() {
            return Applied::Invalid(e.to_string());
        }

        let result = match &op.kind {
            OperationKind::Create { object } => match object.clone().into_object() {
                Ok(object) => remote.insert(object).await,
                Err(e) => return Applied::Invalid(e.to_string()),
            },
            OperationKind::Update { changes } => remote.update(op.target_id, changes).await,
            OperationKind::Delete => remote.delete(op.target_id).await,
        };

        match (result, op.operation_type()) {
            (Ok(()), _) => Applied::Landed,
            // The effect already landed through another path.
            (Err(RemoteError::AlreadyExists(_)), OperationType::Create)
            | (Err(RemoteError::NotFound(_)), OperationType::Update | OperationType::Delete) => {
                tracing::debug!(
                    op_id = %op.id,
                    target_id = %op.target_id,
                    operation = %op.operation_type(),
                    "Replayed operation already applied remotely"
                );
                Applied::Landed
            }
            (Err(e), _) if e.is_transient() => Applied::Transient(e),
            (Err(e), _) => Applied::Rejected(e),
        }
    }

    /// Put a failed entry back at the tail. Returns false once its retry
    /// budget is spent, in which case it is dropped.
    fn requeue(&self, mut op: QueuedOperation) -> bool {
        let mut state = self.lock_state();
        let Some(pos) = state.operations.iter().position(|o| o.id == op.id) else {
            // Evicted by capacity while in flight.
            return true;
        };
        state.operations.remove(pos);
        op.retry_count += 1;
        let keep = op.retry_count < self.config.max_retry;
        if keep {
            state.operations.push_back(op);
        }
        self.persist(&state);
        keep
    }

    /// Move an entry to the tail without charging its retry budget.
    fn defer(&self, id: Uuid) {
        let mut state = self.lock_state();
        let Some(pos) = state.operations.iter().position(|o| o.id == id) else {
            return;
        };
        if let Some(op) = state.operations.remove(pos) {
            state.operations.push_back(op);
        }
        self.persist(&state);
    }

    fn remove(&self, id: Uuid) {
        let mut state = self.lock_state();
        if let Some(pos) = state.operations.iter().position(|o| o.id == id) {
            state.operations.remove(pos);
        }
        self.persist(&state);
    }

    fn front(&self) -> Option<QueuedOperation> {
        self.lock_state().operations.front().cloned()
    }

    /// Save the queue; on failure keep only the newest entries and retry once.
    fn persist(&self, state: &QueueState) {
        let full = PersistedQueue {
            operations: state.operations.iter().collect::<Vec<_>>(),
            last_flush_time: state.last_flush_time,
        };
        let Err(error) = save_versioned(self.storage.as_ref(), QUEUE_STORAGE_KEY, &full) else {
            return;
        };

        let keep = self.config.truncate_keep.min(state.operations.len());
        let skip = state.operations.len() - keep;
        let truncated = PersistedQueue {
            operations: state.operations.iter().skip(skip).collect::<Vec<_>>(),
            last_flush_time: state.last_flush_time,
        };
        match save_versioned(self.storage.as_ref(), QUEUE_STORAGE_KEY, &truncated) {
            Ok(()) => tracing::warn!(
                error = %error,
                kept = keep,
                dropped = skip,
                "Persisted a truncated operation queue"
            ),
            Err(retry_error) => tracing::warn!(
                error = %error,
                retry_error = %retry_error,
                "Failed to persist operation queue"
            ),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of pending operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().operations.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_state().operations.is_empty()
    }

    /// Whether a flush pass is running.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Snapshot of pending operations in queue order.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedOperation> {
        self.lock_state().operations.iter().cloned().collect()
    }

    /// When the last flush pass finished (ms since epoch).
    #[must_use]
    pub fn last_flush_time(&self) -> Option<u64> {
        self.lock_state().last_flush_time
    }

    /// Drop every pending operation.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.operations.clear();
        self.persist(&state);
    }
}
