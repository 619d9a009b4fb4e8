//! # Sync Session
//!
//! Composition root for one user editing one board. Owns exactly one of
//! each core component and wires them together:
//!
//! ```text
//!   edits ──► apply_optimistic ──► RemoteStore            (online, queue empty)
//!                    └────────────► OperationQueue        (offline or backlog)
//!
//!   ConnectionMonitor ── connected ──► OperationQueue::flush
//!   RemoteStore feed  ───────────────► LocalDocument + LockTable
//!   PresenceChannel   ───────────────► PresenceReconciler ──► yield / release
//! ```
//!
//! Writes for one object run through a per-object [`SequentialQueues`] entry
//! so rapid updates land in issue order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canvas_sync::{
    apply_optimistic, current_timestamp_ms, BroadcastThrottle, CanvasObject, ChangeKind,
    ConnectionEvent, ConnectionMonitor, ConnectionNotice, ConnectionState, ConnectionStatus,
    CursorPosition, FlushReport, Identity, KeyValueStorage, LocalDocument, LockCoordinator,
    MountGuard, ObjectId, ObjectLock, ObjectPatch, ObjectTreatment, OperationQueue, Outcome,
    PresenceChannel, PresenceEvent, PresenceReconciler, QueuedOperation, ReconnectHook,
    RemoteError, RemoteStore, RowChange, SelectionConflict, SelectionState, SequentialQueues,
    SyncConfig, SyncError, SyncResult, UserPresence,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// External collaborators a session runs against.
#[derive(Clone)]
pub struct Backends {
    /// Shared object store.
    pub remote: Arc<dyn RemoteStore>,
    /// Presence channel.
    pub presence: Arc<dyn PresenceChannel>,
    /// Durable key-value storage for the queue and connection snapshot.
    pub storage: Arc<dyn KeyValueStorage>,
    /// Performs reconnection I/O when the monitor schedules an attempt.
    pub reconnect: Arc<dyn ReconnectHook>,
}

/// Where a write ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Confirmed by the remote store.
    Sent,
    /// Applied locally and waiting in the operation queue.
    Queued,
    /// Rejected by the remote store; the local change was undone.
    RolledBack(RemoteError),
}

/// Something the UI may want to react to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Status change or notice from the connection monitor.
    Connection(ConnectionEvent),
    /// A flush pass finished.
    Flushed(FlushReport),
    /// The local selection lost these objects to newer remote selections.
    SelectionYielded(Vec<SelectionConflict>),
    /// These users left or went silent.
    UsersDeparted(Vec<String>),
}

/// Result of a selection request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionResult {
    /// Objects now selected.
    pub selected: Vec<ObjectId>,
    /// Requested objects refused because someone else holds their lock.
    pub locked: Vec<ObjectLock>,
}

struct SessionInner {
    scope: String,
    identity: Identity,
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    presence: Arc<dyn PresenceChannel>,
    presence_key: String,
    monitor: ConnectionMonitor,
    queue: OperationQueue,
    locks: LockCoordinator,
    reconciler: Mutex<PresenceReconciler>,
    document: Mutex<LocalDocument>,
    updates: SequentialQueues,
    throttle: Mutex<BroadcastThrottle>,
    guard: MountGuard,
    events: broadcast::Sender<SessionEvent>,
}

/// One user's live editing session on one board.
pub struct SyncSession {
    inner: Arc<SessionInner>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("scope", &self.inner.scope)
            .field("identity", &self.inner.identity)
            .field("monitor", &self.inner.monitor)
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl SyncSession {
    /// Build the components and spawn the background listeners.
    ///
    /// The monitor starts `connecting` (or `disconnected` after a recent
    /// drop); feed it [`canvas_sync::TransportSignal::Subscribed`] once the
    /// transport is up. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        config: SyncConfig,
        identity: Identity,
        scope: impl Into<String>,
        backends: Backends,
    ) -> Self {
        let scope = scope.into();
        let monitor = ConnectionMonitor::new(
            config.monitor.clone(),
            Arc::clone(&backends.storage),
            backends.reconnect,
        );
        let queue = OperationQueue::new(config.queue.clone(), backends.storage);
        let locks = LockCoordinator::new(
            identity.clone(),
            Arc::clone(&backends.remote),
            config.lock.clone(),
        );
        let reconciler = PresenceReconciler::new(&identity, config.presence.tie_policy);
        let throttle = BroadcastThrottle::new(Duration::from_millis(config.presence.throttle_ms));
        let (events, _) = broadcast::channel(128);

        let inner = Arc::new(SessionInner {
            presence_key: format!("{}:{}", identity.user_id, Uuid::new_v4()),
            scope,
            identity,
            config,
            remote: backends.remote,
            presence: backends.presence,
            monitor,
            queue,
            locks,
            reconciler: Mutex::new(reconciler),
            document: Mutex::new(LocalDocument::new()),
            updates: SequentialQueues::new(),
            throttle: Mutex::new(throttle),
            guard: MountGuard::new(),
            events,
        });

        // Subscribe before spawning so nothing emitted in between is lost.
        let connection_rx = inner.monitor.subscribe();
        let rows_rx = inner.remote.subscribe();
        let presence_rx = inner.presence.subscribe();
        let listeners = vec![
            tokio::spawn(Arc::clone(&inner).watch_connection(connection_rx)),
            tokio::spawn(Arc::clone(&inner).watch_rows(rows_rx)),
            tokio::spawn(Arc::clone(&inner).watch_presence(presence_rx)),
            tokio::spawn(Arc::clone(&inner).maintain()),
        ];

        tracing::info!(
            scope = %inner.scope,
            user_id = %inner.identity.user_id,
            status = %inner.monitor.status(),
            pending = inner.queue.len(),
            "Sync session started"
        );

        Self {
            inner,
            listeners: Mutex::new(listeners),
        }
    }

    /// The local user.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// The board this session edits.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    /// The connection monitor; feed transport and host signals here.
    #[must_use]
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.inner.monitor
    }

    /// The operation queue.
    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    /// The lock coordinator.
    #[must_use]
    pub fn locks(&self) -> &LockCoordinator {
        &self.inner.locks
    }

    /// Connection snapshot.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.monitor.state()
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether [`Self::shutdown`] has not run yet.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.guard.is_mounted()
    }

    /// Local copy of one object.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<CanvasObject> {
        lock(&self.inner.document).get(id).cloned()
    }

    /// Local copy of every object, in z order.
    #[must_use]
    pub fn objects(&self) -> Vec<CanvasObject> {
        let mut objects: Vec<CanvasObject> =
            lock(&self.inner.document).objects().cloned().collect();
        objects.sort_by_key(|o| o.z_index);
        objects
    }

    /// Remote users currently present.
    #[must_use]
    pub fn presence_users(&self) -> Vec<UserPresence> {
        lock(&self.inner.reconciler).users().cloned().collect()
    }

    /// The local user's current selection.
    #[must_use]
    pub fn local_selection(&self) -> Option<SelectionState> {
        lock(&self.inner.reconciler).local().selection.clone()
    }

    /// How an object should be rendered given remote activity.
    #[must_use]
    pub fn object_treatment(&self, id: ObjectId) -> ObjectTreatment {
        lock(&self.inner.reconciler).object_treatment(id)
    }

    /// Create an object.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an object missing required
    /// fields, or [`SyncError::ShutDown`] after teardown.
    pub async fn create_object(&self, object: CanvasObject) -> SyncResult<WriteOutcome> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .updates
            .enqueue(&object.id.to_string(), inner.create_now(object))
            .await
            .map_err(SyncError::from)
    }

    /// Patch an object.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ObjectNotFound`] if the object is not in the local
    /// document, [`SyncError::LockedByOther`] if someone else is editing it,
    /// or [`SyncError::Validation`] for an empty patch.
    pub async fn update_object(
        &self,
        id: ObjectId,
        patch: ObjectPatch,
    ) -> SyncResult<WriteOutcome> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .updates
            .enqueue(&id.to_string(), inner.update_now(id, patch))
            .await
            .map_err(SyncError::from)
    }

    /// Delete an object.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ObjectNotFound`] if the object is not in the local
    /// document or [`SyncError::LockedByOther`] if someone else is editing it.
    pub async fn delete_object(&self, id: ObjectId) -> SyncResult<WriteOutcome> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .updates
            .enqueue(&id.to_string(), inner.delete_now(id))
            .await
            .map_err(SyncError::from)
    }

    /// Take the lock on `id` and announce that we are editing it.
    ///
    /// Returns false when someone else holds the lock.
    pub async fn begin_edit(&self, id: ObjectId) -> bool {
        if !self.inner.guard.is_mounted() {
            return false;
        }
        let granted = self.inner.locks.request_lock(id).await;
        if !granted || !self.inner.guard.is_mounted() {
            return false;
        }
        lock(&self.inner.reconciler).set_local_editing(Some(id));
        self.inner.publish_presence().await;
        true
    }

    /// Release the lock on `id` and stop announcing the edit.
    pub async fn end_edit(&self, id: ObjectId) -> bool {
        let released = self.inner.locks.release_db_lock(id).await;
        {
            let mut reconciler = lock(&self.inner.reconciler);
            if reconciler.local().actively_editing == Some(id) {
                reconciler.set_local_editing(None);
            }
        }
        self.inner.publish_presence().await;
        released
    }

    /// Select objects, skipping any locked by someone else, and broadcast.
    pub async fn select(&self, ids: &[ObjectId]) -> SelectionResult {
        let partition = self.inner.locks.partition_selection(ids);
        lock(&self.inner.reconciler).select_local(partition.selectable.clone());
        self.inner.publish_presence().await;
        SelectionResult {
            selected: partition.selectable,
            locked: partition.locked,
        }
    }

    /// Move the local cursor. Returns whether a broadcast went out.
    pub async fn move_cursor(&self, x: f64, y: f64) -> bool {
        lock(&self.inner.reconciler).set_local_cursor(CursorPosition { x, y });
        let allowed = lock(&self.inner.throttle).try_acquire();
        if allowed {
            self.inner.publish_presence().await;
        }
        allowed
    }

    /// Flush the operation queue now, regardless of connection state.
    pub async fn flush_now(&self) -> FlushReport {
        self.inner.flush().await
    }

    /// Tear the session down. Returns how many remote locks were released.
    ///
    /// Idempotent. Listeners and timers stop immediately; results of calls
    /// still in flight are discarded.
    pub async fn shutdown(&self) -> usize {
        if !self.inner.guard.is_mounted() {
            return 0;
        }
        self.inner.guard.unmount();
        self.stop_background();

        if let Err(e) = self.inner.presence.untrack(&self.inner.presence_key).await {
            tracing::warn!(error = %e, "Failed to withdraw presence");
        }
        let released = self.inner.locks.release_mine().await;
        tracing::info!(
            scope = %self.inner.scope,
            released_locks = released,
            pending = self.inner.queue.len(),
            "Sync session shut down"
        );
        released
    }

    fn stop_background(&self) {
        for handle in lock(&self.listeners).drain(..) {
            handle.abort();
        }
        self.inner.monitor.shutdown();
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.inner.guard.unmount();
        self.stop_background();
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn can_send_directly(&self) -> bool {
        self.monitor.is_connected() && self.queue.is_empty()
    }

    fn ensure_unlocked(&self, id: ObjectId) -> SyncResult<()> {
        match self.locks.table().lock_for(id) {
            Some(held) if held.holder_id != self.identity.user_id => Err(SyncError::LockedByOther {
                object_id: id.to_string(),
                holder: held.holder_name,
            }),
            _ => Ok(()),
        }
    }

    /// Turn an optimistic outcome into a write outcome, deferring transient
    /// failures to the operation queue.
    fn settle(&self, outcome: Outcome<()>, op: QueuedOperation) -> WriteOutcome {
        match outcome {
            Outcome::Committed(()) => WriteOutcome::Sent,
            Outcome::Deferred(e) => {
                tracing::debug!(
                    target_id = %op.target_id,
                    operation = %op.operation_type(),
                    error = %e,
                    "Direct write failed, queueing"
                );
                self.queue.enqueue(op);
                self.monitor.report_sync_failure(e.to_string());
                WriteOutcome::Queued
            }
            Outcome::RolledBack(e) => WriteOutcome::RolledBack(e),
        }
    }

    async fn create_now(self: Arc<Self>, object: CanvasObject) -> SyncResult<WriteOutcome> {
        let op = QueuedOperation::create(&self.scope, &object);
        op.validate()?;
        let id = object.id;

        if !self.can_send_directly() {
            lock(&self.document).upsert(object);
            self.defer(op);
            return Ok(WriteOutcome::Queued);
        }

        let remote = Arc::clone(&self.remote);
        let to_send = object.clone();
        let outcome = apply_optimistic(
            &self.guard,
            || Ok(lock(&self.document).upsert(object)),
            move || async move {
                match remote.insert(to_send).await {
                    Err(RemoteError::AlreadyExists(_)) => Ok(()),
                    other => other,
                }
            },
            |previous| {
                let mut document = lock(&self.document);
                match previous {
                    Some(previous) => {
                        document.upsert(previous);
                    }
                    None => {
                        let _ = document.remove(id);
                    }
                }
            },
        )
        .await?;
        Ok(self.settle(outcome, op))
    }

    async fn update_now(
        self: Arc<Self>,
        id: ObjectId,
        patch: ObjectPatch,
    ) -> SyncResult<WriteOutcome> {
        if patch.is_empty() {
            return Err(SyncError::Validation(format!(
                "update of {id} carries no changes"
            )));
        }
        self.ensure_unlocked(id)?;
        let op = QueuedOperation::update(&self.scope, id, patch.clone());

        if !self.can_send_directly() {
            lock(&self.document).patch(id, &patch)?;
            self.defer(op);
            return Ok(WriteOutcome::Queued);
        }

        let remote = Arc::clone(&self.remote);
        let changes = patch.clone();
        let outcome = apply_optimistic(
            &self.guard,
            || lock(&self.document).patch(id, &patch),
            move || async move { remote.update(id, &changes).await },
            |before| {
                if let Some(object) = lock(&self.document).get_mut(id) {
                    *object = before;
                }
            },
        )
        .await?;
        Ok(self.settle(outcome, op))
    }

    async fn delete_now(self: Arc<Self>, id: ObjectId) -> SyncResult<WriteOutcome> {
        self.ensure_unlocked(id)?;
        let op = QueuedOperation::delete(&self.scope, id);

        if !self.can_send_directly() {
            lock(&self.document).remove(id)?;
            self.locks.table().forget(id);
            self.defer(op);
            return Ok(WriteOutcome::Queued);
        }

        let remote = Arc::clone(&self.remote);
        let outcome = apply_optimistic(
            &self.guard,
            || lock(&self.document).remove(id),
            move || async move {
                match remote.delete(id).await {
                    Err(RemoteError::NotFound(_)) => Ok(()),
                    other => other,
                }
            },
            |removed| {
                lock(&self.document).upsert(removed);
            },
        )
        .await?;
        Ok(self.settle(outcome, op))
    }

    /// Flush the queue, running another pass when writes were queued behind
    /// a pass that had already finished with the connection still up.
    async fn flush(&self) -> FlushReport {
        loop {
            let report = self.queue.flush(self.remote.as_ref()).await;
            if !self.guard.is_mounted() {
                return report;
            }
            if report.retried > 0 {
                self.monitor.report_sync_failure(format!(
                    "{} queued writes failed to flush",
                    report.retried
                ));
            }
            self.emit(SessionEvent::Flushed(report.clone()));
            if report.skipped
                || report.retried > 0
                || self.queue.is_empty()
                || !self.monitor.is_connected()
            {
                return report;
            }
            tracing::debug!(
                pending = self.queue.len(),
                "Writes queued during flush, flushing again"
            );
        }
    }

    /// Queue `op` behind earlier writes. While connected a flush is started
    /// so the entry does not wait for the next reconnect.
    fn defer(self: &Arc<Self>, op: QueuedOperation) {
        self.queue.enqueue(op);
        if self.monitor.is_connected() {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.flush().await;
            });
        }
    }

    async fn publish_presence(&self) {
        if !self.guard.is_mounted() {
            return;
        }
        let payload = lock(&self.reconciler).local_payload();
        if let Err(e) = self.presence.track(&self.presence_key, payload).await {
            tracing::warn!(error = %e, "Failed to publish presence");
        }
    }

    async fn watch_connection(self: Arc<Self>, mut rx: broadcast::Receiver<ConnectionEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Connection events lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            self.emit(SessionEvent::Connection(event.clone()));

            match event {
                ConnectionEvent::StatusChanged {
                    current: ConnectionStatus::Connected,
                    ..
                } => {
                    // Stale if the connection dropped again before we got here.
                    if !self.monitor.is_connected() {
                        continue;
                    }
                    self.publish_presence().await;
                    if !self.queue.is_empty() {
                        tracing::info!(
                            pending = self.queue.len(),
                            "Connected, flushing queued writes"
                        );
                    }
                    self.flush().await;
                }
                ConnectionEvent::Notice(ConnectionNotice::WorkingOffline) => {
                    tracing::warn!(pending = self.queue.len(), "Working offline, edits are queued");
                }
                ConnectionEvent::Notice(ConnectionNotice::Restored) => {
                    tracing::info!("Connection restored");
                }
                ConnectionEvent::Notice(ConnectionNotice::Failed) => {
                    tracing::error!("Connection lost for good, reload required");
                }
                ConnectionEvent::StatusChanged { .. } => {}
            }
        }
    }

    async fn watch_rows(self: Arc<Self>, mut rx: broadcast::Receiver<RowChange>) {
        loop {
            let change = match rx.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Row changes lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !self.guard.is_mounted() {
                break;
            }

            lock(&self.document).apply_row_change(&change);
            match (change.event_type, &change.new) {
                (ChangeKind::Delete, _) => {
                    if let Some(id) = change.object_id() {
                        self.locks.table().forget(id);
                    }
                }
                (_, Some(row)) => self.locks.table().apply_row(row),
                (_, None) => {}
            }
        }
    }

    async fn watch_presence(self: Arc<Self>, mut rx: broadcast::Receiver<PresenceEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Presence events lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !self.guard.is_mounted() {
                break;
            }

            let update = lock(&self.reconciler).apply_event(event);

            if !update.departed.is_empty() {
                self.release_departed(&update.departed);
                self.emit(SessionEvent::UsersDeparted(update.departed));
            }

            if !update.conflicts.is_empty() {
                let losing: Vec<ObjectId> = update.conflicts.iter().map(|c| c.object_id).collect();
                let changed = lock(&self.reconciler).yield_objects(&losing);
                tracing::info!(
                    count = losing.len(),
                    winner = %update.conflicts[0].winner_id,
                    "Yielding selection to a newer remote selection"
                );
                if changed.is_some() {
                    self.publish_presence().await;
                }
                self.emit(SessionEvent::SelectionYielded(update.conflicts));
            }
        }
    }

    fn release_departed(&self, users: &[String]) {
        for user_id in users {
            let released = self.locks.table().release_lock_by_holder(user_id);
            if !released.is_empty() {
                tracing::debug!(
                    user_id = %user_id,
                    count = released.len(),
                    "Dropped advisory locks of departed user"
                );
            }
        }
    }

    /// Heartbeat: refresh our presence and edit lock, drop stale users,
    /// expired locks and idle per-object queues.
    async fn maintain(self: Arc<Self>) {
        let stale_after = Duration::from_millis(self.config.presence.stale_after_ms);
        let period = Duration::from_millis((self.config.presence.stale_after_ms / 3).max(1_000));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !self.guard.is_mounted() {
                break;
            }
            let now = current_timestamp_ms();

            let stale = lock(&self.reconciler).prune_stale(now, stale_after);
            if !stale.is_empty() {
                self.release_departed(&stale);
                self.emit(SessionEvent::UsersDeparted(stale));
            }

            if self.monitor.is_connected() {
                let editing = lock(&self.reconciler).local().actively_editing;
                if let Some(id) = editing {
                    if !self.locks.request_lock(id).await {
                        tracing::warn!(object_id = %id, "Lost edit lock");
                        lock(&self.reconciler).set_local_editing(None);
                    }
                }
                self.publish_presence().await;
            }

            let expired = self.locks.table().sweep_expired(now);
            if !expired.is_empty() {
                tracing::debug!(count = expired.len(), "Swept expired locks");
            }
            self.updates.prune_idle();
        }
    }
}
