//! # Connection Monitor
//!
//! Explicit state machine tracking connectivity to the remote store.
//!
//! ```text
//! connecting ──► connected ──► disconnected ──► reconnecting ──► connected
//!                                   ▲                │
//!                                   └── error ───────┤
//!                                                    ▼
//!                                   failed ◄── attempts exhausted
//!                                     │
//!                                     └── manual retry ──► reconnecting
//! ```
//!
//! The monitor owns *when* to reconnect (exponential backoff) but not *how*:
//! every scheduled attempt calls the caller-supplied [`ReconnectHook`].
//! Success is reported back through [`TransportSignal::Subscribed`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::storage::{load_versioned, save_versioned, KeyValueStorage, CONNECTION_STORAGE_KEY};
use crate::{current_timestamp_ms, SyncError, SyncResult};

/// Connectivity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Initial connection in progress.
    Connecting,
    /// Subscribed and operational.
    Connected,
    /// Connection lost; a reconnect schedule is about to start.
    Disconnected,
    /// Backoff schedule running.
    Reconnecting,
    /// Automatic retries exhausted; needs a manual retry.
    Failed,
}

impl ConnectionStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Failed, Reconnecting};
        matches!(
            (self, next),
            (Connecting, Connected | Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Reconnecting | Connected)
                | (Reconnecting, Connected | Failed | Disconnected)
                | (Failed, Reconnecting | Connected)
        )
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of the monitor's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// Attempts made in the current reconnect schedule.
    pub reconnect_attempts: u32,
    /// When the connection was last lost (ms since epoch).
    pub last_disconnect_time: Option<u64>,
    /// Most recent error reason.
    pub last_error: Option<String>,
}

impl ConnectionState {
    fn new(status: ConnectionStatus, last_disconnect_time: Option<u64>) -> Self {
        Self {
            status,
            reconnect_attempts: 0,
            last_disconnect_time,
            last_error: None,
        }
    }
}

/// Transport-level signal from the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// The channel is subscribed.
    Subscribed,
    /// The channel reported an error.
    ChannelError(String),
    /// The channel timed out.
    TimedOut,
    /// The channel was closed.
    Closed,
}

/// Online/offline signal from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Network is back.
    Online,
    /// Network went away.
    Offline,
}

/// User-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionNotice {
    /// Still offline after the notice delay.
    WorkingOffline,
    /// Reconnected after at least one attempt.
    Restored,
    /// Automatic retries exhausted.
    Failed,
}

/// Event emitted by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The status changed.
    StatusChanged {
        /// Status before.
        previous: ConnectionStatus,
        /// Status after.
        current: ConnectionStatus,
    },
    /// A notice for the user.
    Notice(ConnectionNotice),
}

/// Performs the actual reconnection I/O for a scheduled attempt.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    /// Try to re-establish the connection. `attempt` is 1-indexed.
    ///
    /// # Errors
    ///
    /// An error marks the attempt as failed; the schedule continues.
    async fn reconnect(&self, attempt: u32) -> SyncResult<()>;
}

/// Persisted layout: `{ version, status, lastDisconnectTime }`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedConnection {
    status: ConnectionStatus,
    last_disconnect_time: Option<u64>,
}

#[derive(Default)]
struct MonitorTasks {
    reconnect: Option<JoinHandle<()>>,
    offline_notice: Option<JoinHandle<()>>,
}

impl MonitorTasks {
    fn abort_all(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
        if let Some(handle) = self.offline_notice.take() {
            handle.abort();
        }
    }
}

struct MonitorInner {
    config: MonitorConfig,
    storage: Arc<dyn KeyValueStorage>,
    hook: Arc<dyn ReconnectHook>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    tasks: Mutex<MonitorTasks>,
}

/// Connection state machine with a backoff scheduler.
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionMonitor {
    /// Create a monitor.
    ///
    /// Starts `disconnected` if a previous session persisted a disconnect
    /// within the resume window, `connecting` otherwise.
    #[must_use]
    pub fn new(
        config: MonitorConfig,
        storage: Arc<dyn KeyValueStorage>,
        hook: Arc<dyn ReconnectHook>,
    ) -> Self {
        let now = current_timestamp_ms();
        let initial = match load_versioned::<PersistedConnection>(
            storage.as_ref(),
            CONNECTION_STORAGE_KEY,
        ) {
            Some(PersistedConnection {
                status,
                last_disconnect_time: Some(at),
            }) if !matches!(status, ConnectionStatus::Connected | ConnectionStatus::Connecting)
                && now.saturating_sub(at) <= config.resume_window_ms =>
            {
                tracing::info!(
                    previous = %status,
                    disconnected_ms_ago = now.saturating_sub(at),
                    "Resuming from a recent disconnect"
                );
                ConnectionState::new(ConnectionStatus::Disconnected, Some(at))
            }
            _ => ConnectionState::new(ConnectionStatus::Connecting, None),
        };

        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                storage,
                hook,
                state: Mutex::new(initial),
                events,
                tasks: Mutex::new(MonitorTasks::default()),
            }),
        }
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().clone()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_state().status
    }

    /// Whether the monitor is `connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Subscribe to status changes and notices.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Move directly to `next`.
    ///
    /// Signal handlers are the normal way to drive the monitor; this exists
    /// for hosts that learn about connectivity some other way.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::IllegalTransition`] if the transition table
    /// forbids the move.
    pub fn transition(&self, next: ConnectionStatus) -> SyncResult<()> {
        self.inner.transition(None, next, |_| {}).map(|_| ())
    }

    /// Feed a transport signal.
    pub fn handle_transport(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Subscribed => MonitorInner::on_connected(&self.inner),
            TransportSignal::ChannelError(reason) => MonitorInner::on_error(&self.inner, reason),
            TransportSignal::TimedOut => {
                MonitorInner::on_error(&self.inner, "channel timed out".to_string());
            }
            TransportSignal::Closed => {
                MonitorInner::on_error(&self.inner, "channel closed".to_string());
            }
        }
    }

    /// Report that a caller who believed it was connected saw a sync failure.
    pub fn report_sync_failure(&self, reason: impl Into<String>) {
        MonitorInner::on_error(&self.inner, reason.into());
    }

    /// Feed a host online/offline signal.
    pub fn handle_host(&self, signal: HostSignal) {
        match signal {
            HostSignal::Online => {
                self.retry_now();
            }
            HostSignal::Offline => {
                MonitorInner::on_error(&self.inner, "host went offline".to_string());
            }
        }
    }

    /// Start reconnecting now if `disconnected` or `failed`.
    ///
    /// Returns true if a reconnect was started.
    pub fn retry_now(&self) -> bool {
        match self.status() {
            ConnectionStatus::Failed => MonitorInner::manual_retry(&self.inner),
            ConnectionStatus::Disconnected => MonitorInner::begin_reconnecting(&self.inner),
            _ => false,
        }
    }

    /// Cancel the reconnect schedule and any pending offline notice.
    pub fn shutdown(&self) {
        self.inner.lock_tasks().abort_all();
        tracing::debug!("Connection monitor shut down");
    }
}

impl MonitorInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, MonitorTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Move to `next` if allowed (and, when `from` is given, only out of
    /// one of those states). Returns the state as it was before.
    fn transition(
        &self,
        from: Option<&[ConnectionStatus]>,
        next: ConnectionStatus,
        update: impl FnOnce(&mut ConnectionState),
    ) -> SyncResult<ConnectionState> {
        let (previous, persisted) = {
            let mut state = self.lock_state();
            let current = state.status;
            let expected = !matches!(from, Some(from) if !from.contains(&current));
            if !expected || !current.can_transition_to(next) {
                return Err(SyncError::IllegalTransition {
                    from: current,
                    to: next,
                });
            }
            let previous = state.clone();
            state.status = next;
            update(&mut state);
            let persisted = PersistedConnection {
                status: state.status,
                last_disconnect_time: state.last_disconnect_time,
            };
            (previous, persisted)
        };

        if let Err(e) = save_versioned(self.storage.as_ref(), CONNECTION_STORAGE_KEY, &persisted) {
            tracing::warn!(error = %e, "Failed to persist connection state");
        }
        tracing::debug!(previous = %previous.status, current = %next, "Connection status changed");
        self.emit(ConnectionEvent::StatusChanged {
            previous: previous.status,
            current: next,
        });
        Ok(previous)
    }

    fn on_connected(this: &Arc<Self>) {
        let previous = match this.transition(None, ConnectionStatus::Connected, |state| {
            state.reconnect_attempts = 0;
            state.last_error = None;
        }) {
            Ok(previous) => previous,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring subscribed signal");
                return;
            }
        };

        this.lock_tasks().abort_all();

        if previous.status == ConnectionStatus::Reconnecting && previous.reconnect_attempts >= 1 {
            tracing::info!(attempts = previous.reconnect_attempts, "Connection restored");
            this.emit(ConnectionEvent::Notice(ConnectionNotice::Restored));
        } else {
            tracing::info!(previous = %previous.status, "Connected");
        }
    }

    fn on_error(this: &Arc<Self>, reason: String) {
        let status = {
            let mut state = this.lock_state();
            if state.status != ConnectionStatus::Failed {
                state.last_error = Some(reason.clone());
            }
            state.status
        };

        match status {
            ConnectionStatus::Connected | ConnectionStatus::Connecting => {
                let now = current_timestamp_ms();
                let moved = this.transition(
                    Some(&[ConnectionStatus::Connected, ConnectionStatus::Connecting]),
                    ConnectionStatus::Disconnected,
                    |state| state.last_disconnect_time = Some(now),
                );
                if moved.is_ok() {
                    tracing::warn!(reason = %reason, "Connection lost");
                    Self::schedule_offline_notice(this);
                    Self::begin_reconnecting(this);
                }
            }
            ConnectionStatus::Disconnected => {
                Self::begin_reconnecting(this);
            }
            ConnectionStatus::Reconnecting => {
                tracing::debug!(reason = %reason, "Error while reconnecting");
            }
            ConnectionStatus::Failed => {
                tracing::debug!(reason = %reason, "Ignoring error while failed");
            }
        }
    }

    fn schedule_offline_notice(this: &Arc<Self>) {
        let inner = Arc::clone(this);
        let delay = std::time::Duration::from_millis(this.config.offline_notice_delay_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.lock_state().status != ConnectionStatus::Connected {
                tracing::info!("Working offline");
                inner.emit(ConnectionEvent::Notice(ConnectionNotice::WorkingOffline));
            }
        });
        if let Some(previous) = this.lock_tasks().offline_notice.replace(handle) {
            previous.abort();
        }
    }

    fn begin_reconnecting(this: &Arc<Self>) -> bool {
        if let Err(e) = this.transition(
            Some(&[ConnectionStatus::Disconnected]),
            ConnectionStatus::Reconnecting,
            |_| {},
        ) {
            tracing::debug!(error = %e, "Not starting reconnect schedule");
            return false;
        }
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move { inner.run_schedule().await });
        if let Some(previous) = this.lock_tasks().reconnect.replace(handle) {
            previous.abort();
        }
        true
    }

    async fn run_schedule(self: Arc<Self>) {
        let max_attempts = self.config.max_attempts;
        let first = self.lock_state().reconnect_attempts + 1;

        for attempt in first..=max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;
            if !self.record_attempt(attempt) {
                return;
            }
            tracing::info!(
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnect attempt"
            );
            self.call_hook(attempt).await;
        }

        // Give the final attempt as long as the next one would have waited.
        tokio::time::sleep(self.config.delay_for_attempt(max_attempts.saturating_add(1))).await;
        self.fail();
    }

    /// Single immediate attempt out of `failed`, then back to `failed` if
    /// nothing reported success within the maximum delay.
    fn manual_retry(this: &Arc<Self>) -> bool {
        if let Err(e) = this.transition(
            Some(&[ConnectionStatus::Failed]),
            ConnectionStatus::Reconnecting,
            |_| {},
        ) {
            tracing::debug!(error = %e, "Manual retry not possible");
            return false;
        }
        tracing::info!("Manual reconnect requested");
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            let attempt = inner.lock_state().reconnect_attempts.max(1);
            inner.call_hook(attempt).await;
            tokio::time::sleep(std::time::Duration::from_millis(inner.config.max_delay_ms)).await;
            inner.fail();
        });
        if let Some(previous) = this.lock_tasks().reconnect.replace(handle) {
            previous.abort();
        }
        true
    }

    fn record_attempt(&self, attempt: u32) -> bool {
        let mut state = self.lock_state();
        if state.status != ConnectionStatus::Reconnecting {
            return false;
        }
        state.reconnect_attempts = state.reconnect_attempts.max(attempt);
        true
    }

    async fn call_hook(&self, attempt: u32) {
        if let Err(e) = self.hook.reconnect(attempt).await {
            tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
            let mut state = self.lock_state();
            if state.status == ConnectionStatus::Reconnecting {
                state.last_error = Some(e.to_string());
            }
        }
    }

    fn fail(&self) {
        match self.transition(
            Some(&[ConnectionStatus::Reconnecting]),
            ConnectionStatus::Failed,
            |_| {},
        ) {
            Ok(previous) => {
                tracing::error!(
                    attempts = previous.reconnect_attempts,
                    last_error = ?previous.last_error,
                    "Reconnection failed, manual retry required"
                );
                self.emit(ConnectionEvent::Notice(ConnectionNotice::Failed));
            }
            Err(e) => tracing::debug!(error = %e, "Schedule ended without failing"),
        }
    }
}
