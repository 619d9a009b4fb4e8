//! Shared harness for session integration tests.
//!
//! Every client runs against the same loopback store and presence hub, so
//! two clients in one test see each other's rows and presence.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use canvas_client::{Backends, ForwardingHook, SessionEvent, SyncSession};
use canvas_sync::{
    CanvasObject, Identity, KeyValueStorage, MemoryPresenceHub, MemoryRemoteStore, MemoryStorage,
    ShapeKind, SyncConfig, TiePolicy, TransportSignal,
};
use tokio::sync::{broadcast, mpsc};

/// Board every test client edits.
pub const TEST_BOARD: &str = "test-board";

/// A session plus the receiving end of its reconnect hook.
pub struct TestClient {
    pub session: SyncSession,
    pub attempts: mpsc::UnboundedReceiver<u32>,
    pub storage: Arc<dyn KeyValueStorage>,
}

impl TestClient {
    /// Report the transport as up.
    pub fn connect(&self) {
        self.session
            .monitor()
            .handle_transport(TransportSignal::Subscribed);
    }

    /// Report the transport as dropped.
    pub fn drop_transport(&self) {
        self.session
            .monitor()
            .handle_transport(TransportSignal::Closed);
    }
}

/// Short backoff so paused-time tests stay readable.
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.monitor.base_delay_ms = 100;
    config.monitor.max_delay_ms = 1_000;
    config.monitor.max_attempts = 5;
    config
}

/// Shared loopback backends.
pub struct Network {
    pub remote: MemoryRemoteStore,
    pub hub: MemoryPresenceHub,
}

impl Network {
    pub fn new() -> Self {
        Self {
            remote: MemoryRemoteStore::new(),
            hub: MemoryPresenceHub::new(),
        }
    }

    /// Start a client with fresh in-memory storage.
    pub fn client(&self, user_id: &str) -> TestClient {
        self.client_with(user_id, fast_config(), Arc::new(MemoryStorage::new()))
    }

    /// Start a client with a given tie policy.
    pub fn client_with_policy(&self, user_id: &str, tie_policy: TiePolicy) -> TestClient {
        let mut config = fast_config();
        config.presence.tie_policy = tie_policy;
        self.client_with(user_id, config, Arc::new(MemoryStorage::new()))
    }

    /// Start a client with explicit config and storage.
    pub fn client_with(
        &self,
        user_id: &str,
        config: SyncConfig,
        storage: Arc<dyn KeyValueStorage>,
    ) -> TestClient {
        let (hook, attempts) = ForwardingHook::channel();
        let session = SyncSession::start(
            config,
            Identity::new(user_id, format!("{user_id} (test)")),
            TEST_BOARD,
            Backends {
                remote: Arc::new(self.remote.clone()),
                presence: Arc::new(self.hub.clone()),
                storage: Arc::clone(&storage),
                reconnect: Arc::new(hook),
            },
        );
        TestClient {
            session,
            attempts,
            storage,
        }
    }
}

/// A plain rectangle.
pub fn rect(x: f64, y: f64) -> CanvasObject {
    CanvasObject::new(ShapeKind::Rectangle, x, y).with_size(100.0, 50.0)
}

/// Let listener tasks drain their channels.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wait for the first event matching `pred`.
///
/// # Panics
///
/// Panics if the channel closes or nothing matches within a minute.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("session events closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}
