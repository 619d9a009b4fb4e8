//! # Canvas Sync
//!
//! Client-side synchronization core for a real-time multi-user canvas.
//! Keeps a locally held document consistent with a shared remote store while
//! several users edit at once over an unreliable network.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    canvas-sync                      │
//! ├─────────────────────────────────────────────────────┤
//! │  OperationQueue       │  ConnectionMonitor          │
//! │  - Durable FIFO       │  - Explicit state machine   │
//! │  - Bounded retries    │  - Exponential backoff      │
//! │  - Idempotent replay  │  - Offline/restored notices │
//! ├─────────────────────────────────────────────────────┤
//! │  LockCoordinator      │  PresenceReconciler         │
//! │  - Advisory table     │  - Sync/join/leave merge    │
//! │  - Remote CAS locks   │  - Last-touch-wins          │
//! ├─────────────────────────────────────────────────────┤
//! │  SequentialQueue  │  apply_optimistic  │  Storage   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Remote collaborators are traits ([`RemoteStore`], [`PresenceChannel`],
//! [`KeyValueStorage`]); loopback implementations live in [`memory`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod document;
pub mod element;
pub mod error;
pub mod lock;
pub mod memory;
pub mod offline;
pub mod optimistic;
pub mod presence;
pub mod remote;
pub mod sequential;
pub mod storage;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use config::{LockConfig, MonitorConfig, PresenceConfig, QueueConfig, SyncConfig};
pub use connection::{
    ConnectionEvent, ConnectionMonitor, ConnectionNotice, ConnectionState, ConnectionStatus,
    HostSignal, ReconnectHook, TransportSignal,
};
pub use document::LocalDocument;
pub use element::{CanvasObject, ObjectId, ObjectPatch, ShapeKind};
pub use error::{SyncError, SyncResult};
pub use lock::{LockAttempt, LockCoordinator, LockTable, ObjectLock, SelectionPartition};
pub use memory::{MemoryPresenceHub, MemoryRemoteStore, RemoteCall};
pub use offline::{FlushReport, OperationKind, OperationQueue, OperationType, QueuedOperation};
pub use optimistic::{apply_optimistic, MountGuard, Outcome};
pub use presence::{
    BroadcastThrottle, CursorPosition, ObjectTreatment, PresenceEvent, PresencePayload,
    PresenceReconciler, PresenceUpdate, SelectionConflict, SelectionState, TiePolicy, UserPresence,
};
pub use remote::{ChangeKind, PresenceChannel, RemoteError, RemoteStore, RowChange};
pub use sequential::{SequentialQueue, SequentialQueues, TaskError};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, StorageError};

/// Canvas sync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The local user as seen by locks and presence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user ID.
    pub user_id: String,
    /// Name shown to other users.
    pub display_name: String,
}

impl Identity {
    /// Create an identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| {
        // Timestamp will not exceed u64 max for millennia
        #[allow(clippy::cast_possible_truncation)]
        {
            d.as_millis() as u64
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in ms
        assert!(current_timestamp_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_identity_new() {
        let identity = Identity::new("u-1", "Ada");
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.display_name, "Ada");
    }
}
