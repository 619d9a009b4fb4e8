//! Collaborators on the far side of the network.
//!
//! The sync core never talks to a transport directly. It consumes:
//!
//! ```text
//! RemoteStore      row-level CRUD + conditional lock writes + row-change feed
//! PresenceChannel  track/untrack per connection key + sync/join/leave feed
//! ```
//!
//! Loopback implementations live in [`crate::memory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::element::{CanvasObject, ObjectId, ObjectPatch};
use crate::lock::ObjectLock;
use crate::presence::{PresenceEvent, PresencePayload};

/// Errors returned by remote collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Insert of an object whose ID already exists.
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    /// Update or delete of an object that does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),
    /// Request timed out.
    #[error("request timed out")]
    Timeout,
    /// The store refused the write (permissions, constraint, malformed row).
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Returns true for failures that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

/// Kind of a row-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// Row-change event delivered by the change-notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// What happened to the row.
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    /// Row after the change (absent for deletes).
    #[serde(default)]
    pub new: Option<CanvasObject>,
    /// Row before the change (absent for inserts).
    #[serde(default)]
    pub old: Option<CanvasObject>,
}

impl RowChange {
    /// The object the change applies to.
    #[must_use]
    pub fn object_id(&self) -> Option<ObjectId> {
        self.new.as_ref().or(self.old.as_ref()).map(|o| o.id)
    }
}

/// Remote object store with row-level CRUD and conditional lock writes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a new row.
    async fn insert(&self, object: CanvasObject) -> Result<(), RemoteError>;

    /// Overwrite the fields present in `patch`.
    async fn update(&self, id: ObjectId, patch: &ObjectPatch) -> Result<(), RemoteError>;

    /// Delete a row.
    async fn delete(&self, id: ObjectId) -> Result<(), RemoteError>;

    /// Read a row.
    async fn fetch(&self, id: ObjectId) -> Result<Option<CanvasObject>, RemoteError>;

    /// Write `lock` into the row's lock columns only if they are empty or the
    /// existing lock has lapsed at `lock.acquired_at`.
    ///
    /// Returns `Ok(false)` when someone else holds the lock.
    async fn try_lock(&self, id: ObjectId, lock: &ObjectLock) -> Result<bool, RemoteError>;

    /// Clear the row's lock columns only if `holder_id` owns the lock.
    ///
    /// Returns `Ok(false)` when the lock is not held by `holder_id`.
    async fn unlock(&self, id: ObjectId, holder_id: &str) -> Result<bool, RemoteError>;

    /// Subscribe to row-change notifications.
    fn subscribe(&self) -> broadcast::Receiver<RowChange>;
}

/// Presence channel: per-connection-key liveness with an arbitrary payload.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Publish (or replace) the payload for `key`.
    async fn track(&self, key: &str, payload: PresencePayload) -> Result<(), RemoteError>;

    /// Withdraw the payload for `key`.
    async fn untrack(&self, key: &str) -> Result<(), RemoteError>;

    /// Subscribe to sync/join/leave events.
    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ShapeKind;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(!RemoteError::AlreadyExists("x".into()).is_transient());
        assert!(!RemoteError::NotFound("x".into()).is_transient());
        assert!(!RemoteError::Rejected("x".into()).is_transient());
    }

    #[test]
    fn test_row_change_wire_shape() {
        let object = CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0);
        let change = RowChange {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(object.clone()),
        };

        let json = serde_json::to_value(&change).expect("serialize");
        assert_eq!(json["eventType"], "DELETE");
        assert_eq!(change.object_id(), Some(object.id));

        let parsed: RowChange = serde_json::from_value(serde_json::json!({
            "eventType": "INSERT",
            "new": serde_json::to_value(&object).expect("serialize"),
        }))
        .expect("deserialize");
        assert_eq!(parsed.event_type, ChangeKind::Insert);
        assert!(parsed.old.is_none());
    }
}
