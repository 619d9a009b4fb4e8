//! Error types for sync operations.

use thiserror::Error;

use crate::connection::ConnectionStatus;
use crate::remote::RemoteError;
use crate::sequential::TaskError;
use crate::storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A queued operation or wire payload failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The remote store or channel returned an error.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection state machine rejected a transition.
    #[error("Illegal connection transition: {from} -> {to}")]
    IllegalTransition {
        /// State the machine was in.
        from: ConnectionStatus,
        /// State that was requested.
        to: ConnectionStatus,
    },

    /// Object not present in the local document.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Another user holds the lock on the object.
    #[error("Object {object_id} is locked by {holder}")]
    LockedByOther {
        /// Locked object.
        object_id: String,
        /// Display name of the holder.
        holder: String,
    },

    /// A sequenced task panicked.
    #[error("Sequenced task panicked")]
    TaskPanicked,

    /// The owning session was torn down before the call completed.
    #[error("Session shut down")]
    ShutDown,
}

impl From<TaskError<SyncError>> for SyncError {
    fn from(error: TaskError<SyncError>) -> Self {
        match error {
            TaskError::Failed(e) => e,
            TaskError::Panicked => Self::TaskPanicked,
            TaskError::Dropped => Self::ShutDown,
        }
    }
}

impl SyncError {
    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_only_for_network_failures() {
        assert!(SyncError::Remote(RemoteError::Timeout).is_transient());
        assert!(!SyncError::Remote(RemoteError::Rejected("no".into())).is_transient());
        assert!(!SyncError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_task_error_conversion() {
        let failed: SyncError = TaskError::Failed(SyncError::ObjectNotFound("x".into())).into();
        assert!(matches!(failed, SyncError::ObjectNotFound(_)));
        assert!(matches!(
            SyncError::from(TaskError::<SyncError>::Panicked),
            SyncError::TaskPanicked
        ));
        assert!(matches!(
            SyncError::from(TaskError::<SyncError>::Dropped),
            SyncError::ShutDown
        ));
    }

    #[test]
    fn test_illegal_transition_message() {
        let error = SyncError::IllegalTransition {
            from: ConnectionStatus::Connected,
            to: ConnectionStatus::Failed,
        };
        assert_eq!(
            error.to_string(),
            "Illegal connection transition: connected -> failed"
        );
    }
}
