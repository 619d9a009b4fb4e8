//! Optimistic apply with compensation.
//!
//! Every local mutation follows the same shape: change local state now,
//! confirm with the remote store, undo on a permanent rejection. A transient
//! failure keeps the local change (the write is deferred to the operation
//! queue by the caller).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::remote::RemoteError;
use crate::{SyncError, SyncResult};

/// Whether the owning session is still alive.
///
/// Results that arrive after teardown are discarded rather than applied.
#[derive(Debug, Clone)]
pub struct MountGuard(Arc<AtomicBool>);

impl Default for MountGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl MountGuard {
    /// A guard in the mounted state.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether the owner is still mounted.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the owner torn down.
    pub fn unmount(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// How an optimistic mutation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The remote store confirmed.
    Committed(T),
    /// Transient failure; the local change stands and the write should be retried.
    Deferred(RemoteError),
    /// Permanent rejection; the local change was undone.
    RolledBack(RemoteError),
}

impl<T> Outcome<T> {
    /// Whether the remote store confirmed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Apply `forward` locally, then run `commit`; on permanent rejection run
/// `rollback` with whatever `forward` returned.
///
/// # Errors
///
/// Returns the error from `forward` (nothing was changed), or
/// [`SyncError::ShutDown`] if `guard` was unmounted while `commit` was in
/// flight, in which case neither the result nor the rollback is applied.
pub async fn apply_optimistic<U, T, F, C, Fut, R>(
    guard: &MountGuard,
    forward: F,
    commit: C,
    rollback: R,
) -> SyncResult<Outcome<T>>
where
    F: FnOnce() -> SyncResult<U>,
    C: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
    R: FnOnce(U),
{
    let undo = forward()?;
    let result = commit().await;

    if !guard.is_mounted() {
        tracing::debug!("Discarding remote result after teardown");
        return Err(SyncError::ShutDown);
    }

    Ok(match result {
        Ok(value) => Outcome::Committed(value),
        Err(e) if e.is_transient() => Outcome::Deferred(e),
        Err(e) => {
            tracing::warn!(error = %e, "Remote rejected optimistic change, rolling back");
            rollback(undo);
            Outcome::RolledBack(e)
        }
    })
}
