//! Object locking.
//!
//! Two layers cooperate:
//!
//! - [`LockTable`]: in-memory, synchronous, advisory. Gives instant UI
//!   feedback (greying out a shape someone else is dragging).
//! - [`LockCoordinator`]: the remote conditional-write path. The store's
//!   compare-and-swap on the lock columns is the single source of truth;
//!   acquisition only touches the local table after the store confirms.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::LockConfig;
use crate::element::{CanvasObject, ObjectId};
use crate::remote::RemoteStore;
use crate::{current_timestamp_ms, Identity};

/// An exclusive edit claim on one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLock {
    /// Locked object.
    pub object_id: ObjectId,
    /// User holding the lock.
    pub holder_id: String,
    /// Display name of the holder.
    pub holder_name: String,
    /// When the lock was taken (ms since epoch).
    pub acquired_at: u64,
    /// When the lock lapses (ms since epoch).
    pub expires_at: u64,
}

impl ObjectLock {
    /// Build a lock for `holder` starting at `now`.
    #[must_use]
    pub fn new(object_id: ObjectId, holder: &Identity, now: u64, ttl_ms: u64) -> Self {
        Self {
            object_id,
            holder_id: holder.user_id.clone(),
            holder_name: holder.display_name.clone(),
            acquired_at: now,
            expires_at: now.saturating_add(ttl_ms),
        }
    }

    /// Read the lock columns of a row, if it is locked at `now`.
    #[must_use]
    pub fn from_row(row: &CanvasObject, now: u64) -> Option<Self> {
        if !row.is_locked_at(now) {
            return None;
        }
        let holder_id = row.locked_by.clone()?;
        Some(Self {
            object_id: row.id,
            holder_name: row
                .locked_by_name
                .clone()
                .unwrap_or_else(|| holder_id.clone()),
            holder_id,
            acquired_at: row.locked_at.unwrap_or(now),
            expires_at: row.lock_expires_at.unwrap_or(u64::MAX),
        })
    }

    /// Whether the lock has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a local acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The object was free and is now held.
    Acquired(ObjectLock),
    /// The caller already held it; the expiry was extended.
    Refreshed(ObjectLock),
    /// Someone else holds it.
    HeldBy(ObjectLock),
}

impl LockAttempt {
    /// Whether the caller holds the lock afterwards.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        !matches!(self, Self::HeldBy(_))
    }
}

/// Requested selection split by lock state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPartition {
    /// IDs the caller may select, in request order.
    pub selectable: Vec<ObjectId>,
    /// Locks held by others on the remaining IDs.
    pub locked: Vec<ObjectLock>,
}

/// In-memory advisory lock table.
#[derive(Debug, Clone)]
pub struct LockTable {
    locks: Arc<RwLock<HashMap<ObjectId, ObjectLock>>>,
    ttl_ms: u64,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(LockConfig::default().ttl_ms)
    }
}

impl LockTable {
    /// Create an empty table whose locks live for `ttl_ms`.
    #[must_use]
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            locks: Arc::default(),
            ttl_ms,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ObjectId, ObjectLock>> {
        self.locks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ObjectId, ObjectLock>> {
        self.locks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Acquire or refresh a lock.
    pub fn acquire_lock(
        &self,
        object_id: ObjectId,
        holder_id: &str,
        holder_name: &str,
    ) -> LockAttempt {
        self.acquire_lock_at(object_id, holder_id, holder_name, current_timestamp_ms())
    }

    /// [`Self::acquire_lock`] with an explicit clock.
    pub fn acquire_lock_at(
        &self,
        object_id: ObjectId,
        holder_id: &str,
        holder_name: &str,
        now: u64,
    ) -> LockAttempt {
        let mut locks = self.write();
        match locks.get_mut(&object_id) {
            Some(existing) if !existing.is_expired_at(now) && existing.holder_id != holder_id => {
                LockAttempt::HeldBy(existing.clone())
            }
            Some(existing) if !existing.is_expired_at(now) => {
                existing.expires_at = now.saturating_add(self.ttl_ms);
                LockAttempt::Refreshed(existing.clone())
            }
            _ => {
                let lock = ObjectLock {
                    object_id,
                    holder_id: holder_id.to_string(),
                    holder_name: holder_name.to_string(),
                    acquired_at: now,
                    expires_at: now.saturating_add(self.ttl_ms),
                };
                locks.insert(object_id, lock.clone());
                LockAttempt::Acquired(lock)
            }
        }
    }

    /// Record a lock confirmed elsewhere (by the store), replacing any entry.
    pub fn install(&self, lock: ObjectLock) {
        self.write().insert(lock.object_id, lock);
    }

    /// Release a lock held by `holder_id`. Returns false if someone else
    /// (or nobody) holds it.
    pub fn release_lock(&self, object_id: ObjectId, holder_id: &str) -> bool {
        let mut locks = self.write();
        match locks.get(&object_id) {
            Some(lock) if lock.holder_id == holder_id => {
                locks.remove(&object_id);
                true
            }
            _ => false,
        }
    }

    /// Remove a lock regardless of holder (conflict takeover).
    pub fn force_release(&self, object_id: ObjectId) -> Option<ObjectLock> {
        self.write().remove(&object_id)
    }

    /// Release every lock held by `holder_id` (e.g. when that user leaves).
    pub fn release_lock_by_holder(&self, holder_id: &str) -> Vec<ObjectId> {
        let mut locks = self.write();
        let released: Vec<ObjectId> = locks
            .values()
            .filter(|lock| lock.holder_id == holder_id)
            .map(|lock| lock.object_id)
            .collect();
        for id in &released {
            locks.remove(id);
        }
        released
    }

    /// Drop every lock. Returns how many were held.
    pub fn release_all(&self) -> usize {
        let mut locks = self.write();
        let count = locks.len();
        locks.clear();
        count
    }

    /// Drop locks that have lapsed at `now`.
    pub fn sweep_expired(&self, now: u64) -> Vec<ObjectId> {
        let mut locks = self.write();
        let expired: Vec<ObjectId> = locks
            .values()
            .filter(|lock| lock.is_expired_at(now))
            .map(|lock| lock.object_id)
            .collect();
        for id in &expired {
            locks.remove(id);
        }
        expired
    }

    /// The live lock on `object_id`, if any.
    #[must_use]
    pub fn lock_for(&self, object_id: ObjectId) -> Option<ObjectLock> {
        let now = current_timestamp_ms();
        self.read()
            .get(&object_id)
            .filter(|lock| !lock.is_expired_at(now))
            .cloned()
    }

    /// Whether a live lock on `object_id` is held by someone other than `user_id`.
    #[must_use]
    pub fn is_locked_by_other(&self, object_id: ObjectId, user_id: &str) -> bool {
        self.lock_for(object_id)
            .is_some_and(|lock| lock.holder_id != user_id)
    }

    /// Objects currently locked by `holder_id`.
    #[must_use]
    pub fn held_by(&self, holder_id: &str) -> Vec<ObjectId> {
        self.read()
            .values()
            .filter(|lock| lock.holder_id == holder_id)
            .map(|lock| lock.object_id)
            .collect()
    }

    /// Number of entries (including lapsed ones not yet swept).
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Mirror the lock columns of a remote row.
    pub fn apply_row(&self, row: &CanvasObject) {
        match ObjectLock::from_row(row, current_timestamp_ms()) {
            Some(lock) => self.install(lock),
            None => self.forget(row.id),
        }
    }

    /// Drop whatever is known about `object_id` (the row was deleted).
    pub fn forget(&self, object_id: ObjectId) {
        self.write().remove(&object_id);
    }
}

/// Remote-authoritative lock coordinator for one local user.
pub struct LockCoordinator {
    identity: Identity,
    table: LockTable,
    remote: Arc<dyn RemoteStore>,
    config: LockConfig,
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("identity", &self.identity)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl LockCoordinator {
    /// Create a coordinator acting as `identity`.
    #[must_use]
    pub fn new(identity: Identity, remote: Arc<dyn RemoteStore>, config: LockConfig) -> Self {
        Self {
            identity,
            table: LockTable::new(config.ttl_ms),
            remote,
            config,
        }
    }

    /// The local advisory table.
    #[must_use]
    pub fn table(&self) -> &LockTable {
        &self.table
    }

    /// The user this coordinator acts for.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Ask the store for an exclusive lock on `object_id`.
    ///
    /// Returns false when someone else holds it or the store could not be
    /// reached. The local table only changes after the store confirms.
    pub async fn request_lock(&self, object_id: ObjectId) -> bool {
        let lock = ObjectLock::new(
            object_id,
            &self.identity,
            current_timestamp_ms(),
            self.config.ttl_ms,
        );
        match self.remote.try_lock(object_id, &lock).await {
            Ok(true) => {
                tracing::debug!(
                    object_id = %object_id,
                    holder = %self.identity.user_id,
                    "Lock acquired"
                );
                self.table.install(lock);
                true
            }
            Ok(false) => {
                tracing::debug!(object_id = %object_id, "Lock held by another user");
                false
            }
            Err(e) => {
                tracing::warn!(object_id = %object_id, error = %e, "Lock request failed");
                false
            }
        }
    }

    /// Release our lock on `object_id` in the store.
    ///
    /// The local entry is cleared only after the store confirms, so the UI
    /// never shows a premature "unlocked".
    pub async fn release_db_lock(&self, object_id: ObjectId) -> bool {
        match self.remote.unlock(object_id, &self.identity.user_id).await {
            Ok(true) => {
                self.table.release_lock(object_id, &self.identity.user_id);
                tracing::debug!(object_id = %object_id, "Lock released");
                true
            }
            Ok(false) => {
                tracing::debug!(object_id = %object_id, "Release refused, lock not ours");
                self.resync(object_id).await;
                false
            }
            Err(e) => {
                tracing::warn!(object_id = %object_id, error = %e, "Lock release failed");
                false
            }
        }
    }

    /// Re-read the row and mirror its lock columns into the table.
    async fn resync(&self, object_id: ObjectId) {
        match self.remote.fetch(object_id).await {
            Ok(Some(row)) => self.table.apply_row(&row),
            Ok(None) => self.table.forget(object_id),
            Err(e) => {
                tracing::debug!(object_id = %object_id, error = %e, "Lock resync failed");
            }
        }
    }

    /// Release every lock we hold in the store. Returns how many were released.
    pub async fn release_mine(&self) -> usize {
        let mut released = 0;
        for object_id in self.table.held_by(&self.identity.user_id) {
            if self.release_db_lock(object_id).await {
                released += 1;
            }
        }
        released
    }

    /// Split a requested selection into what we may select and what is
    /// locked by someone else.
    #[must_use]
    pub fn partition_selection(&self, ids: &[ObjectId]) -> SelectionPartition {
        let mut partition = SelectionPartition::default();
        for &id in ids {
            match self.table.lock_for(id) {
                Some(lock) if lock.holder_id != self.identity.user_id => {
                    partition.locked.push(lock);
                }
                _ => partition.selectable.push(id),
            }
        }
        partition
    }

    /// Whether we hold the lock on `object_id`.
    #[must_use]
    pub fn holds(&self, object_id: ObjectId) -> bool {
        self.table
            .lock_for(object_id)
            .is_some_and(|lock| lock.holder_id == self.identity.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ShapeKind;
    use crate::memory::MemoryRemoteStore;

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    fn bob() -> Identity {
        Identity::new("bob", "Bob")
    }

    #[test]
    fn test_local_acquire_refresh_and_conflict() {
        let table = LockTable::new(1_000);
        let id = ObjectId::new();

        let first = table.acquire_lock_at(id, "alice", "Alice", 100);
        assert!(matches!(first, LockAttempt::Acquired(_)));

        let refreshed = table.acquire_lock_at(id, "alice", "Alice", 500);
        match refreshed {
            LockAttempt::Refreshed(lock) => assert_eq!(lock.expires_at, 1_500),
            other => panic!("expected refresh, got {other:?}"),
        }

        let conflict = table.acquire_lock_at(id, "bob", "Bob", 600);
        match conflict {
            LockAttempt::HeldBy(lock) => assert_eq!(lock.holder_id, "alice"),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(!conflict_granted(&table, id, 600));
    }

    fn conflict_granted(table: &LockTable, id: ObjectId, now: u64) -> bool {
        table.acquire_lock_at(id, "carol", "Carol", now).is_granted()
    }

    #[test]
    fn test_expired_lock_can_be_taken() {
        let table = LockTable::new(100);
        let id = ObjectId::new();
        table.acquire_lock_at(id, "alice", "Alice", 0);

        let attempt = table.acquire_lock_at(id, "bob", "Bob", 100);
        assert!(matches!(attempt, LockAttempt::Acquired(ref lock) if lock.holder_id == "bob"));
    }

    #[test]
    fn test_only_holder_releases() {
        let table = LockTable::default();
        let id = ObjectId::new();
        table.acquire_lock(id, "alice", "Alice");

        assert!(!table.release_lock(id, "bob"));
        assert!(table.lock_for(id).is_some());
        assert!(table.release_lock(id, "alice"));
        assert!(table.lock_for(id).is_none());
        assert!(!table.release_lock(id, "alice"));
    }

    #[test]
    fn test_bulk_release() {
        let table = LockTable::default();
        let a = ObjectId::new();
        let b = ObjectId::new();
        let c = ObjectId::new();
        table.acquire_lock(a, "alice", "Alice");
        table.acquire_lock(b, "alice", "Alice");
        table.acquire_lock(c, "bob", "Bob");

        let mut released = table.release_lock_by_holder("alice");
        released.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(released, expected);
        assert!(table.is_locked_by_other(c, "alice"));

        assert!(table.force_release(c).is_some());
        table.acquire_lock(a, "carol", "Carol");
        assert_eq!(table.release_all(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_expired() {
        let table = LockTable::new(10);
        let a = ObjectId::new();
        let b = ObjectId::new();
        table.acquire_lock_at(a, "alice", "Alice", 0);
        table.acquire_lock_at(b, "bob", "Bob", 50);

        assert_eq!(table.sweep_expired(20), vec![a]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_apply_row_mirrors_lock_columns() {
        let table = LockTable::default();
        let mut row = CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0);
        row.locked_by = Some("bob".into());
        row.locked_by_name = Some("Bob".into());
        row.locked_at = Some(current_timestamp_ms());
        row.lock_expires_at = Some(current_timestamp_ms() + 60_000);

        table.apply_row(&row);
        assert!(table.is_locked_by_other(row.id, "alice"));

        row.clear_lock();
        table.apply_row(&row);
        assert!(table.lock_for(row.id).is_none());
    }

    #[tokio::test]
    async fn test_request_and_release_db_lock() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let object = CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0);
        remote.seed(object.clone());
        let coordinator = LockCoordinator::new(alice(), remote.clone(), LockConfig::default());

        assert!(coordinator.request_lock(object.id).await);
        assert!(coordinator.holds(object.id));
        let row = remote.get(object.id).expect("row exists");
        assert_eq!(row.locked_by.as_deref(), Some("alice"));

        assert!(coordinator.release_db_lock(object.id).await);
        assert!(!coordinator.holds(object.id));
        assert!(remote.get(object.id).expect("row").locked_by.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_exactly_one_wins() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_latency(std::time::Duration::from_millis(5));
        let object = CanvasObject::new(ShapeKind::Ellipse, 0.0, 0.0);
        remote.seed(object.clone());

        let a = LockCoordinator::new(alice(), remote.clone(), LockConfig::default());
        let b = LockCoordinator::new(bob(), remote.clone(), LockConfig::default());

        let (got_a, got_b) = tokio::join!(a.request_lock(object.id), b.request_lock(object.id));
        assert!(got_a ^ got_b, "exactly one request must win");

        let (winner, loser) = if got_a { (&a, &b) } else { (&b, &a) };
        assert!(winner.holds(object.id));
        assert!(!loser.holds(object.id));
        let row = remote.get(object.id).expect("row");
        assert_eq!(row.locked_by.as_deref(), Some(winner.identity().user_id.as_str()));

        // The loser cannot clear the winner's lock.
        assert!(!loser.release_db_lock(object.id).await);
        assert!(remote.get(object.id).expect("row").locked_by.is_some());
    }

    #[tokio::test]
    async fn test_failed_release_keeps_local_state() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let object = CanvasObject::new(ShapeKind::Line, 0.0, 0.0);
        remote.seed(object.clone());
        let coordinator = LockCoordinator::new(alice(), remote.clone(), LockConfig::default());
        assert!(coordinator.request_lock(object.id).await);

        remote.fail_next(1, crate::remote::RemoteError::Timeout);
        assert!(!coordinator.release_db_lock(object.id).await);
        assert!(coordinator.holds(object.id), "local lock must survive a failed release");
    }

    #[tokio::test]
    async fn test_refused_release_adopts_remote_holder() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let object = CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0);
        remote.seed(object.clone());
        let coordinator = LockCoordinator::new(alice(), remote.clone(), LockConfig::default());
        assert!(coordinator.request_lock(object.id).await);

        // Our lease lapsed and bob took the row over.
        let now = current_timestamp_ms();
        let mut row = remote.get(object.id).expect("row");
        row.locked_by = Some("bob".to_string());
        row.locked_by_name = Some("Bob".to_string());
        row.locked_at = Some(now);
        row.lock_expires_at = Some(now + 60_000);
        remote.seed(row);

        assert!(!coordinator.release_db_lock(object.id).await);
        assert!(!coordinator.holds(object.id));
        let lock = coordinator.table().lock_for(object.id).expect("bob's lock");
        assert_eq!(lock.holder_id, "bob");
        assert_eq!(lock.holder_name, "Bob");
    }

    #[tokio::test]
    async fn test_request_lock_on_network_error_is_false() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let object = CanvasObject::new(ShapeKind::Line, 0.0, 0.0);
        remote.seed(object.clone());
        let coordinator = LockCoordinator::new(alice(), remote.clone(), LockConfig::default());

        remote.fail_next(1, crate::remote::RemoteError::Network("down".into()));
        assert!(!coordinator.request_lock(object.id).await);
        assert!(coordinator.table().is_empty());
    }

    #[test]
    fn test_partition_selection() {
        let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemoteStore::new());
        let coordinator = LockCoordinator::new(alice(), remote, LockConfig::default());
        let free = ObjectId::new();
        let mine = ObjectId::new();
        let theirs = ObjectId::new();
        coordinator.table().acquire_lock(mine, "alice", "Alice");
        coordinator.table().acquire_lock(theirs, "bob", "Bob");

        let partition = coordinator.partition_selection(&[free, theirs, mine]);
        assert_eq!(partition.selectable, vec![free, mine]);
        assert_eq!(partition.locked.len(), 1);
        assert_eq!(partition.locked[0].holder_name, "Bob");
    }
}
