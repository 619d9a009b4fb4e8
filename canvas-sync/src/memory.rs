//! In-process loopback collaborators.
//!
//! [`MemoryRemoteStore`] behaves like a row store with conditional lock
//! writes and a change feed; [`MemoryPresenceHub`] fans presence out to every
//! subscriber. Both are shared by cloning, so several clients in one process
//! can talk to the same "server". Fault injection and artificial latency make
//! retry and race behaviour observable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::current_timestamp_ms;
use crate::element::{CanvasObject, ObjectId, ObjectPatch};
use crate::lock::ObjectLock;
use crate::presence::{PresenceEvent, PresencePayload};
use crate::remote::{ChangeKind, PresenceChannel, RemoteError, RemoteStore, RowChange};

/// A mutating call as seen by [`MemoryRemoteStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCall {
    /// `insert`
    Insert(ObjectId),
    /// `update`
    Update(ObjectId),
    /// `delete`
    Delete(ObjectId),
    /// `try_lock`
    Lock(ObjectId),
    /// `unlock`
    Unlock(ObjectId),
}

#[derive(Debug, Default)]
struct Faults {
    remaining: u32,
    error: Option<RemoteError>,
}

#[derive(Debug)]
struct StoreInner {
    rows: RwLock<HashMap<ObjectId, CanvasObject>>,
    changes: broadcast::Sender<RowChange>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<RemoteCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Loopback [`RemoteStore`].
#[derive(Debug, Clone)]
pub struct MemoryRemoteStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(StoreInner {
                rows: RwLock::default(),
                changes,
                faults: Mutex::default(),
                latency: Mutex::new(Duration::ZERO),
                calls: Mutex::default(),
            }),
        }
    }

    /// Insert a row directly, without a change notification.
    pub fn seed(&self, object: CanvasObject) {
        self.write_rows().insert(object.id, object);
    }

    /// Current row for `id`.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<CanvasObject> {
        self.read_rows().get(&id).cloned()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_rows().len()
    }

    /// Whether the store has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_rows().is_empty()
    }

    /// Fail the next `count` mutating calls with `error`.
    pub fn fail_next(&self, count: u32, error: RemoteError) {
        let mut faults = lock(&self.inner.faults);
        faults.remaining = count;
        faults.error = Some(error);
    }

    /// Delay every mutating call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Mutating calls received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.inner.calls).clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.inner.calls).clear();
    }

    fn read_rows(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ObjectId, CanvasObject>> {
        self.inner
            .rows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_rows(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ObjectId, CanvasObject>> {
        self.inner
            .rows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record the call, wait out the latency, then apply any injected fault.
    async fn begin(&self, call: RemoteCall) -> Result<(), RemoteError> {
        lock(&self.inner.calls).push(call);
        let latency = *lock(&self.inner.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut faults = lock(&self.inner.faults);
        if faults.remaining > 0 {
            faults.remaining -= 1;
            if let Some(error) = faults.error.clone() {
                tracing::debug!(?call, error = %error, "Injected remote fault");
                return Err(error);
            }
        }
        Ok(())
    }

    fn publish(
        &self,
        event_type: ChangeKind,
        new: Option<CanvasObject>,
        old: Option<CanvasObject>,
    ) {
        // No listeners is fine.
        let _ = self.inner.changes.send(RowChange {
            event_type,
            new,
            old,
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn insert(&self, mut object: CanvasObject) -> Result<(), RemoteError> {
        self.begin(RemoteCall::Insert(object.id)).await?;
        object.updated_at = current_timestamp_ms();
        {
            let mut rows = self.write_rows();
            if rows.contains_key(&object.id) {
                return Err(RemoteError::AlreadyExists(object.id.to_string()));
            }
            rows.insert(object.id, object.clone());
        }
        self.publish(ChangeKind::Insert, Some(object), None);
        Ok(())
    }

    async fn update(&self, id: ObjectId, patch: &ObjectPatch) -> Result<(), RemoteError> {
        self.begin(RemoteCall::Update(id)).await?;
        let (old, new) = {
            let mut rows = self.write_rows();
            let row = rows
                .get_mut(&id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            let old = row.clone();
            row.apply_patch(patch);
            row.updated_at = current_timestamp_ms();
            (old, row.clone())
        };
        self.publish(ChangeKind::Update, Some(new), Some(old));
        Ok(())
    }

    async fn delete(&self, id: ObjectId) -> Result<(), RemoteError> {
        self.begin(RemoteCall::Delete(id)).await?;
        let old = self
            .write_rows()
            .remove(&id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        self.publish(ChangeKind::Delete, None, Some(old));
        Ok(())
    }

    async fn fetch(&self, id: ObjectId) -> Result<Option<CanvasObject>, RemoteError> {
        Ok(self.get(id))
    }

    async fn try_lock(&self, id: ObjectId, lock: &ObjectLock) -> Result<bool, RemoteError> {
        self.begin(RemoteCall::Lock(id)).await?;
        let (old, new) = {
            let mut rows = self.write_rows();
            let row = rows
                .get_mut(&id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            let held_by_other = row.is_locked_at(lock.acquired_at)
                && row.locked_by.as_deref() != Some(lock.holder_id.as_str());
            if held_by_other {
                return Ok(false);
            }
            let old = row.clone();
            row.locked_by = Some(lock.holder_id.clone());
            row.locked_by_name = Some(lock.holder_name.clone());
            row.locked_at = Some(lock.acquired_at);
            row.lock_expires_at = Some(lock.expires_at);
            (old, row.clone())
        };
        self.publish(ChangeKind::Update, Some(new), Some(old));
        Ok(true)
    }

    async fn unlock(&self, id: ObjectId, holder_id: &str) -> Result<bool, RemoteError> {
        self.begin(RemoteCall::Unlock(id)).await?;
        let (old, new) = {
            let mut rows = self.write_rows();
            let row = rows
                .get_mut(&id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            if row.locked_by.as_deref() != Some(holder_id) {
                return Ok(false);
            }
            let old = row.clone();
            row.clear_lock();
            (old, row.clone())
        };
        self.publish(ChangeKind::Update, Some(new), Some(old));
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.inner.changes.subscribe()
    }
}

#[derive(Debug)]
struct HubInner {
    tracked: Mutex<HashMap<String, PresencePayload>>,
    events: broadcast::Sender<PresenceEvent>,
}

/// Loopback [`PresenceChannel`] shared by every client holding a clone.
#[derive(Debug, Clone)]
pub struct MemoryPresenceHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryPresenceHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPresenceHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(HubInner {
                tracked: Mutex::default(),
                events,
            }),
        }
    }

    /// Current tracked payloads per key, in the shape of a sync event.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Vec<PresencePayload>> {
        lock(&self.inner.tracked)
            .iter()
            .map(|(key, payload)| (key.clone(), vec![payload.clone()]))
            .collect()
    }

    /// Broadcast a full sync event to every subscriber.
    pub fn broadcast_sync(&self) {
        let _ = self.inner.events.send(PresenceEvent::Sync {
            presences: self.snapshot(),
        });
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.tracked).len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.inner.tracked).is_empty()
    }
}

#[async_trait]
impl PresenceChannel for MemoryPresenceHub {
    async fn track(&self, key: &str, payload: PresencePayload) -> Result<(), RemoteError> {
        lock(&self.inner.tracked).insert(key.to_string(), payload.clone());
        let _ = self.inner.events.send(PresenceEvent::Join {
            key: key.to_string(),
            new_presences: vec![payload],
        });
        Ok(())
    }

    async fn untrack(&self, key: &str) -> Result<(), RemoteError> {
        let removed = lock(&self.inner.tracked).remove(key);
        if let Some(payload) = removed {
            let _ = self.inner.events.send(PresenceEvent::Leave {
                key: key.to_string(),
                left_presences: vec![payload],
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ShapeKind;
    use crate::Identity;

    #[tokio::test]
    async fn test_crud_publishes_row_changes() {
        let store = MemoryRemoteStore::new();
        let mut changes = store.subscribe();
        let object = CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0);

        store.insert(object.clone()).await.expect("insert");
        store
            .update(object.id, &ObjectPatch::position(5.0, 5.0))
            .await
            .expect("update");
        store.delete(object.id).await.expect("delete");

        let kinds: Vec<ChangeKind> = (0..3)
            .map(|_| changes.try_recv().expect("change").event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expected_negative_outcomes() {
        let store = MemoryRemoteStore::new();
        let object = CanvasObject::new(ShapeKind::Ellipse, 0.0, 0.0);
        store.seed(object.clone());

        assert!(matches!(
            store.insert(object.clone()).await,
            Err(RemoteError::AlreadyExists(_))
        ));
        let missing = ObjectId::new();
        assert!(matches!(store.delete(missing).await, Err(RemoteError::NotFound(_))));
        assert!(matches!(
            store.update(missing, &ObjectPatch::position(0.0, 0.0)).await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_cas_honours_expiry() {
        let store = MemoryRemoteStore::new();
        let object = CanvasObject::new(ShapeKind::Line, 0.0, 0.0);
        store.seed(object.clone());
        let alice = Identity::new("alice", "Alice");
        let bob = Identity::new("bob", "Bob");

        assert!(store
            .try_lock(object.id, &ObjectLock::new(object.id, &alice, 1_000, 100))
            .await
            .expect("lock"));
        assert!(!store
            .try_lock(object.id, &ObjectLock::new(object.id, &bob, 1_050, 100))
            .await
            .expect("lock"));
        // Alice's lock lapsed at 1_100.
        assert!(store
            .try_lock(object.id, &ObjectLock::new(object.id, &bob, 1_100, 100))
            .await
            .expect("lock"));

        assert!(!store.unlock(object.id, "alice").await.expect("unlock"));
        assert!(store.unlock(object.id, "bob").await.expect("unlock"));
        assert!(store.get(object.id).expect("row").locked_by.is_none());
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let store = MemoryRemoteStore::new();
        store.fail_next(2, RemoteError::Timeout);
        let object = CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0);

        assert_eq!(store.insert(object.clone()).await, Err(RemoteError::Timeout));
        assert_eq!(store.insert(object.clone()).await, Err(RemoteError::Timeout));
        assert_eq!(store.insert(object.clone()).await, Ok(()));
        assert_eq!(store.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_presence_hub_fan_out() {
        let hub = MemoryPresenceHub::new();
        let mut events = hub.subscribe();
        let payload = PresencePayload {
            user_id: "alice".into(),
            display_name: "Alice".into(),
            color: "#fff".into(),
            is_active: true,
            last_seen: 1,
            selection: None,
            actively_editing_id: None,
            cursor: None,
        };

        hub.track("conn-a", payload.clone()).await.expect("track");
        hub.broadcast_sync();
        hub.untrack("conn-a").await.expect("untrack");
        hub.untrack("conn-a").await.expect("untrack twice");

        assert!(matches!(events.try_recv(), Ok(PresenceEvent::Join { .. })));
        match events.try_recv() {
            Ok(PresenceEvent::Sync { presences }) => {
                assert_eq!(presences.get("conn-a"), Some(&vec![payload]));
            }
            other => panic!("expected sync, got {other:?}"),
        }
        assert!(matches!(events.try_recv(), Ok(PresenceEvent::Leave { .. })));
        assert!(events.try_recv().is_err());
        assert!(hub.is_empty());
    }
}
