//! Presence and selection reconciliation.
//!
//! Remote presence arrives as full snapshots (`sync`) or single-key
//! increments (`join`/`leave`). The reconciler keeps one [`UserPresence`]
//! per remote user and reports selection conflicts against the local
//! user's selection, resolved last-touch-wins on `updated_at`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::element::ObjectId;
use crate::{current_timestamp_ms, Identity, SyncError, SyncResult};

/// Who keeps an object when both selections carry the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// The local user keeps it; no forced deselection.
    #[default]
    LocalWins,
    /// The remote user keeps it.
    RemoteWins,
}

/// Pointer position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

/// A user's current selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionState {
    /// Selected objects, in selection order.
    pub object_ids: Vec<ObjectId>,
    /// When the selection was broadcast (ms since epoch).
    pub updated_at: u64,
}

impl SelectionState {
    /// Whether `object_id` is selected.
    #[must_use]
    pub fn contains(&self, object_id: ObjectId) -> bool {
        self.object_ids.contains(&object_id)
    }
}

/// Live record for one connected user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPresence {
    /// User identity.
    pub user_id: String,
    /// Name shown next to cursors and locks.
    pub display_name: String,
    /// Colour used for the user's cursor and selection outline.
    pub color: String,
    /// Whether the user is actively interacting.
    pub is_active: bool,
    /// Last time anything was heard from the user (ms since epoch).
    pub last_seen: u64,
    /// Current selection.
    pub selection: Option<SelectionState>,
    /// Object being dragged/edited under a lock.
    pub actively_editing: Option<ObjectId>,
    /// Pointer position.
    pub cursor: Option<CursorPosition>,
}

/// Presence payload as tracked on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    /// User identity.
    pub user_id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Colour.
    #[serde(default)]
    pub color: String,
    /// Activity flag.
    #[serde(default)]
    pub is_active: bool,
    /// Last activity (ms since epoch).
    #[serde(default)]
    pub last_seen: u64,
    /// Selection with raw object IDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionPayload>,
    /// Raw ID of the object being edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actively_editing_id: Option<String>,
    /// Pointer position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

/// Selection as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPayload {
    /// Raw object IDs.
    pub object_ids: Vec<String>,
    /// Broadcast timestamp.
    pub updated_at: u64,
}

impl TryFrom<PresencePayload> for UserPresence {
    type Error = SyncError;

    fn try_from(payload: PresencePayload) -> SyncResult<Self> {
        if payload.user_id.trim().is_empty() {
            return Err(SyncError::Validation("presence without user id".into()));
        }
        let parse = |raw: &str| {
            ObjectId::parse(raw).map_err(|e| {
                SyncError::Validation(format!("presence object id {raw:?}: {e}"))
            })
        };
        let selection = payload
            .selection
            .map(|s| -> SyncResult<SelectionState> {
                Ok(SelectionState {
                    object_ids: s
                        .object_ids
                        .iter()
                        .map(|raw| parse(raw))
                        .collect::<SyncResult<_>>()?,
                    updated_at: s.updated_at,
                })
            })
            .transpose()?;
        let actively_editing = payload
            .actively_editing_id
            .as_deref()
            .map(parse)
            .transpose()?;
        let display_name = if payload.display_name.is_empty() {
            payload.user_id.clone()
        } else {
            payload.display_name
        };

        Ok(Self {
            user_id: payload.user_id,
            display_name,
            color: payload.color,
            is_active: payload.is_active,
            last_seen: payload.last_seen,
            selection,
            actively_editing,
            cursor: payload.cursor,
        })
    }
}

impl From<&UserPresence> for PresencePayload {
    fn from(presence: &UserPresence) -> Self {
        Self {
            user_id: presence.user_id.clone(),
            display_name: presence.display_name.clone(),
            color: presence.color.clone(),
            is_active: presence.is_active,
            last_seen: presence.last_seen,
            selection: presence.selection.as_ref().map(|s| SelectionPayload {
                object_ids: s.object_ids.iter().map(ToString::to_string).collect(),
                updated_at: s.updated_at,
            }),
            actively_editing_id: presence.actively_editing.map(|id| id.to_string()),
            cursor: presence.cursor,
        }
    }
}

/// Event delivered by the presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Full snapshot: every connection key with its tracked payloads.
    Sync {
        /// Payloads per connection key.
        #[serde(rename = "currentPresences")]
        presences: HashMap<String, Vec<PresencePayload>>,
    },
    /// A connection key started tracking.
    Join {
        /// Connection key.
        key: String,
        /// Payloads now tracked under `key`.
        #[serde(rename = "newPresences")]
        new_presences: Vec<PresencePayload>,
    },
    /// A connection key stopped tracking.
    Leave {
        /// Connection key.
        key: String,
        /// Payloads withdrawn from `key`.
        #[serde(rename = "leftPresences")]
        left_presences: Vec<PresencePayload>,
    },
}

/// An object both the local user and a remote user have selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionConflict {
    /// Contested object.
    pub object_id: ObjectId,
    /// Remote user whose newer selection wins.
    pub winner_id: String,
    /// Local selection timestamp.
    pub local_updated_at: u64,
    /// Remote selection timestamp.
    pub remote_updated_at: u64,
}

/// What changed as a result of one presence event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// Objects the local user must deselect.
    pub conflicts: Vec<SelectionConflict>,
    /// Users that are no longer present.
    pub departed: Vec<String>,
}

/// How the UI should render an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectTreatment {
    /// A remote user is dragging/editing it under a lock.
    Editing {
        /// Editor's user ID.
        user_id: String,
        /// Editor's display name.
        display_name: String,
    },
    /// Selected by these remote users.
    Selected(Vec<String>),
    /// Nobody else is touching it.
    Free,
}

/// Merges remote presence and arbitrates selection conflicts.
#[derive(Debug, Clone)]
pub struct PresenceReconciler {
    local: UserPresence,
    tie_policy: TiePolicy,
    users: HashMap<String, UserPresence>,
    keys: HashMap<String, String>,
}

impl PresenceReconciler {
    /// Create a reconciler for the local `identity`.
    #[must_use]
    pub fn new(identity: &Identity, tie_policy: TiePolicy) -> Self {
        Self {
            local: UserPresence {
                user_id: identity.user_id.clone(),
                display_name: identity.display_name.clone(),
                color: color_for(&identity.user_id).to_string(),
                is_active: true,
                last_seen: current_timestamp_ms(),
                selection: None,
                actively_editing: None,
                cursor: None,
            },
            tie_policy,
            users: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    /// The local user's record.
    #[must_use]
    pub fn local(&self) -> &UserPresence {
        &self.local
    }

    /// The payload to track for the local user.
    #[must_use]
    pub fn local_payload(&self) -> PresencePayload {
        PresencePayload::from(&self.local)
    }

    /// Remote users currently present.
    pub fn users(&self) -> impl Iterator<Item = &UserPresence> {
        self.users.values()
    }

    /// A remote user's record.
    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    /// Apply any presence event.
    pub fn apply_event(&mut self, event: PresenceEvent) -> PresenceUpdate {
        match event {
            PresenceEvent::Sync { presences } => self.apply_sync(presences),
            PresenceEvent::Join { key, new_presences } => self.apply_join(&key, new_presences),
            PresenceEvent::Leave { key, .. } => self.apply_leave(&key),
        }
    }

    /// Replace the remote presence map wholesale.
    pub fn apply_sync(
        &mut self,
        presences: HashMap<String, Vec<PresencePayload>>,
    ) -> PresenceUpdate {
        let previous: HashSet<String> = self.users.keys().cloned().collect();
        self.users.clear();
        self.keys.clear();

        let mut update = PresenceUpdate::default();
        for (key, payloads) in presences {
            if let Some(presence) = self.accept(&key, payloads) {
                update.conflicts.extend(self.conflicts_with(&presence));
                self.insert(key, presence);
            }
        }

        update.departed = previous
            .into_iter()
            .filter(|user_id| !self.users.contains_key(user_id))
            .collect();
        update.departed.sort();
        tracing::debug!(
            users = self.users.len(),
            departed = update.departed.len(),
            conflicts = update.conflicts.len(),
            "Presence synced"
        );
        update
    }

    /// Add or replace the user tracked under `key`.
    pub fn apply_join(&mut self, key: &str, payloads: Vec<PresencePayload>) -> PresenceUpdate {
        let mut update = PresenceUpdate::default();
        if let Some(presence) = self.accept(key, payloads) {
            tracing::debug!(user_id = %presence.user_id, key, "Presence joined");
            update.conflicts = self.conflicts_with(&presence);
            self.insert(key.to_string(), presence);
        }
        update
    }

    /// Remove the user tracked under `key`, unless they are still present
    /// under another key.
    pub fn apply_leave(&mut self, key: &str) -> PresenceUpdate {
        let mut update = PresenceUpdate::default();
        let Some(user_id) = self.keys.remove(key) else {
            return update;
        };
        if !self.keys.values().any(|other| other == &user_id) {
            self.users.remove(&user_id);
            tracing::debug!(user_id = %user_id, key, "Presence left");
            update.departed.push(user_id);
        }
        update
    }

    /// Validate the newest payload under `key`, skipping our own.
    fn accept(&self, key: &str, payloads: Vec<PresencePayload>) -> Option<UserPresence> {
        let payload = payloads.into_iter().max_by_key(|p| p.last_seen)?;
        match UserPresence::try_from(payload) {
            Ok(presence) if presence.user_id == self.local.user_id => None,
            Ok(mut presence) => {
                presence.last_seen = presence.last_seen.max(current_timestamp_ms());
                Some(presence)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Ignoring malformed presence payload");
                None
            }
        }
    }

    fn insert(&mut self, key: String, presence: UserPresence) {
        self.keys.insert(key, presence.user_id.clone());
        self.users.insert(presence.user_id.clone(), presence);
    }

    /// Objects the local user must yield to `remote`'s selection.
    #[must_use]
    pub fn conflicts_with(&self, remote: &UserPresence) -> Vec<SelectionConflict> {
        let (Some(local), Some(theirs)) = (&self.local.selection, &remote.selection) else {
            return Vec::new();
        };
        let remote_wins = match theirs.updated_at.cmp(&local.updated_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.tie_policy == TiePolicy::RemoteWins,
            std::cmp::Ordering::Less => false,
        };
        if !remote_wins {
            return Vec::new();
        }
        local
            .object_ids
            .iter()
            .filter(|id| theirs.contains(**id))
            .map(|&object_id| SelectionConflict {
                object_id,
                winner_id: remote.user_id.clone(),
                local_updated_at: local.updated_at,
                remote_updated_at: theirs.updated_at,
            })
            .collect()
    }

    /// Set the local selection. `updated_at` strictly increases across calls.
    pub fn select_local(&mut self, object_ids: Vec<ObjectId>) -> SelectionState {
        self.select_local_at(object_ids, current_timestamp_ms())
    }

    /// [`Self::select_local`] with an explicit clock.
    pub fn select_local_at(&mut self, object_ids: Vec<ObjectId>, now: u64) -> SelectionState {
        let floor = self
            .local
            .selection
            .as_ref()
            .map_or(0, |s| s.updated_at.saturating_add(1));
        let selection = SelectionState {
            object_ids,
            updated_at: now.max(floor),
        };
        self.local.selection = Some(selection.clone());
        self.local.last_seen = now.max(self.local.last_seen);
        selection
    }

    /// Drop `object_ids` from the local selection after losing a conflict.
    pub fn yield_objects(&mut self, object_ids: &[ObjectId]) -> Option<SelectionState> {
        let current = self.local.selection.as_ref()?;
        let remaining: Vec<ObjectId> = current
            .object_ids
            .iter()
            .copied()
            .filter(|id| !object_ids.contains(id))
            .collect();
        if remaining.len() == current.object_ids.len() {
            return None;
        }
        Some(self.select_local(remaining))
    }

    /// Record the object the local user is editing (or none).
    pub fn set_local_editing(&mut self, object_id: Option<ObjectId>) {
        self.local.actively_editing = object_id;
    }

    /// Record the local cursor position.
    pub fn set_local_cursor(&mut self, cursor: CursorPosition) {
        self.local.cursor = Some(cursor);
        self.local.last_seen = current_timestamp_ms();
    }

    /// How `object_id` should be rendered given remote activity.
    ///
    /// Active editing outranks selection.
    #[must_use]
    pub fn object_treatment(&self, object_id: ObjectId) -> ObjectTreatment {
        if let Some(editor) = self
            .users
            .values()
            .find(|u| u.actively_editing == Some(object_id))
        {
            return ObjectTreatment::Editing {
                user_id: editor.user_id.clone(),
                display_name: editor.display_name.clone(),
            };
        }
        let mut selectors: Vec<String> = self
            .users
            .values()
            .filter(|u| u.selection.as_ref().is_some_and(|s| s.contains(object_id)))
            .map(|u| u.user_id.clone())
            .collect();
        if selectors.is_empty() {
            return ObjectTreatment::Free;
        }
        selectors.sort();
        ObjectTreatment::Selected(selectors)
    }

    /// Forget users not heard from within `timeout`. Returns their IDs.
    pub fn prune_stale(&mut self, now: u64, timeout: Duration) -> Vec<String> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut stale: Vec<String> = self
            .users
            .values()
            .filter(|u| now.saturating_sub(u.last_seen) > timeout_ms)
            .map(|u| u.user_id.clone())
            .collect();
        stale.sort();
        for user_id in &stale {
            self.users.remove(user_id);
        }
        self.keys.retain(|_, user_id| !stale.contains(user_id));
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "Pruned stale presence");
        }
        stale
    }
}

/// Stable colour for a user, picked from a fixed palette.
#[must_use]
pub fn color_for(user_id: &str) -> &'static str {
    const PALETTE: [&str; 8] = [
        "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6", "#9a6324",
    ];
    let hash = user_id
        .bytes()
        .fold(0_usize, |acc, b| acc.wrapping_mul(31).wrapping_add(usize::from(b)));
    PALETTE[hash % PALETTE.len()]
}

/// Limits how often cursor/selection broadcasts go out.
#[derive(Debug, Clone)]
pub struct BroadcastThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl BroadcastThrottle {
    /// Allow at most one broadcast per `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a broadcast may go out now. Records it if so.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// [`Self::try_acquire`] with an explicit clock.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
