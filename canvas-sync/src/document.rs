//! The locally held document that optimistic mutations land on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::element::{CanvasObject, ObjectId, ObjectPatch};
use crate::remote::{ChangeKind, RowChange};
use crate::{SyncError, SyncResult};

/// Local copy of the shared object set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalDocument {
    objects: HashMap<ObjectId, CanvasObject>,
}

impl LocalDocument {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object. Returns the previous row, if any.
    pub fn upsert(&mut self, object: CanvasObject) -> Option<CanvasObject> {
        self.objects.insert(object.id, object)
    }

    /// Remove an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not found.
    pub fn remove(&mut self, id: ObjectId) -> SyncResult<CanvasObject> {
        self.objects
            .remove(&id)
            .ok_or_else(|| SyncError::ObjectNotFound(id.to_string()))
    }

    /// Apply a patch, returning the row as it was before.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not found.
    pub fn patch(&mut self, id: ObjectId, patch: &ObjectPatch) -> SyncResult<CanvasObject> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| SyncError::ObjectNotFound(id.to_string()))?;
        let before = object.clone();
        object.apply_patch(patch);
        Ok(before)
    }

    /// Get an object by ID.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&CanvasObject> {
        self.objects.get(&id)
    }

    /// Get a mutable reference to an object.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut CanvasObject> {
        self.objects.get_mut(&id)
    }

    /// Iterate over all objects.
    pub fn objects(&self) -> impl Iterator<Item = &CanvasObject> {
        self.objects.values()
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the document has no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Mirror a remote row change. Remote rows win over local state.
    pub fn apply_row_change(&mut self, change: &RowChange) {
        match change.event_type {
            ChangeKind::Insert | ChangeKind::Update => {
                if let Some(row) = &change.new {
                    self.objects.insert(row.id, row.clone());
                }
            }
            ChangeKind::Delete => {
                if let Some(id) = change.object_id() {
                    self.objects.remove(&id);
                }
            }
        }
    }
}
