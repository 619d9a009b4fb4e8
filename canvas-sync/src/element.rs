//! Canvas objects - the rows shared through the remote store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{SyncError, SyncResult};

/// Default width for objects created without one.
const DEFAULT_WIDTH: f64 = 100.0;

/// Default height for objects created without one.
const DEFAULT_HEIGHT: f64 = 100.0;

/// Unique identifier for a canvas object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Create a new unique object ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse an object ID from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The drawable kind of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShapeKind {
    /// Axis-aligned rectangle.
    Rectangle,
    /// Ellipse inscribed in the object's bounds.
    Ellipse,
    /// Straight line from the top-left to the bottom-right corner.
    Line,
    /// Text label.
    Text {
        /// Text content.
        content: String,
        /// Font size in pixels.
        font_size: f64,
    },
    /// Raster or vector image.
    Image {
        /// Image source URI.
        src: String,
    },
    /// Container for other objects.
    Group {
        /// Child object IDs.
        children: Vec<ObjectId>,
    },
}

/// A full canvas object row, including its lock columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    /// Unique identifier.
    pub id: ObjectId,
    /// Drawable kind.
    pub kind: ShapeKind,
    /// X position.
    pub x: f64,
    /// Y position.
    pub y: f64,
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
    /// Rotation in radians.
    #[serde(default)]
    pub rotation: f64,
    /// Fill color as hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    /// Stroke color as hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    /// Layer order.
    #[serde(default)]
    pub z_index: i32,
    /// User currently holding the edit lock.
    #[serde(default)]
    pub locked_by: Option<String>,
    /// Display name of the lock holder.
    #[serde(default)]
    pub locked_by_name: Option<String>,
    /// When the lock was taken (ms since epoch).
    #[serde(default)]
    pub locked_at: Option<u64>,
    /// When the lock lapses (ms since epoch).
    #[serde(default)]
    pub lock_expires_at: Option<u64>,
    /// Last modification time (ms since epoch).
    #[serde(default)]
    pub updated_at: u64,
}

impl CanvasObject {
    /// Create an unlocked object at the given position with default size.
    #[must_use]
    pub fn new(kind: ShapeKind, x: f64, y: f64) -> Self {
        Self {
            id: ObjectId::new(),
            kind,
            x,
            y,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            rotation: 0.0,
            fill: None,
            stroke: None,
            z_index: 0,
            locked_by: None,
            locked_by_name: None,
            locked_at: None,
            lock_expires_at: None,
            updated_at: 0,
        }
    }

    /// Set the size.
    #[must_use]
    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the fill color.
    #[must_use]
    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    /// Overwrite the fields present in `patch`. The ID is never changed.
    pub fn apply_patch(&mut self, patch: &ObjectPatch) {
        if let Some(kind) = &patch.kind {
            self.kind = kind.clone();
        }
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(width) = patch.width {
            self.width = width;
        }
        if let Some(height) = patch.height {
            self.height = height;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(fill) = &patch.fill {
            self.fill = Some(fill.clone());
        }
        if let Some(stroke) = &patch.stroke {
            self.stroke = Some(stroke.clone());
        }
        if let Some(z_index) = patch.z_index {
            self.z_index = z_index;
        }
    }

    /// Whether the lock columns name a holder whose lock has not lapsed at `now`.
    #[must_use]
    pub fn is_locked_at(&self, now: u64) -> bool {
        self.locked_by.is_some() && !matches!(self.lock_expires_at, Some(exp) if exp <= now)
    }

    /// Clear the lock columns.
    pub fn clear_lock(&mut self) {
        self.locked_by = None;
        self.locked_by_name = None;
        self.locked_at = None;
        self.lock_expires_at = None;
    }
}

/// A partial object: every field optional.
///
/// Used as the payload of queued creates (the full object) and updates (the
/// changed fields only).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    /// Object identity (required for creates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Drawable kind (required for creates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ShapeKind>,
    /// X position (required for creates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// Y position (required for creates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// Width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    /// Height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// Rotation in radians.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    /// Fill color.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    /// Stroke color.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    /// Layer order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

impl ObjectPatch {
    /// A patch that only moves the object.
    #[must_use]
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Materialize a create payload into a full object.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the identity, kind or either
    /// coordinate is missing, or a coordinate is not finite.
    pub fn into_object(self) -> SyncResult<CanvasObject> {
        let id = self
            .id
            .ok_or_else(|| SyncError::Validation("create is missing an object id".into()))?;
        let kind = self
            .kind
            .ok_or_else(|| SyncError::Validation(format!("create of {id} is missing a kind")))?;
        let (Some(x), Some(y)) = (self.x, self.y) else {
            return Err(SyncError::Validation(format!(
                "create of {id} is missing coordinates"
            )));
        };
        if !x.is_finite() || !y.is_finite() {
            return Err(SyncError::Validation(format!(
                "create of {id} has non-finite coordinates"
            )));
        }

        let mut object = CanvasObject::new(kind, x, y);
        object.id = id;
        object.width = self.width.unwrap_or(DEFAULT_WIDTH);
        object.height = self.height.unwrap_or(DEFAULT_HEIGHT);
        object.rotation = self.rotation.unwrap_or(0.0);
        object.fill = self.fill;
        object.stroke = self.stroke;
        object.z_index = self.z_index.unwrap_or(0);
        Ok(object)
    }
}

impl From<&CanvasObject> for ObjectPatch {
    fn from(object: &CanvasObject) -> Self {
        Self {
            id: Some(object.id),
            kind: Some(object.kind.clone()),
            x: Some(object.x),
            y: Some(object.y),
            width: Some(object.width),
            height: Some(object.height),
            rotation: Some(object.rotation),
            fill: object.fill.clone(),
            stroke: object.stroke.clone(),
            z_index: Some(object.z_index),
        }
    }
}
