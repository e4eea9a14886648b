//! Delta records: the unit of replication.

use crate::error::{ProtocolError, ProtocolResult};
use crate::fields::{EmojiField, EntityKind, FavoritesField, FieldKey, GroupField, SettingsField};
use crate::ids::{DeltaId, DeviceId};
use crate::snapshot::{EntityKey, EntitySnapshot};
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Kind of mutation a delta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Entity was created.
    Create,
    /// Entity fields were updated.
    Update,
    /// Entity was deleted.
    Delete,
    /// Entity moved to another parent (e.g. emoji between groups).
    Move,
}

impl OperationType {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            OperationType::Create => 1,
            OperationType::Update => 2,
            OperationType::Delete => 3,
            OperationType::Move => 4,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationType::Create),
            2 => Some(OperationType::Update),
            3 => Some(OperationType::Delete),
            4 => Some(OperationType::Move),
            _ => None,
        }
    }

    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
        }
    }
}

/// A change to one field. `None` means the field is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange<F> {
    /// The field that changed.
    pub field: F,
    /// Value before the change.
    pub old_value: Option<FieldValue>,
    /// Value after the change.
    pub new_value: Option<FieldValue>,
}

impl<F: FieldKey> FieldChange<F> {
    /// Creates a change with explicit old and new values.
    pub fn new(field: F, old_value: Option<FieldValue>, new_value: Option<FieldValue>) -> Self {
        Self {
            field,
            old_value,
            new_value,
        }
    }

    /// Creates a change that sets `field` without a known previous value.
    pub fn set(field: F, value: impl Into<FieldValue>) -> Self {
        Self::new(field, None, Some(value.into()))
    }

    /// Creates a change that removes `field`.
    pub fn clear(field: F, old_value: Option<FieldValue>) -> Self {
        Self::new(field, old_value, None)
    }
}

/// Field changes of one delta, typed by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "changes", rename_all = "snake_case")]
pub enum EntityChanges {
    /// Changes to an emoji.
    Emoji(Vec<FieldChange<EmojiField>>),
    /// Changes to a group.
    Group(Vec<FieldChange<GroupField>>),
    /// Changes to settings.
    Settings(Vec<FieldChange<SettingsField>>),
    /// Changes to a favorites entry.
    Favorites(Vec<FieldChange<FavoritesField>>),
}

impl EntityChanges {
    /// Returns the entity kind these changes apply to.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityChanges::Emoji(_) => EntityKind::Emoji,
            EntityChanges::Group(_) => EntityKind::Group,
            EntityChanges::Settings(_) => EntityKind::Settings,
            EntityChanges::Favorites(_) => EntityKind::Favorites,
        }
    }

    /// Returns an empty change set of the given kind.
    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Emoji => EntityChanges::Emoji(Vec::new()),
            EntityKind::Group => EntityChanges::Group(Vec::new()),
            EntityKind::Settings => EntityChanges::Settings(Vec::new()),
            EntityKind::Favorites => EntityChanges::Favorites(Vec::new()),
        }
    }

    /// Returns the number of field changes.
    pub fn len(&self) -> usize {
        match self {
            EntityChanges::Emoji(c) => c.len(),
            EntityChanges::Group(c) => c.len(),
            EntityChanges::Settings(c) => c.len(),
            EntityChanges::Favorites(c) => c.len(),
        }
    }

    /// Returns true if there are no field changes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the final value per field name; the last change to a field wins.
    pub fn final_values(&self) -> BTreeMap<String, Option<FieldValue>> {
        match self {
            EntityChanges::Emoji(c) => final_values(c),
            EntityChanges::Group(c) => final_values(c),
            EntityChanges::Settings(c) => final_values(c),
            EntityChanges::Favorites(c) => final_values(c),
        }
    }

    /// Returns the names of the touched fields in change order, deduplicated.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        };
        match self {
            EntityChanges::Emoji(c) => c.iter().for_each(|ch| push(ch.field.as_str())),
            EntityChanges::Group(c) => c.iter().for_each(|ch| push(ch.field.as_str())),
            EntityChanges::Settings(c) => c.iter().for_each(|ch| push(ch.field.as_str())),
            EntityChanges::Favorites(c) => c.iter().for_each(|ch| push(ch.field.as_str())),
        }
        names
    }

    /// Returns a copy without changes to the named fields.
    pub fn without_fields(&self, fields: &BTreeSet<String>) -> Self {
        match self {
            EntityChanges::Emoji(c) => EntityChanges::Emoji(retain_fields(c, fields)),
            EntityChanges::Group(c) => EntityChanges::Group(retain_fields(c, fields)),
            EntityChanges::Settings(c) => EntityChanges::Settings(retain_fields(c, fields)),
            EntityChanges::Favorites(c) => EntityChanges::Favorites(retain_fields(c, fields)),
        }
    }

    /// Returns the net change of applying `self` and then `later`.
    ///
    /// Each field appears once, keeping its first `old_value` and its last
    /// `new_value`.
    ///
    /// # Errors
    ///
    /// Returns `KindMismatch` if the change sets are for different kinds.
    pub fn followed_by(&self, later: &EntityChanges) -> ProtocolResult<Self> {
        let folded = match (self, later) {
            (EntityChanges::Emoji(a), EntityChanges::Emoji(b)) => EntityChanges::Emoji(fold(a, b)),
            (EntityChanges::Group(a), EntityChanges::Group(b)) => EntityChanges::Group(fold(a, b)),
            (EntityChanges::Settings(a), EntityChanges::Settings(b)) => {
                EntityChanges::Settings(fold(a, b))
            }
            (EntityChanges::Favorites(a), EntityChanges::Favorites(b)) => {
                EntityChanges::Favorites(fold(a, b))
            }
            (a, b) => {
                return Err(ProtocolError::KindMismatch {
                    expected: a.kind(),
                    found: b.kind(),
                })
            }
        };
        Ok(folded)
    }

    /// Applies the new values onto a snapshot of the entity.
    pub fn apply_to(&self, snapshot: &mut EntitySnapshot) {
        for (name, value) in self.final_values() {
            match value {
                Some(value) => {
                    snapshot.insert(name, value);
                }
                None => {
                    snapshot.remove(&name);
                }
            }
        }
    }
}

fn fold<F: FieldKey>(earlier: &[FieldChange<F>], later: &[FieldChange<F>]) -> Vec<FieldChange<F>> {
    let mut folded: Vec<FieldChange<F>> = Vec::with_capacity(earlier.len() + later.len());
    for change in earlier.iter().chain(later) {
        match folded.iter_mut().find(|c| c.field == change.field) {
            Some(existing) => existing.new_value = change.new_value.clone(),
            None => folded.push(change.clone()),
        }
    }
    folded
}

fn retain_fields<F: FieldKey>(
    changes: &[FieldChange<F>],
    excluded: &BTreeSet<String>,
) -> Vec<FieldChange<F>> {
    changes
        .iter()
        .filter(|c| !excluded.contains(c.field.as_str()))
        .cloned()
        .collect()
}

pub(crate) fn final_values<F: FieldKey>(
    changes: &[FieldChange<F>],
) -> BTreeMap<String, Option<FieldValue>> {
    changes
        .iter()
        .map(|c| (c.field.as_str().to_string(), c.new_value.clone()))
        .collect()
}

/// A single committed change, immutable once created.
///
/// # Fields
///
/// - `id`: globally unique identifier
/// - `timestamp`: wall-clock milliseconds at creation, used for newest-wins
/// - `version`: per-device monotonically increasing version
/// - `device_id`: authoring device
/// - `operation`: create, update, delete or move
/// - `entity_id`: the affected entity
/// - `changes`: typed field changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    id: DeltaId,
    timestamp: u64,
    version: u64,
    device_id: DeviceId,
    operation: OperationType,
    entity_id: String,
    changes: EntityChanges,
}

impl DeltaRecord {
    /// Creates a new record stamped with a fresh id and the current time.
    pub fn new(
        version: u64,
        device_id: DeviceId,
        operation: OperationType,
        entity_id: impl Into<String>,
        changes: EntityChanges,
    ) -> ProtocolResult<Self> {
        let entity_id = entity_id.into();
        if entity_id.is_empty() {
            return Err(ProtocolError::EmptyEntityId);
        }
        Ok(Self {
            id: DeltaId::new(),
            timestamp: now_millis(),
            version,
            device_id,
            operation,
            entity_id,
            changes,
        })
    }

    /// Overrides the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns a copy carrying different changes, keeping every other field.
    ///
    /// Used to apply a merged result without touching the original record.
    pub fn with_changes(&self, changes: EntityChanges) -> Self {
        Self {
            changes,
            entity_id: self.entity_id.clone(),
            ..*self
        }
    }

    pub(crate) fn with_operation(mut self, operation: OperationType) -> Self {
        self.operation = operation;
        self
    }

    /// Returns the record id.
    pub fn id(&self) -> DeltaId {
        self.id
    }

    /// Returns the creation timestamp in milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns the per-device version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the authoring device.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Returns the operation type.
    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Returns the affected entity id.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Returns the field changes.
    pub fn changes(&self) -> &EntityChanges {
        &self.changes
    }

    /// Returns the entity kind.
    pub fn kind(&self) -> EntityKind {
        self.changes.kind()
    }

    /// Returns the `(kind, entity_id)` key used for grouping.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.entity_id.clone())
    }
}
