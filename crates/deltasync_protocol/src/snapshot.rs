//! Entity snapshots used for full reconciliation.

use crate::delta::{DeltaRecord, OperationType};
use crate::error::{ProtocolError, ProtocolResult};
use crate::fields::EntityKind;
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field name to value for one entity.
pub type EntitySnapshot = BTreeMap<String, FieldValue>;

/// Identifies one entity across kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id.
    pub entity_id: String,
}

impl EntityKey {
    /// Creates a new key.
    pub fn new(kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.entity_id)
    }
}

/// The full state of a store: every live entity and its fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Entities keyed by kind and id.
    pub entities: BTreeMap<EntityKey, EntitySnapshot>,
}

impl StoreSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fields of one entity.
    pub fn get(&self, key: &EntityKey) -> Option<&EntitySnapshot> {
        self.entities.get(key)
    }

    /// Inserts or replaces one entity.
    pub fn insert(&mut self, key: EntityKey, fields: EntitySnapshot) {
        self.entities.insert(key, fields);
    }

    /// Returns the number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if no entity is live.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Applies one delta.
    ///
    /// Create and update upsert the entity, delete removes it, move requires
    /// the entity to exist. Applying the same delta twice yields the same
    /// state as applying it once.
    pub fn apply_delta(&mut self, delta: &DeltaRecord) -> ProtocolResult<()> {
        let key = delta.entity_key();
        match delta.operation() {
            OperationType::Create | OperationType::Update => {
                let entity = self.entities.entry(key).or_default();
                delta.changes().apply_to(entity);
            }
            OperationType::Delete => {
                self.entities.remove(&key);
            }
            OperationType::Move => {
                let entity =
                    self.entities
                        .get_mut(&key)
                        .ok_or_else(|| ProtocolError::MissingEntity {
                            kind: key.kind,
                            entity_id: key.entity_id.clone(),
                        })?;
                delta.changes().apply_to(entity);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{EntityChanges, FieldChange};
    use crate::fields::EmojiField;
    use crate::ids::DeviceId;

    fn delta(op: OperationType, changes: Vec<FieldChange<EmojiField>>) -> DeltaRecord {
        DeltaRecord::new(1, DeviceId::new(), op, "e1", EntityChanges::Emoji(changes)).unwrap()
    }

    #[test]
    fn create_update_delete() {
        let mut snapshot = StoreSnapshot::new();
        snapshot
            .apply_delta(&delta(
                OperationType::Create,
                vec![FieldChange::set(EmojiField::Name, "smile")],
            ))
            .unwrap();
        snapshot
            .apply_delta(&delta(
                OperationType::Update,
                vec![FieldChange::set(EmojiField::Width, 32i64)],
            ))
            .unwrap();

        let key = EntityKey::new(EntityKind::Emoji, "e1");
        assert_eq!(snapshot.get(&key).unwrap().len(), 2);

        snapshot
            .apply_delta(&delta(OperationType::Delete, vec![]))
            .unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn move_requires_existing_entity() {
        let mut snapshot = StoreSnapshot::new();
        let err = snapshot
            .apply_delta(&delta(
                OperationType::Move,
                vec![FieldChange::set(EmojiField::GroupId, "g2")],
            ))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingEntity { .. }));
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let d = delta(
            OperationType::Update,
            vec![FieldChange::set(EmojiField::Tags, vec!["a", "b"])],
        );
        let mut once = StoreSnapshot::new();
        once.apply_delta(&d).unwrap();
        let mut twice = once.clone();
        twice.apply_delta(&d).unwrap();
        assert_eq!(once, twice);
    }
}
