//! Conflict detection and resolution records.

use crate::delta::{now_millis, DeltaRecord, EntityChanges, OperationType};
use crate::error::ProtocolError;
use crate::fields::EntityKind;
use crate::ids::ConflictId;
use crate::snapshot::EntityKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The local delta wins.
    Local,
    /// The remote delta wins.
    Remote,
    /// A merged change set was applied.
    Merged,
}

impl Resolution {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            Resolution::Local => 1,
            Resolution::Remote => 2,
            Resolution::Merged => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Resolution::Local),
            2 => Some(Resolution::Remote),
            3 => Some(Resolution::Merged),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merged => "merged",
        })
    }
}

/// Strategy applied to detected conflicts during a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Local always wins.
    LocalFirst,
    /// Remote always wins.
    RemoteFirst,
    /// The delta with the larger timestamp wins; ties go to remote.
    NewestWins,
    /// Field-level merge, falling back to newest-wins per conflicting field.
    #[default]
    Auto,
    /// Conflicts are returned to the caller unresolved.
    Manual,
}

impl ConflictStrategy {
    /// Returns true if the strategy settles conflicts without user input.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictStrategy::Manual)
    }

    /// Returns the canonical kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LocalFirst => "local-first",
            ConflictStrategy::RemoteFirst => "remote-first",
            ConflictStrategy::NewestWins => "newest-wins",
            ConflictStrategy::Auto => "auto",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-first" => Ok(ConflictStrategy::LocalFirst),
            "remote-first" => Ok(ConflictStrategy::RemoteFirst),
            "newest-wins" => Ok(ConflictStrategy::NewestWins),
            "auto" => Ok(ConflictStrategy::Auto),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(ProtocolError::UnknownStrategy(other.to_string())),
        }
    }
}

/// A conflict between the local and remote net changes for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Conflict id.
    pub id: ConflictId,
    /// Entity kind.
    pub entity_kind: EntityKind,
    /// Entity id.
    pub entity_id: String,
    /// Net local change for the entity, stamped like its latest local delta.
    pub local_delta: DeltaRecord,
    /// Net remote change for the entity, stamped like its latest remote delta.
    pub remote_delta: DeltaRecord,
    /// Chosen resolution, once resolved.
    pub resolution: Option<Resolution>,
    /// True once the conflict reached a terminal state.
    pub resolved: bool,
    /// Merged changes when `resolution` is `Merged`.
    pub merged_changes: Option<EntityChanges>,
    /// Detection time in milliseconds.
    pub detected_at: u64,
    /// Resolution time in milliseconds.
    pub resolved_at: Option<u64>,
}

impl ConflictInfo {
    /// Creates an unresolved conflict.
    pub fn new(local_delta: DeltaRecord, remote_delta: DeltaRecord) -> Self {
        Self {
            id: ConflictId::new(),
            entity_kind: local_delta.kind(),
            entity_id: local_delta.entity_id().to_string(),
            local_delta,
            remote_delta,
            resolution: None,
            resolved: false,
            merged_changes: None,
            detected_at: now_millis(),
            resolved_at: None,
        }
    }

    /// Returns the `(kind, entity_id)` key.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_kind, self.entity_id.clone())
    }

    /// Returns true if either side deletes the entity.
    pub fn involves_delete(&self) -> bool {
        self.local_delta.operation() == OperationType::Delete
            || self.remote_delta.operation() == OperationType::Delete
    }

    /// Returns a terminal copy with the given resolution.
    pub fn resolved_with(
        &self,
        resolution: Resolution,
        merged_changes: Option<EntityChanges>,
    ) -> Self {
        Self {
            resolution: Some(resolution),
            resolved: true,
            merged_changes,
            resolved_at: Some(now_millis()),
            ..self.clone()
        }
    }

    /// Returns the side that wins under newest-wins. Ties go to remote.
    pub fn newest_side(&self) -> Resolution {
        if self.local_delta.timestamp() > self.remote_delta.timestamp() {
            Resolution::Local
        } else {
            Resolution::Remote
        }
    }
}

/// Finds entities changed on both sides with incompatible changes.
///
/// Deltas are grouped by `(kind, entity_id)` and every delta of a side is
/// folded, in order, into one net change per entity. A conflict exists
/// when either side deletes the entity in any of its deltas, or when both
/// sides end with different values for a common field. Disjoint field
/// changes never conflict.
///
/// The returned conflicts carry the folded changes, stamped with the id,
/// version and timestamp of each side's latest delta.
pub fn detect_conflicts(local: &[DeltaRecord], remote: &[DeltaRecord]) -> Vec<ConflictInfo> {
    let local_net = fold_by_entity(local);
    let remote_net = fold_by_entity(remote);

    local_net
        .into_iter()
        .filter_map(|(key, local_delta)| {
            let remote_delta = remote_net.get(&key)?;
            has_real_conflict(&local_delta, remote_delta)
                .then(|| ConflictInfo::new(local_delta, remote_delta.clone()))
        })
        .collect()
}

fn fold_by_entity(deltas: &[DeltaRecord]) -> BTreeMap<EntityKey, DeltaRecord> {
    let mut grouped: BTreeMap<EntityKey, Vec<&DeltaRecord>> = BTreeMap::new();
    for delta in deltas {
        grouped.entry(delta.entity_key()).or_default().push(delta);
    }
    grouped
        .into_iter()
        .filter_map(|(key, group)| fold_entity(&group).map(|net| (key, net)))
        .collect()
}

fn fold_entity(group: &[&DeltaRecord]) -> Option<DeltaRecord> {
    let latest = group
        .iter()
        .max_by_key(|d| (d.timestamp(), d.version()))?;
    let mut changes = EntityChanges::empty(latest.kind());
    for delta in group {
        // Same key implies same kind.
        changes = changes.followed_by(delta.changes()).ok()?;
    }
    let deleted = group.iter().any(|d| d.operation() == OperationType::Delete);
    let operation = if deleted {
        OperationType::Delete
    } else {
        latest.operation()
    };
    Some(latest.with_changes(changes).with_operation(operation))
}

fn has_real_conflict(local: &DeltaRecord, remote: &DeltaRecord) -> bool {
    if local.operation() == OperationType::Delete || remote.operation() == OperationType::Delete {
        return true;
    }

    let local_values = local.changes().final_values();
    let remote_values = remote.changes().final_values();
    local_values
        .iter()
        .any(|(field, value)| matches!(remote_values.get(field), Some(other) if other != value))
}
