//! Field-level and three-way merging.

use crate::delta::{DeltaRecord, EntityChanges, FieldChange, OperationType};
use crate::error::{ProtocolError, ProtocolResult};
use crate::fields::FieldKey;
use crate::snapshot::EntitySnapshot;
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A field both sides changed to different values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Field name.
    pub field: String,
    /// Local value (`None` if absent).
    pub local_value: Option<FieldValue>,
    /// Remote value (`None` if absent).
    pub remote_value: Option<FieldValue>,
    /// Common ancestor value, for three-way merges.
    pub base_value: Option<FieldValue>,
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult<T> {
    /// Merged data, with conflicting fields settled by the tiebreak.
    pub data: T,
    /// Fields that could not be merged cleanly.
    pub conflicts: Vec<FieldConflict>,
}

impl<T> MergeResult<T> {
    /// Returns true if no field conflicted.
    pub fn success(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Which side a three-way merge takes for a conflicting field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tiebreak {
    /// Take the local value.
    PreferLocal,
    /// Take the remote value.
    #[default]
    PreferRemote,
}

/// Merges two deltas for the same entity field by field.
///
/// Fields touched by only one side are taken from that side and fields set
/// to equal values merge cleanly. Fields set to different values are
/// reported as conflicts and settled newest-wins using the record
/// timestamps (ties go to remote). A delete cannot be merged: every field
/// of the surviving side conflicts with an absent value.
pub fn smart_merge(
    local: &DeltaRecord,
    remote: &DeltaRecord,
) -> ProtocolResult<MergeResult<EntityChanges>> {
    if local.kind() != remote.kind() {
        return Err(ProtocolError::KindMismatch {
            expected: local.kind(),
            found: remote.kind(),
        });
    }

    let local_deleted = local.operation() == OperationType::Delete;
    let remote_deleted = remote.operation() == OperationType::Delete;
    if local_deleted || remote_deleted {
        return Ok(delete_merge(local, remote, local_deleted, remote_deleted));
    }

    let prefer_local = local.timestamp() > remote.timestamp();
    let merged = match (local.changes(), remote.changes()) {
        (EntityChanges::Emoji(l), EntityChanges::Emoji(r)) => {
            let (data, conflicts) = merge_fields(l, r, prefer_local);
            MergeResult {
                data: EntityChanges::Emoji(data),
                conflicts,
            }
        }
        (EntityChanges::Group(l), EntityChanges::Group(r)) => {
            let (data, conflicts) = merge_fields(l, r, prefer_local);
            MergeResult {
                data: EntityChanges::Group(data),
                conflicts,
            }
        }
        (EntityChanges::Settings(l), EntityChanges::Settings(r)) => {
            let (data, conflicts) = merge_fields(l, r, prefer_local);
            MergeResult {
                data: EntityChanges::Settings(data),
                conflicts,
            }
        }
        (EntityChanges::Favorites(l), EntityChanges::Favorites(r)) => {
            let (data, conflicts) = merge_fields(l, r, prefer_local);
            MergeResult {
                data: EntityChanges::Favorites(data),
                conflicts,
            }
        }
        (l, r) => {
            return Err(ProtocolError::KindMismatch {
                expected: l.kind(),
                found: r.kind(),
            })
        }
    };
    Ok(merged)
}

fn delete_merge(
    local: &DeltaRecord,
    remote: &DeltaRecord,
    local_deleted: bool,
    remote_deleted: bool,
) -> MergeResult<EntityChanges> {
    let data = EntityChanges::empty(local.kind());
    if local_deleted && remote_deleted {
        return MergeResult {
            data,
            conflicts: Vec::new(),
        };
    }

    let (survivor, local_survives) = if local_deleted {
        (remote, false)
    } else {
        (local, true)
    };
    let conflicts = survivor
        .changes()
        .final_values()
        .into_iter()
        .map(|(field, value)| {
            let (local_value, remote_value) = if local_survives {
                (value, None)
            } else {
                (None, value)
            };
            FieldConflict {
                field,
                local_value,
                remote_value,
                base_value: None,
            }
        })
        .collect();
    MergeResult { data, conflicts }
}

fn merge_fields<F: FieldKey>(
    local: &[FieldChange<F>],
    remote: &[FieldChange<F>],
    prefer_local: bool,
) -> (Vec<FieldChange<F>>, Vec<FieldConflict>) {
    let local_latest: BTreeMap<&F, &FieldChange<F>> = local.iter().map(|c| (&c.field, c)).collect();
    let remote_latest: BTreeMap<&F, &FieldChange<F>> =
        remote.iter().map(|c| (&c.field, c)).collect();
    let fields: BTreeSet<&F> = local_latest
        .keys()
        .chain(remote_latest.keys())
        .copied()
        .collect();

    let mut merged = Vec::with_capacity(fields.len());
    let mut conflicts = Vec::new();
    for field in fields {
        match (local_latest.get(field), remote_latest.get(field)) {
            (Some(l), None) => merged.push((*l).clone()),
            (None, Some(r)) => merged.push((*r).clone()),
            (Some(l), Some(r)) => {
                if l.new_value != r.new_value {
                    conflicts.push(FieldConflict {
                        field: field.as_str().to_string(),
                        local_value: l.new_value.clone(),
                        remote_value: r.new_value.clone(),
                        base_value: None,
                    });
                    merged.push(if prefer_local { (*l).clone() } else { (*r).clone() });
                } else {
                    merged.push((*r).clone());
                }
            }
            (None, None) => {}
        }
    }
    (merged, conflicts)
}

/// Returns the fields whose value differs between `base` and `modified`.
///
/// Removed fields map to `None`.
pub fn diff_snapshots(
    base: &EntitySnapshot,
    modified: &EntitySnapshot,
) -> BTreeMap<String, Option<FieldValue>> {
    let mut diff = BTreeMap::new();
    for (field, value) in modified {
        if base.get(field) != Some(value) {
            diff.insert(field.clone(), Some(value.clone()));
        }
    }
    for field in base.keys() {
        if !modified.contains_key(field) {
            diff.insert(field.clone(), None);
        }
    }
    diff
}

fn apply(data: &mut EntitySnapshot, field: &str, value: &Option<FieldValue>) {
    match value {
        Some(v) => {
            data.insert(field.to_string(), v.clone());
        }
        None => {
            data.remove(field);
        }
    }
}

/// Merges two descendants of a common base.
///
/// Each side's changes relative to `base` are applied; a field changed by
/// both sides to different values is a conflict and takes the value chosen
/// by `tiebreak`.
pub fn three_way_merge(
    base: &EntitySnapshot,
    local: &EntitySnapshot,
    remote: &EntitySnapshot,
    tiebreak: Tiebreak,
) -> MergeResult<EntitySnapshot> {
    let local_diff = diff_snapshots(base, local);
    let remote_diff = diff_snapshots(base, remote);

    let mut data = base.clone();
    let mut conflicts = Vec::new();
    for (field, local_value) in &local_diff {
        match remote_diff.get(field) {
            Some(remote_value) if remote_value != local_value => {
                conflicts.push(FieldConflict {
                    field: field.clone(),
                    local_value: local_value.clone(),
                    remote_value: remote_value.clone(),
                    base_value: base.get(field).cloned(),
                });
                let chosen = match tiebreak {
                    Tiebreak::PreferLocal => local_value,
                    Tiebreak::PreferRemote => remote_value,
                };
                apply(&mut data, field, chosen);
            }
            _ => apply(&mut data, field, local_value),
        }
    }
    for (field, remote_value) in &remote_diff {
        if !local_diff.contains_key(field) {
            apply(&mut data, field, remote_value);
        }
    }

    MergeResult { data, conflicts }
}
