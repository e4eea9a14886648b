//! Turns resolved conflicts into per-delta keep, strip or drop decisions.

use deltasync_protocol::{
    ConflictInfo, DeltaRecord, EntityKey, FieldValue, OperationType, Resolution,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct EntityPlan {
    drop_local: bool,
    drop_remote: bool,
    strip_local: BTreeSet<String>,
    strip_remote: BTreeSet<String>,
}

/// Decides what each side contributes for entities that conflicted.
///
/// Fields touched on both sides are contested; only the winner's changes to
/// a contested field survive, in both directions, so both sides converge.
/// Uncontested fields always flow. When a delete is involved the losing
/// side's deltas for the entity are dropped entirely.
#[derive(Debug, Default)]
pub(crate) struct ResolutionPlan {
    entities: BTreeMap<EntityKey, EntityPlan>,
}

impl ResolutionPlan {
    pub(crate) fn new(
        resolved: &[ConflictInfo],
        local: &[DeltaRecord],
        remote: &[DeltaRecord],
    ) -> Self {
        let mut entities = BTreeMap::new();
        for conflict in resolved {
            let key = conflict.entity_key();
            let local_final = final_values(local, &key);
            let remote_final = final_values(remote, &key);
            let resolution = conflict.resolution.unwrap_or_else(|| conflict.newest_side());

            let mut plan = EntityPlan::default();
            if conflict.involves_delete() {
                match whole_entity_winner(conflict, resolution) {
                    Resolution::Local => plan.drop_remote = true,
                    _ => plan.drop_local = true,
                }
            } else {
                let merged = conflict
                    .merged_changes
                    .as_ref()
                    .map(|changes| changes.final_values())
                    .unwrap_or_default();
                for field in local_final.keys().filter(|f| remote_final.contains_key(*f)) {
                    let winner = match resolution {
                        Resolution::Local | Resolution::Remote => resolution,
                        Resolution::Merged => match merged.get(field) {
                            Some(value)
                                if local_final.get(field) == Some(value)
                                    && remote_final.get(field) != Some(value) =>
                            {
                                Resolution::Local
                            }
                            Some(_) => Resolution::Remote,
                            None => conflict.newest_side(),
                        },
                    };
                    match winner {
                        Resolution::Local => plan.strip_remote.insert(field.clone()),
                        _ => plan.strip_local.insert(field.clone()),
                    };
                }
            }
            entities.insert(key, plan);
        }
        Self { entities }
    }

    /// Returns the remote delta to apply locally, if any survives.
    pub(crate) fn incoming(&self, delta: &DeltaRecord) -> Option<DeltaRecord> {
        match self.entities.get(&delta.entity_key()) {
            None => Some(delta.clone()),
            Some(plan) => filter(delta, plan.drop_remote, &plan.strip_remote),
        }
    }

    /// Returns the local delta to push, if any survives.
    pub(crate) fn outgoing(&self, delta: &DeltaRecord) -> Option<DeltaRecord> {
        match self.entities.get(&delta.entity_key()) {
            None => Some(delta.clone()),
            Some(plan) => filter(delta, plan.drop_local, &plan.strip_local),
        }
    }
}

fn whole_entity_winner(conflict: &ConflictInfo, resolution: Resolution) -> Resolution {
    match resolution {
        Resolution::Merged => conflict.newest_side(),
        other => other,
    }
}

/// Final value per field across all deltas for `key`, in order.
fn final_values(deltas: &[DeltaRecord], key: &EntityKey) -> BTreeMap<String, Option<FieldValue>> {
    let mut values = BTreeMap::new();
    for delta in deltas.iter().filter(|d| &d.entity_key() == key) {
        values.extend(delta.changes().final_values());
    }
    values
}

fn filter(delta: &DeltaRecord, drop: bool, strip: &BTreeSet<String>) -> Option<DeltaRecord> {
    if drop {
        return None;
    }
    if strip.is_empty() {
        return Some(delta.clone());
    }
    let changes = delta.changes().without_fields(strip);
    if changes.len() == delta.changes().len() {
        return Some(delta.clone());
    }
    if changes.is_empty() && delta.operation() == OperationType::Update {
        return None;
    }
    Some(delta.with_changes(changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_protocol::{DeviceId, EntityChanges, FieldChange, GroupField};

    fn group(operation: OperationType, changes: Vec<FieldChange<GroupField>>, ts: u64) -> DeltaRecord {
        DeltaRecord::new(1, DeviceId::new(), operation, "g1", EntityChanges::Group(changes))
            .unwrap()
            .with_timestamp(ts)
    }

    fn names(delta: &DeltaRecord) -> Vec<String> {
        delta.changes().field_names()
    }

    #[test]
    fn remote_win_strips_contested_fields_from_push() {
        let local = group(
            OperationType::Update,
            vec![
                FieldChange::set(GroupField::Name, "l"),
                FieldChange::set(GroupField::Icon, "i"),
            ],
            1,
        );
        let remote = group(OperationType::Update, vec![FieldChange::set(GroupField::Name, "r")], 2);
        let conflict = ConflictInfo::new(local.clone(), remote.clone())
            .resolved_with(Resolution::Remote, None);

        let plan = ResolutionPlan::new(&[conflict], &[local.clone()], &[remote.clone()]);
        assert_eq!(names(&plan.outgoing(&local).unwrap()), vec!["icon"]);
        assert_eq!(plan.incoming(&remote).unwrap(), remote);
    }

    #[test]
    fn local_win_drops_fully_contested_remote_update() {
        let local = group(OperationType::Update, vec![FieldChange::set(GroupField::Name, "l")], 2);
        let remote = group(OperationType::Update, vec![FieldChange::set(GroupField::Name, "r")], 1);
        let conflict = ConflictInfo::new(local.clone(), remote.clone())
            .resolved_with(Resolution::Local, None);

        let plan = ResolutionPlan::new(&[conflict], &[local.clone()], &[remote.clone()]);
        assert!(plan.incoming(&remote).is_none());
        assert_eq!(plan.outgoing(&local).unwrap(), local);
    }

    #[test]
    fn delete_loser_is_dropped() {
        let local = group(OperationType::Delete, vec![], 5);
        let remote = group(OperationType::Update, vec![FieldChange::set(GroupField::Name, "r")], 1);
        let conflict = ConflictInfo::new(local.clone(), remote.clone())
            .resolved_with(Resolution::Local, None);

        let plan = ResolutionPlan::new(&[conflict], &[local.clone()], &[remote.clone()]);
        assert!(plan.incoming(&remote).is_none());
        assert!(plan.outgoing(&local).is_some());
    }

    #[test]
    fn merged_fields_follow_the_merged_value() {
        let local = group(
            OperationType::Update,
            vec![
                FieldChange::set(GroupField::Name, "l"),
                FieldChange::set(GroupField::Color, "red"),
            ],
            9,
        );
        let remote = group(
            OperationType::Update,
            vec![
                FieldChange::set(GroupField::Name, "r"),
                FieldChange::set(GroupField::Color, "blue"),
            ],
            1,
        );
        let merged = EntityChanges::Group(vec![
            FieldChange::set(GroupField::Name, "l"),
            FieldChange::set(GroupField::Color, "blue"),
        ]);
        let conflict = ConflictInfo::new(local.clone(), remote.clone())
            .resolved_with(Resolution::Merged, Some(merged));

        let plan = ResolutionPlan::new(&[conflict], &[local.clone()], &[remote.clone()]);
        assert_eq!(names(&plan.outgoing(&local).unwrap()), vec!["name"]);
        assert_eq!(names(&plan.incoming(&remote).unwrap()), vec!["color"]);
    }

    #[test]
    fn unrelated_entities_pass_through() {
        let plan = ResolutionPlan::default();
        let delta = group(OperationType::Update, vec![FieldChange::set(GroupField::Name, "x")], 1);
        assert_eq!(plan.incoming(&delta).unwrap(), delta);
        assert_eq!(plan.outgoing(&delta).unwrap(), delta);
    }
}
