//! Conflict detection and resolution with an auditable history.

use crate::error::{SyncError, SyncResult};
use deltasync_protocol::{
    ConflictInfo, ConflictStrategy, DeltaRecord, EntityChanges, EntitySnapshot, MergeResult,
    Resolution, Tiebreak,
};
use deltasync_storage::ConflictHistoryStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Detects and resolves conflicts between local and remote deltas.
///
/// Every terminal resolution and every conflict left to the caller is
/// appended to the history store.
#[derive(Clone)]
pub struct ConflictResolver {
    history: Arc<dyn ConflictHistoryStore>,
}

impl ConflictResolver {
    /// Creates a resolver backed by a history store.
    pub fn new(history: Arc<dyn ConflictHistoryStore>) -> Self {
        Self { history }
    }

    /// Finds real conflicts between two delta sets.
    pub fn detect_conflicts(&self, local: &[DeltaRecord], remote: &[DeltaRecord]) -> Vec<ConflictInfo> {
        let conflicts = deltasync_protocol::detect_conflicts(local, remote);
        if !conflicts.is_empty() {
            info!(
                count = conflicts.len(),
                local = local.len(),
                remote = remote.len(),
                "conflicts detected"
            );
        }
        conflicts
    }

    /// Resolves every conflict with `strategy` and records the outcomes.
    ///
    /// # Errors
    ///
    /// Returns `NotAutoResolvable` for the manual strategy, and storage or
    /// merge errors as they occur. Conflicts resolved before an error stay
    /// recorded.
    pub fn auto_resolve(
        &self,
        conflicts: &[ConflictInfo],
        strategy: ConflictStrategy,
    ) -> SyncResult<Vec<ConflictInfo>> {
        if !strategy.auto_resolves() {
            return Err(SyncError::NotAutoResolvable(strategy.to_string()));
        }

        let mut resolved = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            let outcome = self.resolve_one(conflict, strategy)?;
            self.history.append_conflict(&outcome)?;
            debug!(
                entity = %outcome.entity_key(),
                %strategy,
                resolution = ?outcome.resolution,
                "conflict resolved"
            );
            resolved.push(outcome);
        }
        Ok(resolved)
    }

    fn resolve_one(
        &self,
        conflict: &ConflictInfo,
        strategy: ConflictStrategy,
    ) -> SyncResult<ConflictInfo> {
        let resolved = match strategy {
            ConflictStrategy::LocalFirst => conflict.resolved_with(Resolution::Local, None),
            ConflictStrategy::RemoteFirst => conflict.resolved_with(Resolution::Remote, None),
            ConflictStrategy::NewestWins => conflict.resolved_with(conflict.newest_side(), None),
            ConflictStrategy::Auto => {
                if conflict.involves_delete() {
                    conflict.resolved_with(conflict.newest_side(), None)
                } else {
                    let merged = self.smart_merge(conflict)?;
                    if !merged.success() {
                        debug!(
                            entity = %conflict.entity_key(),
                            fields = merged.conflicts.len(),
                            "conflicting fields settled newest-wins"
                        );
                    }
                    conflict.resolved_with(Resolution::Merged, Some(merged.data))
                }
            }
            ConflictStrategy::Manual => {
                return Err(SyncError::NotAutoResolvable(strategy.to_string()));
            }
        };
        Ok(resolved)
    }

    /// Merges the two sides of a conflict field by field.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the sides are different entity kinds.
    pub fn smart_merge(&self, conflict: &ConflictInfo) -> SyncResult<MergeResult<EntityChanges>> {
        Ok(deltasync_protocol::smart_merge(
            &conflict.local_delta,
            &conflict.remote_delta,
        )?)
    }

    /// Merges two snapshots that descend from `base`.
    pub fn three_way_merge(
        &self,
        base: &EntitySnapshot,
        local: &EntitySnapshot,
        remote: &EntitySnapshot,
        tiebreak: Tiebreak,
    ) -> MergeResult<EntitySnapshot> {
        let result = deltasync_protocol::three_way_merge(base, local, remote, tiebreak);
        for conflict in &result.conflicts {
            debug!(field = %conflict.field, ?tiebreak, "three-way merge conflict");
        }
        result
    }

    /// Resolves a pending conflict by hand.
    ///
    /// A `Merged` resolution without explicit changes takes the smart-merge
    /// result.
    ///
    /// # Errors
    ///
    /// Returns `ConflictNotPending` if the conflict is already resolved.
    pub fn manual_resolve(
        &self,
        conflict: &ConflictInfo,
        resolution: Resolution,
        merged: Option<EntityChanges>,
    ) -> SyncResult<ConflictInfo> {
        if conflict.resolved {
            return Err(SyncError::ConflictNotPending(conflict.id.to_string()));
        }

        let merged = match (resolution, merged) {
            (Resolution::Merged, Some(changes)) => Some(changes),
            (Resolution::Merged, None) => Some(self.smart_merge(conflict)?.data),
            (_, _) => None,
        };
        let outcome = conflict.resolved_with(resolution, merged);
        self.history.append_conflict(&outcome)?;
        info!(entity = %outcome.entity_key(), %resolution, "conflict resolved manually");
        Ok(outcome)
    }

    /// Records conflicts left for the caller.
    ///
    /// # Errors
    ///
    /// Returns the first storage error.
    pub fn record_unresolved(&self, conflicts: &[ConflictInfo]) -> SyncResult<()> {
        for conflict in conflicts {
            self.history.append_conflict(conflict)?;
        }
        if !conflicts.is_empty() {
            warn!(count = conflicts.len(), "conflicts left for manual resolution");
        }
        Ok(())
    }

    /// Returns conflicts whose latest recorded state is unresolved.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    pub fn unresolved_conflicts(&self) -> SyncResult<Vec<ConflictInfo>> {
        Ok(self.history.unresolved_conflicts()?)
    }

    /// Returns the full history in recording order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    pub fn history(&self) -> SyncResult<Vec<ConflictInfo>> {
        Ok(self.history.conflict_history()?)
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_protocol::{DeviceId, FieldChange, FieldValue, GroupField, OperationType};
    use deltasync_storage::MemoryStore;

    fn group(
        device: DeviceId,
        operation: OperationType,
        changes: Vec<FieldChange<GroupField>>,
        timestamp: u64,
    ) -> DeltaRecord {
        DeltaRecord::new(1, device, operation, "g1", EntityChanges::Group(changes))
            .unwrap()
            .with_timestamp(timestamp)
    }

    fn conflict(local_ts: u64, remote_ts: u64) -> ConflictInfo {
        let local = group(
            DeviceId::new(),
            OperationType::Update,
            vec![
                FieldChange::set(GroupField::Name, "local"),
                FieldChange::set(GroupField::Icon, "star"),
            ],
            local_ts,
        );
        let remote = group(
            DeviceId::new(),
            OperationType::Update,
            vec![
                FieldChange::set(GroupField::Name, "remote"),
                FieldChange::set(GroupField::Color, "blue"),
            ],
            remote_ts,
        );
        ConflictInfo::new(local, remote)
    }

    fn resolver() -> (ConflictResolver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ConflictResolver::new(store.clone()), store)
    }

    #[test]
    fn fixed_strategies() {
        let (resolver, _) = resolver();
        let conflicts = vec![conflict(10, 20)];

        let local = resolver.auto_resolve(&conflicts, ConflictStrategy::LocalFirst).unwrap();
        assert_eq!(local[0].resolution, Some(Resolution::Local));

        let remote = resolver.auto_resolve(&conflicts, ConflictStrategy::RemoteFirst).unwrap();
        assert_eq!(remote[0].resolution, Some(Resolution::Remote));
        assert!(remote[0].resolved);
    }

    #[test]
    fn newest_wins_uses_timestamps_and_ties_go_remote() {
        let (resolver, _) = resolver();
        let out = resolver
            .auto_resolve(&[conflict(30, 20), conflict(20, 20)], ConflictStrategy::NewestWins)
            .unwrap();
        assert_eq!(out[0].resolution, Some(Resolution::Local));
        assert_eq!(out[1].resolution, Some(Resolution::Remote));
    }

    #[test]
    fn auto_merges_fields() {
        let (resolver, _) = resolver();
        let out = resolver.auto_resolve(&[conflict(10, 20)], ConflictStrategy::Auto).unwrap();
        assert_eq!(out[0].resolution, Some(Resolution::Merged));

        let values = out[0].merged_changes.as_ref().unwrap().final_values();
        assert_eq!(values["name"], Some(FieldValue::text("remote")));
        assert_eq!(values["icon"], Some(FieldValue::text("star")));
        assert_eq!(values["color"], Some(FieldValue::text("blue")));
    }

    #[test]
    fn auto_with_delete_falls_back_to_newest() {
        let (resolver, _) = resolver();
        let local = group(DeviceId::new(), OperationType::Delete, vec![], 50);
        let remote = group(
            DeviceId::new(),
            OperationType::Update,
            vec![FieldChange::set(GroupField::Name, "kept")],
            40,
        );
        let out = resolver
            .auto_resolve(&[ConflictInfo::new(local, remote)], ConflictStrategy::Auto)
            .unwrap();
        assert_eq!(out[0].resolution, Some(Resolution::Local));
        assert!(out[0].merged_changes.is_none());
    }

    #[test]
    fn manual_strategy_is_rejected() {
        let (resolver, store) = resolver();
        let err = resolver
            .auto_resolve(&[conflict(1, 2)], ConflictStrategy::Manual)
            .unwrap_err();
        assert!(matches!(err, SyncError::NotAutoResolvable(_)));
        assert!(store.conflict_history().unwrap().is_empty());
    }

    #[test]
    fn history_tracks_unresolved_until_resolved() {
        let (resolver, _) = resolver();
        let pending = conflict(1, 2);
        resolver.record_unresolved(std::slice::from_ref(&pending)).unwrap();
        assert_eq!(resolver.unresolved_conflicts().unwrap().len(), 1);

        let done = resolver.manual_resolve(&pending, Resolution::Merged, None).unwrap();
        assert!(done.merged_changes.is_some());
        assert!(resolver.unresolved_conflicts().unwrap().is_empty());
        assert_eq!(resolver.history().unwrap().len(), 2);

        let err = resolver.manual_resolve(&done, Resolution::Local, None).unwrap_err();
        assert!(matches!(err, SyncError::ConflictNotPending(_)));
    }

    #[test]
    fn storage_failure_surfaces() {
        let (resolver, store) = resolver();
        store.set_fail_writes(true);
        let err = resolver
            .auto_resolve(&[conflict(1, 2)], ConflictStrategy::RemoteFirst)
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
