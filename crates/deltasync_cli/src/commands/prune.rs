//! Prune command implementation.

use super::{open_store, CliError, CliResult};
use deltasync_protocol::now_millis;
use deltasync_storage::{DeltaStore, FileStore};
use std::path::Path;
use tracing::info;

const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;

/// Runs the prune command.
pub fn run(path: &Path, older_than_days: u64, dry_run: bool) -> CliResult<()> {
    if older_than_days == 0 {
        return Err(CliError::InvalidArgument(
            "--older-than-days must be at least 1".into(),
        ));
    }
    let store = open_store(path)?;
    let cutoff = now_millis().saturating_sub(older_than_days.saturating_mul(DAY_MILLIS));
    let count = prune(&store, cutoff, dry_run)?;

    if dry_run {
        println!("Would remove {count} deltas older than {older_than_days} days");
    } else {
        println!("Removed {count} deltas older than {older_than_days} days");
    }
    Ok(())
}

/// Removes (or with `dry_run` counts) deltas created before `cutoff`.
pub fn prune(store: &FileStore, cutoff: u64, dry_run: bool) -> CliResult<usize> {
    if dry_run {
        return Ok(store
            .query_ordered_since(0)?
            .iter()
            .filter(|delta| delta.timestamp() < cutoff)
            .count());
    }
    let removed = store.prune_older_than(cutoff)?;
    info!(removed, cutoff, "pruned delta log");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_protocol::{
        DeltaRecord, DeviceId, EntityChanges, FieldChange, GroupField, OperationType,
    };

    fn rename(version: u64, timestamp: u64) -> DeltaRecord {
        DeltaRecord::new(
            version,
            DeviceId::new(),
            OperationType::Update,
            "g1",
            EntityChanges::Group(vec![FieldChange::set(GroupField::Name, "n")]),
        )
        .unwrap()
        .with_timestamp(timestamp)
    }

    #[test]
    fn dry_run_leaves_log_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .bulk_append(&[rename(1, 100), rename(2, 200), rename(3, 300)])
            .unwrap();

        assert_eq!(prune(&store, 250, true).unwrap(), 2);
        assert_eq!(store.delta_count().unwrap(), 3);

        assert_eq!(prune(&store, 250, false).unwrap(), 2);
        assert_eq!(store.delta_count().unwrap(), 1);
        assert_eq!(store.latest_version().unwrap(), 3);
    }
}
