//! The same behavioral contract checked against every store.

use deltasync_protocol::{
    ConflictInfo, DeltaRecord, DeviceId, EntityChanges, FieldChange, OperationType, QueueItem,
    Resolution, SettingsField, SyncVersionState,
};
use deltasync_storage::frame::{decode_frames, encode_frame, FrameKind};
use deltasync_storage::{
    ConflictHistoryStore, DeltaStore, FileStore, MemoryStore, QueueStore, SyncStateStore,
};
use proptest::prelude::*;
use tempfile::tempdir;

fn delta(version: u64) -> DeltaRecord {
    DeltaRecord::new(
        version,
        DeviceId::new(),
        OperationType::Update,
        "settings",
        EntityChanges::Settings(vec![FieldChange::set(
            SettingsField::GridColumns,
            version as i64,
        )]),
    )
    .unwrap()
}

fn check_contract<S>(store: &S)
where
    S: DeltaStore + QueueStore + SyncStateStore + ConflictHistoryStore,
{
    // Delta log ordering and watermarks.
    assert_eq!(store.latest_version().unwrap(), 0);
    store.bulk_append(&[delta(2), delta(1)]).unwrap();
    store.append(&delta(3)).unwrap();
    let since_one: Vec<u64> = store
        .query_ordered_since(1)
        .unwrap()
        .iter()
        .map(DeltaRecord::version)
        .collect();
    assert_eq!(since_one, vec![2, 3]);
    assert_eq!(store.latest_version().unwrap(), 3);

    // Pruning every record keeps the high-water version.
    assert_eq!(store.prune_older_than(u64::MAX).unwrap(), 3);
    assert_eq!(store.delta_count().unwrap(), 0);
    assert_eq!(store.latest_version().unwrap(), 3);
    assert!(store.query_ordered_since(0).unwrap().is_empty());

    // Queue FIFO order.
    let first = QueueItem::new(delta(10), 2);
    let second = QueueItem::new(delta(11), 2);
    store.put_item(&first).unwrap();
    store.put_item(&second).unwrap();
    store.remove_item(first.id).unwrap();
    let queue = store.load_queue().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, second.id);
    store.clear_queue().unwrap();
    assert!(store.load_queue().unwrap().is_empty());

    // Version state.
    let device = DeviceId::new();
    assert!(store.load_version_state(device).unwrap().is_none());
    let state = SyncVersionState {
        local_version: 3,
        remote_version: 9,
        last_sync_time: 1,
        device_id: device,
        pending_changes: 0,
    };
    store.save_version_state(&state).unwrap();
    assert_eq!(store.load_version_state(device).unwrap(), Some(state));
    assert_eq!(store.version_states().unwrap().len(), 1);

    // Conflict history.
    let conflict = ConflictInfo::new(delta(1), delta(1));
    store.append_conflict(&conflict).unwrap();
    assert_eq!(store.unresolved_conflicts().unwrap().len(), 1);
    store
        .append_conflict(&conflict.resolved_with(Resolution::Local, None))
        .unwrap();
    assert!(store.unresolved_conflicts().unwrap().is_empty());
}

#[test]
fn memory_store_contract() {
    check_contract(&MemoryStore::new());
}

#[test]
fn file_store_contract() {
    let dir = tempdir().unwrap();
    check_contract(&FileStore::open(dir.path()).unwrap());
}

proptest! {
    #[test]
    fn any_prefix_of_a_frame_stream_decodes_to_whole_frames(
        payloads in proptest::collection::vec(".{0,40}", 1..6),
        cut in any::<prop::sample::Index>(),
    ) {
        let mut buf = Vec::new();
        let mut boundaries = vec![0usize];
        for payload in &payloads {
            buf.extend(encode_frame(FrameKind::Delta, payload).unwrap());
            boundaries.push(buf.len());
        }

        let cut = cut.index(buf.len() + 1);
        let decoded = decode_frames(&buf[..cut]).unwrap();
        let expected = boundaries.iter().filter(|b| **b <= cut).count() - 1;
        prop_assert_eq!(decoded.frames.len(), expected);
        prop_assert_eq!(decoded.valid_len, boundaries[expected]);
    }
}
