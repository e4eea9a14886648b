//! Multi-device sync cycles against a shared in-memory remote.

use async_trait::async_trait;
use deltasync_engine::{
    ConflictResolver, ConnectivityMonitor, DeltaLog, DeltaLogConfig, EntityStore,
    MemoryEntityStore, MemoryRemote, OfflineDeliveryQueue, QueueConfig, RemoteProvider,
    StaticDeviceIdentity, SyncConfig, SyncError, SyncOptions, SyncOrchestrator, SyncOutcome,
    SyncResult, SyncStatus,
};
use deltasync_protocol::{
    ConflictStrategy, DeltaRecord, EntityChanges, EntityKey, EntityKind, EntitySnapshot,
    FieldChange, FieldValue, GroupField, OperationType, Resolution, SettingsField, StoreSnapshot,
};
use deltasync_storage::{MemoryStore, SyncStateStore};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

struct Device<R: RemoteProvider + 'static> {
    sync: SyncOrchestrator<R, MemoryEntityStore>,
    entities: Arc<MemoryEntityStore>,
    states: Arc<MemoryStore>,
    log: DeltaLog,
}

impl<R: RemoteProvider + 'static> Device<R> {
    fn new(remote: Arc<R>, config: SyncConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let states = Arc::new(MemoryStore::new());
        let entities = Arc::new(MemoryEntityStore::new());
        let log = DeltaLog::open(
            store.clone(),
            &StaticDeviceIdentity::random(),
            DeltaLogConfig::default(),
        );
        let queue = OfflineDeliveryQueue::new(
            remote.clone(),
            store.clone(),
            Arc::new(ConnectivityMonitor::new(true)),
            QueueConfig::default().with_auto_retry(false),
        )
        .unwrap();
        let sync = SyncOrchestrator::new(
            config,
            log.clone(),
            remote,
            entities.clone(),
            states.clone(),
            ConflictResolver::new(store),
            queue,
        );
        Self {
            sync,
            entities,
            states,
            log,
        }
    }

    fn track(&self, operation: OperationType, id: &str, changes: EntityChanges) -> DeltaRecord {
        let delta = self.log.track_change(operation, id, changes, true).unwrap();
        self.entities.apply_local(&delta).unwrap();
        delta
    }

    fn set_group(&self, id: &str, field: GroupField, old: &str, new: &str) -> DeltaRecord {
        self.track(
            OperationType::Update,
            id,
            EntityChanges::Group(vec![FieldChange::new(
                field,
                Some(FieldValue::text(old)),
                Some(FieldValue::text(new)),
            )]),
        )
    }

    fn set_columns(&self, columns: i64) -> DeltaRecord {
        self.track(
            OperationType::Update,
            "settings",
            EntityChanges::Settings(vec![FieldChange::set(SettingsField::GridColumns, columns)]),
        )
    }

    fn group(&self, id: &str) -> Option<EntitySnapshot> {
        self.entities
            .snapshot()
            .unwrap()
            .get(&EntityKey::new(EntityKind::Group, id))
            .cloned()
    }

    fn field(&self, id: &str, field: &str) -> Option<FieldValue> {
        self.group(id).and_then(|fields| fields.get(field).cloned())
    }

    async fn sync(&self) -> SyncOutcome {
        self.sync.sync(SyncOptions::new()).await.unwrap()
    }
}

fn seeded_remote() -> MemoryRemote {
    let mut e1 = EntitySnapshot::new();
    e1.insert("name".into(), FieldValue::text("foo"));
    e1.insert("color".into(), FieldValue::text("red"));
    let mut snapshot = StoreSnapshot::new();
    snapshot.insert(EntityKey::new(EntityKind::Group, "e1"), e1);
    MemoryRemote::with_snapshot(snapshot)
}

#[tokio::test]
async fn disjoint_field_edits_converge_without_conflicts() {
    let remote = Arc::new(seeded_remote());
    let a = Device::new(remote.clone(), SyncConfig::default());
    let b = Device::new(remote.clone(), SyncConfig::default());

    for columns in 1..=4 {
        a.set_columns(columns);
    }
    assert!(a.sync().await.report().unwrap().full_sync);
    b.set_columns(8);
    assert!(b.sync().await.report().unwrap().full_sync);

    let renamed = a.set_group("e1", GroupField::Name, "foo", "bar");
    assert_eq!(renamed.version(), 5);
    b.set_group("e1", GroupField::Color, "red", "blue");

    let outcome = a.sync().await;
    assert!(!outcome.report().unwrap().full_sync);
    let outcome = b.sync().await;
    assert!(outcome.report().unwrap().resolved.is_empty());
    a.sync().await;

    for device in [&a, &b] {
        assert_eq!(device.field("e1", "name"), Some(FieldValue::text("bar")));
        assert_eq!(device.field("e1", "color"), Some(FieldValue::text("blue")));
        assert!(device.sync.resolver().history().unwrap().is_empty());
    }
    assert_eq!(a.entities.snapshot().unwrap(), b.entities.snapshot().unwrap());
}

#[tokio::test]
async fn same_field_edits_converge_under_auto_strategy() {
    let remote = Arc::new(seeded_remote());
    let a = Device::new(remote.clone(), SyncConfig::default());
    let b = Device::new(remote.clone(), SyncConfig::default());
    a.set_columns(1);
    a.sync().await;
    b.set_columns(2);
    b.sync().await;
    a.sync().await;

    a.set_group("e1", GroupField::Name, "foo", "from-a");
    b.set_group("e1", GroupField::Name, "foo", "from-b");

    b.sync().await;
    let outcome = a.sync().await;
    let resolved = &outcome.report().unwrap().resolved;
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].resolution, Some(Resolution::Merged));
    b.sync().await;

    assert_eq!(a.field("e1", "name"), b.field("e1", "name"));
    assert_eq!(a.sync.resolver().history().unwrap().len(), 1);
}

#[tokio::test]
async fn earlier_same_field_edit_still_conflicts() {
    let remote = Arc::new(seeded_remote());
    let a = Device::new(remote.clone(), SyncConfig::default());
    let b = Device::new(remote.clone(), SyncConfig::default());
    a.set_columns(1);
    a.sync().await;
    b.set_columns(2);
    b.sync().await;
    a.sync().await;

    a.set_group("e1", GroupField::Name, "foo", "from-a");
    a.track(
        OperationType::Update,
        "e1",
        EntityChanges::Group(vec![FieldChange::set(GroupField::Icon, "star")]),
    );
    b.set_group("e1", GroupField::Name, "foo", "from-b");

    b.sync().await;
    let outcome = a.sync().await;
    assert_eq!(outcome.report().unwrap().resolved.len(), 1);
    b.sync().await;
    a.sync().await;

    assert_eq!(a.field("e1", "name"), b.field("e1", "name"));
    for device in [&a, &b] {
        assert_eq!(device.field("e1", "icon"), Some(FieldValue::text("star")));
    }
    assert_eq!(a.entities.snapshot().unwrap(), b.entities.snapshot().unwrap());
}

#[tokio::test]
async fn delete_conflict_converges() {
    let remote = Arc::new(seeded_remote());
    let a = Device::new(remote.clone(), SyncConfig::default());
    let b = Device::new(remote.clone(), SyncConfig::default());
    a.set_columns(1);
    a.sync().await;
    b.set_columns(2);
    b.sync().await;
    a.sync().await;

    a.track(OperationType::Delete, "e1", EntityChanges::empty(EntityKind::Group));
    b.set_group("e1", GroupField::Name, "foo", "renamed");

    b.sync().await;
    a.sync().await;
    b.sync().await;

    assert_eq!(a.group("e1").is_some(), b.group("e1").is_some());
}

#[tokio::test]
async fn manual_strategy_halts_until_resolved() {
    let remote = Arc::new(seeded_remote());
    let config = SyncConfig::default().with_conflict_strategy(ConflictStrategy::Manual);
    let a = Device::new(remote.clone(), config.clone());
    let b = Device::new(remote.clone(), config);
    a.set_columns(1);
    a.sync().await;
    b.set_columns(2);
    b.sync().await;

    a.set_group("e1", GroupField::Name, "foo", "from-a");
    b.set_group("e1", GroupField::Name, "foo", "from-b");
    b.sync().await;

    let device_id = a.log.device_id();
    let before = a.states.load_version_state(device_id).unwrap();
    let outcome = a.sync().await;
    let conflicts = outcome.conflicts().to_vec();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(a.sync.status(), SyncStatus::Conflict);
    assert_eq!(a.states.load_version_state(device_id).unwrap(), before);
    assert_eq!(a.field("e1", "name"), Some(FieldValue::text("from-a")));
    assert_eq!(a.sync.resolver().unresolved_conflicts().unwrap().len(), 1);

    let decided = a
        .sync
        .resolver()
        .manual_resolve(&conflicts[0], Resolution::Remote, None)
        .unwrap();
    let outcome = a
        .sync
        .sync(SyncOptions::new().with_resolutions(vec![decided]))
        .await
        .unwrap();
    assert!(outcome.report().is_some());
    assert_eq!(a.sync.status(), SyncStatus::Idle);
    assert_eq!(a.field("e1", "name"), Some(FieldValue::text("from-b")));
    assert!(a.sync.resolver().unresolved_conflicts().unwrap().is_empty());
}

/// A remote whose watermark call waits for a permit.
struct GatedRemote {
    inner: MemoryRemote,
    gate: Semaphore,
}

#[async_trait]
impl RemoteProvider for GatedRemote {
    async fn remote_version(&self) -> SyncResult<u64> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        self.inner.remote_version().await
    }

    async fn deltas_since(&self, version: u64) -> SyncResult<Vec<DeltaRecord>> {
        self.inner.deltas_since(version).await
    }

    async fn push_deltas(&self, deltas: &[DeltaRecord]) -> SyncResult<()> {
        self.inner.push_deltas(deltas).await
    }

    async fn pull_snapshot(&self) -> SyncResult<Option<StoreSnapshot>> {
        self.inner.pull_snapshot().await
    }

    async fn push_snapshot(&self, snapshot: &StoreSnapshot) -> SyncResult<()> {
        self.inner.push_snapshot(snapshot).await
    }
}

#[tokio::test]
async fn concurrent_sync_is_rejected_immediately() {
    let remote = Arc::new(GatedRemote {
        inner: MemoryRemote::new(),
        gate: Semaphore::new(0),
    });
    let device = Device::new(remote.clone(), SyncConfig::default());
    device.set_columns(3);

    let running = device.sync.clone();
    let first = tokio::spawn(async move { running.sync(SyncOptions::new()).await });
    while !device.sync.is_syncing() {
        tokio::task::yield_now().await;
    }

    let err = device.sync.sync(SyncOptions::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::SyncInProgress));
    assert_eq!(device.sync.status(), SyncStatus::Syncing);
    assert!(device
        .states
        .load_version_state(device.log.device_id())
        .unwrap()
        .is_none());

    remote.gate.add_permits(1);
    let outcome = first.await.unwrap().unwrap();
    assert!(outcome.report().unwrap().full_sync);
    assert_eq!(device.sync.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn progress_is_observable() {
    let remote = Arc::new(MemoryRemote::new());
    let device = Device::new(remote, SyncConfig::default());
    let mut progress = device.sync.subscribe();
    device.set_columns(1);

    device.sync().await;
    progress.changed().await.unwrap();
    let last = progress.borrow_and_update().clone();
    assert_eq!(last.status, SyncStatus::Idle);
    assert_eq!(last.progress, 100);
}

#[tokio::test(start_paused = true)]
async fn periodic_sync_runs_until_cancelled() {
    let remote = Arc::new(MemoryRemote::new());
    let device = Device::new(remote, SyncConfig::default());
    device.set_columns(1);

    let token = tokio_util::sync::CancellationToken::new();
    let task = device
        .sync
        .spawn_periodic(std::time::Duration::from_secs(30), token.clone());

    tokio::time::sleep(std::time::Duration::from_secs(95)).await;
    token.cancel();
    task.await.unwrap();
    assert_eq!(device.sync.stats().cycles_completed, 3);
}

#[tokio::test(start_paused = true)]
async fn auto_sync_follows_configured_interval() {
    let remote = Arc::new(MemoryRemote::new());
    let manual = Device::new(remote.clone(), SyncConfig::default());
    assert!(manual
        .sync
        .spawn_auto_sync(tokio_util::sync::CancellationToken::new())
        .is_none());

    let config = SyncConfig::default().with_sync_interval(std::time::Duration::from_secs(30));
    let device = Device::new(remote, config);
    device.set_columns(1);

    let token = tokio_util::sync::CancellationToken::new();
    let task = device.sync.spawn_auto_sync(token.clone()).unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(35)).await;
    token.cancel();
    task.await.unwrap();
    assert_eq!(device.sync.stats().cycles_completed, 1);
}
