//! Durable retrying queue for deltas the remote did not accept.

use crate::busy::BusyGuard;
use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::SyncResult;
use crate::remote::RemoteProvider;
use deltasync_protocol::{DeltaRecord, QueueItem, QueueItemId};
use deltasync_storage::QueueStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStatus {
    /// Connectivity at the time of the call.
    pub online: bool,
    /// Items waiting for delivery.
    pub queue_length: usize,
    /// Whether a drain is running.
    pub in_progress: bool,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items accepted by the remote.
    pub delivered: usize,
    /// Items that failed and stay queued.
    pub retried: usize,
    /// Items dropped after spending their retry budget.
    pub dropped: Vec<QueueItem>,
    /// True if another drain was already running.
    pub skipped: bool,
    /// True if the pass did not run or stopped early because connectivity
    /// was lost.
    pub offline: bool,
}

/// Delivers queued deltas to the remote, one at a time in FIFO order.
///
/// Items are persisted before they are acknowledged, so the queue survives
/// restarts. A failed delivery increments the item's retry count; an item
/// that fails with its budget spent is dropped and kept in the failed list
/// until [`take_failed`](Self::take_failed) is called.
pub struct OfflineDeliveryQueue<R: RemoteProvider + 'static> {
    inner: Arc<QueueInner<R>>,
}

struct QueueInner<R: RemoteProvider + 'static> {
    remote: Arc<R>,
    store: Arc<dyn QueueStore>,
    connectivity: Arc<dyn Connectivity>,
    config: QueueConfig,
    items: Mutex<Vec<QueueItem>>,
    failed: Mutex<Vec<QueueItem>>,
    in_progress: AtomicBool,
    shutdown: CancellationToken,
}

impl<R: RemoteProvider + 'static> Clone for OfflineDeliveryQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteProvider + 'static> OfflineDeliveryQueue<R> {
    /// Creates a queue and loads persisted items.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted queue cannot be read.
    pub fn new(
        remote: Arc<R>,
        store: Arc<dyn QueueStore>,
        connectivity: Arc<dyn Connectivity>,
        config: QueueConfig,
    ) -> SyncResult<Self> {
        let items = store.load_queue()?;
        if !items.is_empty() {
            info!(count = items.len(), "loaded offline queue");
        }

        let queue = Self {
            inner: Arc::new(QueueInner {
                remote,
                store,
                connectivity,
                config,
                items: Mutex::new(items),
                failed: Mutex::new(Vec::new()),
                in_progress: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        };
        if !queue.is_empty() {
            queue.inner.trigger_drain();
        }
        Ok(queue)
    }

    /// Persists and queues a delta.
    ///
    /// When automatic retry is on and the remote is reachable a drain is
    /// started in the background.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the item cannot be persisted; nothing is
    /// queued in that case.
    pub fn enqueue(&self, delta: DeltaRecord, max_retries: Option<u32>) -> SyncResult<QueueItemId> {
        let id = self.inner.push_item(delta, max_retries)?;
        self.inner.trigger_drain();
        Ok(id)
    }

    /// Queues several deltas in order and starts at most one drain.
    ///
    /// # Errors
    ///
    /// Returns the first storage error. Deltas before it stay queued.
    pub fn enqueue_all(&self, deltas: &[DeltaRecord], max_retries: Option<u32>) -> SyncResult<usize> {
        for delta in deltas {
            self.inner.push_item(delta.clone(), max_retries)?;
        }
        if !deltas.is_empty() {
            self.inner.trigger_drain();
        }
        Ok(deltas.len())
    }

    /// Runs one drain pass over the whole queue.
    ///
    /// A no-op while offline or while another pass runs.
    ///
    /// # Errors
    ///
    /// Returns a storage error if an item's new state cannot be persisted.
    /// Remote failures are absorbed into the report.
    pub async fn process_queue(&self) -> SyncResult<DrainReport> {
        self.inner.process_queue().await
    }

    /// Spawns a task that drains the queue whenever connectivity returns.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn_listener(&self, token: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut rx = inner.connectivity.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *rx.borrow_and_update();
                        if online {
                            info!("back online; draining offline queue");
                            inner.run_passes().await;
                        } else {
                            debug!("offline; delivery paused");
                        }
                    }
                }
            }
            debug!("offline queue listener stopped");
        })
    }

    /// Returns a snapshot of the queue.
    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus {
            online: self.inner.connectivity.is_online(),
            queue_length: self.len(),
            in_progress: self.inner.in_progress.load(Ordering::SeqCst),
        }
    }

    /// Returns and forgets items dropped after spending their retry budget.
    pub fn take_failed(&self) -> Vec<QueueItem> {
        std::mem::take(&mut *self.inner.failed.lock())
    }

    /// Returns a copy of the queued items in delivery order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.inner.items.lock().clone()
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued item.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted queue cannot be cleared.
    pub fn clear(&self) -> SyncResult<()> {
        self.inner.store.clear_queue()?;
        let dropped = std::mem::take(&mut *self.inner.items.lock());
        info!(dropped = dropped.len(), "offline queue cleared");
        Ok(())
    }

    /// Stops background drains. Queued items stay persisted.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl<R: RemoteProvider + 'static> QueueInner<R> {
    fn push_item(&self, delta: DeltaRecord, max_retries: Option<u32>) -> SyncResult<QueueItemId> {
        let item = QueueItem::new(delta, max_retries.unwrap_or(self.config.default_max_retries));
        self.store.put_item(&item)?;
        debug!(
            id = %item.id,
            delta_id = %item.delta.id(),
            operation = item.delta.operation().as_str(),
            "delta queued for delivery"
        );
        let id = item.id;
        self.items.lock().push(item);
        Ok(id)
    }

    fn trigger_drain(self: &Arc<Self>) {
        if !self.config.auto_retry
            || self.shutdown.is_cancelled()
            || !self.connectivity.is_online()
        {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(self);
        handle.spawn(async move {
            inner.run_passes().await;
        });
    }

    /// Drains repeatedly with backoff while items remain and the remote is
    /// reachable. Without automatic retry a single pass runs.
    async fn run_passes(self: &Arc<Self>) {
        let passes = if self.config.auto_retry {
            self.config.retry.max_attempts.max(1)
        } else {
            1
        };

        for pass in 0..passes {
            if pass > 0 {
                let delay = self.config.retry.delay_for_attempt(pass);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => return,
                }
            }
            match self.process_queue().await {
                Ok(report) if report.skipped || report.offline => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "offline queue drain failed");
                    return;
                }
            }
            if self.items.lock().is_empty() {
                return;
            }
        }
    }

    async fn process_queue(&self) -> SyncResult<DrainReport> {
        if !self.connectivity.is_online() {
            debug!("offline; skipping drain");
            return Ok(DrainReport {
                offline: true,
                ..DrainReport::default()
            });
        }
        let Some(_busy) = BusyGuard::try_acquire(&self.in_progress) else {
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };
        // Items leave the queue only once delivered or dropped, so an
        // interrupted drain leaves the rest queued.
        self.drain().await
    }

    async fn drain(&self) -> SyncResult<DrainReport> {
        let pending = self.items.lock().clone();
        let mut report = DrainReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        debug!(count = pending.len(), "draining offline queue");

        for mut item in pending {
            if !self.connectivity.is_online() {
                info!(remaining = self.items.lock().len(), "connectivity lost; drain stopped");
                report.offline = true;
                break;
            }

            match self.remote.push_deltas(std::slice::from_ref(&item.delta)).await {
                Ok(()) => {
                    self.store.remove_item(item.id)?;
                    self.forget(item.id);
                    report.delivered += 1;
                }
                Err(e) if item.record_failure() => {
                    self.store.put_item(&item)?;
                    warn!(
                        id = %item.id,
                        retry = item.retry_count,
                        max_retries = item.max_retries,
                        error = %e,
                        "delivery failed; item stays queued"
                    );
                    self.replace(&item);
                    report.retried += 1;
                }
                Err(e) => {
                    self.store.remove_item(item.id)?;
                    self.forget(item.id);
                    error!(
                        id = %item.id,
                        delta_id = %item.delta.id(),
                        error = %e,
                        "delivery failed permanently; item dropped"
                    );
                    self.failed.lock().push(item.clone());
                    report.dropped.push(item);
                }
            }
        }

        if report.delivered > 0 || !report.dropped.is_empty() {
            info!(
                delivered = report.delivered,
                retried = report.retried,
                dropped = report.dropped.len(),
                "offline queue drained"
            );
        }
        Ok(report)
    }

    fn forget(&self, id: QueueItemId) {
        self.items.lock().retain(|item| item.id != id);
    }

    fn replace(&self, updated: &QueueItem) {
        if let Some(slot) = self.items.lock().iter_mut().find(|item| item.id == updated.id) {
            *slot = updated.clone();
        }
    }
}

impl<R: RemoteProvider + 'static> std::fmt::Debug for OfflineDeliveryQueue<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineDeliveryQueue")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::connectivity::ConnectivityMonitor;
    use crate::remote::MemoryRemote;
    use deltasync_protocol::{
        DeviceId, EntityChanges, FieldChange, GroupField, OperationType, StoreSnapshot,
    };
    use deltasync_storage::MemoryStore;
    use std::time::Duration;

    /// Holds every push until released.
    struct StallingRemote {
        inner: MemoryRemote,
        stalled: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RemoteProvider for StallingRemote {
        async fn remote_version(&self) -> SyncResult<u64> {
            self.inner.remote_version().await
        }

        async fn deltas_since(&self, version: u64) -> SyncResult<Vec<DeltaRecord>> {
            self.inner.deltas_since(version).await
        }

        async fn push_deltas(&self, deltas: &[DeltaRecord]) -> SyncResult<()> {
            if self.stalled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.push_deltas(deltas).await
        }

        async fn pull_snapshot(&self) -> SyncResult<Option<StoreSnapshot>> {
            self.inner.pull_snapshot().await
        }

        async fn push_snapshot(&self, snapshot: &StoreSnapshot) -> SyncResult<()> {
            self.inner.push_snapshot(snapshot).await
        }
    }

    fn delta(version: u64) -> DeltaRecord {
        DeltaRecord::new(
            version,
            DeviceId::new(),
            OperationType::Create,
            format!("g{version}"),
            EntityChanges::Group(vec![FieldChange::set(GroupField::Name, "n")]),
        )
        .unwrap()
    }

    struct Harness {
        remote: Arc<MemoryRemote>,
        store: Arc<MemoryStore>,
        connectivity: Arc<ConnectivityMonitor>,
    }

    impl Harness {
        fn new(online: bool) -> Self {
            Self {
                remote: Arc::new(MemoryRemote::new()),
                store: Arc::new(MemoryStore::new()),
                connectivity: Arc::new(ConnectivityMonitor::new(online)),
            }
        }

        fn queue(&self, config: QueueConfig) -> OfflineDeliveryQueue<MemoryRemote> {
            OfflineDeliveryQueue::new(
                self.remote.clone(),
                self.store.clone(),
                self.connectivity.clone(),
                config,
            )
            .unwrap()
        }

        fn manual_queue(&self) -> OfflineDeliveryQueue<MemoryRemote> {
            self.queue(QueueConfig::default().with_auto_retry(false))
        }
    }

    #[tokio::test]
    async fn items_survive_restart() {
        let h = Harness::new(false);
        let queue = h.manual_queue();
        queue.enqueue(delta(1), None).unwrap();
        queue.enqueue(delta(2), Some(5)).unwrap();
        drop(queue);

        let reopened = h.manual_queue();
        let items = reopened.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].max_retries, 3);
        assert_eq!(items[1].max_retries, 5);
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let h = Harness::new(true);
        let queue = h.manual_queue();
        let deltas: Vec<DeltaRecord> = (1..=3).map(delta).collect();
        queue.enqueue_all(&deltas, None).unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.delivered, 3);
        assert!(queue.is_empty());
        assert!(h.store.load_queue().unwrap().is_empty());

        let ids: Vec<_> = h.remote.accepted().iter().map(DeltaRecord::id).collect();
        let expected: Vec<_> = deltas.iter().map(DeltaRecord::id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn item_is_dropped_exactly_when_budget_is_spent() {
        let h = Harness::new(true);
        h.remote.set_online(false);
        let queue = h.manual_queue();
        queue.enqueue(delta(1), Some(2)).unwrap();

        queue.process_queue().await.unwrap();
        assert_eq!(queue.items()[0].retry_count, 1);

        queue.process_queue().await.unwrap();
        assert_eq!(queue.items()[0].retry_count, 2);
        assert_eq!(h.store.load_queue().unwrap()[0].retry_count, 2);

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.dropped.len(), 1);
        assert!(queue.is_empty());
        assert!(h.store.load_queue().unwrap().is_empty());
        assert_eq!(queue.take_failed().len(), 1);
        assert!(queue.take_failed().is_empty());
    }

    #[tokio::test]
    async fn drain_continues_past_failures() {
        let h = Harness::new(true);
        h.remote.fail_next_pushes(1);
        let queue = h.manual_queue();
        queue.enqueue_all(&[delta(1), delta(2)], None).unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_drain_releases_the_queue() {
        let remote = Arc::new(StallingRemote {
            inner: MemoryRemote::new(),
            stalled: AtomicBool::new(true),
        });
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineDeliveryQueue::new(
            remote.clone(),
            store.clone(),
            Arc::new(ConnectivityMonitor::new(true)),
            QueueConfig::default().with_auto_retry(false),
        )
        .unwrap();
        queue.enqueue_all(&[delta(1), delta(2)], None).unwrap();

        let interrupted = tokio::time::timeout(Duration::from_millis(10), queue.process_queue()).await;
        assert!(interrupted.is_err());
        assert!(!queue.status().in_progress);
        assert_eq!(queue.len(), 2);
        assert_eq!(store.load_queue().unwrap().len(), 2);

        remote.stalled.store(false, Ordering::SeqCst);
        let report = queue.process_queue().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.delivered, 2);
        assert!(queue.is_empty());
        assert_eq!(remote.inner.accepted().len(), 2);
    }

    #[tokio::test]
    async fn offline_stops_attempts_without_clearing() {
        let h = Harness::new(false);
        let queue = h.manual_queue();
        queue.enqueue(delta(1), None).unwrap();

        let report = queue.process_queue().await.unwrap();
        assert!(report.offline);
        assert_eq!(h.remote.push_calls(), 0);
        assert_eq!(
            queue.status(),
            DeliveryStatus {
                online: false,
                queue_length: 1,
                in_progress: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_drains_queue() {
        let h = Harness::new(false);
        let queue = h.manual_queue();
        queue.enqueue_all(&[delta(1), delta(2)], None).unwrap();

        let token = CancellationToken::new();
        let listener = queue.spawn_listener(token.clone());
        h.connectivity.set_online(true);

        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.remote.accepted().len(), 2);

        token.cancel();
        listener.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn automatic_retry_backs_off_between_passes() {
        let h = Harness::new(true);
        h.remote.fail_next_pushes(1);
        let queue = h.queue(
            QueueConfig::default().with_retry(RetryConfig::new(3).without_jitter()),
        );
        queue.enqueue(delta(1), None).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.items()[0].retry_count, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(queue.is_empty());
        assert_eq!(h.remote.push_calls(), 2);
    }

    #[tokio::test]
    async fn failed_persist_queues_nothing() {
        let h = Harness::new(false);
        let queue = h.manual_queue();
        h.store.set_fail_writes(true);
        assert!(queue.enqueue(delta(1), None).is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn clear_empties_store() {
        let h = Harness::new(false);
        let queue = h.manual_queue();
        queue.enqueue(delta(1), None).unwrap();
        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert!(h.store.load_queue().unwrap().is_empty());
    }
}
