//! Sync cycle state machine.

use crate::busy::BusyGuard;
use crate::config::SyncConfig;
use crate::delta_log::DeltaLog;
use crate::entity_store::EntityStore;
use crate::error::{SyncError, SyncResult};
use crate::offline_queue::OfflineDeliveryQueue;
use crate::plan::ResolutionPlan;
use crate::remote::RemoteProvider;
use crate::resolver::ConflictResolver;
use deltasync_protocol::{
    now_millis, ConflictInfo, ConflictStrategy, DeltaId, DeltaRecord, DeviceId, SyncVersionState,
};
use deltasync_storage::SyncStateStore;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The orchestrator's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No cycle is running and the last one succeeded (or none ran).
    Idle,
    /// A cycle is running.
    Syncing,
    /// The last cycle stopped on conflicts left for manual resolution.
    Conflict,
    /// The last cycle failed.
    Error,
}

impl SyncStatus {
    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the current or last cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    /// Current state.
    pub status: SyncStatus,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    /// Human-readable step description.
    pub message: String,
}

impl SyncProgress {
    fn idle() -> Self {
        Self {
            status: SyncStatus::Idle,
            progress: 0,
            message: String::new(),
        }
    }
}

/// Options for one cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Reconcile from snapshots instead of deltas.
    pub full_sync: bool,
    /// Overrides the configured conflict strategy.
    pub strategy: Option<ConflictStrategy>,
    /// Conflicts already resolved by hand, matched by entity.
    pub resolutions: Vec<ConflictInfo>,
}

impl SyncOptions {
    /// Options for a default incremental cycle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces a full reconciliation.
    pub fn full() -> Self {
        Self {
            full_sync: true,
            ..Self::default()
        }
    }

    /// Overrides the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Supplies manual resolutions for conflicts reported by an earlier cycle.
    pub fn with_resolutions(mut self, resolutions: Vec<ConflictInfo>) -> Self {
        self.resolutions = resolutions;
        self
    }
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Whether the cycle reconciled from snapshots.
    pub full_sync: bool,
    /// Remote deltas fetched (entities, for a full sync).
    pub pulled: usize,
    /// Remote deltas skipped as own or already applied.
    pub skipped: usize,
    /// Deltas applied to the entity store.
    pub applied: usize,
    /// Deltas that failed to apply and were skipped.
    pub apply_failures: usize,
    /// Local deltas accepted by the remote.
    pub pushed: usize,
    /// Local deltas handed to the offline queue.
    pub queued: usize,
    /// Conflicts settled during the cycle.
    pub resolved: Vec<ConflictInfo>,
    /// Committed local watermark.
    pub local_version: u64,
    /// Committed remote watermark.
    pub remote_version: u64,
    /// Wall time of the cycle.
    pub duration: Duration,
}

/// How a cycle ended.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The cycle committed new watermarks.
    Completed(SyncReport),
    /// The cycle stopped on conflicts that need a manual decision.
    /// Nothing was applied or pushed.
    Conflicts(Vec<ConflictInfo>),
}

impl SyncOutcome {
    /// Returns the report of a completed cycle.
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Conflicts(_) => None,
        }
    }

    /// Returns the conflicts of a halted cycle.
    pub fn conflicts(&self) -> &[ConflictInfo] {
        match self {
            SyncOutcome::Completed(_) => &[],
            SyncOutcome::Conflicts(conflicts) => conflicts,
        }
    }
}

/// Counters across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Cycles that committed.
    pub cycles_completed: u64,
    /// Cycles that reconciled from snapshots.
    pub full_syncs: u64,
    /// Cycles that failed.
    pub cycles_failed: u64,
    /// Remote deltas applied.
    pub deltas_applied: u64,
    /// Local deltas pushed.
    pub deltas_pushed: u64,
    /// Local deltas handed to the offline queue.
    pub deltas_queued: u64,
    /// Conflicts settled.
    pub conflicts_resolved: u64,
    /// Conflicts left for manual resolution.
    pub conflicts_halted: u64,
    /// Completion time of the last committed cycle, in milliseconds.
    pub last_sync_time: Option<u64>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

/// Runs sync cycles between the local entity store and a remote.
///
/// At most one cycle runs at a time; a second caller gets
/// [`SyncError::SyncInProgress`] immediately. A failed cycle leaves the
/// stored watermarks untouched so the next cycle starts from the last good
/// point.
///
/// Cloning is cheap and clones share the same state.
pub struct SyncOrchestrator<R: RemoteProvider + 'static, E: EntityStore + 'static> {
    inner: Arc<OrchestratorInner<R, E>>,
}

struct OrchestratorInner<R: RemoteProvider + 'static, E: EntityStore + 'static> {
    config: SyncConfig,
    delta_log: DeltaLog,
    remote: Arc<R>,
    entities: Arc<E>,
    states: Arc<dyn SyncStateStore>,
    resolver: ConflictResolver,
    queue: OfflineDeliveryQueue<R>,
    busy: AtomicBool,
    status: RwLock<SyncStatus>,
    progress: watch::Sender<SyncProgress>,
    stats: RwLock<SyncStats>,
}

impl<R: RemoteProvider + 'static, E: EntityStore + 'static> Clone for SyncOrchestrator<R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteProvider + 'static, E: EntityStore + 'static> SyncOrchestrator<R, E> {
    /// Creates an orchestrator.
    pub fn new(
        config: SyncConfig,
        delta_log: DeltaLog,
        remote: Arc<R>,
        entities: Arc<E>,
        states: Arc<dyn SyncStateStore>,
        resolver: ConflictResolver,
        queue: OfflineDeliveryQueue<R>,
    ) -> Self {
        if let Ok(Some(state)) = states.load_version_state(delta_log.device_id()) {
            delta_log.advance_to(state.local_version);
        }
        let (progress, _) = watch::channel(SyncProgress::idle());
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                delta_log,
                remote,
                entities,
                states,
                resolver,
                queue,
                busy: AtomicBool::new(false),
                status: RwLock::new(SyncStatus::Idle),
                progress,
                stats: RwLock::new(SyncStats::default()),
            }),
        }
    }

    /// Runs one cycle.
    ///
    /// # Errors
    ///
    /// Returns `SyncInProgress` if a cycle is already running, or the error
    /// that aborted the cycle. Conflicts under the manual strategy are not
    /// an error; they come back as [`SyncOutcome::Conflicts`].
    pub async fn sync(&self, options: SyncOptions) -> SyncResult<SyncOutcome> {
        let Some(_busy) = BusyGuard::try_acquire(&self.inner.busy) else {
            debug!("sync requested while another cycle is running");
            return Err(SyncError::SyncInProgress);
        };

        *self.inner.status.write() = SyncStatus::Syncing;
        let result = self.inner.run_cycle(options).await;
        self.inner.finish(&result);
        result
    }

    /// Returns the current state.
    pub fn status(&self) -> SyncStatus {
        *self.inner.status.read()
    }

    /// Returns true while a cycle runs.
    pub fn is_syncing(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Returns the latest progress.
    pub fn progress(&self) -> SyncProgress {
        self.inner.progress.borrow().clone()
    }

    /// Subscribes to progress updates.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    /// Returns counters across cycles.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Returns the delta log.
    pub fn delta_log(&self) -> &DeltaLog {
        &self.inner.delta_log
    }

    /// Returns the offline queue.
    pub fn queue(&self) -> &OfflineDeliveryQueue<R> {
        &self.inner.queue
    }

    /// Returns the conflict resolver.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.inner.resolver
    }

    /// Spawns a task that syncs every `interval` until `token` is cancelled.
    ///
    /// Must be called within a tokio runtime. Failed and skipped cycles are
    /// logged; the task keeps running.
    pub fn spawn_periodic(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match orchestrator.sync(SyncOptions::new()).await {
                            Ok(_) => {}
                            Err(SyncError::SyncInProgress) => debug!("periodic sync skipped"),
                            Err(e) => warn!(error = %e, "periodic sync failed"),
                        }
                    }
                }
            }
            debug!("periodic sync stopped");
        })
    }

    /// Spawns periodic sync at the configured interval, if one is set.
    pub fn spawn_auto_sync(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        self.inner
            .config
            .sync_interval
            .map(|interval| self.spawn_periodic(interval, token))
    }
}

impl<R: RemoteProvider + 'static, E: EntityStore + 'static> OrchestratorInner<R, E> {
    fn publish(&self, progress: u8, message: impl Into<String>) {
        let message = message.into();
        debug!(progress, %message, "sync progress");
        self.progress.send_replace(SyncProgress {
            status: SyncStatus::Syncing,
            progress,
            message,
        });
    }

    fn finish(&self, result: &SyncResult<SyncOutcome>) {
        let (status, message) = match result {
            Ok(SyncOutcome::Completed(report)) => {
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.full_syncs += u64::from(report.full_sync);
                stats.deltas_applied += report.applied as u64;
                stats.deltas_pushed += report.pushed as u64;
                stats.deltas_queued += report.queued as u64;
                stats.conflicts_resolved += report.resolved.len() as u64;
                stats.last_sync_time = Some(now_millis());
                stats.last_error = None;
                info!(
                    full_sync = report.full_sync,
                    applied = report.applied,
                    pushed = report.pushed,
                    queued = report.queued,
                    conflicts = report.resolved.len(),
                    local_version = report.local_version,
                    remote_version = report.remote_version,
                    duration_ms = report.duration.as_millis() as u64,
                    "sync completed"
                );
                (SyncStatus::Idle, "sync complete".to_string())
            }
            Ok(SyncOutcome::Conflicts(conflicts)) => {
                self.stats.write().conflicts_halted += conflicts.len() as u64;
                warn!(count = conflicts.len(), "sync halted on conflicts");
                (
                    SyncStatus::Conflict,
                    format!("{} conflicts need resolution", conflicts.len()),
                )
            }
            Err(e) => {
                let mut stats = self.stats.write();
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                error!(error = %e, "sync failed");
                (SyncStatus::Error, e.to_string())
            }
        };

        *self.status.write() = status;
        self.progress.send_replace(SyncProgress {
            status,
            progress: 100,
            message,
        });
    }

    async fn run_cycle(&self, options: SyncOptions) -> SyncResult<SyncOutcome> {
        let started = Instant::now();
        let device_id = self.delta_log.device_id();
        self.publish(10, "loading sync state");

        let state = match self.states.load_version_state(device_id) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "version state unreadable; forcing full sync");
                None
            }
        };
        if let Some(state) = &state {
            self.delta_log.advance_to(state.local_version);
        }

        let full = options.full_sync
            || self.delta_log.needs_full_resync()
            || state.as_ref().map_or(true, SyncVersionState::requires_full_sync);

        match state {
            Some(state) if !full => self.incremental(state, &options, started).await,
            state => {
                let report = self.full_reconcile(device_id, state, started).await?;
                Ok(SyncOutcome::Completed(report))
            }
        }
    }

    async fn incremental(
        &self,
        state: SyncVersionState,
        options: &SyncOptions,
        started: Instant,
    ) -> SyncResult<SyncOutcome> {
        let device_id = state.device_id;
        self.publish(20, "fetching changes");

        let remote_version = self.remote.remote_version().await?;
        let local = self.delta_log.get_since(state.local_version)?;
        let fetched = self.remote.deltas_since(state.remote_version).await?;

        let pulled = fetched.len();
        let mut incoming = Vec::with_capacity(pulled);
        let mut skipped = 0;
        for delta in fetched {
            if delta.device_id() == device_id || self.states.is_applied(delta.id())? {
                skipped += 1;
            } else {
                incoming.push(delta);
            }
        }
        debug!(
            local = local.len(),
            incoming = incoming.len(),
            skipped,
            "changes fetched"
        );

        self.publish(40, "detecting conflicts");
        let strategy = options.strategy.unwrap_or(self.config.conflict_strategy);
        let conflicts = self.resolver.detect_conflicts(&local, &incoming);
        let resolved = if conflicts.is_empty() {
            Vec::new()
        } else if strategy.auto_resolves() {
            self.resolver.auto_resolve(&conflicts, strategy)?
        } else {
            let (settled, pending) = match_resolutions(conflicts, &options.resolutions);
            if !pending.is_empty() {
                self.resolver.record_unresolved(&pending)?;
                return Ok(SyncOutcome::Conflicts(pending));
            }
            settled
        };
        let plan = ResolutionPlan::new(&resolved, &local, &incoming);

        self.publish(60, "applying remote changes");
        let mut ledger: Vec<DeltaId> = Vec::with_capacity(incoming.len());
        let mut to_apply = Vec::with_capacity(incoming.len());
        for delta in &incoming {
            match plan.incoming(delta) {
                Some(kept) => to_apply.push(kept),
                None => ledger.push(delta.id()),
            }
        }
        let (applied, apply_failures) = self.apply_batch(&to_apply, &mut ledger)?;
        if !ledger.is_empty() {
            self.states.mark_applied(&ledger)?;
        }

        self.publish(80, "pushing local changes");
        let outgoing: Vec<DeltaRecord> = local.iter().filter_map(|d| plan.outgoing(d)).collect();
        let (pushed, queued) = self.push(&outgoing).await?;

        self.publish(90, "committing");
        let local_version = local
            .last()
            .map_or(state.local_version, |d| d.version().max(state.local_version));
        self.commit(device_id, local_version, remote_version)?;

        Ok(SyncOutcome::Completed(SyncReport {
            full_sync: false,
            pulled,
            skipped,
            applied,
            apply_failures,
            pushed,
            queued,
            resolved,
            local_version,
            remote_version,
            duration: started.elapsed(),
        }))
    }

    /// Replaces local state with the remote snapshot and replays local
    /// changes the remote has not seen on top. Without a remote snapshot
    /// the local state is uploaded instead.
    async fn full_reconcile(
        &self,
        device_id: DeviceId,
        state: Option<SyncVersionState>,
        started: Instant,
    ) -> SyncResult<SyncReport> {
        info!(%device_id, "starting full reconciliation");
        self.publish(20, "full reconciliation");

        let remote_version = self.remote.remote_version().await?;
        let since = match &state {
            Some(state) if !self.delta_log.needs_full_resync() => state.local_version,
            _ => 0,
        };
        let local = self.delta_log.get_since(since)?;

        let mut report = SyncReport {
            full_sync: true,
            ..SyncReport::default()
        };

        match self.remote.pull_snapshot().await? {
            Some(snapshot) => {
                self.publish(50, "replacing local state");
                report.pulled = snapshot.len();
                self.entities.begin_batch();
                if let Err(e) = self.entities.replace_all(snapshot) {
                    self.entities.end_batch()?;
                    return Err(e);
                }
                for delta in &local {
                    match self.entities.apply(delta) {
                        Ok(()) => report.applied += 1,
                        Err(e) => {
                            report.apply_failures += 1;
                            warn!(
                                delta_id = %delta.id(),
                                entity = %delta.entity_key(),
                                error = %e,
                                "failed to replay local delta"
                            );
                        }
                    }
                }
                self.entities.end_batch()?;
            }
            None => {
                self.publish(50, "uploading local state");
                let snapshot = self.entities.snapshot()?;
                self.remote.push_snapshot(&snapshot).await?;
                info!(entities = snapshot.len(), "uploaded local snapshot");
            }
        }

        self.publish(80, "pushing local changes");
        let (pushed, queued) = self.push(&local).await?;
        report.pushed = pushed;
        report.queued = queued;

        self.publish(90, "committing");
        let local_version = local.last().map_or(since, |d| d.version().max(since));
        self.commit(device_id, local_version, remote_version)?;
        self.delta_log.clear_full_resync();

        report.local_version = local_version;
        report.remote_version = remote_version;
        report.duration = started.elapsed();
        Ok(report)
    }

    /// Applies deltas inside one batch, skipping failures.
    fn apply_batch(
        &self,
        deltas: &[DeltaRecord],
        ledger: &mut Vec<DeltaId>,
    ) -> SyncResult<(usize, usize)> {
        if deltas.is_empty() {
            return Ok((0, 0));
        }

        let mut applied = Vec::with_capacity(deltas.len());
        let mut failed = 0;
        self.entities.begin_batch();
        for delta in deltas {
            match self.entities.apply(delta) {
                Ok(()) => applied.push(delta.id()),
                Err(e) => {
                    failed += 1;
                    warn!(
                        delta_id = %delta.id(),
                        entity = %delta.entity_key(),
                        error = %e,
                        "failed to apply remote delta; skipping"
                    );
                }
            }
        }
        self.entities.end_batch()?;

        let count = applied.len();
        ledger.extend(applied);
        Ok((count, failed))
    }

    /// Pushes in batches. The first failed batch and everything after it go
    /// to the offline queue.
    async fn push(&self, deltas: &[DeltaRecord]) -> SyncResult<(usize, usize)> {
        let mut pushed = 0;
        for chunk in deltas.chunks(self.config.push_batch_size.max(1)) {
            if let Err(e) = self.remote.push_deltas(chunk).await {
                let undelivered = &deltas[pushed..];
                warn!(
                    error = %e,
                    undelivered = undelivered.len(),
                    "push failed; handing deltas to offline queue"
                );
                let queued = self
                    .queue
                    .enqueue_all(undelivered, Some(self.config.queue_max_retries))?;
                return Ok((pushed, queued));
            }
            pushed += chunk.len();
        }
        Ok((pushed, 0))
    }

    fn commit(&self, device_id: DeviceId, local_version: u64, remote_version: u64) -> SyncResult<()> {
        let state = SyncVersionState {
            local_version,
            remote_version,
            last_sync_time: now_millis(),
            device_id,
            pending_changes: self.queue.len() as u64,
        };
        self.states.save_version_state(&state)?;
        debug!(local_version, remote_version, "version state committed");
        Ok(())
    }
}

/// Splits detected conflicts into those with a manual resolution for the
/// same entity and those still pending.
fn match_resolutions(
    conflicts: Vec<ConflictInfo>,
    resolutions: &[ConflictInfo],
) -> (Vec<ConflictInfo>, Vec<ConflictInfo>) {
    let mut settled = Vec::new();
    let mut pending = Vec::new();
    for conflict in conflicts {
        let key = conflict.entity_key();
        match resolutions
            .iter()
            .find(|r| r.resolved && r.entity_key() == key)
        {
            Some(resolution) => settled.push(resolution.clone()),
            None => pending.push(conflict),
        }
    }
    (settled, pending)
}

impl<R: RemoteProvider + 'static, E: EntityStore + 'static> fmt::Debug for SyncOrchestrator<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("status", &self.status())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
