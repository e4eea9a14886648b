//! Priority-tiered coalescing scheduler for UI-driven updates.

use crate::busy::BusyGuard;
use crate::config::SchedulerConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use deltasync_protocol::FieldValue;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Urgency of an update. Higher tiers flush sooner and sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Flushed after the low-tier delay.
    Low,
    /// Flushed after the normal-tier delay.
    Normal,
    /// Flushed after the high-tier delay.
    High,
    /// Flushed right away.
    Immediate,
}

impl Priority {
    /// Returns the tier a failed operation is retried at.
    ///
    /// High drops to normal and normal to low; other tiers are kept.
    pub fn demoted(self) -> Self {
        match self {
            Priority::High => Priority::Normal,
            Priority::Normal => Priority::Low,
            other => other,
        }
    }
}

/// Kinds of coalescable UI update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdateKind {
    /// Most-used emoji list.
    CommonEmoji,
    /// Emoji order inside a group.
    EmojiOrder,
    /// Group icon.
    GroupIcon,
    /// Emojis without a group.
    UngroupedEmojis,
    /// Cache invalidation.
    CacheInvalidation,
}

impl UpdateKind {
    /// Returns the canonical kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::CommonEmoji => "common-emoji",
            UpdateKind::EmojiOrder => "emoji-order",
            UpdateKind::GroupIcon => "group-icon",
            UpdateKind::UngroupedEmojis => "ungrouped-emojis",
            UpdateKind::CacheInvalidation => "cache-invalidation",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a scheduled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to schedule an update.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Update kind.
    pub kind: UpdateKind,
    /// Payload handed to the handler.
    pub data: FieldValue,
    /// Priority tier.
    pub priority: Priority,
    /// Retry budget; the scheduler default applies when `None`.
    pub max_retries: Option<u32>,
}

impl UpdateRequest {
    /// Creates a normal-priority request.
    pub fn new(kind: UpdateKind, data: impl Into<FieldValue>) -> Self {
        Self {
            kind,
            data: data.into(),
            priority: Priority::Normal,
            max_retries: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// A queued operation as seen by handlers.
#[derive(Debug, Clone)]
pub struct UpdateOperation {
    /// Operation id.
    pub id: OperationId,
    /// Update kind.
    pub kind: UpdateKind,
    /// Current priority tier.
    pub priority: Priority,
    /// Payload, coalesced across merged requests.
    pub data: FieldValue,
    /// Time of the last enqueue or retry; anchors the merge window.
    pub timestamp: Instant,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before the operation is dropped.
    pub max_retries: u32,
}

impl UpdateOperation {
    /// Folds a newer request of the same kind into this operation.
    fn absorb(&mut self, request: UpdateRequest, now: Instant, default_retries: u32) {
        let data = std::mem::take(&mut self.data);
        self.data = data.coalesce(request.data);
        self.priority = self.priority.max(request.priority);
        self.max_retries = self
            .max_retries
            .max(request.max_retries.unwrap_or(default_retries));
        self.timestamp = now;
    }
}

/// Final state reported to completion listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The handler succeeded.
    Completed,
    /// The retry budget was spent.
    Failed {
        /// Last handler error.
        error: String,
    },
}

/// Processes one kind of update.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Handles one operation.
    async fn handle(&self, operation: &UpdateOperation) -> SyncResult<()>;
}

/// Result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Operations handled successfully.
    pub succeeded: usize,
    /// Operations that failed and were requeued.
    pub retried: usize,
    /// Operations dropped after spending their retry budget.
    pub dropped: Vec<OperationId>,
    /// True if another batch was already running and nothing was done.
    pub skipped: bool,
}

/// Snapshot of the scheduler queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// Queued operations.
    pub queue_length: usize,
    /// Whether a batch is running.
    pub processing: bool,
    /// Queued operations per priority.
    pub by_priority: BTreeMap<Priority, usize>,
    /// Queued operations per kind.
    pub by_kind: BTreeMap<UpdateKind, usize>,
}

/// Coalesces bursts of UI updates into prioritized batches.
///
/// Requests of the same kind that arrive within the merge window are
/// folded into one operation. Each priority tier has its own flush timer,
/// restarted by every enqueue into that tier. Only one batch runs at a
/// time; operations left over after a batch are picked up by a follow-up
/// flush.
///
/// Cloning is cheap and clones share the same queue.
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    queue: Mutex<Vec<UpdateOperation>>,
    completions: Mutex<HashMap<OperationId, Vec<oneshot::Sender<OperationOutcome>>>>,
    handlers: RwLock<HashMap<UpdateKind, Arc<dyn UpdateHandler>>>,
    timers: Mutex<HashMap<Priority, CancellationToken>>,
    processing: AtomicBool,
    shutdown: CancellationToken,
}

impl UpdateScheduler {
    /// Creates a scheduler with no handlers.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                queue: Mutex::new(Vec::new()),
                completions: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                processing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers the handler for a kind, replacing any previous one.
    pub fn register_handler(&self, kind: UpdateKind, handler: Arc<dyn UpdateHandler>) {
        self.inner.handlers.write().insert(kind, handler);
    }

    /// Enqueues a request and returns the id of the operation carrying it.
    ///
    /// If an operation of the same kind was enqueued within the merge
    /// window the request is folded into it and that operation's id is
    /// returned.
    pub fn enqueue(&self, request: UpdateRequest) -> OperationId {
        self.inner.enqueue(request, None)
    }

    /// Enqueues a request and returns a receiver for its final outcome.
    pub fn enqueue_with_completion(
        &self,
        request: UpdateRequest,
    ) -> (OperationId, oneshot::Receiver<OperationOutcome>) {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.enqueue(request, Some(tx));
        (id, rx)
    }

    /// Runs one batch now.
    pub async fn flush(&self) -> BatchReport {
        self.inner.process_batch().await
    }

    /// Bypasses the queue and runs the handler right away.
    ///
    /// # Errors
    ///
    /// Returns the handler error, or `HandlerMissing`.
    pub async fn process_immediate(&self, request: UpdateRequest) -> SyncResult<()> {
        let operation = UpdateOperation {
            id: OperationId::new(),
            kind: request.kind,
            priority: Priority::Immediate,
            data: request.data,
            timestamp: Instant::now(),
            retry_count: 0,
            max_retries: 0,
        };
        let handler = self.inner.handler_for(operation.kind)?;
        handler.handle(&operation).await
    }

    /// Returns a copy of the queued operations, in processing order.
    pub fn pending(&self) -> Vec<UpdateOperation> {
        self.inner.queue.lock().clone()
    }

    /// Returns a snapshot of the queue.
    pub fn status(&self) -> SchedulerStatus {
        let queue = self.inner.queue.lock();
        let mut status = SchedulerStatus {
            queue_length: queue.len(),
            processing: self.inner.processing.load(Ordering::SeqCst),
            ..SchedulerStatus::default()
        };
        for operation in queue.iter() {
            *status.by_priority.entry(operation.priority).or_default() += 1;
            *status.by_kind.entry(operation.kind).or_default() += 1;
        }
        status
    }

    /// Drops every queued operation and cancels pending timers.
    ///
    /// Completion receivers of dropped operations observe a closed channel.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.inner.queue.lock());
        let mut completions = self.inner.completions.lock();
        for operation in &dropped {
            completions.remove(&operation.id);
        }
        drop(completions);
        for (_, token) in self.inner.timers.lock().drain() {
            token.cancel();
        }
        debug!(dropped = dropped.len(), "scheduler queue cleared");
    }

    /// Stops all timers. Queued operations stay queued.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl SchedulerInner {
    fn enqueue(
        self: &Arc<Self>,
        request: UpdateRequest,
        completion: Option<oneshot::Sender<OperationOutcome>>,
    ) -> OperationId {
        let now = Instant::now();
        let mut queue = self.queue.lock();

        let mergeable = queue.iter().position(|op| {
            op.kind == request.kind
                && now.saturating_duration_since(op.timestamp) < self.config.merge_window
        });

        let (id, priority) = match mergeable {
            Some(index) => {
                let mut operation = queue.remove(index);
                operation.absorb(request, now, self.config.default_max_retries);
                let id = operation.id;
                let priority = operation.priority;
                debug!(%id, kind = %operation.kind, "merged update into queued operation");
                insert_by_priority(&mut queue, operation);
                (id, priority)
            }
            None => {
                let operation = UpdateOperation {
                    id: OperationId::new(),
                    kind: request.kind,
                    priority: request.priority,
                    data: request.data,
                    timestamp: now,
                    retry_count: 0,
                    max_retries: request
                        .max_retries
                        .unwrap_or(self.config.default_max_retries),
                };
                let id = operation.id;
                let priority = operation.priority;
                insert_by_priority(&mut queue, operation);
                (id, priority)
            }
        };
        if let Some(tx) = completion {
            self.completions.lock().entry(id).or_default().push(tx);
        }
        drop(queue);

        self.schedule_tier(priority);
        id
    }

    /// Restarts the flush timer of one tier.
    fn schedule_tier(self: &Arc<Self>, priority: Priority) {
        let delay = self.config.delay_for(priority);
        self.schedule_flush(Some(priority), delay);
    }

    fn schedule_flush(self: &Arc<Self>, tier: Option<Priority>, delay: std::time::Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime; scheduler flush must be triggered manually");
            return;
        };

        let token = self.shutdown.child_token();
        if let Some(tier) = tier {
            if let Some(previous) = self.timers.lock().insert(tier, token.clone()) {
                previous.cancel();
            }
        }

        let inner = Arc::clone(self);
        handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }
            // A superseded timer never starts a batch; a running batch is
            // never interrupted.
            if token.is_cancelled() {
                return;
            }
            inner.process_batch().await;
        });
    }

    fn handler_for(&self, kind: UpdateKind) -> SyncResult<Arc<dyn UpdateHandler>> {
        self.handlers
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| SyncError::HandlerMissing(kind.to_string()))
    }

    async fn process_batch(self: &Arc<Self>) -> BatchReport {
        let Some(busy) = BusyGuard::try_acquire(&self.processing) else {
            debug!("batch already running");
            return BatchReport {
                skipped: true,
                ..BatchReport::default()
            };
        };

        let drained: Vec<UpdateOperation> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(self.config.max_batch_size);
            queue.drain(..take).collect()
        };
        let mut batch = UnfinishedBatch {
            inner: self,
            operations: group_by_kind(drained)
                .into_iter()
                .flat_map(|(_, operations)| operations)
                .collect(),
        };

        let mut report = BatchReport::default();
        while let Some(operation) = batch.operations.front() {
            let result = match self.handler_for(operation.kind) {
                Ok(handler) => handler.handle(operation).await,
                Err(e) => Err(e),
            };
            let Some(operation) = batch.operations.pop_front() else {
                break;
            };
            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    self.complete(operation.id, OperationOutcome::Completed);
                }
                Err(e) => self.retry_or_drop(operation, e, &mut report),
            }
        }
        drop(batch);
        drop(busy);

        if !self.queue.lock().is_empty() {
            self.schedule_flush(None, self.config.follow_up_delay);
        }
        report
    }

    fn retry_or_drop(&self, mut operation: UpdateOperation, error: SyncError, report: &mut BatchReport) {
        if operation.retry_count < operation.max_retries {
            operation.retry_count += 1;
            operation.priority = operation.priority.demoted();
            operation.timestamp = Instant::now();
            warn!(
                id = %operation.id,
                kind = %operation.kind,
                retry = operation.retry_count,
                error = %error,
                "update failed; requeued"
            );
            report.retried += 1;
            insert_by_priority(&mut self.queue.lock(), operation);
        } else {
            error!(
                id = %operation.id,
                kind = %operation.kind,
                error = %error,
                "update dropped after exhausting retries"
            );
            report.dropped.push(operation.id);
            self.complete(
                operation.id,
                OperationOutcome::Failed {
                    error: error.to_string(),
                },
            );
        }
    }

    fn complete(&self, id: OperationId, outcome: OperationOutcome) {
        if let Some(senders) = self.completions.lock().remove(&id) {
            for sender in senders {
                let _ = sender.send(outcome.clone());
            }
        }
    }
}

/// Operations taken from the queue whose handler has not finished.
///
/// Dropping the batch future mid-await puts them back at the front of
/// their tiers, with their completion senders still registered.
struct UnfinishedBatch<'a> {
    inner: &'a Arc<SchedulerInner>,
    operations: VecDeque<UpdateOperation>,
}

impl Drop for UnfinishedBatch<'_> {
    fn drop(&mut self) {
        if self.operations.is_empty() {
            return;
        }
        warn!(
            count = self.operations.len(),
            "batch interrupted; requeueing unfinished updates"
        );
        {
            let mut queue = self.inner.queue.lock();
            while let Some(operation) = self.operations.pop_back() {
                let index = queue
                    .iter()
                    .position(|op| op.priority <= operation.priority)
                    .unwrap_or(queue.len());
                queue.insert(index, operation);
            }
        }
        self.inner.schedule_flush(None, self.inner.config.follow_up_delay);
    }
}

/// Inserts before the first operation with strictly lower priority, so
/// equal priorities stay FIFO.
fn insert_by_priority(queue: &mut Vec<UpdateOperation>, operation: UpdateOperation) {
    let index = queue
        .iter()
        .position(|op| op.priority < operation.priority)
        .unwrap_or(queue.len());
    queue.insert(index, operation);
}

/// Groups by kind, keeping the first-seen order of kinds and operations.
fn group_by_kind(batch: Vec<UpdateOperation>) -> Vec<(UpdateKind, Vec<UpdateOperation>)> {
    let mut groups: Vec<(UpdateKind, Vec<UpdateOperation>)> = Vec::new();
    for operation in batch {
        match groups.iter_mut().find(|(kind, _)| *kind == operation.kind) {
            Some((_, ops)) => ops.push(operation),
            None => groups.push((operation.kind, vec![operation])),
        }
    }
    groups
}

impl fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
