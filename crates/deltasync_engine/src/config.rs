//! Configuration for the sync engine components.

use crate::scheduler::Priority;
use deltasync_protocol::ConflictStrategy;
use std::time::Duration;

/// Configuration for the delta log.
#[derive(Debug, Clone)]
pub struct DeltaLogConfig {
    /// How long non-immediate changes are buffered before a flush.
    pub batch_delay: Duration,
    /// Age beyond which `prune` removes records.
    pub retention: Duration,
}

impl DeltaLogConfig {
    /// Sets the batch delay.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Sets the retention period.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

impl Default for DeltaLogConfig {
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(100),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Configuration for the update scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Flush delay for `Immediate` operations.
    pub immediate_delay: Duration,
    /// Flush delay for `High` operations.
    pub high_delay: Duration,
    /// Flush delay for `Normal` operations.
    pub normal_delay: Duration,
    /// Flush delay for `Low` operations.
    pub low_delay: Duration,
    /// Maximum operations taken per batch.
    pub max_batch_size: usize,
    /// Same-kind operations enqueued within this window are merged.
    pub merge_window: Duration,
    /// Delay before processing what is left after a batch.
    pub follow_up_delay: Duration,
    /// Retry budget for operations that don't set one.
    pub default_max_retries: u32,
}

impl SchedulerConfig {
    /// Returns the flush delay for a priority tier.
    pub fn delay_for(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Immediate => self.immediate_delay,
            Priority::High => self.high_delay,
            Priority::Normal => self.normal_delay,
            Priority::Low => self.low_delay,
        }
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Sets the merge window.
    pub fn with_merge_window(mut self, window: Duration) -> Self {
        self.merge_window = window;
        self
    }

    /// Sets the default retry budget.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            immediate_delay: Duration::ZERO,
            high_delay: Duration::from_millis(50),
            normal_delay: Duration::from_millis(200),
            low_delay: Duration::from_millis(1000),
            max_batch_size: 10,
            merge_window: Duration::from_millis(1000),
            follow_up_delay: Duration::from_millis(100),
            default_max_retries: 3,
        }
    }
}

/// Configuration for the offline delivery queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry budget for items that don't set one.
    pub default_max_retries: u32,
    /// Backoff between automatic drain passes.
    pub retry: RetryConfig,
    /// Whether failed items trigger a delayed drain pass on their own.
    pub auto_retry: bool,
}

impl QueueConfig {
    /// Sets the default retry budget.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables automatic retry passes.
    pub fn with_auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry: RetryConfig::default(),
            auto_retry: true,
        }
    }
}

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Strategy used when a cycle is started without one.
    pub conflict_strategy: ConflictStrategy,
    /// Maximum local deltas per push request.
    pub push_batch_size: usize,
    /// Retry budget for deltas handed to the offline queue.
    pub queue_max_retries: u32,
    /// Interval for automatic sync.
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::Auto,
            push_batch_size: 100,
            queue_max_retries: 3,
            sync_interval: None,
        }
    }

    /// Sets the default conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the retry budget for queued deltas.
    pub fn with_queue_max_retries(mut self, retries: u32) -> Self {
        self.queue_max_retries = retries;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
