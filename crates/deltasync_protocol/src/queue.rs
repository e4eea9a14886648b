//! Offline delivery queue items.

use crate::delta::{now_millis, DeltaRecord};
use crate::ids::QueueItemId;
use serde::{Deserialize, Serialize};

/// A delta waiting for delivery to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Queue item id.
    pub id: QueueItemId,
    /// The delta to deliver.
    pub delta: DeltaRecord,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before the item is dropped.
    pub max_retries: u32,
    /// Enqueue time in milliseconds.
    pub created_at: u64,
}

impl QueueItem {
    /// Creates a fresh item with zero retries.
    pub fn new(delta: DeltaRecord, max_retries: u32) -> Self {
        Self {
            id: QueueItemId::new(),
            delta,
            retry_count: 0,
            max_retries,
            created_at: now_millis(),
        }
    }

    /// Records a failed attempt.
    ///
    /// Returns false once the retry budget is spent; the item must then be
    /// removed from the queue.
    pub fn record_failure(&mut self) -> bool {
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{EntityChanges, OperationType};
    use crate::fields::EntityKind;
    use crate::ids::DeviceId;

    #[test]
    fn retry_budget_is_bounded() {
        let delta = DeltaRecord::new(
            1,
            DeviceId::new(),
            OperationType::Delete,
            "e1",
            EntityChanges::empty(EntityKind::Emoji),
        )
        .unwrap();
        let mut item = QueueItem::new(delta, 2);
        assert!(item.record_failure());
        assert!(item.record_failure());
        assert!(!item.record_failure());
        assert_eq!(item.retry_count, 2);
    }
}
