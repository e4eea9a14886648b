//! Queue command implementation.

use super::{format_age, open_store, print_json, CliResult};
use deltasync_protocol::{now_millis, QueueItem};
use deltasync_storage::{FileStore, QueueStore};
use serde::Serialize;
use std::path::Path;
use tracing::warn;

/// Offline queue item representation for output.
#[derive(Debug, Serialize)]
pub struct QueueItemInfo {
    /// Queue item id.
    pub id: String,
    /// Version of the queued delta.
    pub version: u64,
    /// Operation name.
    pub operation: String,
    /// `kind:entity_id` of the queued delta.
    pub entity: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before the item is dropped.
    pub max_retries: u32,
    /// Enqueue time in milliseconds.
    pub created_at: u64,
}

impl From<&QueueItem> for QueueItemInfo {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.id.to_string(),
            version: item.delta.version(),
            operation: item.delta.operation().as_str().to_string(),
            entity: item.delta.entity_key().to_string(),
            retry_count: item.retry_count,
            max_retries: item.max_retries,
            created_at: item.created_at,
        }
    }
}

/// Runs the queue command.
pub fn run(path: &Path, clear: bool, format: &str) -> CliResult<()> {
    let store = open_store(path)?;

    if clear {
        let removed = clear_queue(&store)?;
        println!("Removed {removed} queued deltas");
        return Ok(());
    }

    let items = list(&store)?;
    match format {
        "json" => print_json(&items)?,
        _ => print_text_output(&items),
    }
    Ok(())
}

/// Lists queued items in delivery order.
pub fn list(store: &FileStore) -> CliResult<Vec<QueueItemInfo>> {
    Ok(store.load_queue()?.iter().map(QueueItemInfo::from).collect())
}

/// Drops every queued item. Returns how many were removed.
pub fn clear_queue(store: &FileStore) -> CliResult<usize> {
    let count = store.load_queue()?.len();
    store.clear_queue()?;
    if count > 0 {
        warn!(count, "offline queue cleared; undelivered deltas discarded");
    }
    Ok(count)
}

fn print_text_output(items: &[QueueItemInfo]) {
    if items.is_empty() {
        println!("Offline queue is empty.");
        return;
    }

    let now = now_millis();
    for item in items {
        println!(
            "{}  v{:<6} {:<7} {}  retries {}/{}  queued {}",
            item.id,
            item.version,
            item.operation,
            item.entity,
            item.retry_count,
            item.max_retries,
            format_age(item.created_at, now)
        );
    }
}
