//! Inspect command implementation.

use super::{format_age, open_store, print_json, CliResult};
use deltasync_protocol::{now_millis, SyncVersionState};
use deltasync_storage::{
    ConflictHistoryStore, DeltaStore, FileStore, QueueStore, SyncStateStore,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Size of each store file in bytes.
    pub files: BTreeMap<String, u64>,
    /// Deltas in the local log.
    pub delta_count: usize,
    /// Highest local version.
    pub latest_version: u64,
    /// Timestamp of the oldest retained delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_delta: Option<u64>,
    /// Deltas per entity kind.
    pub deltas_by_kind: BTreeMap<String, usize>,
    /// Items waiting in the offline queue.
    pub queue_length: usize,
    /// Queued items that have failed at least once.
    pub queue_retrying: usize,
    /// Entries in the conflict history.
    pub conflict_entries: usize,
    /// Conflicts awaiting manual resolution.
    pub unresolved_conflicts: usize,
    /// Remote deltas recorded as applied.
    pub applied_ledger: usize,
    /// Watermarks per device.
    pub devices: Vec<SyncVersionState>,
    /// Why the watermarks could not be read; the next sync is a full one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_error: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let store = open_store(path)?;
    let result = inspect(&store)?;

    match format {
        "json" => print_json(&result)?,
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Collects statistics from an open store.
pub fn inspect(store: &FileStore) -> CliResult<InspectResult> {
    let deltas = store.query_ordered_since(0)?;
    let mut deltas_by_kind = BTreeMap::new();
    for delta in &deltas {
        *deltas_by_kind.entry(delta.kind().to_string()).or_insert(0) += 1;
    }

    let queue = store.load_queue()?;
    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(store.path())? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.insert(entry.file_name().to_string_lossy().into_owned(), metadata.len());
        }
    }

    let (devices, state_error) = match store.version_states() {
        Ok(devices) => (devices, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    Ok(InspectResult {
        path: store.path().display().to_string(),
        files,
        delta_count: deltas.len(),
        latest_version: store.latest_version()?,
        oldest_delta: deltas.iter().map(|d| d.timestamp()).min(),
        deltas_by_kind,
        queue_length: queue.len(),
        queue_retrying: queue.iter().filter(|item| item.retry_count > 0).count(),
        conflict_entries: store.conflict_history()?.len(),
        unresolved_conflicts: store.unresolved_conflicts()?.len(),
        applied_ledger: store.applied_count()?,
        devices,
        state_error,
    })
}

fn print_text_output(result: &InspectResult) {
    let now = now_millis();
    println!("DeltaSync Store Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Files:");
    for (name, size) in &result.files {
        println!("  {name:<14} {size} bytes");
    }
    println!();
    println!("Delta log:");
    println!("  Deltas:         {}", result.delta_count);
    println!("  Latest version: {}", result.latest_version);
    if let Some(oldest) = result.oldest_delta {
        println!("  Oldest delta:   {}", format_age(oldest, now));
    }
    for (kind, count) in &result.deltas_by_kind {
        println!("  {kind:<14} {count}");
    }
    println!();
    println!("Offline queue:");
    println!("  Items:    {}", result.queue_length);
    println!("  Retrying: {}", result.queue_retrying);
    println!();
    println!("Conflicts:");
    println!("  History entries: {}", result.conflict_entries);
    println!("  Unresolved:      {}", result.unresolved_conflicts);
    println!();
    println!("Applied remote deltas: {}", result.applied_ledger);

    if let Some(error) = &result.state_error {
        println!();
        println!("Version state: {error}");
    }

    if !result.devices.is_empty() {
        println!();
        println!("Devices:");
        for state in &result.devices {
            let last = if state.last_sync_time == 0 {
                "never".to_string()
            } else {
                format_age(state.last_sync_time, now)
            };
            println!(
                "  {} local={} remote={} pending={} synced {}",
                state.device_id,
                state.local_version,
                state.remote_version,
                state.pending_changes,
                last
            );
        }
    }
}
