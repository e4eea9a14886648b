//! Dump-log command implementation.

use super::{open_store, print_json, CliError, CliResult};
use deltasync_protocol::{DeltaRecord, EntityKind, FieldValue};
use deltasync_storage::{DeltaStore, FileStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Delta representation for output.
#[derive(Debug, Serialize)]
pub struct DeltaInfo {
    /// Local version.
    pub version: u64,
    /// Delta id.
    pub id: String,
    /// Authoring device.
    pub device_id: String,
    /// Creation time in milliseconds.
    pub timestamp: u64,
    /// Operation name.
    pub operation: String,
    /// Entity kind.
    pub kind: String,
    /// Entity id.
    pub entity_id: String,
    /// Final value per changed field; `None` clears the field.
    pub fields: BTreeMap<String, Option<FieldValue>>,
}

impl From<&DeltaRecord> for DeltaInfo {
    fn from(delta: &DeltaRecord) -> Self {
        Self {
            version: delta.version(),
            id: delta.id().to_string(),
            device_id: delta.device_id().to_string(),
            timestamp: delta.timestamp(),
            operation: delta.operation().as_str().to_string(),
            kind: delta.kind().to_string(),
            entity_id: delta.entity_id().to_string(),
            fields: delta.changes().final_values(),
        }
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    since: u64,
    limit: Option<usize>,
    kind: Option<&str>,
    format: &str,
) -> CliResult<()> {
    let kind = kind.map(parse_kind).transpose()?;
    let store = open_store(path)?;
    let records = read_deltas(&store, since, limit, kind)?;

    match format {
        "json" => print_json(&records)?,
        _ => print_text_output(&records),
    }
    Ok(())
}

/// Reads deltas newer than `since`, optionally of one kind.
pub fn read_deltas(
    store: &FileStore,
    since: u64,
    limit: Option<usize>,
    kind: Option<EntityKind>,
) -> CliResult<Vec<DeltaInfo>> {
    Ok(store
        .query_ordered_since(since)?
        .iter()
        .filter(|delta| kind.map_or(true, |k| delta.kind() == k))
        .take(limit.unwrap_or(usize::MAX))
        .map(DeltaInfo::from)
        .collect())
}

fn parse_kind(name: &str) -> CliResult<EntityKind> {
    [
        EntityKind::Emoji,
        EntityKind::Group,
        EntityKind::Settings,
        EntityKind::Favorites,
    ]
    .into_iter()
    .find(|kind| kind.as_str() == name)
    .ok_or_else(|| CliError::InvalidArgument(format!("unknown entity kind: {name}")))
}

fn print_text_output(records: &[DeltaInfo]) {
    if records.is_empty() {
        println!("No deltas.");
        return;
    }

    for record in records {
        println!(
            "v{:<6} {:<7} {}:{}  ({})",
            record.version, record.operation, record.kind, record.entity_id, record.device_id
        );
        for (field, value) in &record.fields {
            match value {
                Some(value) => println!("    {field} = {}", render(value)),
                None => println!("    {field} cleared"),
            }
        }
    }
    println!();
    println!("{} deltas", records.len());
}

fn render(value: &FieldValue) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}
