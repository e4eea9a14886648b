//! Conflicts command implementation.

use super::{format_age, open_store, print_json, CliResult};
use deltasync_protocol::{now_millis, ConflictInfo};
use deltasync_storage::{ConflictHistoryStore, FileStore};
use std::path::Path;

/// Runs the conflicts command.
pub fn run(path: &Path, unresolved_only: bool, format: &str) -> CliResult<()> {
    let store = open_store(path)?;
    let conflicts = load(&store, unresolved_only)?;

    match format {
        "json" => print_json(&conflicts)?,
        _ => print_text_output(&conflicts),
    }
    Ok(())
}

/// Returns the full history, or only conflicts still awaiting resolution.
pub fn load(store: &FileStore, unresolved_only: bool) -> CliResult<Vec<ConflictInfo>> {
    let conflicts = if unresolved_only {
        store.unresolved_conflicts()?
    } else {
        store.conflict_history()?
    };
    Ok(conflicts)
}

fn print_text_output(conflicts: &[ConflictInfo]) {
    if conflicts.is_empty() {
        println!("No conflicts.");
        return;
    }

    let now = now_millis();
    for conflict in conflicts {
        let state = match conflict.resolution {
            Some(resolution) => format!("resolved {resolution}"),
            None if conflict.resolved => "resolved".to_string(),
            None => "PENDING".to_string(),
        };
        println!(
            "{}  {}  {}  detected {}",
            conflict.id,
            conflict.entity_key(),
            state,
            format_age(conflict.detected_at, now)
        );
        println!(
            "    local  v{} {} fields {:?}",
            conflict.local_delta.version(),
            conflict.local_delta.operation().as_str(),
            conflict.local_delta.changes().field_names()
        );
        println!(
            "    remote v{} {} fields {:?}",
            conflict.remote_delta.version(),
            conflict.remote_delta.operation().as_str(),
            conflict.remote_delta.changes().field_names()
        );
    }
}
