//! Reset command implementation.
//!
//! Deleting a device's version state makes its next sync a full
//! reconciliation.

use super::{open_store, CliError, CliResult};
use deltasync_protocol::DeviceId;
use deltasync_storage::{FileStore, SyncStateStore};
use std::path::Path;
use tracing::info;

/// Runs the reset command.
pub fn run(path: &Path, device: Option<&str>) -> CliResult<()> {
    let device = device
        .map(|id| {
            id.parse::<DeviceId>()
                .map_err(|_| CliError::InvalidArgument(format!("invalid device id: {id}")))
        })
        .transpose()?;
    let store = open_store(path)?;
    let reset_devices = reset(&store, device)?;

    if reset_devices.is_empty() {
        println!("No version state to reset.");
    }
    for device_id in reset_devices {
        println!("Reset {device_id}; next sync will be a full reconciliation");
    }
    Ok(())
}

/// Clears the version state of one device, or of every device.
///
/// Returns the devices whose state was removed.
pub fn reset(store: &FileStore, device: Option<DeviceId>) -> CliResult<Vec<DeviceId>> {
    let known: Vec<DeviceId> = store
        .version_states()?
        .into_iter()
        .map(|state| state.device_id)
        .collect();
    let targets: Vec<DeviceId> = match device {
        Some(id) => known.into_iter().filter(|known| *known == id).collect(),
        None => known,
    };

    for device_id in &targets {
        store.clear_version_state(*device_id)?;
        info!(%device_id, "version state cleared");
    }
    Ok(targets)
}
