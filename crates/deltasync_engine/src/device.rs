//! Device identity providers.

use crate::error::SyncResult;
use deltasync_protocol::DeviceId;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Supplies the stable id of this device.
pub trait DeviceIdentity: Send + Sync {
    /// Returns the device id. Must return the same value for the life of
    /// the installation.
    fn device_id(&self) -> DeviceId;
}

/// A fixed device id, for tests and embedders that manage ids themselves.
#[derive(Debug, Clone, Copy)]
pub struct StaticDeviceIdentity(DeviceId);

impl StaticDeviceIdentity {
    /// Wraps an existing id.
    pub fn new(device_id: DeviceId) -> Self {
        Self(device_id)
    }

    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(DeviceId::new())
    }
}

impl DeviceIdentity for StaticDeviceIdentity {
    fn device_id(&self) -> DeviceId {
        self.0
    }
}

/// A device id persisted as text in a file.
#[derive(Debug, Clone)]
pub struct FileDeviceIdentity {
    path: PathBuf,
    device_id: DeviceId,
}

impl FileDeviceIdentity {
    /// Loads the id from `path`, creating and persisting a new one if the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written, or holds
    /// something other than a device id.
    pub fn load_or_create(path: &Path) -> SyncResult<Self> {
        let device_id = match fs::read_to_string(path) {
            Ok(text) => text.parse()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let device_id = DeviceId::new();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, device_id.to_string())?;
                info!(%device_id, path = %path.display(), "created device id");
                device_id
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            device_id,
        })
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceIdentity for FileDeviceIdentity {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }
}
