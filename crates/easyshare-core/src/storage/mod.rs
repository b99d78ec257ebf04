//! Storage facade consumed by the engine.
//!
//! The core never persists anything itself; settings, paired devices and
//! transfer history live behind the [`Storage`] trait, implemented by the
//! host (platform keychains, databases, plain files). [`MemoryStorage`]
//! is the in-process implementation used by tests and as a default.
//!
//! Storage is only touched between frame dispatches, so implementations
//! need interior mutability but no async.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::device::{PairedDevice, Transfer};
use crate::HISTORY_CAP;

/// Persisted application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// Display name advertised on the network
    pub device_name: String,
    /// Stable device id, generated on first run
    pub device_id: String,
    /// Whether files from paired devices are accepted without a prompt
    pub auto_accept_from_paired: bool,
    /// Directory received files are saved into
    pub save_directory: PathBuf,
    /// Whether the host shows notifications
    pub notifications_enabled: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        let device_name = hostname::get().map_or_else(
            |_| "EasyShare Device".to_string(),
            |h| h.to_string_lossy().to_string(),
        );

        let save_directory = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir);

        Self {
            device_name,
            device_id: crate::crypto::generate_device_id(),
            auto_accept_from_paired: true,
            save_directory,
            notifications_enabled: true,
        }
    }
}

/// A partial settings update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettingsPatch {
    /// New display name
    pub device_name: Option<String>,
    /// New auto-accept policy
    pub auto_accept_from_paired: Option<bool>,
    /// New save directory
    pub save_directory: Option<PathBuf>,
    /// New notification preference
    pub notifications_enabled: Option<bool>,
}

/// The storage contract the engine consumes.
pub trait Storage: Send + Sync {
    /// Current settings.
    fn get_settings(&self) -> AppSettings;

    /// Apply a partial update and return the merged settings.
    fn update_settings(&self, patch: AppSettingsPatch) -> AppSettings;

    /// All paired devices.
    fn get_paired_devices(&self) -> Vec<PairedDevice>;

    /// Insert or overwrite a paired device (uniqueness by device id).
    fn add_paired_device(&self, device: PairedDevice);

    /// Remove a paired device by id.
    fn remove_paired_device(&self, device_id: &str);

    /// Stamp a paired device's last successful connection with now.
    fn update_paired_device_last_connected(&self, device_id: &str);

    /// Transfer history, newest first.
    fn get_transfers(&self) -> Vec<Transfer>;

    /// Prepend a finished transfer, keeping at most [`HISTORY_CAP`]
    /// entries.
    fn add_transfer(&self, transfer: Transfer);

    /// Drop all history entries.
    fn clear_transfers(&self);
}

#[derive(Debug, Default)]
struct MemoryInner {
    settings: AppSettings,
    paired: Vec<PairedDevice>,
    transfers: Vec<Transfer>,
}

/// In-memory [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    /// Create a store with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given settings.
    #[must_use]
    pub fn with_settings(settings: AppSettings) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                settings,
                ..MemoryInner::default()
            }),
        }
    }
}

impl Storage for MemoryStorage {
    fn get_settings(&self) -> AppSettings {
        self.inner.lock().expect("storage lock").settings.clone()
    }

    fn update_settings(&self, patch: AppSettingsPatch) -> AppSettings {
        let mut inner = self.inner.lock().expect("storage lock");
        if let Some(name) = patch.device_name {
            inner.settings.device_name = name;
        }
        if let Some(auto) = patch.auto_accept_from_paired {
            inner.settings.auto_accept_from_paired = auto;
        }
        if let Some(dir) = patch.save_directory {
            inner.settings.save_directory = dir;
        }
        if let Some(notify) = patch.notifications_enabled {
            inner.settings.notifications_enabled = notify;
        }
        inner.settings.clone()
    }

    fn get_paired_devices(&self) -> Vec<PairedDevice> {
        self.inner.lock().expect("storage lock").paired.clone()
    }

    fn add_paired_device(&self, device: PairedDevice) {
        let mut inner = self.inner.lock().expect("storage lock");
        inner.paired.retain(|p| p.device.id != device.device.id);
        inner.paired.push(device);
    }

    fn remove_paired_device(&self, device_id: &str) {
        let mut inner = self.inner.lock().expect("storage lock");
        inner.paired.retain(|p| p.device.id != device_id);
    }

    fn update_paired_device_last_connected(&self, device_id: &str) {
        let mut inner = self.inner.lock().expect("storage lock");
        if let Some(paired) = inner.paired.iter_mut().find(|p| p.device.id == device_id) {
            paired.last_connected = Some(crate::epoch_ms());
        }
    }

    fn get_transfers(&self) -> Vec<Transfer> {
        self.inner.lock().expect("storage lock").transfers.clone()
    }

    fn add_transfer(&self, transfer: Transfer) {
        let mut inner = self.inner.lock().expect("storage lock");
        inner.transfers.insert(0, transfer);
        inner.transfers.truncate(HISTORY_CAP);
    }

    fn clear_transfers(&self) {
        self.inner.lock().expect("storage lock").transfers.clear();
    }
}
