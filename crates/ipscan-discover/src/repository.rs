//! Device inventory persistence: trait + JSON file implementation.
//!
//! The inventory is always read and written as a whole. The file store
//! caches it after the first load, so later loads observe earlier saves
//! even when the disk write failed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipscan_core::{Device, DeviceId, DeviceInventory};
use tokio::sync::Mutex;

/// Errors that can occur while loading or saving the inventory.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trait for inventory persistence backends.
///
/// Implementations serialize `save_all` calls against each other and
/// guarantee that `load_all` after `save_all` returns the saved state.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn load_all(&self) -> Result<DeviceInventory, StorageError>;

    async fn save_all(&self, inventory: &DeviceInventory) -> Result<(), StorageError>;

    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>, StorageError> {
        Ok(self.load_all().await?.find_by_id(id).cloned())
    }

    /// Case-insensitive match on the IP string.
    async fn find_by_ip(&self, ip: &str) -> Result<Option<Device>, StorageError> {
        Ok(self.load_all().await?.find_by_ip(ip).cloned())
    }

    /// Insert or replace by id, then save.
    async fn upsert(&self, device: Device) -> Result<Device, StorageError>;

    /// Returns false if no device had that id.
    async fn remove(&self, id: DeviceId) -> Result<bool, StorageError>;

    /// Returns how many of `ids` were present and removed.
    async fn remove_many(&self, ids: &[DeviceId]) -> Result<usize, StorageError>;
}

/// JSON-file backed inventory store.
///
/// All operations hold one async lock, so a save never interleaves with
/// another save or with a read-modify-write. Writes go to a sibling temp
/// file that is then renamed over the target.
pub struct JsonDeviceRepository {
    path: Option<PathBuf>,
    state: Mutex<RepoState>,
}

#[derive(Default)]
struct RepoState {
    cache: Option<DeviceInventory>,
    /// The cache holds changes that have not reached disk.
    dirty: bool,
}

impl JsonDeviceRepository {
    /// Store backed by the file at `path`. Nothing is read until first use.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: Mutex::new(RepoState::default()),
        }
    }

    /// Store that never touches the filesystem.
    pub fn memory_only() -> Self {
        Self {
            path: None,
            state: Mutex::new(RepoState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_memory_only(&self) -> bool {
        self.path.is_none()
    }

    /// True when the last save failed and memory is ahead of disk.
    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    async fn ensure_loaded(&self, state: &mut RepoState) -> Result<(), StorageError> {
        if state.cache.is_some() {
            return Ok(());
        }

        let inventory = match &self.path {
            Some(path) => read_inventory(path).await?,
            None => DeviceInventory::default(),
        };
        state.cache = Some(inventory);
        Ok(())
    }

    /// Write the cached inventory to disk, tracking failure in `dirty`.
    async fn flush(&self, state: &mut RepoState) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            state.dirty = false;
            return Ok(());
        };
        let Some(inventory) = state.cache.as_ref() else {
            return Ok(());
        };
        let devices = inventory.devices.len();

        let written = write_inventory(path, inventory).await;
        match written {
            Ok(()) => {
                state.dirty = false;
                tracing::debug!(devices, path = %path.display(), "Inventory saved");
                Ok(())
            }
            Err(e) => {
                state.dirty = true;
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to save inventory, keeping changes in memory"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl DeviceRepository for JsonDeviceRepository {
    async fn load_all(&self) -> Result<DeviceInventory, StorageError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.cache.clone().unwrap_or_default())
    }

    async fn save_all(&self, inventory: &DeviceInventory) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.cache = Some(inventory.clone());
        self.flush(&mut state).await
    }

    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>, StorageError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.cache.as_ref().and_then(|inv| inv.find_by_id(id)).cloned())
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<Device>, StorageError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.cache.as_ref().and_then(|inv| inv.find_by_ip(ip)).cloned())
    }

    async fn upsert(&self, device: Device) -> Result<Device, StorageError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let inventory = state.cache.get_or_insert_with(DeviceInventory::default);
        tracing::debug!(id = %device.id, name = %device.display_name(), "Upserting device");
        inventory.upsert(device.clone());

        self.flush(&mut state).await?;
        Ok(device)
    }

    async fn remove(&self, id: DeviceId) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let inventory = state.cache.get_or_insert_with(DeviceInventory::default);
        let Some(device) = inventory.remove(id) else {
            return Ok(false);
        };
        tracing::debug!(id = %device.id, name = %device.display_name(), "Removed device");

        self.flush(&mut state).await?;
        Ok(true)
    }

    async fn remove_many(&self, ids: &[DeviceId]) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let inventory = state.cache.get_or_insert_with(DeviceInventory::default);
        let removed = ids.iter().filter(|id| inventory.remove(**id).is_some()).count();

        if removed > 0 {
            self.flush(&mut state).await?;
        }
        Ok(removed)
    }
}

async fn read_inventory(path: &Path) -> Result<DeviceInventory, StorageError> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(DeviceInventory::default());
        }
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_str::<DeviceInventory>(&json) {
        Ok(inventory) => {
            tracing::debug!(
                devices = inventory.devices.len(),
                path = %path.display(),
                "Inventory loaded"
            );
            Ok(inventory)
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Unreadable inventory, starting fresh");
            Ok(DeviceInventory::default())
        }
    }
}

async fn write_inventory(path: &Path, inventory: &DeviceInventory) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let json = serde_json::to_string_pretty(inventory)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
