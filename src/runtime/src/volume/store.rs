//! Persistent storage for volume records.
//!
//! Volumes are stored as JSON in `<state>/volumes.json` with atomic writes
//! (write to tmp file, then rename) to prevent corruption.
//! Volume data is stored under `<state>/volumes/<name>/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use strata_core::error::{Result, StrataError};
use strata_core::volume::VolumeRecord;

use crate::fs::write_atomic;

/// Persistent store for volume records.
#[derive(Debug)]
pub struct VolumeStore {
    /// Path to the JSON file.
    path: PathBuf,
    /// Base directory for volume data.
    volumes_dir: PathBuf,
}

/// Serializable wrapper for the volumes file.
#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct VolumesFile {
    volumes: BTreeMap<String, VolumeRecord>,
}

impl VolumeStore {
    /// Create a new store at the given path.
    pub fn new(path: impl Into<PathBuf>, volumes_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            volumes_dir: volumes_dir.into(),
        }
    }

    /// Load all volumes from disk, keyed by name.
    pub fn load(&self) -> Result<BTreeMap<String, VolumeRecord>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            StrataError::StoreError(format!(
                "failed to read volumes file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let file: VolumesFile = serde_json::from_str(&data).map_err(|e| {
            StrataError::StoreError(format!("failed to parse volumes file: {}", e))
        })?;

        Ok(file.volumes)
    }

    /// Save all volumes to disk (atomic write).
    pub fn save(&self, volumes: &BTreeMap<String, VolumeRecord>) -> Result<()> {
        let file = VolumesFile {
            volumes: volumes.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &json)
    }

    /// Get a single volume by name.
    pub fn get(&self, name: &str) -> Result<Option<VolumeRecord>> {
        Ok(self.load()?.remove(name))
    }

    /// Find a volume by name or id.
    pub fn find(&self, name_or_id: &str) -> Result<Option<VolumeRecord>> {
        let mut volumes = self.load()?;
        if let Some(record) = volumes.remove(name_or_id) {
            return Ok(Some(record));
        }
        Ok(volumes.into_values().find(|v| v.id == name_or_id))
    }

    /// Create a new named volume and its data directory.
    pub fn create(&self, id: &str, name: &str) -> Result<VolumeRecord> {
        let mut volumes = self.load()?;

        if volumes.contains_key(name) {
            return Err(StrataError::DuplicateVolume(name.to_string()));
        }

        let vol_dir = self.volume_dir(name);
        std::fs::create_dir_all(&vol_dir).map_err(|e| {
            StrataError::StoreError(format!(
                "failed to create volume directory {}: {}",
                vol_dir.display(),
                e
            ))
        })?;

        let record = VolumeRecord::new(id, name, vol_dir);
        volumes.insert(name.to_string(), record.clone());
        self.save(&volumes)?;
        Ok(record)
    }

    /// Remove a volume by name together with its data. Fails while the
    /// volume has live attachments.
    pub fn remove(&self, name: &str) -> Result<VolumeRecord> {
        let mut volumes = self.load()?;

        let record = volumes
            .get(name)
            .ok_or_else(|| StrataError::VolumeNotFound(name.to_string()))?;

        if record.is_in_use() {
            return Err(StrataError::VolumeInUse {
                name: name.to_string(),
                attachments: record.attachments.len(),
            });
        }

        let record = volumes
            .remove(name)
            .ok_or_else(|| StrataError::VolumeNotFound(name.to_string()))?;
        self.save(&volumes)?;

        if record.storage_root.exists() {
            std::fs::remove_dir_all(&record.storage_root).map_err(|e| {
                StrataError::StoreError(format!(
                    "failed to remove volume data {}: {}",
                    record.storage_root.display(),
                    e
                ))
            })?;
        }

        Ok(record)
    }

    /// List all volumes ordered by name.
    pub fn list(&self) -> Result<Vec<VolumeRecord>> {
        Ok(self.load()?.into_values().collect())
    }

    /// Update a volume in-place (used for attach/detach).
    pub fn update(&self, record: &VolumeRecord) -> Result<()> {
        let mut volumes = self.load()?;

        if !volumes.contains_key(&record.name) {
            return Err(StrataError::VolumeNotFound(record.name.clone()));
        }

        volumes.insert(record.name.clone(), record.clone());
        self.save(&volumes)
    }

    /// Get the volume data directory for a named volume.
    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.volumes_dir.join(name)
    }

    /// Get the store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
