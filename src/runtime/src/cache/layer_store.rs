//! On-disk content-addressed layer records.
//!
//! Layout under the store root:
//!
//! ```text
//! <id>.json        layer metadata (LayerRecord)
//! <id>.tar.gz      diff archive
//! keys/<key>       id of the cacheable layer produced for a cache key
//! ```
//!
//! All files are written atomically so a crash never leaves a record
//! visible without its archive.

use std::path::{Path, PathBuf};

use strata_core::error::{Result, StrataError};

use crate::build::layer::{decode_diff, encode_diff, Layer, LayerRecord};
use crate::digest::{CacheKey, LayerId};
use crate::fs::write_atomic;

/// Persistent layer store.
#[derive(Debug)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Open (creating if needed) a store at the given directory.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("keys")).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to create layer store directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_path(&self, id: &LayerId) -> PathBuf {
        self.root.join(format!("{}.json", id.as_str()))
    }

    fn archive_path(&self, id: &LayerId) -> PathBuf {
        self.root.join(format!("{}.tar.gz", id.as_str()))
    }

    fn key_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join("keys").join(key.as_str())
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.meta_path(id).is_file()
    }

    /// Persist a layer. Existing records are left untouched.
    pub fn put(&self, layer: &Layer) -> Result<()> {
        if !self.contains(&layer.id) {
            let archive = encode_diff(&layer.diff)?;
            write_atomic(&self.archive_path(&layer.id), &archive)?;
            let meta = serde_json::to_vec_pretty(&layer.record())?;
            write_atomic(&self.meta_path(&layer.id), &meta)?;

            tracing::debug!(
                layer = %layer.id.short(),
                archive_bytes = archive.len(),
                "Persisted layer"
            );
        }
        if layer.cacheable {
            write_atomic(&self.key_path(&layer.cache_key), layer.id.as_str().as_bytes())?;
        }
        Ok(())
    }

    /// Load a layer by id.
    pub fn get(&self, id: &LayerId) -> Result<Option<Layer>> {
        let meta_path = self.meta_path(id);
        if !meta_path.is_file() {
            return Ok(None);
        }

        let record: LayerRecord = serde_json::from_slice(&std::fs::read(&meta_path)?)?;
        let archive_path = self.archive_path(id);
        let archive = std::fs::read(&archive_path).map_err(|e| {
            StrataError::StoreError(format!(
                "Layer archive {} unreadable: {}",
                archive_path.display(),
                e
            ))
        })?;
        let diff = decode_diff(&archive)?;
        Layer::from_record(record, diff).map(Some)
    }

    /// Load the cacheable layer recorded for a cache key.
    pub fn find_by_key(&self, key: &CacheKey) -> Result<Option<Layer>> {
        let key_path = self.key_path(key);
        if !key_path.is_file() {
            return Ok(None);
        }
        let id = LayerId::from_hex(std::fs::read_to_string(&key_path)?.trim());
        match self.get(&id)? {
            Some(layer) if &layer.cache_key == key => Ok(Some(layer)),
            _ => {
                tracing::warn!(key = %key.short(), "Dangling cache key index entry, removing");
                let _ = std::fs::remove_file(&key_path);
                Ok(None)
            }
        }
    }

    /// Delete a layer and its key index entry. Returns whether it existed.
    pub fn remove(&self, id: &LayerId) -> Result<bool> {
        let meta_path = self.meta_path(id);
        if !meta_path.is_file() {
            return Ok(false);
        }

        if let Ok(bytes) = std::fs::read(&meta_path) {
            if let Ok(record) = serde_json::from_slice::<LayerRecord>(&bytes) {
                let key_path = self.key_path(&record.cache_key);
                let points_here = std::fs::read_to_string(&key_path)
                    .map(|s| s.trim() == id.as_str())
                    .unwrap_or(false);
                if points_here {
                    let _ = std::fs::remove_file(&key_path);
                }
            }
        }

        for path in [meta_path, self.archive_path(id)] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    StrataError::StoreError(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(true)
    }

    /// List all persisted layer records.
    pub fn list_entries(&self) -> Result<Vec<LayerRecord>> {
        let mut entries = Vec::new();

        let read_dir = std::fs::read_dir(&self.root).map_err(|e| {
            StrataError::StoreError(format!(
                "Failed to read layer store {}: {}",
                self.root.display(),
                e
            ))
        })?;

        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match std::fs::read(&path)
                    .map_err(StrataError::from)
                    .and_then(|b| serde_json::from_slice::<LayerRecord>(&b).map_err(Into::into))
                {
                    Ok(record) => entries.push(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable layer record")
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}
