//! Image records and the tag index.
//!
//! Persisted as `<dir>/<id>.json` per image plus `<dir>/index.json`
//! mapping tags to image ids. An in-memory store (no directory) is used
//! by tests and embedders that do not need persistence.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use strata_core::error::{Result, StrataError};

use crate::digest::ImageId;
use crate::fs::write_atomic;
use crate::image::Image;

/// Persistent tag index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TagIndex {
    tags: BTreeMap<String, ImageId>,
}

#[derive(Default)]
struct StoreState {
    images: HashMap<ImageId, Image>,
    tags: BTreeMap<String, ImageId>,
}

/// Image store with an in-memory index.
pub struct ImageStore {
    dir: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl ImageStore {
    /// A store that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Open (creating if needed) a store directory and load its contents.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            StrataError::StoreError(format!(
                "Failed to create image store directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut state = StoreState::default();
        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            let is_record = path.extension().map(|e| e == "json").unwrap_or(false)
                && path.file_name().map(|n| n != "index.json").unwrap_or(false);
            if !is_record {
                continue;
            }
            match std::fs::read(&path)
                .map_err(StrataError::from)
                .and_then(|b| serde_json::from_slice::<Image>(&b).map_err(Into::into))
            {
                Ok(image) => {
                    state.images.insert(image.id.clone(), image);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image record")
                }
            }
        }

        let index_path = dir.join("index.json");
        if index_path.is_file() {
            let index: TagIndex = serde_json::from_slice(&std::fs::read(&index_path)?)?;
            state.tags = index
                .tags
                .into_iter()
                .filter(|(tag, id)| {
                    let known = state.images.contains_key(id);
                    if !known {
                        tracing::warn!(tag = %tag, image = %id.short(), "Dropping tag for missing image");
                    }
                    known
                })
                .collect();
        }

        tracing::debug!(
            dir = %dir.display(),
            images = state.images.len(),
            tags = state.tags.len(),
            "Loaded image store"
        );

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            state: RwLock::new(state),
        })
    }

    /// Save an image, optionally pointing `tag` at it.
    pub async fn put(&self, image: &Image, tag: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(dir) = &self.dir {
            if !state.images.contains_key(&image.id) {
                let path = dir.join(format!("{}.json", image.id.as_str()));
                write_atomic(&path, &serde_json::to_vec_pretty(image)?)?;
            }
        }
        state.images.insert(image.id.clone(), image.clone());
        if let Some(tag) = tag {
            state.tags.insert(tag.to_string(), image.id.clone());
            self.save_index(&state)?;
        }
        Ok(())
    }

    /// Look up an image by tag, then by id (`sha256:<hex>` or bare hex).
    pub async fn get(&self, reference: &str) -> Option<Image> {
        let state = self.state.read().await;
        Self::resolve(&state, reference).and_then(|id| state.images.get(&id).cloned())
    }

    fn resolve(state: &StoreState, reference: &str) -> Option<ImageId> {
        if let Some(id) = state.tags.get(reference) {
            return Some(id.clone());
        }
        let id = ImageId::from_hex(reference.strip_prefix("sha256:").unwrap_or(reference));
        state.images.contains_key(&id).then_some(id)
    }

    /// Tags currently pointing at an image.
    pub async fn tags_for(&self, id: &ImageId) -> Vec<String> {
        let state = self.state.read().await;
        state
            .tags
            .iter()
            .filter(|(_, target)| *target == id)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Remove a tag, and the image record too when the reference is an id
    /// or the tag was the image's last. Returns the image whose record was
    /// deleted, if any.
    pub async fn remove(&self, reference: &str) -> Result<Option<Image>> {
        let mut state = self.state.write().await;
        let id = Self::resolve(&state, reference)
            .ok_or_else(|| StrataError::ImageNotFound(reference.to_string()))?;

        let by_tag = state.tags.remove(reference).is_some();
        let still_tagged = state.tags.values().any(|t| *t == id);
        if by_tag && still_tagged {
            self.save_index(&state)?;
            return Ok(None);
        }

        state.tags.retain(|_, t| *t != id);
        let image = state.images.remove(&id);
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.json", id.as_str()));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        self.save_index(&state)?;
        Ok(image)
    }

    /// All images.
    pub async fn list(&self) -> Vec<Image> {
        let state = self.state.read().await;
        let mut images: Vec<Image> = state.images.values().cloned().collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        images
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.images.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn save_index(&self, state: &StoreState) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let index = TagIndex {
            tags: state.tags.clone(),
        };
        write_atomic(&dir.join("index.json"), &serde_json::to_vec_pretty(&index)?)
    }
}
