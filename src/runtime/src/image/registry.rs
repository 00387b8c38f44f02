//! Base-image resolution for FROM.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use strata_core::error::Result;

use crate::cache::LayerCache;
use crate::digest::ContentHasher;
use crate::fs::Snapshot;
use crate::image::{ImageConfig, ImageStore};

/// A resolved base image: its flattened filesystem and run config.
#[derive(Debug, Clone)]
pub struct BaseImage {
    /// `name:tag` the image was resolved as.
    pub reference: String,
    /// Content digest; part of the FROM cache key.
    pub id: String,
    pub rootfs: Snapshot,
    pub config: ImageConfig,
}

impl BaseImage {
    /// Build a base image, deriving its id from content.
    pub fn new(reference: impl Into<String>, rootfs: Snapshot, config: ImageConfig) -> Self {
        let mut hasher = ContentHasher::new("strata-base-v1");
        hasher.str(&rootfs.digest());
        hasher.field(&serde_json::to_vec(&config).unwrap_or_default());
        Self {
            reference: reference.into(),
            id: hasher.finish(),
            rootfs,
            config,
        }
    }
}

/// Trait for base-image sources.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Resolve `name:tag`. `Ok(None)` means the image does not exist here.
    async fn resolve(&self, name: &str, tag: &str) -> Result<Option<BaseImage>>;
}

/// Registry holding seeded images in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    images: RwLock<HashMap<String, BaseImage>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image under `name:tag`.
    pub fn insert(&self, name: &str, tag: &str, rootfs: Snapshot, config: ImageConfig) {
        let reference = format!("{}:{}", name, tag);
        let image = BaseImage::new(reference.clone(), rootfs, config);
        self.images.write().insert(reference, image);
    }

    pub fn remove(&self, name: &str, tag: &str) -> bool {
        self.images
            .write()
            .remove(&format!("{}:{}", name, tag))
            .is_some()
    }
}

#[async_trait]
impl ImageRegistry for MemoryRegistry {
    async fn resolve(&self, name: &str, tag: &str) -> Result<Option<BaseImage>> {
        Ok(self.images.read().get(&format!("{}:{}", name, tag)).cloned())
    }
}

/// Registry over images this engine built earlier.
pub struct StoreRegistry {
    images: Arc<ImageStore>,
    cache: Arc<LayerCache>,
}

impl StoreRegistry {
    pub fn new(images: Arc<ImageStore>, cache: Arc<LayerCache>) -> Self {
        Self { images, cache }
    }
}

#[async_trait]
impl ImageRegistry for StoreRegistry {
    async fn resolve(&self, name: &str, tag: &str) -> Result<Option<BaseImage>> {
        let reference = format!("{}:{}", name, tag);
        let Some(image) = self.images.get(&reference).await else {
            return Ok(None);
        };
        let rootfs = match image.top_layer() {
            Some(top) => self.cache.materialize(top)?,
            None => Snapshot::new(),
        };
        Ok(Some(BaseImage {
            reference,
            id: image.id.as_str().to_string(),
            rootfs,
            config: image.config,
        }))
    }
}

/// Tries registries in order; the first hit wins.
#[derive(Default)]
pub struct ChainRegistry {
    registries: Vec<Arc<dyn ImageRegistry>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, registry: Arc<dyn ImageRegistry>) -> Self {
        self.registries.push(registry);
        self
    }
}

#[async_trait]
impl ImageRegistry for ChainRegistry {
    async fn resolve(&self, name: &str, tag: &str) -> Result<Option<BaseImage>> {
        for registry in &self.registries {
            if let Some(image) = registry.resolve(name, tag).await? {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }
}
