//! Container run preparation.
//!
//! Turns a `ContainerRunConfig` into everything a container runtime needs
//! for one run: the image, the effective environment and identity, and the
//! attached volumes. Launching the container is out of scope.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_core::error::{Result, StrataError};
use strata_core::run::ContainerRunConfig;
use strata_core::volume::Ownership;

use crate::build::identity::resolve_user;
use crate::cache::LayerCache;
use crate::fs::Snapshot;
use crate::image::{Image, ImageStore, ResolvedUser};
use crate::volume::{Attachment, VolumeManager};

/// A run ready to be handed to a container runtime.
#[derive(Debug)]
pub struct PreparedRun {
    pub container_id: String,
    pub image: Image,
    /// Image env with the run's overrides applied.
    pub env: Vec<(String, String)>,
    pub user: ResolvedUser,
    pub workdir: String,
    /// ENTRYPOINT followed by CMD.
    pub command: Vec<String>,
    pub memory_limit_bytes: i64,
    pub mounts: Vec<Attachment>,
}

impl PreparedRun {
    /// `KEY=value` form of the environment.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Prepares container runs against built images and managed volumes.
pub struct RunPreparer {
    images: Arc<ImageStore>,
    cache: Arc<LayerCache>,
    volumes: Arc<VolumeManager>,
}

impl RunPreparer {
    pub fn new(images: Arc<ImageStore>, cache: Arc<LayerCache>, volumes: Arc<VolumeManager>) -> Self {
        Self {
            images,
            cache,
            volumes,
        }
    }

    /// Validate `config`, resolve its image and identity, and attach its
    /// volumes. If any attach fails the ones already made are released.
    pub async fn prepare(&self, config: &ContainerRunConfig) -> Result<PreparedRun> {
        config.validate()?;

        let image = self
            .images
            .get(&config.image)
            .await
            .ok_or_else(|| StrataError::ImageNotFound(config.image.clone()))?;

        let user = match config.user.as_deref() {
            None => image.user.clone(),
            Some(spec) => {
                let rootfs = match image.top_layer() {
                    Some(top) => self.cache.materialize(top)?,
                    None => Snapshot::new(),
                };
                resolve_user(Some(spec), &rootfs).map_err(|reason| {
                    StrataError::InvalidRunConfig(format!("user '{}': {}", spec, reason))
                })?
            }
        };

        let mut env: BTreeMap<String, String> = image.config.env.clone();
        for (key, value) in &config.env {
            env.insert(key.clone(), value.clone());
        }

        let owner = Ownership::new(user.uid, user.gid);
        let mut mounts: Vec<Attachment> = Vec::with_capacity(config.volumes.len());
        for mount in &config.volumes {
            match self
                .volumes
                .attach(&mount.volume, config, &mount.mount_path, owner)
                .await
            {
                Ok(attachment) => mounts.push(attachment),
                Err(e) => {
                    tracing::warn!(
                        container = %config.container_id,
                        volume = %mount.volume,
                        error = %e,
                        "Volume attach failed, releasing earlier attachments"
                    );
                    for attached in &mounts {
                        if let Err(detach_err) = self.volumes.detach(&attached.volume, &attached.id).await {
                            tracing::warn!(volume = %attached.volume, error = %detach_err, "Rollback detach failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let command = image
            .config
            .entrypoint
            .iter()
            .flatten()
            .chain(image.config.cmd.iter().flatten())
            .cloned()
            .collect();

        tracing::info!(
            container = %config.container_id,
            image = %image.id.short(),
            user = %user.name,
            volumes = mounts.len(),
            "Prepared container run"
        );

        Ok(PreparedRun {
            container_id: config.container_id.clone(),
            workdir: image.config.workdir.clone(),
            image,
            env: env.into_iter().collect(),
            user,
            command,
            memory_limit_bytes: config.memory_limit_bytes,
            mounts,
        })
    }

    /// Release every volume attached for a run. Detaching never deletes
    /// data. All attachments are released even if one fails; the first
    /// error is returned.
    pub async fn finish(&self, run: PreparedRun) -> Result<()> {
        let mut first_err = None;
        for mount in &run.mounts {
            if let Err(e) = self.volumes.detach(&mount.volume, &mount.id).await {
                tracing::warn!(volume = %mount.volume, error = %e, "Detach failed");
                first_err.get_or_insert(e);
            }
        }
        tracing::debug!(container = %run.container_id, "Finished container run");
        first_err.map_or(Ok(()), Err)
    }
}
