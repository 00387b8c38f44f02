//! Image assembly: turns a finished layer chain into an image record.

use std::sync::Arc;

use strata_core::error::{Result, StrataError};

use crate::build::identity::resolve_user;
use crate::build::layer::Layer;
use crate::digest::{ContentHasher, ImageId};
use crate::fs::Snapshot;
use crate::image::{Image, ImageConfig};

/// Assemble an image from its layers (base first), the final config and the
/// flattened root filesystem.
///
/// Fails with `IncompleteImage` naming the first unmet requirement; nothing
/// is produced in that case.
pub fn finalize(layers: &[Arc<Layer>], config: &ImageConfig, rootfs: &Snapshot) -> Result<Image> {
    if layers.is_empty() {
        return Err(StrataError::IncompleteImage("image has no layers".to_string()));
    }
    if !layers[0].from_base {
        return Err(StrataError::IncompleteImage(
            "image has no base layer (missing FROM)".to_string(),
        ));
    }
    for pair in layers.windows(2) {
        if pair[1].parent.as_ref() != Some(&pair[0].id) {
            return Err(StrataError::IncompleteImage(format!(
                "layer {} does not follow {}",
                pair[1].id.short(),
                pair[0].id.short()
            )));
        }
    }

    if let Some(port) = config.exposed_ports.iter().find(|p| !p.is_valid()) {
        return Err(StrataError::IncompleteImage(format!(
            "exposed port {} is outside 1-65535",
            port
        )));
    }

    let user = resolve_user(config.user.as_deref(), rootfs)
        .map_err(|reason| StrataError::IncompleteImage(format!("USER does not resolve: {}", reason)))?;

    let layer_ids: Vec<_> = layers.iter().map(|l| l.id.clone()).collect();
    let mut hasher = ContentHasher::new("strata-image-v1");
    for id in &layer_ids {
        hasher.str(id.as_str());
    }
    hasher.field(&serde_json::to_vec(config)?);

    let image = Image {
        id: ImageId::from_hex(hasher.finish()),
        layers: layer_ids,
        config: config.clone(),
        user,
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    tracing::debug!(
        image = %image.id.short(),
        layers = image.layers.len(),
        user = %image.user.name,
        "Assembled image"
    );
    Ok(image)
}
