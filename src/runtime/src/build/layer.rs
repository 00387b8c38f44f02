//! Layer records and their archive form.
//!
//! A layer is the diff one step applies to its parent plus the cumulative
//! image config after that step, so a cache hit restores both without
//! re-executing anything. On disk the diff is a gzip'd tar with OCI
//! whiteouts (`.wh.<name>`) marking deletions.

use serde::{Deserialize, Serialize};
use std::io::Read;

use strata_core::error::{Result, StrataError};

use crate::build::recipe::Instruction;
use crate::digest::{CacheKey, ContentHasher, LayerId};
use crate::fs::{Change, FsDiff, Node, NodeKind};
use crate::image::ImageConfig;

const WHITEOUT_PREFIX: &str = ".wh.";

/// Derive the cache key for a step.
///
/// `inputs` are extra `(name, digest)` pairs the instruction text does not
/// capture: COPY source contents, the resolved base image for FROM, the
/// build arguments visible to RUN.
pub fn derive_cache_key(
    parent: Option<&LayerId>,
    instruction: &Instruction,
    inputs: &[(String, String)],
) -> Result<CacheKey> {
    let normalized = serde_json::to_vec(instruction)?;
    let mut hasher = ContentHasher::new("strata-cache-v1");
    hasher
        .str(parent.map(|p| p.as_str()).unwrap_or(""))
        .field(&normalized);
    for (name, digest) in inputs {
        hasher.str(name).str(digest);
    }
    Ok(CacheKey::from_hex(hasher.finish()))
}

/// An immutable layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    pub cache_key: CacheKey,
    /// Source text of the step that produced this layer.
    pub created_by: String,
    pub diff: FsDiff,
    /// Cumulative image config after this step.
    pub config: ImageConfig,
    /// False for `RUN --no-cache` output; such layers are never served from
    /// the key index.
    pub cacheable: bool,
    /// Produced by FROM.
    pub from_base: bool,
    pub created_at: String,
}

impl Layer {
    pub fn new(
        parent: Option<LayerId>,
        cache_key: CacheKey,
        created_by: impl Into<String>,
        diff: FsDiff,
        config: ImageConfig,
        cacheable: bool,
        from_base: bool,
    ) -> Self {
        let mut hasher = ContentHasher::new("strata-layer-v1");
        hasher.str(cache_key.as_str());
        if !cacheable {
            // Output is not implied by the key; identify by content.
            hasher.str(&diff.digest());
        }
        Self {
            id: LayerId::from_hex(hasher.finish()),
            parent,
            cache_key,
            created_by: created_by.into(),
            diff,
            config,
            cacheable,
            from_base,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Metadata persisted next to the diff archive.
    pub fn record(&self) -> LayerRecord {
        LayerRecord {
            id: self.id.clone(),
            parent: self.parent.clone(),
            cache_key: self.cache_key.clone(),
            created_by: self.created_by.clone(),
            config: self.config.clone(),
            cacheable: self.cacheable,
            from_base: self.from_base,
            created_at: self.created_at.clone(),
            diff_digest: self.diff.digest(),
        }
    }

    /// Rebuild a layer from its persisted parts.
    pub fn from_record(record: LayerRecord, diff: FsDiff) -> Result<Self> {
        if diff.digest() != record.diff_digest {
            return Err(StrataError::StoreError(format!(
                "layer {} diff does not match its recorded digest",
                record.id.short()
            )));
        }
        Ok(Self {
            id: record.id,
            parent: record.parent,
            cache_key: record.cache_key,
            created_by: record.created_by,
            diff,
            config: record.config,
            cacheable: record.cacheable,
            from_base: record.from_base,
            created_at: record.created_at,
        })
    }
}

/// Serialized layer metadata (`<id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    pub cache_key: CacheKey,
    pub created_by: String,
    pub config: ImageConfig,
    pub cacheable: bool,
    #[serde(default)]
    pub from_base: bool,
    pub created_at: String,
    pub diff_digest: String,
}

/// Encode a diff as a gzip'd tar. Entries carry mtime 0 so identical diffs
/// produce identical archives.
pub fn encode_diff(diff: &FsDiff) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (path, change) in diff.iter() {
        let relative = path.trim_start_matches('/');
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);

        let appended = match change {
            Change::Upsert(node) => {
                header.set_mode(node.mode);
                header.set_uid(node.uid as u64);
                header.set_gid(node.gid as u64);
                match &node.kind {
                    NodeKind::File(data) => {
                        header.set_entry_type(tar::EntryType::Regular);
                        header.set_size(data.len() as u64);
                        builder.append_data(&mut header, relative, data.as_slice())
                    }
                    NodeKind::Dir => {
                        header.set_entry_type(tar::EntryType::Directory);
                        header.set_size(0);
                        builder.append_data(&mut header, relative, std::io::empty())
                    }
                    NodeKind::Symlink(target) => {
                        header.set_entry_type(tar::EntryType::Symlink);
                        header.set_size(0);
                        builder.append_link(&mut header, relative, target)
                    }
                }
            }
            Change::Delete => {
                let whiteout = whiteout_path(relative);
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(0);
                builder.append_data(&mut header, whiteout, std::io::empty())
            }
        };
        appended.map_err(|e| {
            StrataError::StoreError(format!("Failed to add {} to layer archive: {}", path, e))
        })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| StrataError::StoreError(format!("Failed to finalize layer archive: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| StrataError::StoreError(format!("Failed to compress layer archive: {}", e)))
}

/// Decode an archive produced by `encode_diff`.
pub fn decode_diff(bytes: &[u8]) -> Result<FsDiff> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut diff = FsDiff::new();

    let entries = archive
        .entries()
        .map_err(|e| StrataError::StoreError(format!("Failed to read layer archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| StrataError::StoreError(format!("Corrupt layer archive entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| StrataError::StoreError(format!("Invalid path in layer archive: {}", e)))?
            .to_string_lossy()
            .into_owned();
        let path = format!("/{}", path.trim_start_matches("./").trim_end_matches('/'));

        let (dir, name) = match path.rfind('/') {
            Some(pos) => (&path[..pos], &path[pos + 1..]),
            None => ("", path.as_str()),
        };
        if let Some(deleted) = name.strip_prefix(WHITEOUT_PREFIX) {
            diff.delete(&format!("{}/{}", dir, deleted));
            continue;
        }

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);
        let uid = header.uid().unwrap_or(0) as u32;
        let gid = header.gid().unwrap_or(0) as u32;
        let kind = match header.entry_type() {
            tar::EntryType::Directory => NodeKind::Dir,
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| StrataError::StoreError(format!("Invalid symlink {}: {}", path, e)))?
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_default();
                NodeKind::Symlink(target)
            }
            _ => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                NodeKind::File(data)
            }
        };
        diff.upsert(
            &path,
            Node {
                kind,
                mode,
                uid,
                gid,
            },
        );
    }

    Ok(diff)
}

fn whiteout_path(relative: &str) -> String {
    match relative.rfind('/') {
        Some(pos) => format!(
            "{}/{}{}",
            &relative[..pos],
            WHITEOUT_PREFIX,
            &relative[pos + 1..]
        ),
        None => format!("{}{}", WHITEOUT_PREFIX, relative),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_step(dest: &str) -> Instruction {
        Instruction::Copy {
            sources: vec!["elasticsearch.yml".to_string()],
            dest: dest.to_string(),
            chown: None,
        }
    }

    #[test]
    fn test_cache_key_deterministic() {
        let parent = LayerId::from_hex("aa");
        let inputs = vec![("elasticsearch.yml".to_string(), "d1".to_string())];
        let a = derive_cache_key(Some(&parent), &copy_step("/etc/"), &inputs).unwrap();
        let b = derive_cache_key(Some(&parent), &copy_step("/etc/"), &inputs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_key_sensitive_to_inputs() {
        let parent = LayerId::from_hex("aa");
        let step = copy_step("/etc/");
        let base = derive_cache_key(
            Some(&parent),
            &step,
            &[("elasticsearch.yml".to_string(), "d1".to_string())],
        )
        .unwrap();
        let changed_file = derive_cache_key(
            Some(&parent),
            &step,
            &[("elasticsearch.yml".to_string(), "d2".to_string())],
        )
        .unwrap();
        let other_parent = derive_cache_key(
            Some(&LayerId::from_hex("bb")),
            &step,
            &[("elasticsearch.yml".to_string(), "d1".to_string())],
        )
        .unwrap();
        let root = derive_cache_key(None, &step, &[]).unwrap();
        assert_ne!(base, changed_file);
        assert_ne!(base, other_parent);
        assert_ne!(base, root);
    }

    #[test]
    fn test_layer_id_follows_key_when_cacheable() {
        let key = CacheKey::from_hex("k1");
        let mut d1 = FsDiff::new();
        d1.upsert("/f", Node::file("a"));
        let a = Layer::new(None, key.clone(), "RUN x", d1, ImageConfig::default(), true, false);
        let b = Layer::new(
            None,
            key,
            "RUN x",
            FsDiff::new(),
            ImageConfig::default(),
            true,
            false,
        );
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_layer_id_follows_content_when_not_cacheable() {
        let key = CacheKey::from_hex("k1");
        let mut d1 = FsDiff::new();
        d1.upsert("/built_at", Node::file("1"));
        let mut d2 = FsDiff::new();
        d2.upsert("/built_at", Node::file("2"));
        let a = Layer::new(None, key.clone(), "RUN date", d1.clone(), ImageConfig::default(), false, false);
        let b = Layer::new(None, key.clone(), "RUN date", d2, ImageConfig::default(), false, false);
        let c = Layer::new(None, key, "RUN date", d1, ImageConfig::default(), false, false);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, c.id);
    }

    #[test]
    fn test_archive_preserves_nodes_and_whiteouts() {
        let mut diff = FsDiff::new();
        diff.upsert("/usr/share/search", Node::dir().with_owner(1000, 1000));
        diff.upsert(
            "/usr/share/search/config.yml",
            Node::file("cluster.name: demo\n").with_mode(0o640).with_owner(1000, 1000),
        );
        diff.upsert("/usr/bin/search", Node::symlink("/usr/share/search/bin/search"));
        diff.delete("/tmp/install");
        diff.delete("/stale");

        let bytes = encode_diff(&diff).unwrap();
        let decoded = decode_diff(&bytes).unwrap();
        assert_eq!(decoded, diff);
    }

    #[test]
    fn test_archive_is_deterministic() {
        let mut diff = FsDiff::new();
        diff.upsert("/f", Node::file("hi\n"));
        assert_eq!(encode_diff(&diff).unwrap(), encode_diff(&diff).unwrap());
    }

    #[test]
    fn test_from_record_rejects_mismatched_diff() {
        let mut diff = FsDiff::new();
        diff.upsert("/f", Node::file("hi\n"));
        let layer = Layer::new(
            None,
            CacheKey::from_hex("k"),
            "RUN echo hi > /f",
            diff,
            ImageConfig::default(),
            true,
            false,
        );
        let record = layer.record();
        assert!(Layer::from_record(record.clone(), layer.diff.clone()).is_ok());
        assert!(matches!(
            Layer::from_record(record, FsDiff::new()),
            Err(StrataError::StoreError(_))
        ));
    }

    #[test]
    fn test_whiteout_path() {
        assert_eq!(whiteout_path("tmp/install"), "tmp/.wh.install");
        assert_eq!(whiteout_path("stale"), ".wh.stale");
    }
}
