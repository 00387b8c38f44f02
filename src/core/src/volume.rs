//! Volume types for named volume management.
//!
//! A volume is a named storage root that outlives builds and container
//! runs. It records which containers currently have it attached and the
//! uid/gid it was reconciled to on first attach.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Numeric owner applied to a volume's storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// What happens to ownership when a container with a different identity
/// attaches to an already-owned volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipPolicy {
    /// Ownership is applied once, on the first attach. Later attaches leave
    /// existing data untouched.
    #[default]
    FirstAttach,
    /// Every attach by a different uid/gid re-owns the storage root.
    Reown,
}

/// A live attachment of a volume to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Attachment handle (unique per attach call).
    pub id: String,
    /// Container run that holds the attachment.
    pub container_id: String,
    /// Path inside the container.
    pub mount_path: String,
}

/// Persisted state of a named volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Stable volume id.
    pub id: String,

    /// Volume name (unique).
    pub name: String,

    /// Host directory holding the volume data.
    pub storage_root: PathBuf,

    /// Owner recorded on first attach, if any.
    #[serde(default)]
    pub owner: Option<Ownership>,

    /// Live attachments.
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,

    /// User-defined labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

impl VolumeRecord {
    /// Create a new, unattached volume record.
    pub fn new(id: &str, name: &str, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            storage_root: storage_root.into(),
            owner: None,
            attachments: Vec::new(),
            labels: HashMap::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Record an attachment. Returns false if the handle was already present.
    pub fn attach(&mut self, attachment: AttachmentRecord) -> bool {
        if self.attachments.iter().any(|a| a.id == attachment.id) {
            return false;
        }
        self.attachments.push(attachment);
        true
    }

    /// Drop an attachment by handle. Returns the removed record.
    pub fn detach(&mut self, attachment_id: &str) -> Option<AttachmentRecord> {
        let pos = self.attachments.iter().position(|a| a.id == attachment_id)?;
        Some(self.attachments.remove(pos))
    }

    /// Check if any container is using this volume.
    pub fn is_in_use(&self) -> bool {
        !self.attachments.is_empty()
    }
}
