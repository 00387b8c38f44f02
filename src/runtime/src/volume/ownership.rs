//! Applying a numeric owner to a volume's storage root.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};

use strata_core::error::{Result, StrataError};
use strata_core::volume::Ownership;

/// Trait for ownership reconciliation backends.
pub trait OwnershipApplier: Send + Sync {
    /// Recursively set `owner` on `root` and everything below it.
    /// Returns the number of entries touched.
    fn apply(&self, root: &Path, owner: Ownership) -> Result<usize>;
}

/// Recursive `lchown`. Symlinks are re-owned, never followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChownApplier;

impl OwnershipApplier for ChownApplier {
    fn apply(&self, root: &Path, owner: Ownership) -> Result<usize> {
        let mut touched = 0;
        chown_tree(root, owner, &mut touched)?;
        Ok(touched)
    }
}

fn chown_tree(path: &Path, owner: Ownership, touched: &mut usize) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid)).map_err(|e| {
        StrataError::StoreError(format!(
            "failed to chown {} to {}: {}",
            path.display(),
            owner,
            e
        ))
    })?;
    *touched += 1;

    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), owner, touched)?;
        }
    }
    Ok(())
}

/// Records requests without touching the filesystem. Used where the
/// process cannot change ownership (unprivileged runs, tests).
#[derive(Debug, Default)]
pub struct RecordingApplier {
    calls: Mutex<Vec<(PathBuf, Ownership)>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(root, owner)` applied so far, in order.
    pub fn calls(&self) -> Vec<(PathBuf, Ownership)> {
        self.calls.lock().clone()
    }
}

impl OwnershipApplier for RecordingApplier {
    fn apply(&self, root: &Path, owner: Ownership) -> Result<usize> {
        self.calls.lock().push((root.to_path_buf(), owner));
        Ok(0)
    }
}
