//! In-memory filesystem snapshots and the diffs between them.
//!
//! A `Snapshot` is the full root filesystem an instruction runs against;
//! a `FsDiff` is what one layer contributes on top of its parent. Paths are
//! normalized absolute strings (`/usr/share/app/config.yml`); the root
//! directory itself is implicit.

use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use strata_core::error::{Result, StrataError};

use crate::digest::ContentHasher;

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// What a path holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

/// A single filesystem entry with its permission bits and numeric owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Node {
    pub fn file(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: NodeKind::File(data.into()),
            mode: DEFAULT_FILE_MODE,
            uid: 0,
            gid: 0,
        }
    }

    pub fn dir() -> Self {
        Self {
            kind: NodeKind::Dir,
            mode: DEFAULT_DIR_MODE,
            uid: 0,
            gid: 0,
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Symlink(target.into()),
            mode: 0o777,
            uid: 0,
            gid: 0,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir)
    }

    fn hash_into(&self, hasher: &mut ContentHasher) {
        match &self.kind {
            NodeKind::File(data) => hasher.str("file").field(data),
            NodeKind::Dir => hasher.str("dir"),
            NodeKind::Symlink(target) => hasher.str("symlink").str(target),
        };
        hasher
            .field(&self.mode.to_be_bytes())
            .field(&self.uid.to_be_bytes())
            .field(&self.gid.to_be_bytes());
    }
}

/// Normalize `path` against `base` into an absolute path without `.`/`..`.
///
/// `..` never climbs above `/`.
pub fn normalize_path(base: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", base, path)
    };
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Parent directory of a normalized path, `None` for `/`.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

/// Full root filesystem state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Node>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.entries.get(&normalize_path("/", path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Contents of a regular file.
    pub fn read_file(&self, path: &str) -> Option<&[u8]> {
        match self.get(path)?.kind {
            NodeKind::File(ref data) => Some(data),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.entries.iter()
    }

    /// Insert a node, creating missing parent directories (root-owned, 0755).
    ///
    /// A non-directory node replaces whatever subtree lived at `path`.
    pub fn insert(&mut self, path: &str, node: Node) {
        let path = normalize_path("/", path);
        if path == "/" {
            return;
        }
        let mut ancestor = parent_path(&path);
        let mut missing = Vec::new();
        while let Some(dir) = ancestor {
            if dir == "/" {
                break;
            }
            match self.entries.get(dir) {
                Some(existing) if existing.is_dir() => break,
                _ => missing.push(dir.to_string()),
            }
            ancestor = parent_path(dir);
        }
        for dir in missing.into_iter().rev() {
            self.entries.insert(dir, Node::dir());
        }
        if !node.is_dir() {
            self.remove_children(&path);
        }
        self.entries.insert(path, node);
    }

    /// Remove a path and everything below it. Returns whether anything was removed.
    pub fn remove(&mut self, path: &str) -> bool {
        let path = normalize_path("/", path);
        let removed_children = self.remove_children(&path);
        self.entries.remove(&path).is_some() || removed_children
    }

    fn remove_children(&mut self, path: &str) -> bool {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &doomed {
            self.entries.remove(p);
        }
        !doomed.is_empty()
    }

    /// Compute the changes that turn `self` (before) into `after`.
    pub fn diff(&self, after: &Snapshot) -> FsDiff {
        let mut diff = FsDiff::default();

        for (path, node) in &after.entries {
            if self.entries.get(path) != Some(node) {
                diff.changes.insert(path.clone(), Change::Upsert(node.clone()));
            }
        }

        // Deleting a directory implies its subtree; only record the top.
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            let parent_gone = parent_path(path)
                .map(|p| self.entries.contains_key(p) && !after.entries.contains_key(p))
                .unwrap_or(false);
            if !parent_gone {
                diff.changes.insert(path.clone(), Change::Delete);
            }
        }

        diff
    }

    /// Apply a diff in place.
    pub fn apply(&mut self, diff: &FsDiff) {
        for (path, change) in &diff.changes {
            match change {
                Change::Upsert(node) => self.insert(path, node.clone()),
                Change::Delete => {
                    self.remove(path);
                }
            }
        }
    }

    /// Content digest over every entry.
    pub fn digest(&self) -> String {
        let mut hasher = ContentHasher::new("strata-snapshot-v1");
        for (path, node) in &self.entries {
            hasher.str(path);
            node.hash_into(&mut hasher);
        }
        hasher.finish()
    }

    /// Total bytes held in regular files.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|n| match n.kind {
                NodeKind::File(ref data) => data.len() as u64,
                _ => 0,
            })
            .sum()
    }

    /// Write the snapshot out under `root` on the host.
    ///
    /// Ownership is only applied when running as root; directory modes are
    /// applied last so read-only directories can still be populated.
    pub fn materialize(&self, root: &Path) -> Result<()> {
        let as_root = unsafe { libc::geteuid() } == 0;
        std::fs::create_dir_all(root).map_err(|e| {
            StrataError::SandboxError(format!("failed to create {}: {}", root.display(), e))
        })?;

        for (path, node) in &self.entries {
            let host = root.join(path.trim_start_matches('/'));
            let written = match &node.kind {
                NodeKind::Dir => std::fs::create_dir_all(&host),
                NodeKind::File(data) => std::fs::write(&host, data).and_then(|_| {
                    std::fs::set_permissions(&host, std::fs::Permissions::from_mode(node.mode))
                }),
                NodeKind::Symlink(target) => std::os::unix::fs::symlink(target, &host),
            };
            written.map_err(|e| {
                StrataError::SandboxError(format!("failed to write {}: {}", host.display(), e))
            })?;
            if as_root {
                std::os::unix::fs::lchown(&host, Some(node.uid), Some(node.gid)).map_err(|e| {
                    StrataError::SandboxError(format!("failed to chown {}: {}", host.display(), e))
                })?;
            }
        }

        for (path, node) in self.entries.iter().rev() {
            if node.is_dir() {
                let host = root.join(path.trim_start_matches('/'));
                std::fs::set_permissions(&host, std::fs::Permissions::from_mode(node.mode))
                    .map_err(|e| {
                        StrataError::SandboxError(format!(
                            "failed to set mode on {}: {}",
                            host.display(),
                            e
                        ))
                    })?;
            }
        }

        Ok(())
    }

    /// Read a host directory tree into a snapshot. Symlinks are not followed.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut snapshot = Snapshot::new();
        walk_dir(root, root, &mut snapshot)?;
        Ok(snapshot)
    }
}

/// Recursively walk a directory and collect nodes.
fn walk_dir(root: &Path, current: &Path, snapshot: &mut Snapshot) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StrataError::SandboxError(format!(
            "failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| StrataError::SandboxError(format!("failed to read directory entry: {}", e)))?;
        let path = entry.path();
        let relative = path.strip_prefix(root).map_err(|e| {
            StrataError::SandboxError(format!(
                "failed to compute relative path for {}: {}",
                path.display(),
                e
            ))
        })?;
        let key = format!("/{}", relative.to_string_lossy());

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            StrataError::SandboxError(format!(
                "failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            NodeKind::Dir
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&path)?;
            NodeKind::Symlink(target.to_string_lossy().into_owned())
        } else if file_type.is_file() {
            NodeKind::File(std::fs::read(&path)?)
        } else {
            tracing::debug!(path = %path.display(), "Skipping special file");
            continue;
        };

        let node = Node {
            kind,
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
        };
        let is_dir = node.is_dir();
        snapshot.entries.insert(key, node);

        if is_dir {
            walk_dir(root, &path, snapshot)?;
        }
    }

    Ok(())
}

/// Write a file atomically (write to tmp file, then rename).
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StrataError::StoreError(format!(
                "failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp_path = std::path::PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, data).map_err(|e| {
        StrataError::StoreError(format!(
            "failed to write tmp file {}: {}",
            tmp_path.display(),
            e
        ))
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        StrataError::StoreError(format!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })
}

/// One path's change in a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert(Node),
    Delete,
}

/// Ordered set of changes a layer applies to its parent's filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsDiff {
    changes: BTreeMap<String, Change>,
}

impl FsDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, path: &str, node: Node) {
        self.changes
            .insert(normalize_path("/", path), Change::Upsert(node));
    }

    pub fn delete(&mut self, path: &str) {
        self.changes.insert(normalize_path("/", path), Change::Delete);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, path: &str) -> Option<&Change> {
        self.changes.get(&normalize_path("/", path))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Change)> {
        self.changes.iter()
    }

    /// Number of (upserted, deleted) paths.
    pub fn counts(&self) -> (usize, usize) {
        let deleted = self
            .changes
            .values()
            .filter(|c| matches!(c, Change::Delete))
            .count();
        (self.changes.len() - deleted, deleted)
    }

    /// Content digest of the diff.
    pub fn digest(&self) -> String {
        let mut hasher = ContentHasher::new("strata-diff-v1");
        for (path, change) in &self.changes {
            hasher.str(path);
            match change {
                Change::Upsert(node) => {
                    hasher.str("upsert");
                    node.hash_into(&mut hasher);
                }
                Change::Delete => {
                    hasher.str("delete");
                }
            }
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/", "etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("/app", "src"), "/app/src");
        assert_eq!(normalize_path("/app", "/usr/bin"), "/usr/bin");
        assert_eq!(normalize_path("/app/", "./a//b/../c"), "/app/a/c");
        assert_eq!(normalize_path("/", "../../.."), "/");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_insert_creates_parents() {
        let mut snap = Snapshot::new();
        snap.insert("/usr/share/app/config.yml", Node::file("cluster.name: demo\n"));
        assert!(snap.get("/usr").unwrap().is_dir());
        assert!(snap.get("/usr/share/app").unwrap().is_dir());
        assert_eq!(
            snap.read_file("/usr/share/app/config.yml").unwrap(),
            b"cluster.name: demo\n"
        );
        assert_eq!(snap.len(), 4);
    }

    #[test]
    fn test_file_replaces_directory_subtree() {
        let mut snap = Snapshot::new();
        snap.insert("/data/a", Node::file("a"));
        snap.insert("/data", Node::file("now a file"));
        assert!(!snap.contains("/data/a"));
        assert_eq!(snap.read_file("/data").unwrap(), b"now a file");
    }

    #[test]
    fn test_remove_subtree_only() {
        let mut snap = Snapshot::new();
        snap.insert("/a/x", Node::file("x"));
        snap.insert("/a-b", Node::file("sibling"));
        assert!(snap.remove("/a"));
        assert!(!snap.contains("/a/x"));
        assert!(snap.contains("/a-b"));
        assert!(!snap.remove("/missing"));
    }

    #[test]
    fn test_diff_added_modified_deleted() {
        let mut before = Snapshot::new();
        before.insert("/keep", Node::file("same"));
        before.insert("/change", Node::file("old"));
        before.insert("/gone/deep/file", Node::file("bye"));

        let mut after = before.clone();
        after.insert("/change", Node::file("new"));
        after.insert("/added", Node::file("hi\n"));
        after.remove("/gone");

        let diff = before.diff(&after);
        assert!(matches!(diff.get("/added"), Some(Change::Upsert(_))));
        assert!(matches!(diff.get("/change"), Some(Change::Upsert(_))));
        assert_eq!(diff.get("/gone"), Some(&Change::Delete));
        assert!(diff.get("/gone/deep").is_none());
        assert!(diff.get("/keep").is_none());
        assert_eq!(diff.counts(), (2, 1));
    }

    #[test]
    fn test_diff_deletes_sibling_trees_once() {
        let mut before = Snapshot::new();
        before.insert("/a/b/file", Node::file("1"));
        before.insert("/a-x/f", Node::file("2"));
        before.insert("/keep", Node::file("3"));

        let mut after = before.clone();
        after.remove("/a");
        after.remove("/a-x");

        // "/a-x" sorts between "/a" and "/a/b".
        let diff = before.diff(&after);
        assert_eq!(diff.get("/a"), Some(&Change::Delete));
        assert_eq!(diff.get("/a-x"), Some(&Change::Delete));
        assert!(diff.get("/a/b").is_none());
        assert!(diff.get("/a/b/file").is_none());
        assert!(diff.get("/a-x/f").is_none());
        assert_eq!(diff.counts(), (0, 2));
    }

    #[test]
    fn test_apply_reproduces_after() {
        let mut before = Snapshot::new();
        before.insert("/etc/hosts", Node::file("127.0.0.1 localhost\n"));
        before.insert("/var/log/old.log", Node::file("..."));

        let mut after = before.clone();
        after.remove("/var/log");
        after.insert("/etc/app.yml", Node::file("x: 1\n").with_owner(1000, 1000));

        let diff = before.diff(&after);
        let mut replayed = before.clone();
        replayed.apply(&diff);
        assert_eq!(replayed, after);
    }

    #[test]
    fn test_diff_digest_changes_with_content() {
        let mut a = FsDiff::new();
        a.upsert("/f", Node::file("hi\n"));
        let mut b = FsDiff::new();
        b.upsert("/f", Node::file("hi!\n"));
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }

    #[test]
    fn test_snapshot_digest_tracks_ownership() {
        let mut a = Snapshot::new();
        a.insert("/f", Node::file("x"));
        let mut b = Snapshot::new();
        b.insert("/f", Node::file("x").with_owner(1, 1));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_materialize_and_capture_roundtrip_content() {
        let tmp = TempDir::new().unwrap();
        let mut snap = Snapshot::new();
        snap.insert("/app/run.sh", Node::file("#!/bin/sh\n").with_mode(0o755));
        snap.insert("/app/link", Node::symlink("run.sh"));

        snap.materialize(tmp.path()).unwrap();
        let captured = Snapshot::capture(tmp.path()).unwrap();

        assert_eq!(captured.read_file("/app/run.sh").unwrap(), b"#!/bin/sh\n");
        assert_eq!(captured.get("/app/run.sh").unwrap().mode, 0o755);
        assert_eq!(
            captured.get("/app/link").unwrap().kind,
            NodeKind::Symlink("run.sh".to_string())
        );
        assert!(captured.get("/app").unwrap().is_dir());
    }

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/index.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_capture_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let snap = Snapshot::capture(tmp.path()).unwrap();
        assert!(snap.is_empty());
    }
}
