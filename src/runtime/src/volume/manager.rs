//! Named volume lifecycle: create, attach, detach, remove.
//!
//! Operations on one volume are serialized by an async mutex keyed by
//! volume id, so a volume removed and re-created under the same name never
//! shares a lock with its predecessor. Different volumes proceed
//! independently. Ownership is reconciled on
//! attach according to the configured `OwnershipPolicy`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use strata_core::config::EngineConfig;
use strata_core::error::{Result, StrataError};
use strata_core::event::{events, EventEmitter, StrataEvent};
use strata_core::run::ContainerRunConfig;
use strata_core::volume::{AttachmentRecord, Ownership, OwnershipPolicy, VolumeRecord};

use crate::volume::ownership::{ChownApplier, OwnershipApplier};
use crate::volume::store::VolumeStore;

/// A live attachment handed to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Handle for `detach`.
    pub id: String,
    /// Volume name.
    pub volume: String,
    pub container_id: String,
    /// Path inside the container.
    pub mount_path: String,
    /// Host directory to bind at `mount_path`.
    pub host_path: PathBuf,
    /// Owner of the storage root after this attach.
    pub owner: Ownership,
}

/// Volume manager.
pub struct VolumeManager {
    store: Mutex<VolumeStore>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    policy: OwnershipPolicy,
    applier: Arc<dyn OwnershipApplier>,
    events: EventEmitter,
}

impl VolumeManager {
    pub fn new(store: VolumeStore) -> Self {
        Self {
            store: Mutex::new(store),
            locks: DashMap::new(),
            policy: OwnershipPolicy::default(),
            applier: Arc::new(ChownApplier),
            events: EventEmitter::default(),
        }
    }

    /// Manager over the volume state described by `config`.
    pub fn open(config: &EngineConfig) -> Self {
        Self::new(VolumeStore::new(config.volumes_file(), config.volumes_dir()))
            .with_policy(config.volumes.ownership)
    }

    pub fn with_policy(mut self, policy: OwnershipPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn OwnershipApplier>) -> Self {
        self.applier = applier;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn policy(&self) -> OwnershipPolicy {
        self.policy
    }

    /// Create a named volume with an empty storage root.
    pub async fn create(&self, name: &str) -> Result<VolumeRecord> {
        validate_name(name)?;
        let id = format!("vol-{}", uuid::Uuid::new_v4().simple());
        let record = self.store.lock().create(&id, name)?;

        tracing::info!(volume = %name, id = %record.id, root = %record.storage_root.display(), "Created volume");
        self.events.emit(StrataEvent::with_fields(
            events::VOLUME_CREATED,
            [("volume", json!(name)), ("id", json!(record.id))],
        ));
        Ok(record)
    }

    /// Attach a volume (by name or id) to a container run at `mount_path`,
    /// reconciling ownership to `owner`.
    ///
    /// The first attach applies `owner` recursively and records it. Later
    /// attaches leave data untouched unless the policy is `Reown` and the
    /// owner differs.
    pub async fn attach(
        &self,
        volume: &str,
        run: &ContainerRunConfig,
        mount_path: &str,
        owner: Ownership,
    ) -> Result<Attachment> {
        run.validate()?;
        if !mount_path.starts_with('/') {
            return Err(StrataError::InvalidRunConfig(format!(
                "mount path '{}' must be absolute",
                mount_path
            )));
        }

        let (_guard, mut record) = self.lock_volume(volume).await?;
        let name = record.name.clone();

        let reown = match record.owner {
            None => true,
            Some(current) => current != owner && self.policy == OwnershipPolicy::Reown,
        };
        if reown {
            let applier = self.applier.clone();
            let root = record.storage_root.clone();
            let touched = tokio::task::spawn_blocking(move || applier.apply(&root, owner))
                .await
                .map_err(|e| StrataError::Other(format!("ownership task failed: {}", e)))??;
            tracing::info!(
                volume = %name,
                owner = %owner,
                previous = ?record.owner,
                entries = touched,
                "Applied volume ownership"
            );
            record.owner = Some(owner);
        } else if record.owner != Some(owner) {
            tracing::debug!(
                volume = %name,
                owner = ?record.owner,
                requested = %owner,
                "Keeping existing volume ownership"
            );
        }

        let attachment = AttachmentRecord {
            id: format!("att-{}", uuid::Uuid::new_v4().simple()),
            container_id: run.container_id.clone(),
            mount_path: mount_path.to_string(),
        };
        record.attach(attachment.clone());
        self.store.lock().update(&record)?;

        tracing::info!(
            volume = %name,
            container = %run.container_id,
            mount = %mount_path,
            attachments = record.attachments.len(),
            "Attached volume"
        );
        self.events.emit(StrataEvent::with_fields(
            events::VOLUME_ATTACHED,
            [
                ("volume", json!(name)),
                ("container", json!(run.container_id)),
                ("attachment", json!(attachment.id)),
            ],
        ));

        Ok(Attachment {
            id: attachment.id,
            volume: name,
            container_id: attachment.container_id,
            mount_path: attachment.mount_path,
            host_path: record.storage_root,
            owner: record.owner.unwrap_or(owner),
        })
    }

    /// Release an attachment. Data is never touched. Returns false when the
    /// handle was not attached.
    pub async fn detach(&self, volume: &str, attachment_id: &str) -> Result<bool> {
        let (_guard, mut record) = self.lock_volume(volume).await?;
        let name = record.name.clone();
        let Some(detached) = record.detach(attachment_id) else {
            tracing::debug!(volume = %name, attachment = %attachment_id, "Attachment not found");
            return Ok(false);
        };
        self.store.lock().update(&record)?;

        tracing::info!(
            volume = %name,
            container = %detached.container_id,
            remaining = record.attachments.len(),
            "Detached volume"
        );
        self.events.emit(StrataEvent::with_fields(
            events::VOLUME_DETACHED,
            [("volume", json!(name)), ("attachment", json!(attachment_id))],
        ));
        Ok(true)
    }

    /// Remove a volume and its data. Fails with `VolumeInUse` while any
    /// attachment is live.
    pub async fn remove(&self, volume: &str) -> Result<VolumeRecord> {
        let removed = {
            let (_guard, record) = self.lock_volume(volume).await?;
            self.store.lock().remove(&record.name)?
        };
        // Ids are never reused; late waiters find the record gone.
        self.locks.remove(&removed.id);

        tracing::info!(volume = %removed.name, id = %removed.id, "Removed volume");
        self.events.emit(StrataEvent::with_fields(
            events::VOLUME_REMOVED,
            [("volume", json!(removed.name)), ("id", json!(removed.id))],
        ));
        Ok(removed)
    }

    /// Look up a volume by name or id.
    pub fn get(&self, volume: &str) -> Result<Option<VolumeRecord>> {
        self.store.lock().find(volume)
    }

    pub fn list(&self) -> Result<Vec<VolumeRecord>> {
        self.store.lock().list()
    }

    /// Remove every volume without attachments. Each removal takes the
    /// volume's lock, so a volume attached meanwhile is kept. Returns the
    /// names removed.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let idle: Vec<VolumeRecord> = self
            .store
            .lock()
            .list()?
            .into_iter()
            .filter(|v| !v.is_in_use())
            .collect();

        let mut pruned = Vec::new();
        for candidate in idle {
            match self.remove(&candidate.id).await {
                Ok(record) => pruned.push(record.name),
                Err(StrataError::VolumeInUse { name, attachments }) => {
                    tracing::debug!(volume = %name, attachments, "Volume attached during prune, keeping it");
                }
                Err(StrataError::VolumeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(pruned)
    }

    /// Lock the volume named by `volume` (name or id) and read its record
    /// under the lock. Fails with `VolumeNotFound` when the volume was
    /// removed while waiting.
    async fn lock_volume(
        &self,
        volume: &str,
    ) -> Result<(tokio::sync::OwnedMutexGuard<()>, VolumeRecord)> {
        let not_found = || StrataError::VolumeNotFound(volume.to_string());
        let id = self.store.lock().find(volume)?.ok_or_else(not_found)?.id;
        let guard = self.lock_for(&id).lock_owned().await;

        let record = self
            .store
            .lock()
            .find(&id)?
            .filter(|record| record.id == id)
            .ok_or_else(not_found)?;
        Ok((guard, record))
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Volume names follow the Docker rule: `[A-Za-z0-9][A-Za-z0-9_.-]*`.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().map(|c| c.is_ascii_alphanumeric()).unwrap_or(false)
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StrataError::Other(format!("invalid volume name '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::ownership::RecordingApplier;
    use tempfile::TempDir;

    fn manager(policy: OwnershipPolicy) -> (TempDir, VolumeManager, Arc<RecordingApplier>) {
        let tmp = TempDir::new().unwrap();
        let applier = Arc::new(RecordingApplier::new());
        let manager = VolumeManager::new(VolumeStore::new(
            tmp.path().join("volumes.json"),
            tmp.path().join("volumes"),
        ))
        .with_policy(policy)
        .with_applier(applier.clone());
        (tmp, manager, applier)
    }

    fn run(container: &str) -> ContainerRunConfig {
        ContainerRunConfig::new(container, "search:8", 1 << 30)
    }

    const DATA: &str = "/usr/share/search/data";

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let (_tmp, manager, _) = manager(OwnershipPolicy::FirstAttach);
        let record = manager.create("esdata").await.unwrap();
        assert!(record.id.starts_with("vol-"));
        assert!(record.storage_root.is_dir());

        let err = manager.create("esdata").await.unwrap_err();
        assert!(matches!(err, StrataError::DuplicateVolume(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let (_tmp, manager, _) = manager(OwnershipPolicy::FirstAttach);
        assert!(manager.create("").await.is_err());
        assert!(manager.create("../escape").await.is_err());
        assert!(manager.create("es-data_1.0").await.is_ok());
    }

    #[tokio::test]
    async fn test_first_attach_sets_ownership_once() {
        let (_tmp, manager, applier) = manager(OwnershipPolicy::FirstAttach);
        let record = manager.create("esdata").await.unwrap();

        let a = manager
            .attach("esdata", &run("c1"), DATA, Ownership::new(1000, 1000))
            .await
            .unwrap();
        assert_eq!(a.owner, Ownership::new(1000, 1000));
        assert_eq!(a.host_path, record.storage_root);

        // By id, with a different identity: ownership is kept.
        let b = manager
            .attach(&record.id, &run("c2"), DATA, Ownership::new(2000, 2000))
            .await
            .unwrap();
        assert_eq!(b.owner, Ownership::new(1000, 1000));

        assert_eq!(applier.calls().len(), 1);
        let stored = manager.get("esdata").unwrap().unwrap();
        assert_eq!(stored.owner, Some(Ownership::new(1000, 1000)));
        assert_eq!(stored.attachments.len(), 2);
    }

    #[tokio::test]
    async fn test_reown_policy() {
        let (_tmp, manager, applier) = manager(OwnershipPolicy::Reown);
        manager.create("esdata").await.unwrap();

        let owner = Ownership::new(1000, 1000);
        manager.attach("esdata", &run("c1"), DATA, owner).await.unwrap();
        manager.attach("esdata", &run("c2"), DATA, owner).await.unwrap();
        let c = manager
            .attach("esdata", &run("c3"), DATA, Ownership::root())
            .await
            .unwrap();

        assert_eq!(c.owner, Ownership::root());
        assert_eq!(applier.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_in_use_then_detach() {
        let (_tmp, manager, _) = manager(OwnershipPolicy::FirstAttach);
        let record = manager.create("esdata").await.unwrap();
        let a = manager
            .attach("esdata", &run("c1"), DATA, Ownership::root())
            .await
            .unwrap();
        std::fs::write(a.host_path.join("segment"), b"docs").unwrap();

        let err = manager.remove("esdata").await.unwrap_err();
        assert!(matches!(err, StrataError::VolumeInUse { attachments: 1, .. }));

        assert!(manager.detach("esdata", &a.id).await.unwrap());
        assert!(!manager.detach("esdata", &a.id).await.unwrap());
        // Detach keeps data.
        assert_eq!(std::fs::read(record.storage_root.join("segment")).unwrap(), b"docs");

        manager.remove("esdata").await.unwrap();
        assert!(!record.storage_root.exists());
        assert!(manager.get("esdata").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attach_rejects_bad_run_config() {
        let (_tmp, manager, applier) = manager(OwnershipPolicy::FirstAttach);
        manager.create("esdata").await.unwrap();

        let zero = ContainerRunConfig::new("c1", "search:8", 0);
        assert!(matches!(
            manager.attach("esdata", &zero, DATA, Ownership::root()).await,
            Err(StrataError::InvalidRunConfig(_))
        ));
        assert!(manager
            .attach("esdata", &run("c1"), "relative", Ownership::root())
            .await
            .is_err());
        assert!(matches!(
            manager.attach("nope", &run("c1"), DATA, Ownership::root()).await,
            Err(StrataError::VolumeNotFound(_))
        ));
        assert!(applier.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attaches_apply_ownership_once() {
        let (_tmp, manager, applier) = manager(OwnershipPolicy::FirstAttach);
        let manager = Arc::new(manager);
        manager.create("esdata").await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .attach("esdata", &run(&format!("c{}", i)), DATA, Ownership::new(1000 + i, 1000))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(applier.calls().len(), 1);
        assert_eq!(manager.get("esdata").unwrap().unwrap().attachments.len(), 8);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let (tmp, manager, _) = manager(OwnershipPolicy::FirstAttach);
        manager.create("esdata").await.unwrap();
        manager
            .attach("esdata", &run("c1"), DATA, Ownership::new(1000, 1000))
            .await
            .unwrap();
        drop(manager);

        let reopened = VolumeManager::new(VolumeStore::new(
            tmp.path().join("volumes.json"),
            tmp.path().join("volumes"),
        ))
        .with_applier(Arc::new(RecordingApplier::new()));
        let record = reopened.get("esdata").unwrap().unwrap();
        assert_eq!(record.owner, Some(Ownership::new(1000, 1000)));
        assert!(matches!(
            reopened.remove("esdata").await,
            Err(StrataError::VolumeInUse { .. })
        ));
    }

    #[tokio::test]
    async fn test_prune() {
        let (_tmp, manager, _) = manager(OwnershipPolicy::FirstAttach);
        manager.create("a").await.unwrap();
        manager.create("b").await.unwrap();
        manager
            .attach("b", &run("c1"), DATA, Ownership::root())
            .await
            .unwrap();
        assert_eq!(manager.prune().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    /// Takes long enough for other operations to queue behind an attach.
    struct SlowApplier;

    impl OwnershipApplier for SlowApplier {
        fn apply(&self, _root: &std::path::Path, _owner: Ownership) -> Result<usize> {
            std::thread::sleep(std::time::Duration::from_millis(100));
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_prune_keeps_volume_attached_during_prune() {
        let (_tmp, manager, _) = manager(OwnershipPolicy::FirstAttach);
        let manager = Arc::new(manager.with_applier(Arc::new(SlowApplier)));
        manager.create("esdata").await.unwrap();
        manager.create("idle").await.unwrap();

        let attaching = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .attach("esdata", &run("c1"), DATA, Ownership::new(1000, 1000))
                    .await
            })
        };
        // Let the attach take the lock and start applying ownership.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(manager.prune().await.unwrap(), vec!["idle".to_string()]);
        let attachment = attaching.await.unwrap().unwrap();
        let record = manager.get("esdata").unwrap().unwrap();
        assert!(record.is_in_use());
        assert!(attachment.host_path.is_dir());
    }

    #[tokio::test]
    async fn test_waiter_does_not_touch_recreated_volume() {
        let (_tmp, manager, applier) = manager(OwnershipPolicy::FirstAttach);
        let manager = Arc::new(manager);
        let old = manager.create("esdata").await.unwrap();

        let gate = manager.lock_for(&old.id);
        let held = gate.lock().await;
        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .attach("esdata", &run("c1"), DATA, Ownership::new(1000, 1000))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // The name now refers to a different volume.
        manager.store.lock().remove("esdata").unwrap();
        let new = manager.create("esdata").await.unwrap();
        assert!(!Arc::ptr_eq(&manager.lock_for(&new.id), &gate));
        drop(held);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, StrataError::VolumeNotFound(_)));
        let current = manager.get("esdata").unwrap().unwrap();
        assert_eq!(current.id, new.id);
        assert!(!current.is_in_use());
        assert!(current.owner.is_none());
        assert!(applier.calls().is_empty());
    }
}
