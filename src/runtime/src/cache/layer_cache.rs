//! Content-addressed layer cache shared by concurrent builds.
//!
//! Layers live in an arena keyed by layer id; parents are referenced by id.
//! A second index maps cache keys to the cacheable layer they produced.
//! Misses for the same key are single-flight: one caller executes, the
//! rest wait on a per-key async mutex and reuse the stored layer.
//!
//! The in-memory arena is bounded by an entry count and evicts least
//! recently used layers. Pinned layers, the layer being admitted and the
//! ancestors of either are never evicted.
//! With a `LayerStore` attached, stores write through to disk and misses
//! fall back to it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strata_core::error::{Result, StrataError};

use crate::build::layer::Layer;
use crate::cache::layer_store::LayerStore;
use crate::digest::{CacheKey, ImageId, LayerId};
use crate::fs::Snapshot;

struct Entry {
    layer: Arc<Layer>,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    layers: HashMap<LayerId, Entry>,
    keys: HashMap<CacheKey, LayerId>,
    pins: HashMap<ImageId, Vec<LayerId>>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, id: &LayerId) -> Option<Arc<Layer>> {
        let now = self.tick();
        let entry = self.layers.get_mut(id)?;
        entry.last_used = now;
        Some(entry.layer.clone())
    }

    fn pinned(&self) -> HashSet<&LayerId> {
        self.pins.values().flatten().collect()
    }

    /// Layers that must survive eviction: everything pinned, the layer
    /// being admitted, and every ancestor of those.
    fn protected(&self, admitted: &LayerId) -> HashSet<LayerId> {
        let mut keep = HashSet::new();
        for root in self.pins.values().flatten().chain(std::iter::once(admitted)) {
            let mut cursor = Some(root);
            while let Some(id) = cursor {
                if !keep.insert(id.clone()) {
                    break;
                }
                cursor = self.layers.get(id).and_then(|e| e.layer.parent.as_ref());
            }
        }
        keep
    }

    /// Ids of in-memory layers whose ancestry passes through `root`.
    fn descendants_of(&self, root: &LayerId) -> Vec<LayerId> {
        self.layers
            .keys()
            .filter(|id| {
                let mut cursor = self.layers.get(*id).and_then(|e| e.layer.parent.as_ref());
                while let Some(parent) = cursor {
                    if parent == root {
                        return true;
                    }
                    cursor = self.layers.get(parent).and_then(|e| e.layer.parent.as_ref());
                }
                false
            })
            .cloned()
            .collect()
    }

    fn drop_layer(&mut self, id: &LayerId) -> bool {
        match self.layers.remove(id) {
            Some(entry) => {
                if self.keys.get(&entry.layer.cache_key) == Some(id) {
                    self.keys.remove(&entry.layer.cache_key);
                }
                true
            }
            None => false,
        }
    }
}

/// Removes the in-flight gate for a key once no other caller holds it.
struct InflightSlot<'a> {
    inflight: &'a DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    key: &'a CacheKey,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // One reference in the map, one in this slot.
        self.inflight
            .remove_if(self.key, |_, gate| Arc::strong_count(gate) <= 2);
    }
}

/// Shared layer cache.
pub struct LayerCache {
    state: Mutex<CacheState>,
    inflight: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    capacity: usize,
    store: Option<Arc<LayerStore>>,
    evictions: AtomicU64,
}

impl LayerCache {
    /// Create an in-memory cache holding at most `capacity` layers.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            inflight: DashMap::new(),
            capacity: capacity.max(1),
            store: None,
            evictions: AtomicU64::new(0),
        }
    }

    /// Create a cache backed by a persistent layer store.
    pub fn with_store(capacity: usize, store: Arc<LayerStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(capacity)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of layers held in memory.
    pub fn len(&self) -> usize {
        self.state.lock().layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total layers evicted from memory so far.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.state.lock().layers.contains_key(id)
    }

    /// Find the cacheable layer previously stored for a cache key.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<Arc<Layer>>> {
        {
            let mut state = self.state.lock();
            if let Some(id) = state.keys.get(key).cloned() {
                if let Some(layer) = state.touch(&id) {
                    tracing::debug!(key = %key.short(), layer = %id.short(), "Layer cache hit");
                    return Ok(Some(layer));
                }
            }
        }

        if let Some(store) = &self.store {
            if let Some(layer) = store.find_by_key(key)? {
                tracing::debug!(key = %key.short(), layer = %layer.id.short(), "Layer cache hit (disk)");
                return Ok(Some(self.admit(Arc::new(layer))));
            }
        }

        tracing::debug!(key = %key.short(), "Layer cache miss");
        Ok(None)
    }

    /// Fetch a layer by id.
    pub fn get(&self, id: &LayerId) -> Result<Option<Arc<Layer>>> {
        if let Some(layer) = self.state.lock().touch(id) {
            return Ok(Some(layer));
        }
        match &self.store {
            Some(store) => Ok(store.get(id)?.map(|layer| self.admit(Arc::new(layer)))),
            None => Ok(None),
        }
    }

    /// Record a layer. Cacheable layers become reachable through their key.
    ///
    /// Storing a layer whose id is already known returns the existing one.
    pub fn store(&self, layer: Layer) -> Result<Arc<Layer>> {
        if let Some(existing) = self.state.lock().touch(&layer.id) {
            return Ok(existing);
        }
        if let Some(store) = &self.store {
            store.put(&layer)?;
        }
        tracing::debug!(
            layer = %layer.id.short(),
            key = %layer.cache_key.short(),
            cacheable = layer.cacheable,
            "Stored layer"
        );
        Ok(self.admit(Arc::new(layer)))
    }

    /// Return the layer for `key`, running `execute` on a miss.
    ///
    /// Concurrent callers with the same key run `execute` at most once
    /// between them; the others wait and observe the stored layer. A failed
    /// execution stores nothing and the next waiter retries. The boolean is
    /// true when the layer came from the cache.
    pub async fn get_or_execute<F, Fut>(&self, key: &CacheKey, execute: F) -> Result<(Arc<Layer>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Layer>>,
    {
        if let Some(layer) = self.lookup(key)? {
            return Ok((layer, true));
        }

        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let slot = InflightSlot {
            inflight: &self.inflight,
            key,
            gate,
        };
        let _guard = slot.gate.lock().await;

        // Another caller may have filled the key while we waited.
        if let Some(layer) = self.lookup(key)? {
            return Ok((layer, true));
        }

        let layer = execute().await?;
        if &layer.cache_key != key || !layer.cacheable {
            return Err(StrataError::CacheError(format!(
                "executor produced layer for key {} while filling {}",
                layer.cache_key.short(),
                key.short()
            )));
        }
        let stored = self.store(layer)?;
        Ok((stored, false))
    }

    /// Layers from the base up to and including `id`.
    pub fn chain(&self, id: &LayerId) -> Result<Vec<Arc<Layer>>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            let layer = self.get(&current)?.ok_or_else(|| {
                StrataError::CacheError(format!("layer {} missing from cache", current.short()))
            })?;
            cursor = layer.parent.clone();
            chain.push(layer);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Flatten the chain ending at `id` into a full filesystem.
    pub fn materialize(&self, id: &LayerId) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for layer in self.chain(id)? {
            snapshot.apply(&layer.diff);
        }
        Ok(snapshot)
    }

    /// Protect every layer of a live image from eviction and collection.
    pub fn pin(&self, image: &ImageId, layers: Vec<LayerId>) {
        self.state.lock().pins.insert(image.clone(), layers);
    }

    /// Release an image's pin. Returns whether it was pinned.
    pub fn unpin(&self, image: &ImageId) -> bool {
        self.state.lock().pins.remove(image).is_some()
    }

    pub fn is_pinned(&self, id: &LayerId) -> bool {
        self.state.lock().pinned().contains(id)
    }

    /// Drop every layer not referenced by a pinned image, in memory and on
    /// disk. Returns the number of distinct layers removed.
    pub fn collect_garbage(&self) -> Result<usize> {
        let mut removed: HashSet<LayerId> = HashSet::new();
        let live: HashSet<LayerId> = {
            let mut state = self.state.lock();
            let live: HashSet<LayerId> = state.pinned().into_iter().cloned().collect();
            let dead: Vec<LayerId> = state
                .layers
                .keys()
                .filter(|id| !live.contains(*id))
                .cloned()
                .collect();
            for id in dead {
                state.drop_layer(&id);
                removed.insert(id);
            }
            live
        };

        if let Some(store) = &self.store {
            for record in store.list_entries()? {
                if !live.contains(&record.id) && store.remove(&record.id)? {
                    removed.insert(record.id);
                }
            }
        }

        tracing::info!(removed = removed.len(), live = live.len(), "Collected unreferenced layers");
        Ok(removed.len())
    }

    /// Insert into the arena and evict down to capacity.
    fn admit(&self, layer: Arc<Layer>) -> Arc<Layer> {
        let mut state = self.state.lock();
        let now = state.tick();
        let layer = state
            .layers
            .entry(layer.id.clone())
            .and_modify(|e| e.last_used = now)
            .or_insert(Entry {
                layer,
                last_used: now,
            })
            .layer
            .clone();
        if layer.cacheable {
            state.keys.insert(layer.cache_key.clone(), layer.id.clone());
        }
        self.evict_locked(&mut state, &layer.id);
        layer
    }

    fn evict_locked(&self, state: &mut CacheState, just_admitted: &LayerId) {
        if state.layers.len() <= self.capacity {
            return;
        }
        // Descendants of an unprotected layer are never protected.
        let protected = state.protected(just_admitted);
        while state.layers.len() > self.capacity {
            let victim = state
                .layers
                .iter()
                .filter(|(id, _)| !protected.contains(*id))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                tracing::warn!(
                    layers = state.layers.len(),
                    capacity = self.capacity,
                    "Layer cache over capacity, every remaining layer is pinned or in use"
                );
                break;
            };

            // Children cannot be materialized without their parent.
            let mut doomed = state.descendants_of(&victim);
            doomed.push(victim);
            for id in doomed {
                if state.drop_layer(&id) {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(layer = %id.short(), "Evicted layer");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::layer::derive_cache_key;
    use crate::build::recipe::Instruction;
    use crate::fs::{FsDiff, Node};
    use crate::image::ImageConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(parent: Option<&LayerId>, command: &str) -> CacheKey {
        derive_cache_key(
            parent,
            &Instruction::Run {
                command: command.to_string(),
                no_cache: false,
            },
            &[],
        )
        .unwrap()
    }

    fn layer(parent: Option<&LayerId>, command: &str) -> Layer {
        let mut diff = FsDiff::new();
        diff.upsert(&format!("/{}", command), Node::file(command));
        Layer::new(
            parent.cloned(),
            key(parent, command),
            format!("RUN {}", command),
            diff,
            ImageConfig::default(),
            true,
            false,
        )
    }

    #[test]
    fn test_store_then_lookup() {
        let cache = LayerCache::new(16);
        let l = layer(None, "a");
        let k = l.cache_key.clone();
        let stored = cache.store(l).unwrap();

        let found = cache.lookup(&k).unwrap().unwrap();
        assert_eq!(found.id, stored.id);
        assert!(cache.lookup(&key(None, "b")).unwrap().is_none());
    }

    #[test]
    fn test_store_is_idempotent() {
        let cache = LayerCache::new(16);
        let a = cache.store(layer(None, "a")).unwrap();
        let b = cache.store(layer(None, "a")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = LayerCache::new(2);
        let a = cache.store(layer(None, "a")).unwrap();
        let b = cache.store(layer(None, "b")).unwrap();
        // Touch a so b is least recently used.
        cache.get(&a.id).unwrap();
        let c = cache.store(layer(None, "c")).unwrap();

        assert!(cache.contains(&a.id));
        assert!(!cache.contains(&b.id));
        assert!(cache.contains(&c.id));
        assert!(cache.lookup(&b.cache_key).unwrap().is_none());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_eviction_spares_pinned_ancestors() {
        let cache = LayerCache::new(3);
        let base = cache.store(layer(None, "base")).unwrap();
        let top = cache.store(layer(Some(&base.id), "top")).unwrap();
        cache.pin(&ImageId::from_hex("img"), vec![base.id.clone(), top.id.clone()]);

        let x = cache.store(layer(None, "x")).unwrap();
        let y = cache.store(layer(None, "y")).unwrap();

        // base is the oldest but pinned; x goes instead.
        assert!(cache.contains(&base.id));
        assert!(cache.contains(&top.id));
        assert!(!cache.contains(&x.id));
        assert!(cache.contains(&y.id));
    }

    #[test]
    fn test_eviction_keeps_ancestry_of_admitted_layer() {
        let cache = LayerCache::new(2);
        let base = cache.store(layer(None, "base")).unwrap();
        let mid = cache.store(layer(Some(&base.id), "mid")).unwrap();
        let top = cache.store(layer(Some(&mid.id), "top")).unwrap();

        // Over capacity, but the chain under top is still needed.
        assert!(cache.contains(&base.id));
        assert!(cache.contains(&mid.id));
        assert_eq!(cache.evictions(), 0);
        let snapshot = cache.materialize(&top.id).unwrap();
        assert!(snapshot.contains("/base"));
        assert!(snapshot.contains("/mid"));
        assert!(snapshot.contains("/top"));

        // An unrelated admission reclaims the whole unpinned chain.
        let other = cache.store(layer(None, "other")).unwrap();
        assert!(!cache.contains(&base.id));
        assert!(!cache.contains(&top.id));
        assert!(cache.contains(&other.id));
        assert_eq!(cache.evictions(), 3);
    }

    #[test]
    fn test_eviction_spares_ancestors_of_pinned_layer() {
        let cache = LayerCache::new(2);
        let base = cache.store(layer(None, "base")).unwrap();
        let top = cache.store(layer(Some(&base.id), "top")).unwrap();
        // A pin naming only the tip still needs its parent.
        cache.pin(&ImageId::from_hex("img"), vec![top.id.clone()]);

        cache.store(layer(None, "x")).unwrap();
        cache.store(layer(None, "y")).unwrap();
        assert!(cache.materialize(&top.id).is_ok());
    }

    #[test]
    fn test_eviction_cascades_to_descendants() {
        let cache = LayerCache::new(3);
        let parent = cache.store(layer(None, "p")).unwrap();
        let child = cache.store(layer(Some(&parent.id), "c")).unwrap();
        cache.get(&child.id).unwrap();
        let other = cache.store(layer(None, "o")).unwrap();
        cache.store(layer(None, "n")).unwrap();

        assert!(!cache.contains(&parent.id));
        assert!(!cache.contains(&child.id));
        assert!(cache.contains(&other.id));
    }

    #[test]
    fn test_materialize_chain() {
        let cache = LayerCache::new(16);
        let base = cache.store(layer(None, "base")).unwrap();
        let mut diff = FsDiff::new();
        diff.delete("/base");
        diff.upsert("/f", Node::file("hi\n"));
        let top = cache
            .store(Layer::new(
                Some(base.id.clone()),
                CacheKey::from_hex("top"),
                "RUN rm /base && echo hi > /f",
                diff,
                ImageConfig::default(),
                true,
                false,
            ))
            .unwrap();

        let snapshot = cache.materialize(&top.id).unwrap();
        assert!(!snapshot.contains("/base"));
        assert_eq!(snapshot.read_file("/f").unwrap(), b"hi\n");
        assert_eq!(cache.chain(&top.id).unwrap().len(), 2);
        assert!(cache.materialize(&LayerId::from_hex("nope")).is_err());
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = Arc::new(LayerCache::new(16));
        let runs = Arc::new(AtomicUsize::new(0));
        let k = key(None, "slow");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let runs = runs.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_execute(&k, || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(layer(None, "slow"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut ids = HashSet::new();
        let mut misses = 0;
        for h in handles {
            let (layer, hit) = h.await.unwrap();
            ids.insert(layer.id.clone());
            if !hit {
                misses += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(misses, 1);
        assert_eq!(ids.len(), 1);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_failed_execution_stores_nothing_and_waiter_retries() {
        let cache = LayerCache::new(16);
        let k = key(None, "flaky");

        let failed = cache
            .get_or_execute(&k, || async {
                Err(StrataError::Other("exit 1".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.lookup(&k).unwrap().is_none());
        assert!(cache.is_empty());

        let (layer, hit) = cache
            .get_or_execute(&k, || async { Ok(layer(None, "flaky")) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(layer.cache_key, k);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_key() {
        let cache = LayerCache::new(16);
        let k = key(None, "one");
        let result = cache
            .get_or_execute(&k, || async { Ok(layer(None, "two")) })
            .await;
        assert!(matches!(result, Err(StrataError::CacheError(_))));
    }

    #[test]
    fn test_disk_fallback_after_restart() {
        let tmp = TempDir::new().unwrap();
        let l = layer(None, "persisted");
        let k = l.cache_key.clone();
        let id = l.id.clone();
        {
            let store = Arc::new(LayerStore::open(tmp.path()).unwrap());
            LayerCache::with_store(16, store).store(l).unwrap();
        }

        let store = Arc::new(LayerStore::open(tmp.path()).unwrap());
        let cache = LayerCache::with_store(16, store);
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(&k).unwrap().unwrap().id, id);
        assert!(cache.contains(&id));
    }

    #[test]
    fn test_collect_garbage() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LayerStore::open(tmp.path()).unwrap());
        let cache = LayerCache::with_store(16, store.clone());

        let base = cache.store(layer(None, "base")).unwrap();
        let kept = cache.store(layer(Some(&base.id), "kept")).unwrap();
        let dropped = cache.store(layer(Some(&base.id), "dropped")).unwrap();
        let image = ImageId::from_hex("img");
        cache.pin(&image, vec![base.id.clone(), kept.id.clone()]);

        assert_eq!(cache.collect_garbage().unwrap(), 1);
        assert!(cache.contains(&kept.id));
        assert!(!cache.contains(&dropped.id));
        assert!(!store.contains(&dropped.id));

        assert!(cache.unpin(&image));
        assert_eq!(cache.collect_garbage().unwrap(), 2);
        assert!(store.list_entries().unwrap().is_empty());
    }
}
