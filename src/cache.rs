//! Descriptor cache
//!
//! Generation is deterministic in the layer params, so the activations of a
//! params value can be reused verbatim. The cache is an LRU keyed by the
//! byte image of the params. One mutex guards the whole LRU and is held for
//! the generation of a missing entry too, so concurrent callers asking for
//! the same params generate it once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use crate::descriptor::Activation;
use crate::params::LayerParams;

pub type CachedActivations = Arc<Vec<Activation>>;

#[derive(Debug)]
struct Entry {
    activations: CachedActivations,
    last_use: u64,
}

#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<LayerParams, Entry>,
    /// Last use tick to key, oldest first
    recency: BTreeMap<u64, LayerParams>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl Lru {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, params: &LayerParams) -> Option<CachedActivations> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(params)?;
        let previous = std::mem::replace(&mut entry.last_use, tick);
        let activations = Arc::clone(&entry.activations);
        if let Some(key) = self.recency.remove(&previous) {
            self.recency.insert(tick, key);
        }
        Some(activations)
    }

    fn insert(&mut self, params: LayerParams, activations: CachedActivations, capacity: usize) {
        if let Some(entry) = self.entries.remove(&params) {
            self.recency.remove(&entry.last_use);
        }
        while self.entries.len() >= capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            debug!("evicting {:?} from the descriptor cache", oldest.op_type);
            self.entries.remove(&oldest);
        }
        let tick = self.next_tick();
        self.recency.insert(tick, params.clone());
        self.entries.insert(
            params,
            Entry {
                activations,
                last_use: tick,
            },
        );
    }
}

/// Fixed capacity LRU of generated activations
#[derive(Debug)]
pub struct DescriptorCache {
    capacity: usize,
    lru: Mutex<Lru>,
}

impl DescriptorCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "descriptor cache capacity must be positive");
        Self {
            capacity,
            lru: Mutex::new(Lru::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Lru> {
        // a panic while holding the lock cannot leave the maps half updated
        self.lru.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached activations of `params`. A hit makes the entry the most
    /// recently used.
    pub fn get(&self, params: &LayerParams) -> Option<CachedActivations> {
        let mut lru = self.lock();
        let found = lru.touch(params);
        if found.is_some() {
            lru.hits += 1;
        } else {
            lru.misses += 1;
        }
        found
    }

    /// Insert or replace the entry of `params`, evicting the least recently
    /// used entry when full
    pub fn insert(&self, params: LayerParams, activations: Vec<Activation>) -> CachedActivations {
        let activations = Arc::new(activations);
        self.lock().insert(params, Arc::clone(&activations), self.capacity);
        activations
    }

    /// Return the cached activations of `params`, generating and inserting
    /// them with `generate` on a miss
    pub fn generate_descriptors_cache<F>(
        &self,
        params: &LayerParams,
        generate: F,
    ) -> CachedActivations
    where
        F: FnOnce() -> Vec<Activation>,
    {
        let mut lru = self.lock();
        if let Some(activations) = lru.touch(params) {
            lru.hits += 1;
            info!("descriptor cache hit ({} activations)", activations.len());
            return activations;
        }
        lru.misses += 1;
        let activations = Arc::new(generate());
        info!("descriptor cache miss, cached {} activations", activations.len());
        lru.insert(params.clone(), Arc::clone(&activations), self.capacity);
        activations
    }

    /// Number of cached params values
    pub fn cache_size(&self) -> usize {
        self.lock().entries.len()
    }

    /// Membership test that leaves the recency order untouched
    pub fn is_element_in_des_cache(&self, params: &LayerParams) -> bool {
        self.lock().entries.contains_key(params)
    }

    pub fn clear(&self) {
        let mut lru = self.lock();
        lru.entries.clear();
        lru.recency.clear();
    }

    pub fn debug_info(&self) -> String {
        let lru = self.lock();
        format!(
            "descriptor cache: size={}/{}, hits={}, misses={}",
            lru.entries.len(),
            self.capacity,
            lru.hits,
            lru.misses
        )
    }
}
