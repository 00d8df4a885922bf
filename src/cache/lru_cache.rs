use crate::cache::CacheProvider;
use crate::structure::{StructureId, StructureSchema};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type TypeCache = LruCache<StructureId, Arc<str>>;

/// Which structure types the provider caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    All,
    AllExcept(HashSet<String>),
    Only(HashSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded per-type payload cache. Each structure type gets its own LRU of
/// `capacity_per_type` entries so a hot type cannot evict another's rows.
pub struct LruCacheProvider {
    capacity_per_type: NonZeroUsize,
    scope: RwLock<CacheScope>,
    types: Mutex<HashMap<String, TypeCache>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruCacheProvider {
    pub fn new(capacity_per_type: usize) -> Self {
        Self::with_scope(capacity_per_type, CacheScope::All)
    }

    /// Provider that caches nothing until types are enabled one by one.
    pub fn opt_in(capacity_per_type: usize) -> Self {
        Self::with_scope(capacity_per_type, CacheScope::Only(HashSet::new()))
    }

    pub fn with_scope(capacity_per_type: usize, scope: CacheScope) -> Self {
        Self {
            capacity_per_type: NonZeroUsize::new(capacity_per_type).unwrap_or(NonZeroUsize::MIN),
            scope: RwLock::new(scope),
            types: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn enable_for(&self, name: &str) {
        let mut scope = self.scope.write();
        match &mut *scope {
            CacheScope::All => {}
            CacheScope::AllExcept(excluded) => {
                excluded.remove(name);
                if excluded.is_empty() {
                    *scope = CacheScope::All;
                }
            }
            CacheScope::Only(names) => {
                names.insert(name.to_string());
            }
        }
    }

    /// Stops caching `name` and drops what was cached for it.
    pub fn disable_for(&self, name: &str) {
        {
            let mut scope = self.scope.write();
            match &mut *scope {
                CacheScope::All => {
                    *scope = CacheScope::AllExcept(HashSet::from([name.to_string()]));
                }
                CacheScope::AllExcept(excluded) => {
                    excluded.insert(name.to_string());
                }
                CacheScope::Only(names) => {
                    names.remove(name);
                }
            }
        }
        self.types.lock().remove(name);
    }

    pub fn is_enabled_for_name(&self, name: &str) -> bool {
        match &*self.scope.read() {
            CacheScope::All => true,
            CacheScope::AllExcept(excluded) => !excluded.contains(name),
            CacheScope::Only(names) => names.contains(name),
        }
    }

    pub fn len_for(&self, name: &str) -> usize {
        self.types.lock().get(name).map_or(0, |cache| cache.len())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.types.lock().values().map(|cache| cache.len()).sum(),
        }
    }
}

impl CacheProvider for LruCacheProvider {
    fn is_enabled_for(&self, schema: &StructureSchema) -> bool {
        self.is_enabled_for_name(schema.name())
    }

    fn get(&self, schema: &StructureSchema, id: &StructureId) -> Option<Arc<str>> {
        let hit = self
            .types
            .lock()
            .get_mut(schema.name())
            .and_then(|cache| cache.get(id).cloned());
        let counter = if hit.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    fn put(&self, schema: &StructureSchema, id: &StructureId, payload: Arc<str>) {
        let capacity = self.capacity_per_type;
        self.types
            .lock()
            .entry(schema.name().to_string())
            .or_insert_with(|| LruCache::new(capacity))
            .put(id.clone(), payload);
    }

    fn notify_deleting(&self, schema: &StructureSchema, id: &StructureId) {
        if let Some(cache) = self.types.lock().get_mut(schema.name()) {
            cache.pop(id);
        }
    }

    fn notify_deleting_many(&self, schema: &StructureSchema, ids: &[StructureId]) {
        if let Some(cache) = self.types.lock().get_mut(schema.name()) {
            for id in ids {
                cache.pop(id);
            }
        }
    }

    fn notify_of_purge(&self, schema: &StructureSchema) {
        self.types.lock().remove(schema.name());
    }

    fn clear(&self) {
        self.types.lock().clear();
    }
}
