pub mod lru_cache;

pub use lru_cache::{CacheScope, CacheStats, LruCacheProvider};

use crate::error::StoreError;
use crate::store::StoredPayload;
use crate::structure::{StructureId, StructureSchema};
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a value fetched from the store on a cache miss is handed back to
/// the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheConsumeMode {
    #[default]
    UpdateCacheWithDbResult,
    DoNotUpdateCacheWithDbResult,
}

impl CacheConsumeMode {
    pub fn populates(self) -> bool {
        self == Self::UpdateCacheWithDbResult
    }
}

/// Read-through cache of stored payloads, keyed per structure type.
///
/// One provider is shared by every session of a database, so
/// implementations must be internally synchronized. Every call other than
/// `is_enabled_for` is only made for schemas the provider reports enabled.
pub trait CacheProvider: Send + Sync {
    fn is_enabled_for(&self, schema: &StructureSchema) -> bool;

    fn get(&self, schema: &StructureSchema, id: &StructureId) -> Option<Arc<str>>;
    fn put(&self, schema: &StructureSchema, id: &StructureId, payload: Arc<str>);

    fn notify_deleting(&self, schema: &StructureSchema, id: &StructureId);

    fn notify_deleting_many(&self, schema: &StructureSchema, ids: &[StructureId]) {
        for id in ids {
            self.notify_deleting(schema, id);
        }
    }

    /// Drops every entry of the schema's type.
    fn notify_of_purge(&self, schema: &StructureSchema);

    fn clear(&self);
}

/// Cache that is never enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl CacheProvider for NoCache {
    fn is_enabled_for(&self, _schema: &StructureSchema) -> bool {
        false
    }

    fn get(&self, _schema: &StructureSchema, _id: &StructureId) -> Option<Arc<str>> {
        None
    }

    fn put(&self, _schema: &StructureSchema, _id: &StructureId, _payload: Arc<str>) {}

    fn notify_deleting(&self, _schema: &StructureSchema, _id: &StructureId) {}

    fn notify_of_purge(&self, _schema: &StructureSchema) {}

    fn clear(&self) {}
}

/// Point read through the cache: a hit skips the store; a miss calls
/// `fallback` and, when `mode` allows it, stores what came back.
pub fn consume<F>(
    cache: &dyn CacheProvider,
    schema: &StructureSchema,
    id: &StructureId,
    mode: CacheConsumeMode,
    fallback: F,
) -> Result<Option<Arc<str>>, StoreError>
where
    F: FnOnce() -> Result<Option<Arc<str>>, StoreError>,
{
    if !cache.is_enabled_for(schema) {
        return fallback();
    }
    if let Some(hit) = cache.get(schema, id) {
        return Ok(Some(hit));
    }
    let fetched = fallback()?;
    if mode.populates()
        && let Some(payload) = &fetched
    {
        cache.put(schema, id, Arc::clone(payload));
    }
    Ok(fetched)
}

/// Multi-id read through the cache. Only the misses reach `fallback`; the
/// result keeps the order of `ids` and skips ids found nowhere.
pub fn consume_many<F>(
    cache: &dyn CacheProvider,
    schema: &StructureSchema,
    ids: &[StructureId],
    mode: CacheConsumeMode,
    fallback: F,
) -> Result<Vec<StoredPayload>, StoreError>
where
    F: FnOnce(&[StructureId]) -> Result<Vec<StoredPayload>, StoreError>,
{
    if !cache.is_enabled_for(schema) {
        return fallback(ids);
    }

    let mut found: HashMap<StructureId, Arc<str>> = HashMap::with_capacity(ids.len());
    let mut misses = Vec::new();
    for id in ids {
        match cache.get(schema, id) {
            Some(payload) => {
                found.insert(id.clone(), payload);
            }
            None => misses.push(id.clone()),
        }
    }

    if !misses.is_empty() {
        for row in fallback(&misses)? {
            if mode.populates() {
                cache.put(schema, &row.id, Arc::clone(&row.payload));
            }
            found.insert(row.id, row.payload);
        }
    }

    Ok(ids
        .iter()
        .filter_map(|id| {
            found.get(id).map(|payload| StoredPayload {
                id: id.clone(),
                payload: Arc::clone(payload),
            })
        })
        .collect())
}
