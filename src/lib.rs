pub mod cache;
pub mod config;
pub mod error;
#[cfg(test)]
mod lib_tests;
pub mod migration;
pub mod serializer;
pub mod session;
pub mod store;
pub mod structure;

pub use crate::cache::{CacheConsumeMode, CacheProvider, LruCacheProvider, NoCache};
pub use crate::config::{DatabaseConfig, IsolationLevel};
pub use crate::error::{StoreError, StoreErrorCode};
pub use crate::migration::{
    MigrationOutcome, MigrationReport, MigrationStatus, StructureSetMigrator,
};
pub use crate::serializer::{JsonSerializer, PayloadSerializer};
pub use crate::session::{
    Session, SessionStatus, UpdateManyModifierStatus, UpdateManyOutcome, UpdateManyReport,
};
pub use crate::store::{MemoryEngine, StoreClient, StoreEngine};
pub use crate::structure::{
    ConcurrencyToken, Document, IdType, StructureId, StructureSchema, TokenType,
};

use crate::structure::SchemaCache;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Summary of a finished session handed to every [`SessionHook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: Uuid,
    /// Structure sets the session wrote to, sorted by name.
    pub structure_sets: Vec<String>,
    pub status: SessionStatus,
}

/// Observer of session outcomes. Hooks run on the disposing thread after
/// the transaction has ended; a panicking hook is logged and skipped.
pub trait SessionHook: Send + Sync {
    fn on_committed(&self, _event: &SessionEvent) {}
    fn on_rolled_back(&self, _event: &SessionEvent) {}
}

/// Handle onto one document store: configuration, the store engine, the
/// serializer and cache shared by all sessions, and the schema cache.
pub struct Database {
    config: DatabaseConfig,
    engine: Arc<dyn StoreEngine>,
    serializer: Arc<dyn PayloadSerializer>,
    cache: Arc<dyn CacheProvider>,
    schemas: SchemaCache,
    session_hooks: Mutex<Vec<Arc<dyn SessionHook>>>,
}

#[derive(Default)]
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    engine: Option<Arc<dyn StoreEngine>>,
    serializer: Option<Arc<dyn PayloadSerializer>>,
    cache: Option<Arc<dyn CacheProvider>>,
    lru_cache: bool,
}

impl DatabaseBuilder {
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn StoreEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self.lru_cache = false;
        self
    }

    /// Caches every structure type in an [`LruCacheProvider`] sized by
    /// `cache_capacity_per_type`.
    pub fn lru_cache(mut self) -> Self {
        self.cache = None;
        self.lru_cache = true;
        self
    }

    pub fn build(self) -> Result<Database, StoreError> {
        let config = self.config;
        config.validate()?;
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(MemoryEngine::from_config(&config)));
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonSerializer::default()));
        let cache: Arc<dyn CacheProvider> = match self.cache {
            Some(cache) => cache,
            None if self.lru_cache => {
                Arc::new(LruCacheProvider::new(config.cache_capacity_per_type))
            }
            None => Arc::new(NoCache),
        };
        info!(
            update_many_batch_size = config.update_many_batch_size,
            migration_batch_size = config.migration_batch_size,
            read_page_size = config.read_page_size,
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            isolation_level = ?config.isolation_level,
            cache_capacity_per_type = config.cache_capacity_per_type,
            "structdb database opened"
        );
        Ok(Database {
            config,
            engine,
            serializer,
            cache,
            schemas: SchemaCache::default(),
            session_hooks: Mutex::new(Vec::new()),
        })
    }
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Database over a fresh [`MemoryEngine`] with default settings.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::builder().build()
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn engine(&self) -> &dyn StoreEngine {
        self.engine.as_ref()
    }

    pub fn serializer(&self) -> &dyn PayloadSerializer {
        self.serializer.as_ref()
    }

    pub fn cache(&self) -> &dyn CacheProvider {
        self.cache.as_ref()
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    pub fn schema<T: Document>(&self) -> Arc<StructureSchema> {
        self.schemas.get_or_describe::<T>()
    }

    pub fn begin_session(&self) -> Result<Session<'_>, StoreError> {
        Session::begin(self)
    }

    /// Runs `work` in a fresh session. The session commits when `work`
    /// returns `Ok` and is marked failed and rolled back when it returns
    /// `Err`; either way it is disposed before this returns.
    pub fn use_session<R, F>(&self, work: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Session<'_>) -> Result<R, StoreError>,
    {
        let mut session = self.begin_session()?;
        match work(&mut session) {
            Ok(value) => match session.dispose()? {
                SessionStatus::DisposedWithFailure => Err(StoreError::Transaction(format!(
                    "session {} was disposed with failure; changes were rolled back",
                    session.id()
                ))),
                _ => Ok(value),
            },
            Err(err) => {
                session.mark_as_failed();
                if let Err(dispose_err) = session.dispose() {
                    warn!(
                        session_id = %session.id(),
                        error = %dispose_err,
                        "dispose of failed session failed"
                    );
                }
                Err(err)
            }
        }
    }

    pub fn upsert_structure_set<T: Document>(&self) -> Result<(), StoreError> {
        let schema = self.schema::<T>();
        self.engine
            .non_transactional_client()?
            .upsert_structure_set(&schema)
    }

    /// Drops the structure set of `T` with every stored item and forgets
    /// its schema.
    pub fn drop_structure_set<T: Document>(&self) -> Result<(), StoreError> {
        let schema = self.schema::<T>();
        self.engine
            .non_transactional_client()?
            .drop_structure_set(schema.name())?;
        self.schemas.remove(schema.name());
        if self.cache.is_enabled_for(&schema) {
            self.cache.notify_of_purge(&schema);
        }
        info!(structure = schema.name(), "structure set dropped");
        Ok(())
    }

    pub fn structure_set_exists<T: Document>(&self) -> Result<bool, StoreError> {
        let schema = self.schema::<T>();
        self.engine
            .non_transactional_client()?
            .structure_set_exists(schema.name())
    }

    pub fn migrator(&self) -> StructureSetMigrator<'_> {
        StructureSetMigrator::new(self)
    }

    pub fn add_session_hook(&self, hook: Arc<dyn SessionHook>) {
        self.session_hooks.lock().push(hook);
    }

    pub fn remove_session_hook(&self, hook: &Arc<dyn SessionHook>) {
        let mut hooks = self.session_hooks.lock();
        hooks.retain(|existing| !Arc::ptr_eq(existing, hook));
    }

    pub(crate) fn notify_session_hooks(&self, event: &SessionEvent, committed: bool) {
        let hooks = self.session_hooks.lock().clone();
        for hook in &hooks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                if committed {
                    hook.on_committed(event)
                } else {
                    hook.on_rolled_back(event)
                }
            }));
            if outcome.is_err() {
                warn!(session_id = %event.session_id, "session hook panicked while handling event");
            }
        }
    }
}
