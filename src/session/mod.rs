pub mod concurrency;
pub mod context;
pub mod update_many;

pub use concurrency::{OptimisticConcurrencyController, load_for_update};
pub use context::{ExecutionContext, SessionStatus};
pub use update_many::{
    BatchedMutator, UpdateManyModifierStatus, UpdateManyOutcome, UpdateManyReport,
};

use crate::cache::{self, CacheConsumeMode};
use crate::error::StoreError;
use crate::serializer::{deserialize, from_document, to_document};
use crate::store::{ClientGuard, PayloadCursor, StoreClient};
use crate::structure::{Document, StructureBuilder, StructureId, StructureSchema};
use crate::{Database, SessionEvent};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A unit of work over one transactional store client.
///
/// Every operation runs through the session's [`ExecutionContext`]: the
/// first error fails the session, later calls are refused, and disposal
/// rolls back instead of committing. A session is not meant to be shared
/// between threads; open one per worker instead.
pub struct Session<'db> {
    context: ExecutionContext,
    state: SessionState<'db>,
}

struct SessionState<'db> {
    db: &'db Database,
    tx: ClientGuard,
    /// Non-transactional handle for scans of structure sets this session
    /// has not written to.
    reader: Option<Box<dyn StoreClient>>,
    cache_mode: CacheConsumeMode,
    ensured: HashSet<String>,
    written: HashMap<String, Arc<StructureSchema>>,
    invalidated: HashMap<String, HashSet<StructureId>>,
    purged: HashSet<String>,
}

impl<'db> Session<'db> {
    pub(crate) fn begin(db: &'db Database) -> Result<Self, StoreError> {
        let session_id = Uuid::new_v4();
        let tx = ClientGuard::new(db.engine().transactional_client()?);
        debug!(session_id = %session_id, "session started");
        Ok(Self {
            context: ExecutionContext::new(session_id),
            state: SessionState {
                db,
                tx,
                reader: None,
                cache_mode: CacheConsumeMode::default(),
                ensured: HashSet::new(),
                written: HashMap::new(),
                invalidated: HashMap::new(),
                purged: HashSet::new(),
            },
        })
    }

    pub fn id(&self) -> Uuid {
        self.context.session_id()
    }

    pub fn status(&self) -> SessionStatus {
        self.context.status()
    }

    pub fn is_aborted(&self) -> bool {
        self.context.is_aborted()
    }

    /// Mode selected by the most recent operation.
    pub fn cache_consume_mode(&self) -> CacheConsumeMode {
        self.state.cache_mode
    }

    /// Stops the session without failing it: later operations become
    /// no-ops and disposal rolls back.
    pub fn abort(&mut self) {
        if !self.context.is_aborted() {
            debug!(session_id = %self.id(), "session aborted");
        }
        self.context.abort();
    }

    pub fn mark_as_failed(&mut self) {
        if self.context.status().is_disposed() {
            return;
        }
        self.context.mark_as_failed("marked as failed by caller");
        self.state.tx.client().mark_as_failed();
    }

    fn try_op<T, F>(&mut self, op: F) -> Result<T, StoreError>
    where
        T: Default,
        F: FnOnce(&mut SessionState<'db>) -> Result<T, StoreError>,
    {
        let state = &mut self.state;
        let result = self.context.try_op(|| op(state));
        if self.context.status() == SessionStatus::Failed {
            self.state.tx.client().mark_as_failed();
        }
        result
    }

    /// Inserts `item`, writing the assigned id and initial concurrency
    /// token back into it.
    pub fn insert<T: Document>(&mut self, item: &mut T) -> Result<(), StoreError> {
        self.try_op(|state| state.insert_many(std::slice::from_mut(item)))
    }

    pub fn insert_many<T: Document>(&mut self, items: &mut [T]) -> Result<(), StoreError> {
        self.try_op(|state| state.insert_many(items))
    }

    /// Full replace of a stored item. Runs the concurrency check when the
    /// schema carries a token and writes the advanced token back into
    /// `item`.
    pub fn update<T: Document>(&mut self, item: &mut T) -> Result<(), StoreError> {
        self.try_op(|state| state.update(item))
    }

    /// Read-modify-write of one item while holding its row lock.
    pub fn update_by_id<T, F>(
        &mut self,
        id: impl Into<StructureId>,
        modifier: F,
    ) -> Result<(), StoreError>
    where
        T: Document,
        F: FnOnce(&mut T),
    {
        let id = id.into();
        self.try_op(|state| state.update_by_id::<T, F>(id, modifier))
    }

    /// Rewrites every item matching `predicate` in batches. An `Abort` from
    /// the modifier also aborts the session.
    pub fn update_many<T, P, F>(
        &mut self,
        predicate: P,
        modifier: F,
    ) -> Result<UpdateManyOutcome, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
        F: FnMut(&mut T) -> UpdateManyModifierStatus,
    {
        let outcome = self.try_op(|state| state.update_many::<T, P, F>(predicate, modifier))?;
        if !outcome.is_completed() && !self.context.is_aborted() {
            self.abort();
        }
        Ok(outcome)
    }

    pub fn delete_by_id<T: Document>(
        &mut self,
        id: impl Into<StructureId>,
    ) -> Result<(), StoreError> {
        let id = id.into();
        self.try_op(|state| state.delete_by_ids::<T>(std::slice::from_ref(&id)))
    }

    pub fn delete_by_ids<T: Document>(&mut self, ids: &[StructureId]) -> Result<(), StoreError> {
        self.try_op(|state| state.delete_by_ids::<T>(ids))
    }

    /// Deletes every item whose identity lies in `from..=to`.
    pub fn delete_by_id_interval<T: Document>(
        &mut self,
        from: i64,
        to: i64,
    ) -> Result<(), StoreError> {
        self.try_op(|state| state.delete_by_id_interval::<T>(from, to))
    }

    /// Deletes every item matching `predicate` and returns how many went.
    pub fn delete_by_query<T, P>(&mut self, predicate: P) -> Result<u64, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
    {
        self.try_op(|state| state.delete_by_query::<T, P>(predicate))
    }

    pub fn clear<T: Document>(&mut self) -> Result<(), StoreError> {
        self.try_op(|state| state.clear::<T>())
    }

    pub fn get_by_id<T: Document>(
        &mut self,
        id: impl Into<StructureId>,
    ) -> Result<Option<T>, StoreError> {
        let id = id.into();
        self.try_op(|state| state.get_by_id(&id))
    }

    /// Items for the ids that exist, in the order asked for.
    pub fn get_by_ids<T: Document>(&mut self, ids: &[StructureId]) -> Result<Vec<T>, StoreError> {
        self.try_op(|state| state.get_by_ids(ids))
    }

    pub fn get_by_id_interval<T: Document>(
        &mut self,
        from: i64,
        to: i64,
    ) -> Result<Vec<T>, StoreError> {
        self.try_op(|state| state.get_by_id_interval(from, to))
    }

    pub fn query<T, P>(&mut self, predicate: P) -> Result<Vec<T>, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
    {
        self.try_op(|state| state.query::<T, P>(predicate, None))
    }

    pub fn query_first<T, P>(&mut self, predicate: P) -> Result<Option<T>, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
    {
        self.try_op(|state| Ok(state.query::<T, P>(predicate, Some(1))?.into_iter().next()))
    }

    pub fn get_all<T: Document>(&mut self) -> Result<Vec<T>, StoreError> {
        self.try_op(|state| state.query(|_: &T| true, None))
    }

    pub fn count<T: Document>(&mut self) -> Result<u64, StoreError> {
        self.try_op(|state| state.count::<T>())
    }

    pub fn exists<T: Document>(&mut self, id: impl Into<StructureId>) -> Result<bool, StoreError> {
        let id = id.into();
        self.try_op(|state| state.exists::<T>(&id))
    }

    /// Ends the session: commits when it is healthy, rolls back when it
    /// failed or was aborted. Disposing twice is an error.
    pub fn dispose(&mut self) -> Result<SessionStatus, StoreError> {
        let failed = self.context.begin_dispose()? || self.state.tx.is_failed();
        let aborted = self.context.is_aborted();
        let result = if failed || aborted {
            self.state.tx.client().mark_as_failed();
            self.state.tx.rollback()
        } else {
            self.state.tx.commit()
        };
        let committed = result.is_ok() && !failed && !aborted;
        self.context.finish_dispose(failed || result.is_err());
        self.finish(committed);
        result.map(|()| self.context.status())
    }

    fn finish(&mut self, committed: bool) {
        self.state.reader = None;
        self.state.reinvalidate();
        let mut structure_sets: Vec<String> = self.state.written.keys().cloned().collect();
        structure_sets.sort();
        let event = SessionEvent {
            session_id: self.id(),
            structure_sets,
            status: self.context.status(),
        };
        info!(
            session_id = %event.session_id,
            committed,
            aborted = self.context.is_aborted(),
            status = ?event.status,
            written_sets = event.structure_sets.len(),
            "session disposed"
        );
        self.state.db.notify_session_hooks(&event, committed);
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.context.status().is_disposed() {
            return;
        }
        warn!(session_id = %self.id(), "session dropped without dispose; rolling back");
        if let Err(err) = self.state.tx.rollback() {
            warn!(session_id = %self.id(), error = %err, "rollback of dropped session failed");
        }
        let failed = self.context.status() == SessionStatus::Failed;
        self.context.finish_dispose(failed);
        self.finish(false);
    }
}

impl<'db> SessionState<'db> {
    fn schema<T: Document>(&self) -> Arc<StructureSchema> {
        self.db.schemas().get_or_describe::<T>()
    }

    fn prepare_read<T: Document>(&mut self) -> Arc<StructureSchema> {
        self.cache_mode = CacheConsumeMode::UpdateCacheWithDbResult;
        self.schema::<T>()
    }

    fn prepare_write<T: Document>(&mut self) -> Result<Arc<StructureSchema>, StoreError> {
        self.cache_mode = CacheConsumeMode::DoNotUpdateCacheWithDbResult;
        let schema = self.schema::<T>();
        if !self.ensured.contains(schema.name()) {
            let client = self.tx.client();
            if !client.structure_set_exists(schema.name())? {
                client.upsert_structure_set(&schema)?;
            }
            self.ensured.insert(schema.name().to_string());
        }
        self.written
            .entry(schema.name().to_string())
            .or_insert_with(|| Arc::clone(&schema));
        Ok(schema)
    }

    /// Cache reads are skipped for sets this session has written, so state
    /// that may still roll back is never served from or put into the cache.
    fn cache_usable(&self, schema: &StructureSchema) -> bool {
        !self.written.contains_key(schema.name()) && self.db.cache().is_enabled_for(schema)
    }

    fn invalidate_ids(&mut self, schema: &StructureSchema, ids: &[StructureId]) {
        let cache = self.db.cache();
        if ids.is_empty() || !cache.is_enabled_for(schema) {
            return;
        }
        cache.notify_deleting_many(schema, ids);
        self.invalidated
            .entry(schema.name().to_string())
            .or_default()
            .extend(ids.iter().cloned());
    }

    fn purge(&mut self, schema: &StructureSchema) {
        let cache = self.db.cache();
        if !cache.is_enabled_for(schema) {
            return;
        }
        cache.notify_of_purge(schema);
        self.purged.insert(schema.name().to_string());
    }

    /// Repeats every invalidation once the transaction has ended, dropping
    /// anything other sessions cached from pre-commit state in between.
    fn reinvalidate(&mut self) {
        let cache = self.db.cache();
        for name in self.purged.drain() {
            if let Some(schema) = self.written.get(&name)
                && cache.is_enabled_for(schema)
            {
                cache.notify_of_purge(schema);
            }
        }
        for (name, ids) in self.invalidated.drain() {
            if let Some(schema) = self.written.get(&name)
                && cache.is_enabled_for(schema)
            {
                let ids: Vec<StructureId> = ids.into_iter().collect();
                cache.notify_deleting_many(schema, &ids);
            }
        }
    }

    fn scan_client(&mut self, schema: &StructureSchema) -> Result<&mut dyn StoreClient, StoreError> {
        if self.written.contains_key(schema.name()) {
            return Ok(self.tx.client());
        }
        if self.reader.is_none() {
            self.reader = Some(self.db.engine().non_transactional_client()?);
        }
        match self.reader.as_mut() {
            Some(reader) => Ok(reader.as_mut()),
            None => Err(StoreError::Transaction("reader client unavailable".into())),
        }
    }

    fn insert_many<T: Document>(&mut self, items: &mut [T]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let schema = self.prepare_write::<T>()?;
        let db = self.db;
        let mut documents = items
            .iter()
            .map(to_document)
            .collect::<Result<Vec<Value>, StoreError>>()?;
        let structures = StructureBuilder::new(db.serializer()).create_structures(
            &mut documents,
            &schema,
            self.tx.client(),
        )?;
        let ids: Vec<StructureId> = structures.iter().map(|s| s.id.clone()).collect();
        self.invalidate_ids(&schema, &ids);
        self.tx.client().bulk_insert(&schema, structures)?;
        for (item, document) in items.iter_mut().zip(documents) {
            *item = from_document(document)?;
        }
        Ok(())
    }

    fn update<T: Document>(&mut self, item: &mut T) -> Result<(), StoreError> {
        let schema = self.prepare_write::<T>()?;
        let mut document = to_document(item)?;
        let id = schema.require_id(&document)?;
        self.invalidate_ids(&schema, std::slice::from_ref(&id));
        let stored = load_for_update(self.tx.client(), self.db.serializer(), &schema, &id)?;
        self.replace(&schema, &id, &stored, &mut document)?;
        *item = from_document(document)?;
        Ok(())
    }

    fn update_by_id<T, F>(&mut self, id: StructureId, modifier: F) -> Result<(), StoreError>
    where
        T: Document,
        F: FnOnce(&mut T),
    {
        let schema = self.prepare_write::<T>()?;
        self.invalidate_ids(&schema, std::slice::from_ref(&id));
        let stored = load_for_update(self.tx.client(), self.db.serializer(), &schema, &id)?;
        let mut item: T = from_document(stored.clone())?;
        modifier(&mut item);
        let mut document = to_document(&item)?;
        let id_after = schema.read_id(&document)?;
        if id_after.as_ref() != Some(&id) {
            return Err(StoreError::IdentityMismatch {
                structure: schema.name().to_string(),
                before: id,
                after: id_after.map_or_else(|| "<none>".to_string(), |id| id.to_string()),
            });
        }
        self.replace(&schema, &id, &stored, &mut document)
    }

    fn replace(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
        stored: &Value,
        document: &mut Value,
    ) -> Result<(), StoreError> {
        OptimisticConcurrencyController.check_and_advance(schema, id, stored, document)?;
        let db = self.db;
        let client = self.tx.client();
        client.delete_by_id(schema, id)?;
        let structure =
            StructureBuilder::new(db.serializer()).create_structure(document, schema, client)?;
        client.bulk_insert(schema, vec![structure])
    }

    fn update_many<T, P, F>(
        &mut self,
        predicate: P,
        modifier: F,
    ) -> Result<UpdateManyOutcome, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
        F: FnMut(&mut T) -> UpdateManyModifierStatus,
    {
        let schema = self.prepare_write::<T>()?;
        let db = self.db;
        let config = db.config();
        let mut mutator = BatchedMutator::new(
            Arc::clone(&schema),
            db.serializer(),
            db.cache(),
            config.update_many_batch_size,
            config.read_page_size,
        );
        let outcome = mutator.run::<T, P, F>(self.tx.client(), predicate, modifier);
        if db.cache().is_enabled_for(&schema) && !mutator.invalidated_ids().is_empty() {
            self.invalidated
                .entry(schema.name().to_string())
                .or_default()
                .extend(mutator.invalidated_ids().iter().cloned());
        }
        outcome
    }

    fn delete_by_ids<T: Document>(&mut self, ids: &[StructureId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let schema = self.prepare_write::<T>()?;
        self.invalidate_ids(&schema, ids);
        self.tx.client().delete_by_ids(&schema, ids)
    }

    fn delete_by_id_interval<T: Document>(&mut self, from: i64, to: i64) -> Result<(), StoreError> {
        let schema = self.prepare_write::<T>()?;
        require_sequential(&schema, "delete_by_id_interval")?;
        self.purge(&schema);
        self.tx.client().delete_where_id_between(
            &schema,
            &StructureId::Identity(from),
            &StructureId::Identity(to),
        )
    }

    fn delete_by_query<T, P>(&mut self, mut predicate: P) -> Result<u64, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
    {
        let schema = self.prepare_write::<T>()?;
        self.purge(&schema);
        let db = self.db;
        let batch_size = db.config().update_many_batch_size.max(1);
        let client = self.tx.client();
        let mut cursor = PayloadCursor::new(Arc::clone(&schema), db.config().read_page_size);
        let mut pending = Vec::with_capacity(batch_size);
        let mut deleted = 0_u64;
        while let Some(row) = cursor.next_payload(client)? {
            let item: T = deserialize(db.serializer(), &row.payload)?;
            if !predicate(&item) {
                continue;
            }
            pending.push(row.id);
            if pending.len() >= batch_size {
                client.delete_by_ids(&schema, &pending)?;
                deleted += pending.len() as u64;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            client.delete_by_ids(&schema, &pending)?;
            deleted += pending.len() as u64;
        }
        debug!(structure = schema.name(), deleted, "delete by query");
        Ok(deleted)
    }

    fn clear<T: Document>(&mut self) -> Result<(), StoreError> {
        let schema = self.prepare_write::<T>()?;
        self.purge(&schema);
        self.tx.client().delete_all(&schema)
    }

    fn get_by_id<T: Document>(&mut self, id: &StructureId) -> Result<Option<T>, StoreError> {
        let schema = self.prepare_read::<T>();
        let db = self.db;
        let mode = self.cache_mode;
        let payload = if self.cache_usable(&schema) {
            let client = self.tx.client();
            cache::consume(db.cache(), &schema, id, mode, || {
                client.get_payload_by_id(&schema, id)
            })?
        } else {
            self.tx.client().get_payload_by_id(&schema, id)?
        };
        payload
            .map(|payload| deserialize(db.serializer(), &payload))
            .transpose()
    }

    fn get_by_ids<T: Document>(&mut self, ids: &[StructureId]) -> Result<Vec<T>, StoreError> {
        let schema = self.prepare_read::<T>();
        let db = self.db;
        let mode = self.cache_mode;
        let rows = if self.cache_usable(&schema) {
            let client = self.tx.client();
            cache::consume_many(db.cache(), &schema, ids, mode, |misses| {
                client.get_payloads_by_ids(&schema, misses)
            })?
        } else {
            self.tx.client().get_payloads_by_ids(&schema, ids)?
        };
        rows.iter()
            .map(|row| deserialize(db.serializer(), &row.payload))
            .collect()
    }

    fn get_by_id_interval<T: Document>(&mut self, from: i64, to: i64) -> Result<Vec<T>, StoreError> {
        let schema = self.prepare_read::<T>();
        require_sequential(&schema, "get_by_id_interval")?;
        let db = self.db;
        let rows = self.tx.client().get_payloads_by_id_interval(
            &schema,
            &StructureId::Identity(from),
            &StructureId::Identity(to),
        )?;
        rows.iter()
            .map(|row| deserialize(db.serializer(), &row.payload))
            .collect()
    }

    fn query<T, P>(&mut self, mut predicate: P, limit: Option<usize>) -> Result<Vec<T>, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
    {
        let schema = self.prepare_read::<T>();
        let db = self.db;
        let client = self.scan_client(&schema)?;
        let mut cursor = PayloadCursor::new(Arc::clone(&schema), db.config().read_page_size);
        let mut items = Vec::new();
        while let Some(row) = cursor.next_payload(client)? {
            let item: T = deserialize(db.serializer(), &row.payload)?;
            if predicate(&item) {
                items.push(item);
                if limit == Some(items.len()) {
                    break;
                }
            }
        }
        Ok(items)
    }

    fn count<T: Document>(&mut self) -> Result<u64, StoreError> {
        let schema = self.prepare_read::<T>();
        self.scan_client(&schema)?.count(&schema)
    }

    fn exists<T: Document>(&mut self, id: &StructureId) -> Result<bool, StoreError> {
        let schema = self.prepare_read::<T>();
        Ok(self.tx.client().get_payload_by_id(&schema, id)?.is_some())
    }
}

fn require_sequential(schema: &StructureSchema, operation: &'static str) -> Result<(), StoreError> {
    if schema.id_is_sequential() {
        Ok(())
    } else {
        Err(StoreError::UnsupportedByStore {
            structure: schema.name().to_string(),
            operation,
        })
    }
}
