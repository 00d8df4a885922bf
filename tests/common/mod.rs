#![allow(dead_code)]

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use structdb::store::StoredPayload;
use structdb::structure::Structure;
use structdb::{
    Database, DatabaseConfig, Document, IdType, MemoryEngine, StoreClient, StoreEngine,
    StoreError, StructureId, StructureSchema, TokenType,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Routes structdb logs to the test output. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetById,
    GetByIdWithLock,
    ReadPage,
    DeleteByIds(usize),
    DeleteBetween(i64, i64),
    DeleteAll,
    BulkInsert(usize),
    Commit,
    Rollback,
}

/// Engine wrapper that records the store calls made through its clients.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    inner: MemoryEngine,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_commit: Arc<AtomicBool>,
}

impl RecordingEngine {
    pub fn new(inner: MemoryEngine) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes the next transactional commit roll back and report an error.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub fn memory(&self) -> &MemoryEngine {
        &self.inner
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    pub fn deletes(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::DeleteByIds(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn inserts(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::BulkInsert(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn interval_deletes(&self) -> Vec<(i64, i64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::DeleteBetween(from, to) => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    fn wrap(&self, inner: Box<dyn StoreClient>) -> Box<dyn StoreClient> {
        Box::new(RecordingClient {
            inner,
            calls: Arc::clone(&self.calls),
            fail_commit: Arc::clone(&self.fail_commit),
        })
    }
}

impl StoreEngine for RecordingEngine {
    fn transactional_client(&self) -> Result<Box<dyn StoreClient>, StoreError> {
        Ok(self.wrap(self.inner.transactional_client()?))
    }

    fn non_transactional_client(&self) -> Result<Box<dyn StoreClient>, StoreError> {
        Ok(self.wrap(self.inner.non_transactional_client()?))
    }
}

struct RecordingClient {
    inner: Box<dyn StoreClient>,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_commit: Arc<AtomicBool>,
}

impl RecordingClient {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl StoreClient for RecordingClient {
    fn is_transactional(&self) -> bool {
        self.inner.is_transactional()
    }

    fn upsert_structure_set(&mut self, schema: &StructureSchema) -> Result<(), StoreError> {
        self.inner.upsert_structure_set(schema)
    }

    fn drop_structure_set(&mut self, name: &str) -> Result<(), StoreError> {
        self.inner.drop_structure_set(name)
    }

    fn structure_set_exists(&mut self, name: &str) -> Result<bool, StoreError> {
        self.inner.structure_set_exists(name)
    }

    fn next_identity(&mut self, schema: &StructureSchema, count: u64) -> Result<i64, StoreError> {
        self.inner.next_identity(schema, count)
    }

    fn get_payload_by_id(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<Option<Arc<str>>, StoreError> {
        self.record(Call::GetById);
        self.inner.get_payload_by_id(schema, id)
    }

    fn get_payload_by_id_with_lock(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<Option<Arc<str>>, StoreError> {
        self.record(Call::GetByIdWithLock);
        self.inner.get_payload_by_id_with_lock(schema, id)
    }

    fn get_payloads_by_ids(
        &mut self,
        schema: &StructureSchema,
        ids: &[StructureId],
    ) -> Result<Vec<StoredPayload>, StoreError> {
        self.inner.get_payloads_by_ids(schema, ids)
    }

    fn get_payloads_by_id_interval(
        &mut self,
        schema: &StructureSchema,
        from: &StructureId,
        to: &StructureId,
    ) -> Result<Vec<StoredPayload>, StoreError> {
        self.inner.get_payloads_by_id_interval(schema, from, to)
    }

    fn read_page(
        &mut self,
        schema: &StructureSchema,
        after: Option<&StructureId>,
        limit: usize,
    ) -> Result<Vec<StoredPayload>, StoreError> {
        self.record(Call::ReadPage);
        self.inner.read_page(schema, after, limit)
    }

    fn count(&mut self, schema: &StructureSchema) -> Result<u64, StoreError> {
        self.inner.count(schema)
    }

    fn delete_by_id(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<(), StoreError> {
        self.record(Call::DeleteByIds(1));
        self.inner.delete_by_id(schema, id)
    }

    fn delete_by_ids(
        &mut self,
        schema: &StructureSchema,
        ids: &[StructureId],
    ) -> Result<(), StoreError> {
        self.record(Call::DeleteByIds(ids.len()));
        self.inner.delete_by_ids(schema, ids)
    }

    fn delete_where_id_between(
        &mut self,
        schema: &StructureSchema,
        from: &StructureId,
        to: &StructureId,
    ) -> Result<(), StoreError> {
        if let (Some(from), Some(to)) = (from.as_identity(), to.as_identity()) {
            self.record(Call::DeleteBetween(from, to));
        }
        self.inner.delete_where_id_between(schema, from, to)
    }

    fn delete_all(&mut self, schema: &StructureSchema) -> Result<(), StoreError> {
        self.record(Call::DeleteAll);
        self.inner.delete_all(schema)
    }

    fn bulk_insert(
        &mut self,
        schema: &StructureSchema,
        structures: Vec<Structure>,
    ) -> Result<(), StoreError> {
        self.record(Call::BulkInsert(structures.len()));
        self.inner.bulk_insert(schema, structures)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.record(Call::Commit);
        if self.inner.is_transactional() && self.fail_commit.swap(false, Ordering::SeqCst) {
            self.inner.rollback()?;
            return Err(StoreError::Transaction("commit refused by store".into()));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.record(Call::Rollback);
        self.inner.rollback()
    }

    fn mark_as_failed(&mut self) {
        self.inner.mark_as_failed();
    }

    fn is_failed(&self) -> bool {
        self.inner.is_failed()
    }
}

pub fn recording_db(config: DatabaseConfig) -> (Database, RecordingEngine) {
    let engine = RecordingEngine::new(MemoryEngine::from_config(&config));
    let db = Database::builder()
        .config(config)
        .engine(Arc::new(engine.clone()))
        .build()
        .expect("database");
    (db, engine)
}

/// Identity-keyed item without a concurrency token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price_cents: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Product {
    pub fn new(name: &str, price_cents: i64) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            price_cents,
            tags: Vec::new(),
        }
    }
}

impl Document for Product {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Product")
            .id("id", IdType::Identity)
            .build()
    }
}

/// Guid-keyed item with a guid concurrency token and a unique email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Option<uuid::Uuid>,
    pub email: String,
    pub name: String,
    pub etag: Option<uuid::Uuid>,
}

impl Customer {
    pub fn new(email: &str, name: &str) -> Self {
        Self {
            id: None,
            email: email.to_string(),
            name: name.to_string(),
            etag: None,
        }
    }
}

impl Document for Customer {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Customer")
            .id("id", IdType::Guid)
            .concurrency_token("etag", TokenType::Guid)
            .unique("email")
            .build()
    }
}

/// Identity-keyed item with an int32 concurrency token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: i64,
    pub value: i64,
    pub version: i32,
}

impl Counter {
    pub fn new(value: i64) -> Self {
        Self {
            id: 0,
            value,
            version: 0,
        }
    }
}

impl Document for Counter {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Counter")
            .id("id", IdType::Identity)
            .concurrency_token("version", TokenType::Int32)
            .build()
    }
}

pub fn seed_products(db: &Database, count: usize) -> Vec<i64> {
    db.use_session(|session| {
        let mut items: Vec<Product> = (0..count)
            .map(|n| Product::new(&format!("product-{n}"), n as i64 * 100))
            .collect();
        session.insert_many(&mut items)?;
        Ok(items.into_iter().map(|p| p.id).collect())
    })
    .expect("seed products")
}
