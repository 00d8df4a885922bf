pub mod memory;

pub use memory::MemoryEngine;

use crate::error::StoreError;
use crate::structure::{Structure, StructureId, StructureSchema};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub id: StructureId,
    pub payload: Arc<str>,
}

/// Blocking handle onto the underlying store. Transactional handles buffer
/// their writes until `commit`; non-transactional handles apply each write
/// immediately. Writers hold row locks until their transaction ends, so a
/// row fetched with lock blocks every other writer of that id.
pub trait StoreClient: Send {
    fn is_transactional(&self) -> bool;

    fn upsert_structure_set(&mut self, schema: &StructureSchema) -> Result<(), StoreError>;
    fn drop_structure_set(&mut self, name: &str) -> Result<(), StoreError>;
    fn structure_set_exists(&mut self, name: &str) -> Result<bool, StoreError>;

    /// Reserves `count` consecutive identities and returns the first one.
    /// Reservations survive rollback.
    fn next_identity(&mut self, schema: &StructureSchema, count: u64) -> Result<i64, StoreError>;

    fn get_payload_by_id(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<Option<Arc<str>>, StoreError>;
    fn get_payload_by_id_with_lock(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<Option<Arc<str>>, StoreError>;
    fn get_payloads_by_ids(
        &mut self,
        schema: &StructureSchema,
        ids: &[StructureId],
    ) -> Result<Vec<StoredPayload>, StoreError>;
    fn get_payloads_by_id_interval(
        &mut self,
        schema: &StructureSchema,
        from: &StructureId,
        to: &StructureId,
    ) -> Result<Vec<StoredPayload>, StoreError>;
    /// Keyset page: up to `limit` rows with ids strictly after `after`, in id
    /// order.
    fn read_page(
        &mut self,
        schema: &StructureSchema,
        after: Option<&StructureId>,
        limit: usize,
    ) -> Result<Vec<StoredPayload>, StoreError>;
    fn count(&mut self, schema: &StructureSchema) -> Result<u64, StoreError>;

    fn delete_by_id(&mut self, schema: &StructureSchema, id: &StructureId)
    -> Result<(), StoreError>;
    fn delete_by_ids(
        &mut self,
        schema: &StructureSchema,
        ids: &[StructureId],
    ) -> Result<(), StoreError>;
    fn delete_where_id_between(
        &mut self,
        schema: &StructureSchema,
        from: &StructureId,
        to: &StructureId,
    ) -> Result<(), StoreError>;
    fn delete_all(&mut self, schema: &StructureSchema) -> Result<(), StoreError>;
    fn bulk_insert(
        &mut self,
        schema: &StructureSchema,
        structures: Vec<Structure>,
    ) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;
    fn mark_as_failed(&mut self);
    fn is_failed(&self) -> bool;
}

/// Source of store clients. One engine is shared by every session of a
/// database.
pub trait StoreEngine: Send + Sync {
    fn transactional_client(&self) -> Result<Box<dyn StoreClient>, StoreError>;
    fn non_transactional_client(&self) -> Result<Box<dyn StoreClient>, StoreError>;
}

/// Streams a structure set in id order, one page at a time. The client is
/// passed per call so the caller can keep writing through it between pages.
#[derive(Debug)]
pub struct PayloadCursor {
    schema: Arc<StructureSchema>,
    page_size: usize,
    after: Option<StructureId>,
    buffer: VecDeque<StoredPayload>,
    exhausted: bool,
    pages_read: u64,
}

impl PayloadCursor {
    pub fn new(schema: Arc<StructureSchema>, page_size: usize) -> Self {
        Self {
            schema,
            page_size: page_size.max(1),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
            pages_read: 0,
        }
    }

    pub fn next_payload(
        &mut self,
        client: &mut dyn StoreClient,
    ) -> Result<Option<StoredPayload>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = client.read_page(&self.schema, self.after.as_ref(), self.page_size)?;
            self.pages_read += 1;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.after = Some(last.id.clone());
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }
}

/// Owns a store client and rolls it back when dropped unless it was
/// committed or rolled back explicitly.
pub struct ClientGuard {
    client: Box<dyn StoreClient>,
    completed: bool,
}

impl ClientGuard {
    pub fn new(client: Box<dyn StoreClient>) -> Self {
        Self {
            client,
            completed: false,
        }
    }

    pub fn client(&mut self) -> &mut dyn StoreClient {
        self.client.as_mut()
    }

    pub fn is_failed(&self) -> bool {
        self.client.is_failed()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.completed = true;
        if self.client.is_failed() {
            self.client.rollback()?;
            return Err(StoreError::Transaction(
                "client was marked as failed; rolled back instead of committing".into(),
            ));
        }
        self.client.commit()
    }

    pub fn rollback(&mut self) -> Result<(), StoreError> {
        self.completed = true;
        self.client.rollback()
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if self.completed || !self.client.is_transactional() {
            return;
        }
        if let Err(err) = self.client.rollback() {
            warn!(error = %err, "rollback of abandoned store client failed");
        }
    }
}
