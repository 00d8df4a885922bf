use crate::cache::CacheProvider;
use crate::error::StoreError;
use crate::serializer::{PayloadSerializer, deserialize, to_document};
use crate::store::{PayloadCursor, StoreClient};
use crate::structure::{Document, StructureBuilder, StructureId, StructureSchema};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// What the modifier wants done with one visited item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateManyModifierStatus {
    Keep,
    Trash,
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateManyReport {
    pub visited: u64,
    pub kept: u64,
    pub trashed: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateManyOutcome {
    Completed(UpdateManyReport),
    /// The modifier asked to stop. Batches flushed before that stay in the
    /// transaction; the pending batch is discarded.
    Aborted(UpdateManyReport),
}

impl Default for UpdateManyOutcome {
    fn default() -> Self {
        Self::Aborted(UpdateManyReport::default())
    }
}

impl UpdateManyOutcome {
    pub fn report(&self) -> &UpdateManyReport {
        match self {
            Self::Completed(report) | Self::Aborted(report) => report,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Rewrites every item of a structure set that matches a predicate, in
/// batches of replaced rows. Reads go through the same client the batches
/// are written with; keyset paging means a rewritten row is never visited
/// twice. Each matching row is locked and re-read before the modifier sees
/// it, so updates committed after the page was read are not overwritten.
pub struct BatchedMutator<'a> {
    schema: Arc<StructureSchema>,
    serializer: &'a dyn PayloadSerializer,
    cache: &'a dyn CacheProvider,
    batch_size: usize,
    page_size: usize,
    delete_ids: Vec<StructureId>,
    keep: Vec<Value>,
    invalidated: Vec<StructureId>,
    report: UpdateManyReport,
}

impl<'a> BatchedMutator<'a> {
    pub fn new(
        schema: Arc<StructureSchema>,
        serializer: &'a dyn PayloadSerializer,
        cache: &'a dyn CacheProvider,
        batch_size: usize,
        page_size: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            schema,
            serializer,
            cache,
            batch_size,
            page_size: page_size.max(1),
            delete_ids: Vec::with_capacity(batch_size),
            keep: Vec::with_capacity(batch_size),
            invalidated: Vec::new(),
            report: UpdateManyReport::default(),
        }
    }

    pub fn run<T, P, F>(
        &mut self,
        client: &mut dyn StoreClient,
        mut predicate: P,
        mut modifier: F,
    ) -> Result<UpdateManyOutcome, StoreError>
    where
        T: Document,
        P: FnMut(&T) -> bool,
        F: FnMut(&mut T) -> UpdateManyModifierStatus,
    {
        let mut cursor = PayloadCursor::new(Arc::clone(&self.schema), self.page_size);
        while let Some(row) = cursor.next_payload(client)? {
            let item: T = deserialize(self.serializer, &row.payload)?;
            if !predicate(&item) {
                continue;
            }
            // The page was read without locks; rewrite what is committed now.
            let Some(locked) = client.get_payload_by_id_with_lock(&self.schema, &row.id)? else {
                continue;
            };
            let mut item: T = deserialize(self.serializer, &locked)?;
            if !predicate(&item) {
                continue;
            }
            self.report.visited += 1;

            let id_before = row.id;
            let status = modifier(&mut item);
            if status == UpdateManyModifierStatus::Abort {
                debug!(
                    structure = self.schema.name(),
                    discarded = self.delete_ids.len(),
                    "update-many aborted by modifier"
                );
                self.delete_ids.clear();
                self.keep.clear();
                return Ok(UpdateManyOutcome::Aborted(self.report));
            }

            let document = to_document(&item)?;
            let id_after = self.schema.read_id(&document)?;
            if id_after.as_ref() != Some(&id_before) {
                return Err(StoreError::IdentityMismatch {
                    structure: self.schema.name().to_string(),
                    before: id_before,
                    after: id_after.map_or_else(|| "<none>".to_string(), |id| id.to_string()),
                });
            }

            self.delete_ids.push(id_before);
            if status == UpdateManyModifierStatus::Keep {
                self.keep.push(document);
                self.report.kept += 1;
            } else {
                self.report.trashed += 1;
            }
            if self.delete_ids.len() >= self.batch_size {
                self.flush(client)?;
            }
        }
        self.flush(client)?;
        Ok(UpdateManyOutcome::Completed(self.report))
    }

    /// Ids whose cache entries were invalidated by flushed batches.
    pub fn invalidated_ids(&self) -> &[StructureId] {
        &self.invalidated
    }

    fn flush(&mut self, client: &mut dyn StoreClient) -> Result<(), StoreError> {
        if self.delete_ids.is_empty() {
            return Ok(());
        }
        let schema = self.schema.as_ref();
        if self.cache.is_enabled_for(schema) {
            self.cache.notify_deleting_many(schema, &self.delete_ids);
        }
        client.delete_by_ids(schema, &self.delete_ids)?;

        let inserted = self.keep.len();
        if !self.keep.is_empty() {
            let structures = StructureBuilder::new(self.serializer).create_structures(
                &mut self.keep,
                schema,
                client,
            )?;
            client.bulk_insert(schema, structures)?;
        }

        self.report.batches += 1;
        debug!(
            structure = schema.name(),
            batch = self.report.batches,
            deleted = self.delete_ids.len(),
            inserted,
            "flushed update-many batch"
        );
        self.invalidated.append(&mut self.delete_ids);
        self.keep.clear();
        Ok(())
    }
}
