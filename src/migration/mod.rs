pub mod interval;

pub use interval::{DeleteMarks, IdInterval};

use crate::Database;
use crate::error::StoreError;
use crate::serializer::{from_document, to_document};
use crate::store::{ClientGuard, PayloadCursor, StoreClient};
use crate::structure::{Document, StructureBuilder, StructureSchema};
use serde_json::Value;
use std::any::TypeId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of the transform for one migrated item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Keep,
    Trash,
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub visited: u64,
    pub kept: u64,
    pub trashed: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Completed(MigrationReport),
    /// The transform returned `Abort`; the migration transaction was rolled
    /// back and both structure sets are as they were before.
    Aborted(MigrationReport),
}

impl MigrationOutcome {
    pub fn report(&self) -> &MigrationReport {
        match self {
            Self::Completed(report) | Self::Aborted(report) => report,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

enum Step {
    Finished,
    Aborted,
}

/// Rewrites every stored `Old` item as a `New` item inside one transaction,
/// flushing deletes and inserts in bounded batches.
pub struct StructureSetMigrator<'db> {
    db: &'db Database,
    batch_size: usize,
    page_size: usize,
}

struct MigrationRun<'a> {
    old_schema: Arc<StructureSchema>,
    new_schema: Arc<StructureSchema>,
    db: &'a Database,
    batch_size: usize,
    marks: DeleteMarks,
    keep: Vec<Value>,
    report: MigrationReport,
}

impl<'db> StructureSetMigrator<'db> {
    pub(crate) fn new(db: &'db Database) -> Self {
        Self {
            db,
            batch_size: db.config().migration_batch_size.max(1),
            page_size: db.config().read_page_size.max(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Migrates every stored `Old` into a `New`.
    ///
    /// `Old` and `New` must be distinct Rust types with the same id type.
    /// When both name the same structure set the migration reshapes it in
    /// place; otherwise the `Old` set is dropped once every item was moved.
    /// The transform must not change the id of the `New` item.
    pub fn migrate<Old, New, F>(&self, mut transform: F) -> Result<MigrationOutcome, StoreError>
    where
        Old: Document,
        New: Document,
        F: FnMut(&Old, &mut New) -> MigrationStatus,
    {
        if TypeId::of::<Old>() == TypeId::of::<New>() {
            return Err(StoreError::Validation(format!(
                "cannot migrate {} to itself",
                std::any::type_name::<Old>()
            )));
        }

        let schemas = self.db.schemas();
        let old_schema = schemas.get_or_describe::<Old>();
        let new_name = New::describe_schema().name().to_string();
        let in_place = old_schema.name() == new_name;
        if in_place {
            schemas.remove(&new_name);
        }
        let new_schema = schemas.get_or_describe::<New>();
        if old_schema.id_type() != new_schema.id_type() {
            if !in_place {
                schemas.remove(new_schema.name());
            }
            return Err(StoreError::Validation(format!(
                "cannot migrate '{}' ({:?} ids) to '{}' ({:?} ids)",
                old_schema.name(),
                old_schema.id_type(),
                new_schema.name(),
                new_schema.id_type()
            )));
        }

        let started = Instant::now();
        info!(
            from = old_schema.name(),
            to = new_schema.name(),
            in_place,
            batch_size = self.batch_size,
            "structure set migration started"
        );

        let mut run = MigrationRun {
            marks: DeleteMarks::for_schema(&old_schema),
            old_schema,
            new_schema,
            db: self.db,
            batch_size: self.batch_size,
            keep: Vec::with_capacity(self.batch_size),
            report: MigrationReport::default(),
        };

        let engine = self.db.engine();
        let mut tx = ClientGuard::new(engine.transactional_client()?);
        let mut reader = engine.non_transactional_client()?;
        let step = run
            .execute::<Old, New, F>(tx.client(), reader.as_mut(), self.page_size, &mut transform)
            .and_then(|step| match step {
                Step::Finished => {
                    if !in_place {
                        tx.client().drop_structure_set(run.old_schema.name())?;
                    }
                    tx.commit()?;
                    Ok(Step::Finished)
                }
                Step::Aborted => Ok(Step::Aborted),
            });

        match step {
            Ok(Step::Finished) => {
                if !in_place {
                    schemas.remove(run.old_schema.name());
                }
                run.purge_caches();
                info!(
                    from = run.old_schema.name(),
                    to = run.new_schema.name(),
                    visited = run.report.visited,
                    kept = run.report.kept,
                    trashed = run.report.trashed,
                    batches = run.report.batches,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "structure set migration completed"
                );
                Ok(MigrationOutcome::Completed(run.report))
            }
            Ok(Step::Aborted) => {
                tx.client().mark_as_failed();
                tx.rollback()?;
                if !in_place {
                    schemas.remove(run.new_schema.name());
                }
                run.purge_caches();
                warn!(
                    from = run.old_schema.name(),
                    to = run.new_schema.name(),
                    visited = run.report.visited,
                    batches = run.report.batches,
                    "structure set migration aborted by transform"
                );
                Ok(MigrationOutcome::Aborted(run.report))
            }
            Err(err) => {
                if !tx.is_completed() {
                    tx.client().mark_as_failed();
                    if let Err(rollback_err) = tx.rollback() {
                        warn!(error = %rollback_err, "rollback of failed migration failed");
                    }
                }
                if !in_place {
                    schemas.remove(run.new_schema.name());
                }
                run.purge_caches();
                warn!(
                    from = run.old_schema.name(),
                    to = run.new_schema.name(),
                    error = %err,
                    "structure set migration failed"
                );
                Err(err)
            }
        }
    }
}

impl MigrationRun<'_> {
    fn execute<Old, New, F>(
        &mut self,
        tx: &mut dyn StoreClient,
        reader: &mut dyn StoreClient,
        page_size: usize,
        transform: &mut F,
    ) -> Result<Step, StoreError>
    where
        Old: Document,
        New: Document,
        F: FnMut(&Old, &mut New) -> MigrationStatus,
    {
        tx.upsert_structure_set(&self.new_schema)?;

        let db = self.db;
        let serializer = db.serializer();
        let mut cursor = PayloadCursor::new(Arc::clone(&self.old_schema), page_size);
        while let Some(row) = cursor.next_payload(reader)? {
            self.report.visited += 1;
            let document = serializer.from_payload(&row.payload)?;
            let id_before = self.old_schema.require_id(&document)?;
            let old_item: Old = from_document(document.clone())?;
            let mut new_item: New = from_document(document)?;

            let status = transform(&old_item, &mut new_item);
            if status == MigrationStatus::Abort {
                return Ok(Step::Aborted);
            }

            let new_document = to_document(&new_item)?;
            let id_after = self.new_schema.read_id(&new_document)?;
            if id_after.as_ref() != Some(&id_before) {
                return Err(StoreError::IdentityMismatch {
                    structure: self.new_schema.name().to_string(),
                    before: id_before,
                    after: id_after.map_or_else(|| "<none>".to_string(), |id| id.to_string()),
                });
            }

            self.marks.mark(id_before)?;
            if status == MigrationStatus::Keep {
                self.keep.push(new_document);
                self.report.kept += 1;
            } else {
                self.report.trashed += 1;
            }
            if self.keep.len() >= self.batch_size || self.marks.len() >= self.batch_size {
                self.flush(tx)?;
            }
        }
        self.flush(tx)?;
        Ok(Step::Finished)
    }

    fn flush(&mut self, tx: &mut dyn StoreClient) -> Result<(), StoreError> {
        if self.marks.is_empty() {
            return Ok(());
        }
        let interval = self.marks.interval();
        let deleted = self.marks.len();
        self.marks.flush(tx, &self.old_schema)?;

        let inserted = self.keep.len();
        if !self.keep.is_empty() {
            let structures = StructureBuilder::new(self.db.serializer()).create_structures(
                &mut self.keep,
                &self.new_schema,
                tx,
            )?;
            tx.bulk_insert(&self.new_schema, structures)?;
            self.keep.clear();
        }

        self.report.batches += 1;
        debug!(
            from = self.old_schema.name(),
            to = self.new_schema.name(),
            batch = self.report.batches,
            deleted,
            inserted,
            interval_from = interval.map(|i| i.from()),
            interval_to = interval.map(|i| i.to()),
            "flushed migration batch"
        );
        Ok(())
    }

    fn purge_caches(&self) {
        let cache = self.db.cache();
        for schema in [&self.old_schema, &self.new_schema] {
            if cache.is_enabled_for(schema) {
                cache.notify_of_purge(schema);
            }
        }
    }
}
