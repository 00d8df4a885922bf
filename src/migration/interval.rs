use crate::error::StoreError;
use crate::store::StoreClient;
use crate::structure::{StructureId, StructureSchema};

/// Closed range of identities, widened as ids are marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdInterval {
    from: i64,
    to: i64,
}

impl IdInterval {
    pub fn new(id: i64) -> Self {
        Self { from: id, to: id }
    }

    pub fn widen(&mut self, id: i64) {
        self.from = self.from.min(id);
        self.to = self.to.max(id);
    }

    pub fn from(&self) -> i64 {
        self.from
    }

    pub fn to(&self) -> i64 {
        self.to
    }

    pub fn contains(&self, id: i64) -> bool {
        (self.from..=self.to).contains(&id)
    }
}

#[derive(Debug)]
enum Marks {
    Interval(Option<IdInterval>),
    Ids(Vec<StructureId>),
}

/// Ids marked for deletion from the old structure set during a migration
/// batch. Sequential ids are visited in order, so a running interval
/// covers them all and is flushed as one ranged delete.
#[derive(Debug)]
pub struct DeleteMarks {
    marks: Marks,
    marked: usize,
}

impl DeleteMarks {
    pub fn for_schema(schema: &StructureSchema) -> Self {
        let marks = if schema.id_is_sequential() {
            Marks::Interval(None)
        } else {
            Marks::Ids(Vec::new())
        };
        Self { marks, marked: 0 }
    }

    pub fn mark(&mut self, id: StructureId) -> Result<(), StoreError> {
        match &mut self.marks {
            Marks::Interval(interval) => {
                let Some(value) = id.as_identity() else {
                    return Err(StoreError::Validation(format!(
                        "cannot mark non-identity id {id} in an identity interval"
                    )));
                };
                match interval {
                    Some(interval) => interval.widen(value),
                    None => *interval = Some(IdInterval::new(value)),
                }
            }
            Marks::Ids(ids) => ids.push(id),
        }
        self.marked += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.marked
    }

    pub fn is_empty(&self) -> bool {
        self.marked == 0
    }

    pub fn interval(&self) -> Option<IdInterval> {
        match &self.marks {
            Marks::Interval(interval) => *interval,
            Marks::Ids(_) => None,
        }
    }

    /// Deletes the marked rows through `client` and resets the marks.
    pub fn flush(
        &mut self,
        client: &mut dyn StoreClient,
        schema: &StructureSchema,
    ) -> Result<(), StoreError> {
        match &mut self.marks {
            Marks::Interval(interval) => {
                if let Some(range) = interval.take() {
                    client.delete_where_id_between(
                        schema,
                        &StructureId::Identity(range.from),
                        &StructureId::Identity(range.to),
                    )?;
                }
            }
            Marks::Ids(ids) => {
                if !ids.is_empty() {
                    client.delete_by_ids(schema, ids)?;
                    ids.clear();
                }
            }
        }
        self.marked = 0;
        Ok(())
    }
}
