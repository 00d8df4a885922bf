use crate::error::StoreError;
use crate::serializer::PayloadSerializer;
use crate::store::StoreClient;
use crate::structure::{StructureId, StructureSchema};
use serde_json::Value;

/// Reads the stored document for `id` under the store's row lock. The lock
/// is held until the transaction ends, so concurrent updaters of the same
/// id queue up behind this one.
pub fn load_for_update(
    client: &mut dyn StoreClient,
    serializer: &dyn PayloadSerializer,
    schema: &StructureSchema,
    id: &StructureId,
) -> Result<Value, StoreError> {
    let payload = client
        .get_payload_by_id_with_lock(schema, id)?
        .ok_or_else(|| StoreError::NotFoundForUpdate {
            structure: schema.name().to_string(),
            id: id.clone(),
        })?;
    serializer.from_payload(&payload)
}

/// Optimistic concurrency check run on every update of a schema that
/// carries a concurrency token.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticConcurrencyController;

impl OptimisticConcurrencyController {
    /// Compares the incoming token against the stored one and, when they
    /// match, writes the advanced token into `incoming`. Schemas without a
    /// token pass through untouched.
    pub fn check_and_advance(
        &self,
        schema: &StructureSchema,
        id: &StructureId,
        stored: &Value,
        incoming: &mut Value,
    ) -> Result<(), StoreError> {
        if !schema.has_concurrency_token() {
            return Ok(());
        }
        let (Some(stored_token), Some(incoming_token)) =
            (schema.read_token(stored)?, schema.read_token(incoming)?)
        else {
            return Ok(());
        };
        if stored_token != incoming_token {
            return Err(StoreError::ConcurrencyConflict {
                structure: schema.name().to_string(),
                id: id.clone(),
            });
        }
        let next = stored_token.advance().ok_or_else(|| {
            StoreError::Validation(format!(
                "concurrency token of '{}' id {id} cannot be advanced past {stored_token:?}",
                schema.name()
            ))
        })?;
        schema.write_token(incoming, &next)
    }
}
