use crate::error::StoreError;
use crate::serializer::PayloadSerializer;
use crate::store::StoreClient;
use crate::structure::{IdType, StructureId, StructureSchema};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// One derived index row: a flattened member path and a scalar value.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub member_path: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueEntry {
    pub member: String,
    pub value: String,
}

/// The storable form of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub id: StructureId,
    pub payload: Arc<str>,
    pub indexes: Vec<IndexEntry>,
    pub uniques: Vec<UniqueEntry>,
}

pub struct StructureBuilder<'a> {
    serializer: &'a dyn PayloadSerializer,
}

impl<'a> StructureBuilder<'a> {
    pub fn new(serializer: &'a dyn PayloadSerializer) -> Self {
        Self { serializer }
    }

    pub fn create_structure(
        &self,
        document: &mut Value,
        schema: &StructureSchema,
        client: &mut dyn StoreClient,
    ) -> Result<Structure, StoreError> {
        let mut structures =
            self.create_structures(std::slice::from_mut(document), schema, client)?;
        structures
            .pop()
            .ok_or_else(|| StoreError::Validation("no structure was built".into()))
    }

    /// Assigns ids to documents that lack one, writing them back into the
    /// documents, then derives payload, index and unique rows. Identity ids
    /// are checked out from the store as one contiguous block.
    pub fn create_structures(
        &self,
        documents: &mut [Value],
        schema: &StructureSchema,
        client: &mut dyn StoreClient,
    ) -> Result<Vec<Structure>, StoreError> {
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents.iter() {
            ids.push(schema.read_id(document)?);
        }

        let missing = ids.iter().filter(|id| id.is_none()).count() as u64;
        let mut next_identity = match schema.id_type() {
            IdType::Identity if missing > 0 => Some(client.next_identity(schema, missing)?),
            _ => None,
        };

        let mut structures = Vec::with_capacity(documents.len());
        for (document, id) in documents.iter_mut().zip(ids) {
            let id = match id {
                Some(id) => id,
                None => {
                    let id = match schema.id_type() {
                        IdType::Guid => StructureId::Guid(Uuid::new_v4()),
                        IdType::Identity => {
                            let Some(value) = next_identity else {
                                return Err(StoreError::Validation(
                                    "identity block exhausted".into(),
                                ));
                            };
                            next_identity = Some(value + 1);
                            StructureId::Identity(value)
                        }
                        IdType::Text => {
                            return Err(StoreError::MissingId {
                                structure: schema.name().to_string(),
                                member: schema.id_member().to_string(),
                            });
                        }
                    };
                    schema.write_id(document, &id)?;
                    id
                }
            };
            schema.ensure_token(document)?;
            structures.push(self.build(document, id, schema)?);
        }
        Ok(structures)
    }

    fn build(
        &self,
        document: &Value,
        id: StructureId,
        schema: &StructureSchema,
    ) -> Result<Structure, StoreError> {
        let payload: Arc<str> = Arc::from(self.serializer.to_payload(document)?);

        let mut indexes = Vec::new();
        if let Value::Object(members) = document {
            for (member, value) in members {
                if member == schema.id_member() {
                    continue;
                }
                flatten_into(member, value, &mut indexes);
            }
        }

        let uniques = schema
            .unique_members()
            .iter()
            .filter_map(|member| match document.get(member) {
                None | Some(Value::Null) => None,
                Some(value) => Some(UniqueEntry {
                    member: member.clone(),
                    value: value.to_string(),
                }),
            })
            .collect();

        Ok(Structure {
            id,
            payload,
            indexes,
            uniques,
        })
    }
}

fn flatten_into(path: &str, value: &Value, out: &mut Vec<IndexEntry>) {
    match value {
        Value::Null => {}
        Value::Object(members) => {
            for (member, nested) in members {
                flatten_into(&format!("{path}.{member}"), nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(path, item, out);
            }
        }
        scalar => out.push(IndexEntry {
            member_path: path.to_string(),
            value: scalar.clone(),
        }),
    }
}
