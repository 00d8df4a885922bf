use crate::error::StoreError;
use crate::structure::{ConcurrencyToken, Document, IdType, StructureId, TokenType};
use parking_lot::RwLock;
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccessor {
    pub member: String,
    pub token_type: TokenType,
}

/// Per-type metadata: the structure set name, where the id and concurrency
/// token live in the serialized document, and which members are unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureSchema {
    name: String,
    id_member: String,
    id_type: IdType,
    concurrency_token: Option<TokenAccessor>,
    unique_members: Vec<String>,
}

impl StructureSchema {
    pub fn builder(name: impl Into<String>) -> StructureSchemaBuilder {
        StructureSchemaBuilder {
            name: name.into(),
            id_member: "id".into(),
            id_type: IdType::Guid,
            concurrency_token: None,
            unique_members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_member(&self) -> &str {
        &self.id_member
    }

    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    pub fn id_is_sequential(&self) -> bool {
        self.id_type.is_sequential()
    }

    pub fn has_concurrency_token(&self) -> bool {
        self.concurrency_token.is_some()
    }

    pub fn concurrency_token(&self) -> Option<&TokenAccessor> {
        self.concurrency_token.as_ref()
    }

    pub fn unique_members(&self) -> &[String] {
        &self.unique_members
    }

    pub fn read_id(&self, document: &Value) -> Result<Option<StructureId>, StoreError> {
        let member = document.get(&self.id_member).unwrap_or(&Value::Null);
        StructureId::from_json(member, self.id_type).map_err(|message| {
            StoreError::Validation(format!("'{}.{}': {message}", self.name, self.id_member))
        })
    }

    pub fn require_id(&self, document: &Value) -> Result<StructureId, StoreError> {
        self.read_id(document)?.ok_or_else(|| StoreError::MissingId {
            structure: self.name.clone(),
            member: self.id_member.clone(),
        })
    }

    pub fn write_id(&self, document: &mut Value, id: &StructureId) -> Result<(), StoreError> {
        if id.id_type() != self.id_type {
            return Err(StoreError::Validation(format!(
                "'{}' expects {:?} ids, got {:?}",
                self.name,
                self.id_type,
                id.id_type()
            )));
        }
        self.object_mut(document)?
            .insert(self.id_member.clone(), id.to_json());
        Ok(())
    }

    /// Decodes the token member. `None` only when the schema carries no
    /// token; a member that does not decode as the declared type is a
    /// configuration error.
    pub fn read_token(&self, document: &Value) -> Result<Option<ConcurrencyToken>, StoreError> {
        let Some(accessor) = &self.concurrency_token else {
            return Ok(None);
        };
        let member = document.get(&accessor.member).unwrap_or(&Value::Null);
        match ConcurrencyToken::from_json(member, accessor.token_type) {
            Some(token) => Ok(Some(token)),
            None => Err(StoreError::UnsupportedConcurrencyToken {
                structure: self.name.clone(),
                member: accessor.member.clone(),
                found: member.to_string(),
            }),
        }
    }

    pub fn write_token(
        &self,
        document: &mut Value,
        token: &ConcurrencyToken,
    ) -> Result<(), StoreError> {
        let Some(accessor) = &self.concurrency_token else {
            return Err(StoreError::Validation(format!(
                "'{}' has no concurrency token member",
                self.name
            )));
        };
        if token.token_type() != accessor.token_type {
            return Err(StoreError::UnsupportedConcurrencyToken {
                structure: self.name.clone(),
                member: accessor.member.clone(),
                found: format!("{:?}", token.token_type()),
            });
        }
        let member = accessor.member.clone();
        self.object_mut(document)?.insert(member, token.to_json());
        Ok(())
    }

    /// Gives an unset token member its initial value so later updates always
    /// have something to compare against.
    pub fn ensure_token(&self, document: &mut Value) -> Result<(), StoreError> {
        let Some(accessor) = &self.concurrency_token else {
            return Ok(());
        };
        let unset = document
            .get(&accessor.member)
            .is_none_or(|value| value.is_null());
        if unset {
            let token = ConcurrencyToken::initial(accessor.token_type);
            self.write_token(document, &token)?;
        }
        Ok(())
    }

    fn object_mut<'a>(
        &self,
        document: &'a mut Value,
    ) -> Result<&'a mut serde_json::Map<String, Value>, StoreError> {
        document.as_object_mut().ok_or_else(|| {
            StoreError::Serialization(format!(
                "'{}' must serialize to a JSON object",
                self.name
            ))
        })
    }
}

pub struct StructureSchemaBuilder {
    name: String,
    id_member: String,
    id_type: IdType,
    concurrency_token: Option<TokenAccessor>,
    unique_members: Vec<String>,
}

impl StructureSchemaBuilder {
    pub fn id(mut self, member: impl Into<String>, id_type: IdType) -> Self {
        self.id_member = member.into();
        self.id_type = id_type;
        self
    }

    pub fn concurrency_token(mut self, member: impl Into<String>, token_type: TokenType) -> Self {
        self.concurrency_token = Some(TokenAccessor {
            member: member.into(),
            token_type,
        });
        self
    }

    pub fn unique(mut self, member: impl Into<String>) -> Self {
        let member = member.into();
        if !self.unique_members.contains(&member) {
            self.unique_members.push(member);
        }
        self
    }

    pub fn build(self) -> StructureSchema {
        StructureSchema {
            name: self.name,
            id_member: self.id_member,
            id_type: self.id_type,
            concurrency_token: self.concurrency_token,
            unique_members: self.unique_members,
        }
    }
}

/// Schemas are described once per Rust type and reused for the lifetime of
/// the database handle. Entries are dropped by name when a structure set is
/// dropped or migrated away.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<TypeId, Arc<StructureSchema>>>,
}

impl SchemaCache {
    pub fn get_or_describe<T: Document>(&self) -> Arc<StructureSchema> {
        let key = TypeId::of::<T>();
        if let Some(schema) = self.entries.read().get(&key) {
            return Arc::clone(schema);
        }
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(T::describe_schema())),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().values().any(|s| s.name() == name)
    }

    pub fn remove(&self, name: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, schema| schema.name() != name);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
