pub mod builder;
pub mod schema;

pub use builder::{IndexEntry, Structure, StructureBuilder, UniqueEntry};
pub use schema::{SchemaCache, StructureSchema, StructureSchemaBuilder, TokenAccessor};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Identifier of a stored structure. Ids of one structure set always share
/// a variant, so ordering across variants never matters in practice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StructureId {
    Identity(i64),
    Guid(Uuid),
    Text(String),
}

impl StructureId {
    pub fn id_type(&self) -> IdType {
        match self {
            StructureId::Identity(_) => IdType::Identity,
            StructureId::Guid(_) => IdType::Guid,
            StructureId::Text(_) => IdType::Text,
        }
    }

    pub fn as_identity(&self) -> Option<i64> {
        match self {
            StructureId::Identity(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StructureId::Identity(v) => Value::from(*v),
            StructureId::Guid(v) => Value::String(v.hyphenated().to_string()),
            StructureId::Text(v) => Value::String(v.clone()),
        }
    }

    /// Reads an id of the given type out of a document member. Unassigned
    /// values (null, `0`, the nil uuid, an empty string) read as `None`.
    pub fn from_json(value: &Value, id_type: IdType) -> Result<Option<Self>, String> {
        match (id_type, value) {
            (_, Value::Null) => Ok(None),
            (IdType::Identity, Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(None),
                Some(v) if v > 0 => Ok(Some(StructureId::Identity(v))),
                _ => Err(format!("identity id must be a positive integer, got {n}")),
            },
            (IdType::Guid, Value::String(s)) => {
                let parsed = Uuid::parse_str(s).map_err(|e| format!("invalid guid id: {e}"))?;
                if parsed.is_nil() {
                    Ok(None)
                } else {
                    Ok(Some(StructureId::Guid(parsed)))
                }
            }
            (IdType::Text, Value::String(s)) if s.is_empty() => Ok(None),
            (IdType::Text, Value::String(s)) => Ok(Some(StructureId::Text(s.clone()))),
            (id_type, other) => Err(format!("expected {id_type:?} id, got {other}")),
        }
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructureId::Identity(v) => write!(f, "{v}"),
            StructureId::Guid(v) => write!(f, "{v}"),
            StructureId::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for StructureId {
    fn from(value: i64) -> Self {
        StructureId::Identity(value)
    }
}

impl From<Uuid> for StructureId {
    fn from(value: Uuid) -> Self {
        StructureId::Guid(value)
    }
}

impl From<&str> for StructureId {
    fn from(value: &str) -> Self {
        StructureId::Text(value.to_string())
    }
}

impl From<String> for StructureId {
    fn from(value: String) -> Self {
        StructureId::Text(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdType {
    Guid,
    Text,
    /// Store-issued, strictly increasing integer ids.
    Identity,
}

impl IdType {
    pub fn is_sequential(self) -> bool {
        matches!(self, IdType::Identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Guid,
    Int32,
    Int64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcurrencyToken {
    Guid(Uuid),
    Int32(i32),
    Int64(i64),
}

impl ConcurrencyToken {
    /// Value given to a token member that is unset when first inserted.
    pub fn initial(token_type: TokenType) -> Self {
        match token_type {
            TokenType::Guid => ConcurrencyToken::Guid(Uuid::new_v4()),
            TokenType::Int32 => ConcurrencyToken::Int32(0),
            TokenType::Int64 => ConcurrencyToken::Int64(0),
        }
    }

    pub fn token_type(&self) -> TokenType {
        match self {
            ConcurrencyToken::Guid(_) => TokenType::Guid,
            ConcurrencyToken::Int32(_) => TokenType::Int32,
            ConcurrencyToken::Int64(_) => TokenType::Int64,
        }
    }

    /// The token persisted after a successful update: a fresh guid, or the
    /// stored integer plus one. `None` on integer overflow.
    pub fn advance(&self) -> Option<Self> {
        match self {
            ConcurrencyToken::Guid(_) => Some(ConcurrencyToken::Guid(Uuid::new_v4())),
            ConcurrencyToken::Int32(v) => v.checked_add(1).map(ConcurrencyToken::Int32),
            ConcurrencyToken::Int64(v) => v.checked_add(1).map(ConcurrencyToken::Int64),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ConcurrencyToken::Guid(v) => Value::String(v.hyphenated().to_string()),
            ConcurrencyToken::Int32(v) => Value::from(*v),
            ConcurrencyToken::Int64(v) => Value::from(*v),
        }
    }

    pub fn from_json(value: &Value, token_type: TokenType) -> Option<Self> {
        match (token_type, value) {
            (TokenType::Guid, Value::String(s)) => {
                Uuid::parse_str(s).ok().map(ConcurrencyToken::Guid)
            }
            (TokenType::Int32, Value::Number(n)) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(ConcurrencyToken::Int32),
            (TokenType::Int64, Value::Number(n)) => n.as_i64().map(ConcurrencyToken::Int64),
            _ => None,
        }
    }
}

/// A domain type stored as a structure. The schema names the structure set
/// and the members holding the id and the optional concurrency token.
pub trait Document: Serialize + DeserializeOwned + 'static {
    fn describe_schema() -> StructureSchema;
}
