use crate::error::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Turns documents into stored payloads and back. Must round-trip every
/// member a schema reads, id and concurrency token included.
pub trait PayloadSerializer: Send + Sync {
    fn to_payload(&self, document: &Value) -> Result<String, StoreError>;
    fn from_payload(&self, payload: &str) -> Result<Value, StoreError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    pretty: bool,
}

impl JsonSerializer {
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl PayloadSerializer for JsonSerializer {
    fn to_payload(&self, document: &Value) -> Result<String, StoreError> {
        let payload = if self.pretty {
            serde_json::to_string_pretty(document)?
        } else {
            serde_json::to_string(document)?
        };
        Ok(payload)
    }

    fn from_payload(&self, payload: &str) -> Result<Value, StoreError> {
        Ok(serde_json::from_str(payload)?)
    }
}

pub fn to_document<T: Serialize>(item: &T) -> Result<Value, StoreError> {
    let document = serde_json::to_value(item)?;
    if !document.is_object() {
        return Err(StoreError::Serialization(format!(
            "{} must serialize to a JSON object",
            std::any::type_name::<T>()
        )));
    }
    Ok(document)
}

pub fn from_document<T: DeserializeOwned>(document: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(document)?)
}

pub fn serialize<T: Serialize>(
    serializer: &dyn PayloadSerializer,
    item: &T,
) -> Result<String, StoreError> {
    serializer.to_payload(&to_document(item)?)
}

pub fn deserialize<T: DeserializeOwned>(
    serializer: &dyn PayloadSerializer,
    payload: &str,
) -> Result<T, StoreError> {
    from_document(serializer.from_payload(payload)?)
}

pub fn deserialize_many<T, I, S>(
    serializer: &dyn PayloadSerializer,
    payloads: I,
) -> Result<Vec<T>, StoreError>
where
    T: DeserializeOwned,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    payloads
        .into_iter()
        .map(|payload| deserialize(serializer, payload.as_ref()))
        .collect()
}
