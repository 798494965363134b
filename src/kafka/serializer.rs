use crate::{Error, Result};
use bytes::Bytes;
use serde_json::Value;

/// Encodes a payload into the bytes placed in the Kafka record value.
pub trait PayloadSerializer: Send + Sync {
    fn serialize(&self, payload: &Value) -> Result<Bytes>;

    fn format(&self) -> SerializationFormat;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationFormat {
    String,
    Json,
}

/// Passes string payloads through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

/// Writes payloads as compact JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for StringSerializer {
    fn serialize(&self, payload: &Value) -> Result<Bytes> {
        match payload {
            Value::String(s) => Ok(Bytes::from(s.clone())),
            other => Err(Error::Serialization(format!(
                "string serializer cannot encode a {} payload",
                json_kind(other)
            ))),
        }
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::String
    }
}

impl PayloadSerializer for JsonSerializer {
    fn serialize(&self, payload: &Value) -> Result<Bytes> {
        serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }
}

impl SerializationFormat {
    pub fn serializer(self) -> Box<dyn PayloadSerializer> {
        match self {
            SerializationFormat::String => Box::new(StringSerializer),
            SerializationFormat::Json => Box::new(JsonSerializer),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
