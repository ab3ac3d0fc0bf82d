//! Pluggable body serialization.
//!
//! Message bodies are opaque bytes on the wire. Each connection negotiates a
//! `serialize_type` byte, and the [`SerializerRegistry`] maps that byte to a
//! [`Serializer`]. Serializers work on `serde_json::Value` so the trait stays
//! object safe; the free functions [`encode`] and [`decode`] add the typed
//! layer on top.

use crate::error::CodecError;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-erased body serializer.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// The byte that selects this serializer on a connection.
    fn serialize_type(&self) -> u8;

    /// Name for logs.
    fn name(&self) -> &'static str;

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decodes a body. An empty body decodes to `Value::Null`.
    fn decode_value(&self, data: &[u8]) -> Result<Value, CodecError>;
}

/// Serializes `value` with `serializer`.
pub fn encode<T: Serialize + ?Sized>(serializer: &dyn Serializer, value: &T) -> Result<Bytes, CodecError> {
    let value = serde_json::to_value(value)?;
    Ok(Bytes::from(serializer.encode_value(&value)?))
}

/// Deserializes a body produced by [`encode`] with the same serializer.
pub fn decode<T: DeserializeOwned>(serializer: &dyn Serializer, data: &[u8]) -> Result<T, CodecError> {
    let value = serializer.decode_value(data)?;
    Ok(serde_json::from_value(value)?)
}

/// Moves a body from one serializer to another. Bytes are reused untouched
/// when both sides agree.
pub fn transcode(from: &dyn Serializer, to: &dyn Serializer, data: &Bytes) -> Result<Bytes, CodecError> {
    if from.serialize_type() == to.serialize_type() {
        return Ok(data.clone());
    }
    let value = from.decode_value(data)?;
    Ok(Bytes::from(to.encode_value(&value)?))
}

/// Plain JSON, serialize type 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const TYPE: u8 = 0;
}

impl Serializer for JsonSerializer {
    fn serialize_type(&self) -> u8 {
        Self::TYPE
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_value(&self, data: &[u8]) -> Result<Value, CodecError> {
        if data.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(data)?)
    }
}

/// Deflate-compressed JSON, serialize type 1. Useful for chatty clients on
/// slow links; costs CPU on both ends.
#[derive(Debug, Clone, Copy)]
pub struct DeflateJsonSerializer {
    level: u32,
}

impl DeflateJsonSerializer {
    pub const TYPE: u8 = 1;

    /// `level` is the flate2 compression level, 0 to 9.
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for DeflateJsonSerializer {
    fn default() -> Self {
        Self::new(flate2::Compression::fast().level())
    }
}

impl Serializer for DeflateJsonSerializer {
    fn serialize_type(&self) -> u8 {
        Self::TYPE
    }

    fn name(&self) -> &'static str {
        "deflate-json"
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        use flate2::{write::DeflateEncoder, Compression};
        use std::io::Write;

        if value.is_null() {
            return Ok(Vec::new());
        }
        let json = serde_json::to_vec(value)?;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn decode_value(&self, data: &[u8]) -> Result<Value, CodecError> {
        use flate2::read::DeflateDecoder;
        use std::io::Read;

        if data.is_empty() {
            return Ok(Value::Null);
        }
        let mut decoder = DeflateDecoder::new(data);
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Serializers available to a process, keyed by serialize type.
///
/// Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<u8, Arc<dyn Serializer>>,
    default_type: u8,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty(JsonSerializer::TYPE);
        registry.register(Arc::new(JsonSerializer));
        registry.register(Arc::new(DeflateJsonSerializer::default()));
        registry
    }
}

impl SerializerRegistry {
    /// A registry with no serializers. `default_type` must be registered
    /// before [`SerializerRegistry::default_serializer`] is used.
    pub fn empty(default_type: u8) -> Self {
        Self {
            serializers: HashMap::new(),
            default_type,
        }
    }

    /// Adds or replaces the serializer for its type byte.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) -> &mut Self {
        self.serializers.insert(serializer.serialize_type(), serializer);
        self
    }

    pub fn with_default_type(mut self, default_type: u8) -> Result<Self, CodecError> {
        if !self.serializers.contains_key(&default_type) {
            return Err(CodecError::UnknownSerializer(default_type));
        }
        self.default_type = default_type;
        Ok(self)
    }

    pub fn get(&self, serialize_type: u8) -> Result<Arc<dyn Serializer>, CodecError> {
        self.serializers
            .get(&serialize_type)
            .cloned()
            .ok_or(CodecError::UnknownSerializer(serialize_type))
    }

    pub fn default_type(&self) -> u8 {
        self.default_type
    }

    pub fn default_serializer(&self) -> Result<Arc<dyn Serializer>, CodecError> {
        self.get(self.default_type)
    }

    pub fn contains(&self, serialize_type: u8) -> bool {
        self.serializers.contains_key(&serialize_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Move {
        x: i32,
        y: i32,
        label: String,
    }

    #[test]
    fn test_json_typed_roundtrip() {
        let serializer = JsonSerializer;
        let value = Move { x: 1, y: -2, label: "north".into() };

        let bytes = encode(&serializer, &value).expect("Failed to encode");
        assert_eq!(bytes.as_ref(), br#"{"label":"north","x":1,"y":-2}"#);

        let decoded: Move = decode(&serializer, &bytes).expect("Failed to decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_deflate_roundtrip_and_compresses() {
        let serializer = DeflateJsonSerializer::default();
        let value = serde_json::json!({ "payload": "a".repeat(2048) });

        let bytes = encode(&serializer, &value).expect("Failed to encode");
        assert!(bytes.len() < 2048, "deflate should shrink repetitive payloads");

        let decoded: Value = decode(&serializer, &bytes).expect("Failed to decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_empty_body_is_unit() {
        let serializer = JsonSerializer;
        let bytes = encode(&serializer, &()).expect("Failed to encode unit");
        assert!(bytes.is_empty());

        let unit: () = decode(&serializer, &[]).expect("Failed to decode empty body");
        assert_eq!(unit, ());
        let missing: Option<Move> = decode(&serializer, &[]).expect("Failed to decode empty body");
        assert!(missing.is_none());
    }

    #[test]
    fn test_transcode_between_serializers() {
        let json = JsonSerializer;
        let deflate = DeflateJsonSerializer::default();
        let original = encode(&json, &serde_json::json!({"x": 2})).unwrap();

        let compressed = transcode(&json, &deflate, &original).expect("Failed to transcode");
        let back: Value = decode(&deflate, &compressed).unwrap();
        assert_eq!(back, serde_json::json!({"x": 2}));

        let same = transcode(&json, &json, &original).unwrap();
        assert_eq!(same, original);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SerializerRegistry::default();
        assert_eq!(registry.get(0).unwrap().name(), "json");
        assert_eq!(registry.get(1).unwrap().name(), "deflate-json");
        assert!(matches!(registry.get(7), Err(CodecError::UnknownSerializer(7))));

        let registry = registry.with_default_type(1).expect("Type 1 should be registered");
        assert_eq!(registry.default_serializer().unwrap().serialize_type(), 1);
        assert!(SerializerRegistry::default().with_default_type(9).is_err());
    }
}
