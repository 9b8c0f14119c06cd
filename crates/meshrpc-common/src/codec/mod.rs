//! meshrpc Codecs
//!
//! Content-type keyed encode/decode capabilities for the header map and the
//! payload, plus the [`MessageCodec`] that composes them.
//!
//! # Components
//!
//! - **[`HeaderCodec`]**: serializes the header map
//! - **[`DataCodec`]**: serializes payload values
//! - **[`CodecRegistry`]**: explicit, injectable lookup table by content type
//! - **[`MessageCodec`]**: `Message` <-> `(data bytes, header bytes)`
//!
//! # Example
//!
//! ```
//! use meshrpc_common::codec::{CodecRegistry, MessageCodec};
//! use meshrpc_common::protocol::Message;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let codec = MessageCodec::new(Arc::new(CodecRegistry::with_json()));
//! let message = Message::new("Greeting/hello", json!("joe"));
//!
//! let (data, headers) = codec.encode(&message).unwrap();
//! let decoded = codec.decode(data, headers).unwrap();
//! assert_eq!(decoded.qualifier(), "Greeting/hello");
//! ```

pub mod message_codec;

pub use message_codec::MessageCodec;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::protocol::error::{Result, ServiceError};

/// Content type of the JSON codec.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type of the plain text codec.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Format used when a message does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = CONTENT_TYPE_JSON;

/// Serializes the header map of a message.
pub trait HeaderCodec: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode(&self, headers: &HashMap<String, String>) -> Result<Bytes>;

    fn decode(&self, data: &[u8]) -> Result<HashMap<String, String>>;
}

/// Serializes message payloads.
pub trait DataCodec: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode(&self, value: &Value) -> Result<Bytes>;

    fn decode(&self, data: &[u8]) -> Result<Value>;
}

/// JSON codec for headers and payloads.
///
/// # Example
///
/// ```
/// use meshrpc_common::codec::{DataCodec, JsonCodec};
/// use serde_json::json;
///
/// let bytes = DataCodec::encode(&JsonCodec, &json!({"n": 42})).unwrap();
/// let value = DataCodec::decode(&JsonCodec, &bytes).unwrap();
/// assert_eq!(value, json!({"n": 42}));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl HeaderCodec for JsonCodec {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_JSON
    }

    fn encode(&self, headers: &HashMap<String, String>) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(headers)?))
    }

    fn decode(&self, data: &[u8]) -> Result<HashMap<String, String>> {
        serde_json::from_slice(data)
            .map_err(|e| ServiceError::bad_request(format!("Malformed headers: {}", e)))
    }
}

impl DataCodec for JsonCodec {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_JSON
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, data: &[u8]) -> Result<Value> {
        serde_json::from_slice(data)
            .map_err(|e| ServiceError::bad_request(format!("Malformed JSON payload: {}", e)))
    }
}

/// Plain text payloads: string values as UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl DataCodec for TextCodec {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_TEXT
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            other => Err(ServiceError::bad_request(format!(
                "text/plain can only carry strings, got {}",
                other
            ))),
        }
    }

    fn decode(&self, data: &[u8]) -> Result<Value> {
        std::str::from_utf8(data)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| ServiceError::bad_request(format!("Payload is not UTF-8: {}", e)))
    }
}

/// Codecs by content type.
///
/// Passed explicitly to whoever needs it rather than living in a global, so
/// that tests and embedders control exactly which formats exist.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    data: HashMap<String, Arc<dyn DataCodec>>,
    headers: HashMap<String, Arc<dyn HeaderCodec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the JSON and text codecs.
    pub fn with_json() -> Self {
        Self::new()
            .register_data(JsonCodec)
            .register_header(JsonCodec)
            .register_data(TextCodec)
    }

    pub fn register_data(mut self, codec: impl DataCodec + 'static) -> Self {
        self.data
            .insert(codec.content_type().to_string(), Arc::new(codec));
        self
    }

    pub fn register_header(mut self, codec: impl HeaderCodec + 'static) -> Self {
        self.headers
            .insert(codec.content_type().to_string(), Arc::new(codec));
        self
    }

    /// Looks up a data codec; `None` selects the default content type.
    pub fn data_codec(&self, content_type: Option<&str>) -> Result<Arc<dyn DataCodec>> {
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        self.data.get(content_type).cloned().ok_or_else(|| {
            ServiceError::bad_request(format!(
                "No data codec registered for content type '{}'",
                content_type
            ))
        })
    }

    /// Looks up a header codec; `None` selects the default content type.
    pub fn header_codec(&self, content_type: Option<&str>) -> Result<Arc<dyn HeaderCodec>> {
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        self.headers.get(content_type).cloned().ok_or_else(|| {
            ServiceError::bad_request(format!(
                "No header codec registered for content type '{}'",
                content_type
            ))
        })
    }

    pub fn data_content_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.data.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("data", &self.data.keys().collect::<Vec<_>>())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}
