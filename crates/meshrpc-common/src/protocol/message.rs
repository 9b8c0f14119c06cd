//! meshrpc Message Types
//!
//! This module defines the immutable message envelope every communication
//! mode carries, and the payload it wraps.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::error::{Result, ServiceError};
use crate::codec::CodecRegistry;

/// Reserved header carrying the qualifier.
pub const HEADER_QUALIFIER: &str = "q";
/// Reserved header carrying the stream id.
pub const HEADER_STREAM_ID: &str = "sid";
/// Reserved header carrying the data type hint.
pub const HEADER_DATA_TYPE: &str = "_type";
/// Reserved header carrying the data format (content type).
pub const HEADER_DATA_FORMAT: &str = "_data_format";
/// Reserved header carrying the advisory inactivity timeout.
pub const HEADER_INACTIVITY: &str = "_inactivity";

/// All reserved header keys, in encode order.
pub const RESERVED_HEADERS: [&str; 5] = [
    HEADER_QUALIFIER,
    HEADER_STREAM_ID,
    HEADER_DATA_TYPE,
    HEADER_DATA_FORMAT,
    HEADER_INACTIVITY,
];

/// Message payload.
///
/// `Empty` is the "no data" sentinel. Payloads received from a transport are
/// `Bytes` and stay undecoded until a caller knows the target type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Raw, undecoded bytes
    Bytes(Bytes),
    /// A decoded object
    Value(Value),
}

impl Payload {
    /// Serializes any value into a `Value` payload.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Value(serde_json::to_value(value)?))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

/// The protocol envelope.
///
/// Reserved header keys never appear in [`headers`](Self::headers); they live
/// in their dedicated fields and are injected/extracted by the
/// [`MessageCodec`](crate::codec::MessageCodec).
///
/// # Example
///
/// ```
/// use meshrpc_common::protocol::Message;
/// use serde_json::json;
///
/// let message = Message::builder()
///     .qualifier("Greeting/hello")
///     .header("trace", "abc")
///     .data(json!("joe"))
///     .build();
///
/// assert_eq!(message.qualifier(), "Greeting/hello");
/// assert_eq!(message.header("trace"), Some("abc"));
/// assert!(message.has_data());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    qualifier: String,
    stream_id: Option<String>,
    data_type: Option<String>,
    data_format: Option<String>,
    inactivity: Option<String>,
    headers: HashMap<String, String>,
    data: Payload,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Shorthand for a message with a qualifier and a payload.
    pub fn new(qualifier: impl Into<String>, data: impl Into<Payload>) -> Self {
        Message::builder().qualifier(qualifier).data(data).build()
    }

    /// Starts a builder pre-filled with this message's fields.
    pub fn to_builder(&self) -> MessageBuilder {
        MessageBuilder {
            message: self.clone(),
        }
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn data_type(&self) -> Option<&str> {
        self.data_type.as_deref()
    }

    pub fn data_format(&self) -> Option<&str> {
        self.data_format.as_deref()
    }

    pub fn inactivity(&self) -> Option<&str> {
        self.inactivity.as_deref()
    }

    /// The inactivity hint parsed as milliseconds, if present and numeric.
    pub fn inactivity_duration(&self) -> Option<Duration> {
        self.inactivity
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn into_data(self) -> Payload {
        self.data
    }

    /// False only for the "no data" sentinel.
    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Returns a copy of this message with another payload.
    pub fn with_data(&self, data: impl Into<Payload>) -> Self {
        let mut message = self.clone();
        message.data = data.into();
        message
    }

    /// Returns a copy of this message with another stream id.
    pub fn with_stream_id(&self, stream_id: impl Into<String>) -> Self {
        let mut message = self.clone();
        message.stream_id = Some(stream_id.into());
        message
    }

    /// Returns a copy of this message with another qualifier.
    pub fn with_qualifier(&self, qualifier: impl Into<String>) -> Self {
        let mut message = self.clone();
        message.qualifier = qualifier.into();
        message
    }

    /// Decodes the payload as JSON-compatible `Value`.
    ///
    /// Raw bytes go through the data codec selected by `data_format`.
    pub fn data_value(&self, codecs: &CodecRegistry) -> Result<Value> {
        match &self.data {
            Payload::Empty => Ok(Value::Null),
            Payload::Value(value) => Ok(value.clone()),
            Payload::Bytes(bytes) => codecs.data_codec(self.data_format())?.decode(bytes),
        }
    }

    /// Decodes the payload into `T`.
    ///
    /// The "no data" sentinel decodes as JSON `null`, so it only succeeds
    /// for types that accept it (`()`, `Option<_>`).
    pub fn decode_data<T: DeserializeOwned>(&self, codecs: &CodecRegistry) -> Result<T> {
        let value = self.data_value(codecs)?;
        serde_json::from_value(value).map_err(|e| {
            ServiceError::bad_request(format!(
                "Failed to decode payload of '{}' as {}: {}",
                self.qualifier,
                std::any::type_name::<T>(),
                e
            ))
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message[q={}", self.qualifier)?;
        if let Some(sid) = &self.stream_id {
            write!(f, ", sid={}", sid)?;
        }
        if !self.headers.is_empty() {
            write!(f, ", headers={}", self.headers.len())?;
        }
        let data = match &self.data {
            Payload::Empty => "empty".to_string(),
            Payload::Bytes(b) => format!("{} bytes", b.len()),
            Payload::Value(_) => "value".to_string(),
        };
        write!(f, ", data={}]", data)
    }
}

/// Builder for [`Message`].
///
/// Setting a reserved key through [`header`](Self::header) assigns the
/// matching field instead, so built messages never carry reserved keys in
/// their application header map.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.message.qualifier = qualifier.into();
        self
    }

    pub fn stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.message.stream_id = Some(stream_id.into());
        self
    }

    pub fn data_type(mut self, data_type: impl Into<String>) -> Self {
        self.message.data_type = Some(data_type.into());
        self
    }

    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.message.data_format = Some(data_format.into());
        self
    }

    pub fn inactivity(mut self, inactivity: impl Into<String>) -> Self {
        self.message.inactivity = Some(inactivity.into());
        self
    }

    /// Sets the inactivity hint in milliseconds.
    pub fn inactivity_duration(self, inactivity: Duration) -> Self {
        self.inactivity(inactivity.as_millis().to_string())
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            HEADER_QUALIFIER => self.message.qualifier = value,
            HEADER_STREAM_ID => self.message.stream_id = Some(value),
            HEADER_DATA_TYPE => self.message.data_type = Some(value),
            HEADER_DATA_FORMAT => self.message.data_format = Some(value),
            HEADER_INACTIVITY => self.message.inactivity = Some(value),
            _ => {
                self.message.headers.insert(key, value);
            }
        }
        self
    }

    pub fn headers<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        headers
            .into_iter()
            .fold(self, |builder, (k, v)| builder.header(k, v))
    }

    pub fn data(mut self, data: impl Into<Payload>) -> Self {
        self.message.data = data.into();
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
