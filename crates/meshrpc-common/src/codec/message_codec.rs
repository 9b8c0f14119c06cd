use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::{CodecRegistry, DEFAULT_CONTENT_TYPE};
use crate::protocol::error::Result;
use crate::protocol::message::{
    Message, Payload, HEADER_DATA_FORMAT, HEADER_DATA_TYPE, HEADER_INACTIVITY, HEADER_QUALIFIER,
    HEADER_STREAM_ID,
};

/// Serializes a [`Message`] into a `(data bytes, header bytes)` pair and back.
///
/// The codec is stateless apart from its configuration. It copies what it
/// needs out of the input buffers and keeps no reference to them once a call
/// returns.
#[derive(Clone, Debug)]
pub struct MessageCodec {
    registry: Arc<CodecRegistry>,
    header_format: String,
}

impl MessageCodec {
    /// Creates a codec that writes headers in the default format.
    pub fn new(registry: Arc<CodecRegistry>) -> Self {
        Self::with_header_format(registry, DEFAULT_CONTENT_TYPE)
    }

    pub fn with_header_format(registry: Arc<CodecRegistry>, header_format: impl Into<String>) -> Self {
        Self {
            registry,
            header_format: header_format.into(),
        }
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    /// Encodes a message.
    ///
    /// Raw byte payloads pass through untouched; decoded values are written
    /// with the data codec named by `data_format`. Reserved fields are merged
    /// into the header map, and an empty map becomes an empty buffer.
    pub fn encode(&self, message: &Message) -> Result<(Bytes, Bytes)> {
        let data = match message.data() {
            Payload::Empty => Bytes::new(),
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Value(value) => self
                .registry
                .data_codec(message.data_format())?
                .encode(value)?,
        };

        let headers = self.encode_headers(message)?;
        Ok((data, headers))
    }

    fn encode_headers(&self, message: &Message) -> Result<Bytes> {
        let reserved = [
            (HEADER_QUALIFIER, Some(message.qualifier()).filter(|q| !q.is_empty())),
            (HEADER_STREAM_ID, message.stream_id()),
            (HEADER_DATA_TYPE, message.data_type()),
            (HEADER_DATA_FORMAT, message.data_format()),
            (HEADER_INACTIVITY, message.inactivity()),
        ];

        if message.headers().is_empty() && reserved.iter().all(|(_, v)| v.is_none()) {
            return Ok(Bytes::new());
        }

        let mut merged: HashMap<String, String> = message.headers().clone();
        for (key, value) in reserved {
            if let Some(value) = value {
                merged.insert(key.to_string(), value.to_string());
            }
        }

        self.registry
            .header_codec(Some(&self.header_format))?
            .encode(&merged)
    }

    /// Decodes a message.
    ///
    /// Data bytes are kept raw; turning them into a concrete type happens
    /// later, once the response type is known.
    pub fn decode(&self, data: Bytes, headers: Bytes) -> Result<Message> {
        let mut builder = Message::builder();

        if !headers.is_empty() {
            let map = self
                .registry
                .header_codec(Some(&self.header_format))?
                .decode(&headers)?;
            builder = builder.headers(map);
        }

        if !data.is_empty() {
            builder = builder.data(Payload::Bytes(data));
        }

        Ok(builder.build())
    }
}
