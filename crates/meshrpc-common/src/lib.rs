//! meshrpc Common Types, Codecs and Transport
//!
//! This crate holds everything the other meshrpc crates share:
//!
//! - **Protocol Layer**: [`Message`], [`MethodBinding`], [`CommunicationMode`]
//!   and the [`ServiceError`] taxonomy
//! - **Codec Layer**: pluggable header and data codecs selected by content
//!   type, and the [`codec::MessageCodec`] that turns a message into the two
//!   buffers a transport carries
//! - **Transport Layer**: the [`transport::Dispatch`] / [`transport::Channel`]
//!   traits, the client and server transport SPI and a multiplexed TCP
//!   implementation
//!
//! # Communication Modes
//!
//! - fire-and-forget: one message, no reply
//! - request-response: one message, exactly one reply or error
//! - request-stream: one message, zero or more replies
//! - request-channel: a stream of messages in, a stream of messages out
//!
//! # Example
//!
//! ```
//! use meshrpc_common::codec::{CodecRegistry, MessageCodec};
//! use meshrpc_common::Message;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let codec = MessageCodec::new(Arc::new(CodecRegistry::with_json()));
//! let (data, headers) = codec.encode(&Message::new("Greeting/hello", json!("joe"))).unwrap();
//! let decoded = codec.decode(data, headers).unwrap();
//! assert_eq!(decoded.qualifier(), "Greeting/hello");
//! ```

pub mod codec;
pub mod protocol;
pub mod transport;

pub use protocol::*;
