pub mod binding;
pub mod error;
pub mod message;

pub use binding::{qualifier, split_qualifier, CommunicationMode, MethodBinding};
pub use error::{ErrorKind, Result, ServiceError};
pub use message::{
    Message, MessageBuilder, Payload, HEADER_DATA_FORMAT, HEADER_DATA_TYPE, HEADER_INACTIVITY,
    HEADER_QUALIFIER, HEADER_STREAM_ID, RESERVED_HEADERS,
};
