use std::fmt;

use thiserror::Error;

/// Taxonomy kind of a [`ServiceError`].
///
/// The kind is what travels on the wire: a remote peer reports a kind and a
/// message, and the caller rebuilds a [`ServiceError::Remote`] from them so
/// that peer-originated failures never look like local ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed message, missing required header, codec failure
    BadRequest,
    /// Application-level rejection
    Unauthorized,
    /// No reachable instance or connection could not be established
    ServiceUnavailable,
    /// Any other uncaught failure
    InternalService,
    /// Connection dropped mid-call
    Connection,
}

impl ErrorKind {
    /// Wire code for this kind.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::InternalService => 500,
            ErrorKind::Connection => 502,
            ErrorKind::ServiceUnavailable => 503,
        }
    }

    /// Maps a wire code back to a kind. Unknown codes are internal errors.
    pub fn from_code(code: u16) -> Self {
        match code {
            400 => ErrorKind::BadRequest,
            401 => ErrorKind::Unauthorized,
            502 => ErrorKind::Connection,
            503 => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::InternalService,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadRequest => "bad request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ServiceUnavailable => "service unavailable",
            ErrorKind::InternalService => "internal service error",
            ErrorKind::Connection => "connection error",
        };
        f.write_str(name)
    }
}

/// Error type shared by every meshrpc crate.
///
/// Errors are `Clone` because a single connection attempt is shared by every
/// caller waiting on the same address, and each of them must observe the
/// same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal service error: {0}")]
    InternalService(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Error raised by a remote peer and carried back over a transport.
    #[error("Remote {kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl ServiceError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ServiceError::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ServiceError::Unauthorized(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ServiceError::ServiceUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::InternalService(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        ServiceError::Connection(message.into())
    }

    /// Rebuilds an error reported by a peer from its wire code and message.
    pub fn remote(code: u16, message: impl Into<String>) -> Self {
        ServiceError::Remote {
            kind: ErrorKind::from_code(code),
            message: message.into(),
        }
    }

    /// The taxonomy kind, regardless of where the error originated.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::BadRequest(_) => ErrorKind::BadRequest,
            ServiceError::Unauthorized(_) => ErrorKind::Unauthorized,
            ServiceError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            ServiceError::InternalService(_) => ErrorKind::InternalService,
            ServiceError::Connection(_) => ErrorKind::Connection,
            ServiceError::Remote { kind, .. } => *kind,
        }
    }

    pub fn code(&self) -> u16 {
        self.kind().code()
    }

    /// True when the error was raised by a remote peer.
    pub fn is_remote(&self) -> bool {
        matches!(self, ServiceError::Remote { .. })
    }

    /// The bare message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            ServiceError::BadRequest(m)
            | ServiceError::Unauthorized(m)
            | ServiceError::ServiceUnavailable(m)
            | ServiceError::InternalService(m)
            | ServiceError::Connection(m) => m,
            ServiceError::Remote { message, .. } => message,
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::BadRequest(format!("JSON serialization error: {}", err))
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Connection(err.to_string())
    }
}

impl From<std::net::AddrParseError> for ServiceError {
    fn from(err: std::net::AddrParseError) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
