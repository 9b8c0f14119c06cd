use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the four ways a method exchanges messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationMode {
    /// One request, no response
    FireAndForget,
    /// One request, exactly one response
    RequestResponse,
    /// One request, zero or more responses
    RequestStream,
    /// Stream of requests, stream of responses
    RequestChannel,
}

impl fmt::Display for CommunicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommunicationMode::FireAndForget => "fire-and-forget",
            CommunicationMode::RequestResponse => "request-response",
            CommunicationMode::RequestStream => "request-stream",
            CommunicationMode::RequestChannel => "request-channel",
        };
        f.write_str(name)
    }
}

/// Builds the dispatch key of a service method.
pub fn qualifier(namespace: &str, action: &str) -> String {
    format!("{}/{}", namespace, action)
}

/// Splits a qualifier into namespace and action.
///
/// Qualifiers without a separator are treated as a namespace with an empty
/// action.
pub fn split_qualifier(qualifier: &str) -> (&str, &str) {
    match qualifier.rsplit_once('/') {
        Some((namespace, action)) => (namespace, action),
        None => (qualifier, ""),
    }
}

/// Per-method dispatch metadata, computed once and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBinding {
    namespace: String,
    action: String,
    qualifier: String,
    mode: CommunicationMode,
    response_type: &'static str,
    request_is_message: bool,
    response_is_message: bool,
}

impl MethodBinding {
    /// Binding for a typed method: payloads are wrapped into and unwrapped
    /// from messages.
    pub fn new(
        namespace: impl Into<String>,
        action: impl Into<String>,
        mode: CommunicationMode,
        response_type: &'static str,
    ) -> Self {
        let namespace = namespace.into();
        let action = action.into();
        let qualifier = qualifier(&namespace, &action);
        Self {
            namespace,
            action,
            qualifier,
            mode,
            response_type,
            request_is_message: false,
            response_is_message: false,
        }
    }

    /// Binding for a method that takes and returns the protocol `Message`
    /// itself.
    pub fn raw(
        namespace: impl Into<String>,
        action: impl Into<String>,
        mode: CommunicationMode,
    ) -> Self {
        let mut binding = Self::new(namespace, action, mode, "Message");
        binding.request_is_message = true;
        binding.response_is_message = true;
        binding
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn mode(&self) -> CommunicationMode {
        self.mode
    }

    pub fn response_type(&self) -> &'static str {
        self.response_type
    }

    pub fn request_is_message(&self) -> bool {
        self.request_is_message
    }

    pub fn response_is_message(&self) -> bool {
        self.response_is_message
    }
}
