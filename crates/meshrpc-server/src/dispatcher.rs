use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use meshrpc_common::codec::CodecRegistry;
use meshrpc_common::protocol::{CommunicationMode, Message, MethodBinding, Result, ServiceError};
use meshrpc_common::transport::{error_stream, Dispatch, MessageStream};
use meshrpc_router::{MethodInfo, ServiceRegistration};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::service::{Handler, MethodEntry, ServiceDefinition};

/// Configuration errors raised while building a dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatcherError {
    #[error("Duplicate qualifier: {0}")]
    DuplicateQualifier(String),

    #[error("Invalid method '{0}': namespace and action must be non-empty")]
    InvalidMethod(String),
}

impl From<DispatcherError> for ServiceError {
    fn from(e: DispatcherError) -> Self {
        ServiceError::bad_request(e.to_string())
    }
}

/// Builder for [`LocalDispatcher`].
pub struct LocalDispatcherBuilder {
    codecs: Arc<CodecRegistry>,
    services: Vec<ServiceDefinition>,
}

impl LocalDispatcherBuilder {
    pub fn service(mut self, service: ServiceDefinition) -> Self {
        self.services.push(service);
        self
    }

    /// Freezes the dispatch table.
    ///
    /// Fails if two methods share a qualifier or a method has an empty
    /// namespace or action.
    pub fn build(self) -> std::result::Result<LocalDispatcher, DispatcherError> {
        let mut methods = HashMap::new();
        let mut registrations = Vec::with_capacity(self.services.len());

        for service in self.services {
            let mut registration = ServiceRegistration::new(service.namespace());
            registration.tags = service.tags().clone();

            for entry in service.methods {
                let binding = &entry.binding;
                if binding.namespace().is_empty() || binding.action().is_empty() {
                    return Err(DispatcherError::InvalidMethod(binding.qualifier().to_string()));
                }
                if methods.contains_key(binding.qualifier()) {
                    return Err(DispatcherError::DuplicateQualifier(binding.qualifier().to_string()));
                }

                let mut info = MethodInfo::new(binding.action(), binding.mode());
                info.tags = entry.tags.clone();
                registration.methods.push(info);

                debug!(qualifier = binding.qualifier(), mode = %binding.mode(), "Registered method");
                methods.insert(binding.qualifier().to_string(), entry);
            }
            registrations.push(registration);
        }

        Ok(LocalDispatcher {
            codecs: self.codecs,
            methods: Arc::new(methods),
            registrations,
        })
    }
}

/// The local dispatch table: qualifier to in-process handler.
///
/// Immutable once built. Implements [`Dispatch`], so it serves both direct
/// in-process calls and calls accepted by a server transport.
///
/// # Example
///
/// ```
/// use meshrpc_common::codec::CodecRegistry;
/// use meshrpc_server::{LocalDispatcher, ServiceDefinition};
/// use std::sync::Arc;
///
/// let dispatcher = LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
///     .service(
///         ServiceDefinition::new("Greeting")
///             .request_response("hello", |name: String| async move { Ok(format!("Hello, {}", name)) }),
///     )
///     .build()
///     .unwrap();
///
/// assert!(dispatcher.contains("Greeting/hello"));
/// ```
pub struct LocalDispatcher {
    codecs: Arc<CodecRegistry>,
    methods: Arc<HashMap<String, MethodEntry>>,
    registrations: Vec<ServiceRegistration>,
}

impl LocalDispatcher {
    pub fn builder(codecs: Arc<CodecRegistry>) -> LocalDispatcherBuilder {
        LocalDispatcherBuilder {
            codecs,
            services: Vec::new(),
        }
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    pub fn contains(&self, qualifier: &str) -> bool {
        self.methods.contains_key(qualifier)
    }

    pub fn binding(&self, qualifier: &str) -> Option<&MethodBinding> {
        self.methods.get(qualifier).map(|m| &m.binding)
    }

    pub fn qualifiers(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Describes the hosted services for discovery announcements.
    pub fn registrations(&self) -> &[ServiceRegistration] {
        &self.registrations
    }

    fn handler(&self, message: &Message, mode: CommunicationMode) -> Result<Handler> {
        find_handler(&self.methods, message, mode)
    }
}

fn find_handler(
    methods: &HashMap<String, MethodEntry>,
    message: &Message,
    mode: CommunicationMode,
) -> Result<Handler> {
    let qualifier = message.qualifier();
    if qualifier.is_empty() {
        return Err(ServiceError::bad_request("Missing required header 'q'"));
    }

    let entry = methods.get(qualifier).ok_or_else(|| {
        ServiceError::unavailable(format!("No service registered for '{}'", qualifier))
    })?;

    if entry.binding.mode() != mode {
        return Err(ServiceError::bad_request(format!(
            "'{}' is a {} method, called as {}",
            qualifier,
            entry.binding.mode(),
            mode
        )));
    }

    trace!(qualifier, %mode, "Local dispatch");
    Ok(entry.handler.clone())
}

#[async_trait]
impl Dispatch for LocalDispatcher {
    /// Resolves the handler and runs it in the background. Completion means
    /// the call was accepted; handler failures are only logged.
    async fn fire_and_forget(&self, message: Message) -> Result<()> {
        let invoke = match self.handler(&message, CommunicationMode::FireAndForget)? {
            Handler::FireAndForget(invoke) => invoke,
            _ => return Err(ServiceError::internal("handler kind does not match binding")),
        };
        let qualifier = message.qualifier().to_string();
        let running = invoke(message, self.codecs.clone());
        tokio::spawn(async move {
            if let Err(e) = running.await {
                warn!(%qualifier, error = %e, "Fire-and-forget handler failed");
            }
        });
        Ok(())
    }

    async fn request_response(&self, message: Message) -> Result<Message> {
        match self.handler(&message, CommunicationMode::RequestResponse)? {
            Handler::RequestResponse(invoke) => invoke(message, self.codecs.clone()).await,
            _ => Err(ServiceError::internal("handler kind does not match binding")),
        }
    }

    fn request_stream(&self, message: Message) -> MessageStream {
        match self.handler(&message, CommunicationMode::RequestStream) {
            Ok(Handler::RequestStream(invoke)) => invoke(message, self.codecs.clone()),
            Ok(_) => error_stream(ServiceError::internal("handler kind does not match binding")),
            Err(e) => error_stream(e),
        }
    }

    fn request_channel(&self, messages: MessageStream) -> MessageStream {
        let methods = self.methods.clone();
        let codecs = self.codecs.clone();

        // The first message selects the handler and is replayed to it.
        stream::once(async move {
            let mut messages = messages;
            let first = match messages.next().await {
                Some(Ok(first)) => first,
                Some(Err(e)) => return error_stream(e),
                None => {
                    return error_stream(ServiceError::bad_request(
                        "Request channel needs at least one message",
                    ))
                }
            };

            match find_handler(&methods, &first, CommunicationMode::RequestChannel) {
                Ok(Handler::RequestChannel(invoke)) => {
                    let input = stream::once(async move { Ok::<_, ServiceError>(first) })
                        .chain(messages)
                        .boxed();
                    invoke(input, codecs)
                }
                Ok(_) => error_stream(ServiceError::internal("handler kind does not match binding")),
                Err(e) => error_stream(e),
            }
        })
        .flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::BoxStream;
    use meshrpc_common::protocol::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn greeting() -> ServiceDefinition {
        ServiceDefinition::new("Greeting")
            .request_response("hello", |name: String| async move { Ok(format!("Hello, {}", name)) })
            .request_response("secret", |_: String| async move {
                Err::<String, _>(ServiceError::unauthorized("no token"))
            })
            .request_stream("count", |n: u32| stream::iter((0..n).map(Ok)))
            .request_channel("echo", |s: BoxStream<'static, Result<String>>| s)
    }

    fn dispatcher() -> LocalDispatcher {
        LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
            .service(greeting())
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_qualifier_fails_build() {
        let result = LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
            .service(greeting())
            .service(
                ServiceDefinition::new("Greeting")
                    .request_response("hello", |s: String| async move { Ok(s) }),
            )
            .build();
        let err = result.err().unwrap();
        assert_eq!(err, DispatcherError::DuplicateQualifier("Greeting/hello".to_string()));
        assert_eq!(ServiceError::from(err).kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_empty_action_fails_build() {
        let result = LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
            .service(ServiceDefinition::new("Greeting").request_response("", |s: String| async move { Ok(s) }))
            .build();
        assert!(matches!(result, Err(DispatcherError::InvalidMethod(_))));
    }

    #[test]
    fn test_lookup() {
        let dispatcher = dispatcher();
        assert!(dispatcher.contains("Greeting/hello"));
        assert!(!dispatcher.contains("Greeting/missing"));
        assert_eq!(
            dispatcher.binding("Greeting/count").unwrap().mode(),
            CommunicationMode::RequestStream
        );
        assert_eq!(dispatcher.qualifiers().count(), 4);
    }

    #[test]
    fn test_registrations() {
        let dispatcher = LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
            .service(greeting().tag("version", "2").method_tag("hello", "weight", "5"))
            .build()
            .unwrap();
        let registrations = dispatcher.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].namespace, "Greeting");
        assert_eq!(registrations[0].tags.get("version").map(String::as_str), Some("2"));
        assert_eq!(registrations[0].methods.len(), 4);
        assert_eq!(
            registrations[0].methods[0].tags.get("weight").map(String::as_str),
            Some("5")
        );
    }

    #[tokio::test]
    async fn test_request_response() {
        let codecs = CodecRegistry::with_json();
        let response = dispatcher()
            .request_response(Message::new("Greeting/hello", json!("joe")))
            .await
            .unwrap();
        assert_eq!(response.decode_data::<String>(&codecs).unwrap(), "Hello, joe");
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let err = dispatcher()
            .request_response(Message::new("Greeting/secret", json!("x")))
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::unauthorized("no token"));
    }

    #[tokio::test]
    async fn test_unknown_qualifier_is_unavailable() {
        let err = dispatcher()
            .request_response(Message::new("Nope/nothing", json!(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_missing_qualifier_is_bad_request() {
        let err = dispatcher()
            .request_response(Message::builder().data(json!(1)).build())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_mode_mismatch_is_bad_request() {
        let items: Vec<_> = dispatcher()
            .request_stream(Message::new("Greeting/hello", json!("joe")))
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_request_stream_in_order() {
        let codecs = CodecRegistry::with_json();
        let items: Vec<u32> = dispatcher()
            .request_stream(Message::new("Greeting/count", json!(4)))
            .map(|m| m.unwrap().decode_data::<u32>(&codecs).unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_request_channel_replays_first() {
        let codecs = CodecRegistry::with_json();
        let input = stream::iter(vec![
            Ok(Message::new("Greeting/echo", json!("a"))),
            Ok(Message::new("Greeting/echo", json!("b"))),
        ])
        .boxed();
        let items: Vec<String> = dispatcher()
            .request_channel(input)
            .map(|m| m.unwrap().decode_data(&codecs).unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_request_channel_empty_input() {
        let items: Vec<_> = dispatcher().request_channel(stream::empty().boxed()).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().kind(), ErrorKind::BadRequest);
    }

    fn audit(calls: Arc<AtomicUsize>) -> LocalDispatcher {
        LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
            .service(ServiceDefinition::new("Audit").fire_and_forget("log", move |entry: String| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if entry == "reject" {
                        return Err(ServiceError::internal("handler failed"));
                    }
                    Ok(())
                }
            }))
            .build()
            .unwrap()
    }

    async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("handler ran {} times", calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fire_and_forget_runs_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = audit(calls.clone());

        dispatcher
            .fire_and_forget(Message::new("Audit/log", json!("entry")))
            .await
            .unwrap();
        wait_for_calls(&calls, 1).await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_hides_handler_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = audit(calls.clone());

        let result = dispatcher
            .fire_and_forget(Message::new("Audit/log", json!("reject")))
            .await;
        assert_eq!(result, Ok(()));
        wait_for_calls(&calls, 1).await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_unknown_qualifier_fails() {
        let err = audit(Arc::new(AtomicUsize::new(0)))
            .fire_and_forget(Message::new("Audit/missing", json!("entry")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_stream_error_is_terminal() {
        let dispatcher = LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
            .service(ServiceDefinition::new("Flaky").request_stream("items", |_: ()| {
                stream::iter(vec![Ok(1u32), Err(ServiceError::internal("boom")), Ok(2)])
            }))
            .build()
            .unwrap();
        let items: Vec<_> = dispatcher
            .request_stream(Message::new("Flaky/items", json!(null)))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().kind(), ErrorKind::InternalService);
    }
}
