//! Service definitions: typed handler registration per communication mode.
//!
//! Typed handlers are erased into message-level invokers at registration
//! time. Request payloads are decoded with the dispatcher's codec registry
//! when a call arrives; responses are wrapped into messages carrying the
//! method qualifier.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use futures::FutureExt;
use meshrpc_common::codec::CodecRegistry;
use meshrpc_common::protocol::{CommunicationMode, Message, MethodBinding, Payload, Result, ServiceError};
use meshrpc_common::transport::{error_stream, terminate_on_error, MessageStream};
use serde::de::DeserializeOwned;
use serde::Serialize;

type FireAndForgetFn = dyn Fn(Message, Arc<CodecRegistry>) -> BoxFuture<'static, Result<()>> + Send + Sync;
type RequestResponseFn =
    dyn Fn(Message, Arc<CodecRegistry>) -> BoxFuture<'static, Result<Message>> + Send + Sync;
type RequestStreamFn = dyn Fn(Message, Arc<CodecRegistry>) -> MessageStream + Send + Sync;
type RequestChannelFn = dyn Fn(MessageStream, Arc<CodecRegistry>) -> MessageStream + Send + Sync;

/// A registered handler, erased to message level.
#[derive(Clone)]
pub(crate) enum Handler {
    FireAndForget(Arc<FireAndForgetFn>),
    RequestResponse(Arc<RequestResponseFn>),
    RequestStream(Arc<RequestStreamFn>),
    RequestChannel(Arc<RequestChannelFn>),
}

pub(crate) struct MethodEntry {
    pub(crate) binding: MethodBinding,
    pub(crate) tags: HashMap<String, String>,
    pub(crate) handler: Handler,
}

/// Builds the response message for a typed handler's return value.
fn wrap_response<T: Serialize>(
    qualifier: &str,
    response_type: &'static str,
    stream_id: Option<&str>,
    value: &T,
) -> Result<Message> {
    let payload = Payload::from_serialize(value).map_err(|e| {
        ServiceError::internal(format!("Failed to encode response of '{}': {}", qualifier, e))
    })?;
    let mut builder = Message::builder()
        .qualifier(qualifier)
        .data_type(response_type)
        .data(payload);
    if let Some(sid) = stream_id {
        builder = builder.stream_id(sid);
    }
    Ok(builder.build())
}

/// A named group of methods.
///
/// # Example
///
/// ```
/// use futures::stream;
/// use meshrpc_common::protocol::ServiceError;
/// use meshrpc_server::ServiceDefinition;
///
/// let greeting = ServiceDefinition::new("Greeting")
///     .request_response("hello", |name: String| async move {
///         Ok(format!("Hello, {}", name))
///     })
///     .request_stream("count", |n: u32| {
///         stream::iter((0..n).map(Ok::<_, ServiceError>))
///     })
///     .tag("version", "2");
///
/// assert_eq!(greeting.namespace(), "Greeting");
/// ```
pub struct ServiceDefinition {
    namespace: String,
    tags: HashMap<String, String>,
    pub(crate) methods: Vec<MethodEntry>,
}

impl ServiceDefinition {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tags: HashMap::new(),
            methods: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    pub fn bindings(&self) -> impl Iterator<Item = &MethodBinding> {
        self.methods.iter().map(|m| &m.binding)
    }

    /// Adds a service-level tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds a tag to an already registered method. Unknown actions are
    /// ignored.
    pub fn method_tag(mut self, action: &str, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(method) = self.methods.iter_mut().find(|m| m.binding.action() == action) {
            method.tags.insert(key.into(), value.into());
        }
        self
    }

    fn push(mut self, binding: MethodBinding, handler: Handler) -> Self {
        self.methods.push(MethodEntry {
            binding,
            tags: HashMap::new(),
            handler,
        });
        self
    }

    pub fn fire_and_forget<Req, F, Fut>(self, action: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let binding = MethodBinding::new(
            self.namespace.clone(),
            action,
            CommunicationMode::FireAndForget,
            "()",
        );
        let handler = Arc::new(handler);
        let invoke = move |message: Message, codecs: Arc<CodecRegistry>| {
            let handler = handler.clone();
            async move {
                let request: Req = message.decode_data(&codecs)?;
                (*handler)(request).await
            }
            .boxed()
        };
        self.push(binding, Handler::FireAndForget(Arc::new(invoke)))
    }

    pub fn request_response<Req, Resp, F, Fut>(self, action: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let binding = MethodBinding::new(
            self.namespace.clone(),
            action,
            CommunicationMode::RequestResponse,
            std::any::type_name::<Resp>(),
        );
        let qualifier = binding.qualifier().to_string();
        let response_type = binding.response_type();
        let handler = Arc::new(handler);
        let invoke = move |message: Message, codecs: Arc<CodecRegistry>| {
            let handler = handler.clone();
            let qualifier = qualifier.clone();
            async move {
                let request: Req = message.decode_data(&codecs)?;
                let response = (*handler)(request).await?;
                wrap_response(&qualifier, response_type, message.stream_id(), &response)
            }
            .boxed()
        };
        self.push(binding, Handler::RequestResponse(Arc::new(invoke)))
    }

    pub fn request_stream<Req, Resp, F, S>(self, action: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp>> + Send + 'static,
    {
        let binding = MethodBinding::new(
            self.namespace.clone(),
            action,
            CommunicationMode::RequestStream,
            std::any::type_name::<Resp>(),
        );
        let qualifier = binding.qualifier().to_string();
        let response_type = binding.response_type();
        let invoke = move |message: Message, codecs: Arc<CodecRegistry>| -> MessageStream {
            let request: Req = match message.decode_data(&codecs) {
                Ok(request) => request,
                Err(e) => return error_stream(e),
            };
            let qualifier = qualifier.clone();
            let stream_id = message.stream_id().map(str::to_string);
            terminate_on_error(handler(request).map(move |item| {
                item.and_then(|value| wrap_response(&qualifier, response_type, stream_id.as_deref(), &value))
            }))
        };
        self.push(binding, Handler::RequestStream(Arc::new(invoke)))
    }

    /// Registers a full-duplex method. Request items that fail to decode
    /// reach the handler as errors. Responses carry the stream id of the
    /// first request.
    pub fn request_channel<Req, Resp, F, S>(self, action: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(BoxStream<'static, Result<Req>>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp>> + Send + 'static,
    {
        let binding = MethodBinding::new(
            self.namespace.clone(),
            action,
            CommunicationMode::RequestChannel,
            std::any::type_name::<Resp>(),
        );
        let qualifier = binding.qualifier().to_string();
        let response_type = binding.response_type();
        let handler = Arc::new(handler);
        let invoke = move |messages: MessageStream, codecs: Arc<CodecRegistry>| -> MessageStream {
            let handler = handler.clone();
            let qualifier = qualifier.clone();
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
                let stream_id = first.stream_id().map(str::to_string);
                let requests = stream::once(async move { Ok::<_, ServiceError>(first) })
                    .chain(messages)
                    .map(move |item| item.and_then(|message| message.decode_data::<Req>(&codecs)))
                    .boxed();
                terminate_on_error((*handler)(requests).map(move |item| {
                    item.and_then(|value| wrap_response(&qualifier, response_type, stream_id.as_deref(), &value))
                }))
            })
            .flatten()
            .boxed()
        };
        self.push(binding, Handler::RequestChannel(Arc::new(invoke)))
    }

    /// Registers a fire-and-forget handler that receives the message as is.
    pub fn raw_fire_and_forget<F, Fut>(self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let binding = MethodBinding::raw(self.namespace.clone(), action, CommunicationMode::FireAndForget);
        let invoke = move |message: Message, _codecs: Arc<CodecRegistry>| handler(message).boxed();
        self.push(binding, Handler::FireAndForget(Arc::new(invoke)))
    }

    pub fn raw_request_response<F, Fut>(self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message>> + Send + 'static,
    {
        let binding =
            MethodBinding::raw(self.namespace.clone(), action, CommunicationMode::RequestResponse);
        let invoke = move |message: Message, _codecs: Arc<CodecRegistry>| handler(message).boxed();
        self.push(binding, Handler::RequestResponse(Arc::new(invoke)))
    }

    pub fn raw_request_stream<F, S>(self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Message>> + Send + 'static,
    {
        let binding = MethodBinding::raw(self.namespace.clone(), action, CommunicationMode::RequestStream);
        let invoke = move |message: Message, _codecs: Arc<CodecRegistry>| -> MessageStream {
            terminate_on_error(handler(message))
        };
        self.push(binding, Handler::RequestStream(Arc::new(invoke)))
    }

    pub fn raw_request_channel<F, S>(self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(MessageStream) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Message>> + Send + 'static,
    {
        let binding =
            MethodBinding::raw(self.namespace.clone(), action, CommunicationMode::RequestChannel);
        let invoke = move |messages: MessageStream, _codecs: Arc<CodecRegistry>| -> MessageStream {
            terminate_on_error(handler(messages))
        };
        self.push(binding, Handler::RequestChannel(Arc::new(invoke)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        text: String,
    }

    fn codecs() -> Arc<CodecRegistry> {
        Arc::new(CodecRegistry::with_json())
    }

    #[test]
    fn test_bindings_carry_mode() {
        let def = ServiceDefinition::new("Greeting")
            .fire_and_forget("notify", |_: String| async { Ok(()) })
            .request_response("hello", |name: String| async move { Ok(name) })
            .request_stream("many", |n: u32| stream::iter((0..n).map(Ok)))
            .request_channel("chat", |s: BoxStream<'static, Result<String>>| s);

        let modes: Vec<_> = def.bindings().map(|b| (b.qualifier().to_string(), b.mode())).collect();
        assert_eq!(
            modes,
            vec![
                ("Greeting/notify".to_string(), CommunicationMode::FireAndForget),
                ("Greeting/hello".to_string(), CommunicationMode::RequestResponse),
                ("Greeting/many".to_string(), CommunicationMode::RequestStream),
                ("Greeting/chat".to_string(), CommunicationMode::RequestChannel),
            ]
        );
    }

    #[test]
    fn test_raw_binding_flags() {
        let def = ServiceDefinition::new("Echo")
            .raw_request_response("say", |m: Message| async move { Ok(m) })
            .request_response("typed", |s: String| async move { Ok(s) });
        let bindings: Vec<_> = def.bindings().collect();
        assert!(bindings[0].request_is_message());
        assert!(bindings[0].response_is_message());
        assert!(!bindings[1].request_is_message());
    }

    #[test]
    fn test_tags() {
        let def = ServiceDefinition::new("Greeting")
            .tag("version", "2")
            .request_response("hello", |s: String| async move { Ok(s) })
            .method_tag("hello", "weight", "3")
            .method_tag("missing", "weight", "9");
        assert_eq!(def.tags().get("version").map(String::as_str), Some("2"));
        assert_eq!(def.methods[0].tags.get("weight").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_typed_request_response_wraps() {
        let def = ServiceDefinition::new("Greeting").request_response("hello", |name: String| async move {
            Ok(Greeting {
                text: format!("Hello, {}", name),
            })
        });
        let Handler::RequestResponse(invoke) = &def.methods[0].handler else {
            panic!("wrong handler kind");
        };

        let request = Message::builder()
            .qualifier("Greeting/hello")
            .stream_id("s-1")
            .data(json!("joe"))
            .build();
        let response = invoke(request, codecs()).await.unwrap();
        assert_eq!(response.qualifier(), "Greeting/hello");
        assert_eq!(response.stream_id(), Some("s-1"));
        assert!(response.data_type().unwrap().ends_with("Greeting"));
        assert_eq!(
            response.decode_data::<Greeting>(&codecs()).unwrap(),
            Greeting {
                text: "Hello, joe".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_typed_decode_failure_is_bad_request() {
        let def = ServiceDefinition::new("Math").request_response("double", |n: u32| async move { Ok(n * 2) });
        let Handler::RequestResponse(invoke) = &def.methods[0].handler else {
            panic!("wrong handler kind");
        };
        let err = invoke(Message::new("Math/double", json!("not a number")), codecs())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), meshrpc_common::protocol::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_typed_stream_wraps_each_item() {
        let def = ServiceDefinition::new("Math").request_stream("count", |n: u32| stream::iter((0..n).map(Ok)));
        let Handler::RequestStream(invoke) = &def.methods[0].handler else {
            panic!("wrong handler kind");
        };
        let items: Vec<u32> = invoke(Message::new("Math/count", json!(3)), codecs())
            .map(|item| item.unwrap().decode_data::<u32>(&codecs()).unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_typed_channel_decodes_requests() {
        let def = ServiceDefinition::new("Math").request_channel(
            "square",
            |requests: BoxStream<'static, Result<i64>>| requests.map(|n| n.map(|n| n * n)),
        );
        let Handler::RequestChannel(invoke) = &def.methods[0].handler else {
            panic!("wrong handler kind");
        };
        let input = stream::iter(vec![
            Ok(Message::new("Math/square", json!(2))),
            Ok(Message::new("Math/square", json!(5))),
        ])
        .boxed();
        let items: Vec<i64> = invoke(input, codecs())
            .map(|item| item.unwrap().decode_data::<i64>(&codecs()).unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![4, 25]);
    }

    #[tokio::test]
    async fn test_typed_stream_ends_at_first_error() {
        let def = ServiceDefinition::new("Math").request_stream("flaky", |_: ()| {
            stream::iter(vec![Ok(1u32), Err(ServiceError::internal("boom")), Ok(2)])
        });
        let Handler::RequestStream(invoke) = &def.methods[0].handler else {
            panic!("wrong handler kind");
        };
        let items: Vec<_> = invoke(Message::new("Math/flaky", json!(null)), codecs()).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().decode_data::<u32>(&codecs()).unwrap(), 1);
        assert_eq!(items[1].as_ref().unwrap_err(), &ServiceError::internal("boom"));
    }

    #[tokio::test]
    async fn test_raw_channel_ends_at_first_error() {
        let def = ServiceDefinition::new("Echo").raw_request_channel("relay", |messages: MessageStream| {
            messages.chain(stream::iter(vec![
                Err(ServiceError::unauthorized("stop")),
                Ok(Message::new("Echo/relay", json!("late"))),
            ]))
        });
        let Handler::RequestChannel(invoke) = &def.methods[0].handler else {
            panic!("wrong handler kind");
        };
        let input = stream::iter(vec![Ok(Message::new("Echo/relay", json!("a")))]).boxed();
        let items: Vec<_> = invoke(input, codecs()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err(), &ServiceError::unauthorized("stop"));
    }

    #[tokio::test]
    async fn test_typed_channel_echoes_stream_id() {
        let def = ServiceDefinition::new("Math").request_channel(
            "square",
            |requests: BoxStream<'static, Result<i64>>| requests.map(|n| n.map(|n| n * n)),
        );
        let Handler::RequestChannel(invoke) = &def.methods[0].handler else {
            panic!("wrong handler kind");
        };
        let input = stream::iter(vec![
            Ok(Message::builder()
                .qualifier("Math/square")
                .stream_id("c-7")
                .data(json!(3))
                .build()),
            Ok(Message::builder()
                .qualifier("Math/square")
                .stream_id("c-7")
                .data(json!(4))
                .build()),
        ])
        .boxed();
        let responses: Vec<Message> = invoke(input, codecs()).map(|item| item.unwrap()).collect().await;
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|m| m.stream_id() == Some("c-7")));
        assert!(responses.iter().all(|m| m.qualifier() == "Math/square"));
    }
}
