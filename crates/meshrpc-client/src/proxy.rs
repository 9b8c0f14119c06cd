use std::collections::HashMap;
use std::marker::PhantomData;

use futures::stream::{BoxStream, Stream, StreamExt};
use meshrpc_common::protocol::{CommunicationMode, Message, MethodBinding, Payload, Result, ServiceError};
use meshrpc_common::transport::{error_stream, terminate_on_error, Dispatch, MessageStream};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::service_call::ServiceCall;

fn check_mode(binding: &MethodBinding, expected: CommunicationMode) -> Result<()> {
    if binding.mode() != expected {
        return Err(ServiceError::bad_request(format!(
            "'{}' is a {} method, called as {}",
            binding.qualifier(),
            binding.mode(),
            expected
        )));
    }
    Ok(())
}

/// A typed client stub for one remote or local method.
///
/// The binding is computed once when the stub is created. Requests are
/// serialized into the message payload; responses are decoded into `Resp`
/// with the call's codecs.
///
/// # Example
///
/// ```no_run
/// use meshrpc_client::{ServiceCall, ServiceMethod};
///
/// # async fn example(call: ServiceCall) -> meshrpc_common::protocol::Result<()> {
/// let hello = ServiceMethod::<String, String>::request_response(call, "Greeting", "hello");
/// let greeting = hello.call("joe".to_string()).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceMethod<Req, Resp> {
    call: ServiceCall,
    binding: MethodBinding,
    headers: HashMap<String, String>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for ServiceMethod<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            call: self.call.clone(),
            binding: self.binding.clone(),
            headers: self.headers.clone(),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> ServiceMethod<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned + Send + 'static,
{
    fn with_mode(call: ServiceCall, namespace: &str, action: &str, mode: CommunicationMode) -> Self {
        Self {
            call,
            binding: MethodBinding::new(namespace, action, mode, std::any::type_name::<Resp>()),
            headers: HashMap::new(),
            _types: PhantomData,
        }
    }

    pub fn fire_and_forget(call: ServiceCall, namespace: &str, action: &str) -> Self {
        Self::with_mode(call, namespace, action, CommunicationMode::FireAndForget)
    }

    pub fn request_response(call: ServiceCall, namespace: &str, action: &str) -> Self {
        Self::with_mode(call, namespace, action, CommunicationMode::RequestResponse)
    }

    pub fn request_stream(call: ServiceCall, namespace: &str, action: &str) -> Self {
        Self::with_mode(call, namespace, action, CommunicationMode::RequestStream)
    }

    pub fn request_channel(call: ServiceCall, namespace: &str, action: &str) -> Self {
        Self::with_mode(call, namespace, action, CommunicationMode::RequestChannel)
    }

    pub fn binding(&self) -> &MethodBinding {
        &self.binding
    }

    /// Adds a header to every request sent through this stub, e.g.
    /// `tag.region` for tag routing.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn to_message(&self, request: &Req) -> Result<Message> {
        Ok(Message::builder()
            .qualifier(self.binding.qualifier())
            .headers(self.headers.clone())
            .data(Payload::from_serialize(request)?)
            .build())
    }

    fn decoder(&self) -> impl Fn(Result<Message>) -> Result<Resp> + Send + 'static {
        let codecs = self.call.codecs().clone();
        move |item| item.and_then(|message| message.decode_data::<Resp>(&codecs))
    }

    /// Fire-and-forget send.
    pub async fn send(&self, request: Req) -> Result<()> {
        check_mode(&self.binding, CommunicationMode::FireAndForget)?;
        let message = self.to_message(&request)?;
        self.call.fire_and_forget(message).await
    }

    /// Request-response call.
    pub async fn call(&self, request: Req) -> Result<Resp> {
        check_mode(&self.binding, CommunicationMode::RequestResponse)?;
        let message = self.to_message(&request)?;
        let response = self.call.request_response(message).await?;
        response.decode_data(self.call.codecs())
    }

    /// Request-stream call. A response that fails to decode ends the
    /// stream with that error.
    pub fn stream(&self, request: Req) -> BoxStream<'static, Result<Resp>> {
        let message = check_mode(&self.binding, CommunicationMode::RequestStream)
            .and_then(|_| self.to_message(&request));
        let responses = match message {
            Ok(message) => self.call.request_stream(message),
            Err(e) => error_stream(e),
        };
        terminate_on_error(responses.map(self.decoder()))
    }

    /// Request-channel call over a stream of requests.
    pub fn channel<S>(&self, requests: S) -> BoxStream<'static, Result<Resp>>
    where
        S: Stream<Item = Req> + Send + 'static,
        Req: Send + 'static,
    {
        if let Err(e) = check_mode(&self.binding, CommunicationMode::RequestChannel) {
            return error_stream(e).map(self.decoder()).boxed();
        }

        let qualifier = self.binding.qualifier().to_string();
        let headers = self.headers.clone();
        let messages: MessageStream = requests
            .map(move |request| -> Result<Message> {
                Ok(Message::builder()
                    .qualifier(qualifier.as_str())
                    .headers(headers.clone())
                    .data(Payload::from_serialize(&request)?)
                    .build())
            })
            .boxed();

        terminate_on_error(self.call.request_channel(messages).map(self.decoder()))
    }
}

/// An untyped stub: messages in, messages out.
///
/// Outgoing messages get the stub's qualifier; everything else, payload
/// included, passes through unchanged.
#[derive(Clone)]
pub struct MessageMethod {
    call: ServiceCall,
    binding: MethodBinding,
}

impl MessageMethod {
    pub fn new(call: ServiceCall, namespace: &str, action: &str, mode: CommunicationMode) -> Self {
        Self {
            call,
            binding: MethodBinding::raw(namespace, action, mode),
        }
    }

    pub fn binding(&self) -> &MethodBinding {
        &self.binding
    }

    fn address(&self, message: Message) -> Message {
        message.with_qualifier(self.binding.qualifier())
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        check_mode(&self.binding, CommunicationMode::FireAndForget)?;
        self.call.fire_and_forget(self.address(message)).await
    }

    pub async fn call(&self, message: Message) -> Result<Message> {
        check_mode(&self.binding, CommunicationMode::RequestResponse)?;
        self.call.request_response(self.address(message)).await
    }

    pub fn stream(&self, message: Message) -> MessageStream {
        match check_mode(&self.binding, CommunicationMode::RequestStream) {
            Ok(()) => self.call.request_stream(self.address(message)),
            Err(e) => error_stream(e),
        }
    }

    pub fn channel(&self, messages: MessageStream) -> MessageStream {
        if let Err(e) = check_mode(&self.binding, CommunicationMode::RequestChannel) {
            return error_stream(e);
        }
        let qualifier = self.binding.qualifier().to_string();
        let messages = messages
            .map(move |item| item.map(|m| m.with_qualifier(qualifier.as_str())))
            .boxed();
        self.call.request_channel(messages)
    }
}
