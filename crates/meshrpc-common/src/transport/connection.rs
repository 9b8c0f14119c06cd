//! Multiplexed connection shared by the TCP client and server.
//!
//! One socket carries many calls, keyed by stream id. A reader task routes
//! inbound frames, a writer task drains an outbound queue. Streams use
//! credit based flow control: a receiver implicitly grants `stream_window`
//! frames and tops the sender up with `RequestN` as its consumer pulls, and a
//! sender waits for credit before pulling the next item from its source.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::frame::{read_frame, Frame};
use super::tcp::TcpConfig;
use super::{error_stream, Dispatch, MessageStream};
use crate::codec::MessageCodec;
use crate::protocol::error::{Result, ServiceError};
use crate::protocol::{CommunicationMode, Message};

/// Which side of the connection we are.
#[derive(Clone)]
pub(crate) enum Role {
    Client,
    Server(Arc<dyn Dispatch>),
}

/// Where inbound `Next`/`Error`/`Complete` frames of a stream id go.
enum Sink {
    Single(oneshot::Sender<Result<Message>>),
    Stream(mpsc::UnboundedSender<Result<Message>>),
}

impl Sink {
    fn fail(self, error: ServiceError) {
        match self {
            Sink::Single(tx) => {
                let _ = tx.send(Err(error));
            }
            Sink::Stream(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// A producer task we run for a stream id, with its send credits.
struct Outbound {
    credits: Arc<Semaphore>,
    task: Option<AbortHandle>,
}

pub(crate) struct Connection {
    peer: String,
    codec: MessageCodec,
    window: u32,
    writer: mpsc::UnboundedSender<Frame>,
    sinks: DashMap<u64, Sink>,
    outbound: DashMap<u64, Outbound>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
    next_stream_id: AtomicU64,
}

impl Connection {
    /// Starts the reader and writer tasks for an established socket.
    pub(crate) fn spawn(
        stream: TcpStream,
        role: Role,
        codec: MessageCodec,
        config: &TcpConfig,
    ) -> Arc<Connection> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        let (writer, queue) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let conn = Arc::new(Connection {
            peer,
            codec,
            window: config.stream_window.max(1),
            writer,
            sinks: DashMap::new(),
            outbound: DashMap::new(),
            closed,
            tasks: Mutex::new(Vec::new()),
            next_stream_id: AtomicU64::new(1),
        });

        let write_task = tokio::spawn(write_loop(Arc::downgrade(&conn), write_half, queue));
        let read_task = tokio::spawn(read_loop(
            conn.clone(),
            read_half,
            role,
            config.max_frame_size,
        ));

        if let Ok(mut tasks) = conn.tasks.lock() {
            tasks.push(write_task.abort_handle());
            tasks.push(read_task.abort_handle());
        }

        conn
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
        .boxed()
    }

    /// Closes the connection: fails every pending call, stops every
    /// producer, fires the close signal. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!(peer = %self.peer, "Connection closed");

        let error = ServiceError::connection(format!("connection to {} closed", self.peer));
        let ids: Vec<u64> = self.sinks.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, sink)) = self.sinks.remove(&id) {
                sink.fail(error.clone());
            }
        }

        let ids: Vec<u64> = self.outbound.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.cancel_outbound(id);
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.writer
            .send(frame)
            .map_err(|_| ServiceError::connection(format!("connection to {} closed", self.peer)))
    }

    fn allocate_stream_id(&self) -> u64 {
        // Client-initiated ids are odd.
        self.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Registers a sink, failing if the connection already closed. The flag
    /// is checked after insertion so a concurrent `close` either drains the
    /// sink or is observed here.
    fn register_sink(&self, stream_id: u64, sink: Sink) -> Result<()> {
        self.sinks.insert(stream_id, sink);
        if self.is_closed() {
            self.sinks.remove(&stream_id);
            return Err(ServiceError::connection(format!(
                "connection to {} closed",
                self.peer
            )));
        }
        Ok(())
    }

    fn message_frame(&self, message: &Message) -> Result<(bytes::Bytes, bytes::Bytes)> {
        self.codec.encode(message)
    }

    fn cancel_outbound(&self, stream_id: u64) {
        if let Some((_, outbound)) = self.outbound.remove(&stream_id) {
            outbound.credits.close();
            if let Some(task) = outbound.task {
                task.abort();
            }
        }
    }

    fn deliver(&self, stream_id: u64, item: Result<Message>) {
        match item {
            Ok(message) => {
                let single = matches!(self.sinks.get(&stream_id).as_deref(), Some(Sink::Single(_)));
                if single {
                    if let Some((_, Sink::Single(tx))) = self.sinks.remove(&stream_id) {
                        let _ = tx.send(Ok(message));
                    }
                } else if let Some(sink) = self.sinks.get(&stream_id) {
                    if let Sink::Stream(tx) = sink.value() {
                        let _ = tx.send(Ok(message));
                    }
                } else {
                    trace!(peer = %self.peer, stream_id, "Dropping frame for unknown stream");
                }
            }
            Err(error) => {
                // A message that cannot be decoded terminates the call.
                if let Some((_, sink)) = self.sinks.remove(&stream_id) {
                    sink.fail(error);
                    let _ = self.send(Frame::Cancel { stream_id });
                }
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame, role: &Role) {
        match frame {
            Frame::Request {
                mode,
                stream_id,
                headers,
                data,
            } => match role {
                Role::Server(acceptor) => {
                    self.accept_call(acceptor.clone(), mode, stream_id, headers, data)
                }
                Role::Client => {
                    warn!(peer = %self.peer, stream_id, "Ignoring request frame sent to a client");
                }
            },
            Frame::Next {
                stream_id,
                headers,
                data,
            } => {
                let item = self.codec.decode(data, headers);
                self.deliver(stream_id, item);
            }
            Frame::Complete { stream_id } => {
                self.sinks.remove(&stream_id);
            }
            Frame::Error {
                stream_id,
                code,
                message,
            } => {
                if let Some((_, sink)) = self.sinks.remove(&stream_id) {
                    sink.fail(ServiceError::remote(code, message));
                }
            }
            Frame::Cancel { stream_id } => {
                self.cancel_outbound(stream_id);
                // A requester cancelling also ends the request side of a
                // channel; a responder cancelling only stops our input pump.
                if let Role::Server(_) = role {
                    self.sinks.remove(&stream_id);
                }
            }
            Frame::RequestN { stream_id, n } => {
                if let Some(outbound) = self.outbound.get(&stream_id) {
                    outbound.credits.add_permits(n as usize);
                }
            }
        }
    }

    /// Server side: decodes an inbound call and runs it against the acceptor.
    fn accept_call(
        self: &Arc<Self>,
        acceptor: Arc<dyn Dispatch>,
        mode: CommunicationMode,
        stream_id: u64,
        headers: bytes::Bytes,
        data: bytes::Bytes,
    ) {
        let message = match self.codec.decode(data, headers) {
            Ok(message) if !message.qualifier().is_empty() => message,
            Ok(_) => {
                self.reject(mode, stream_id, ServiceError::bad_request("Missing required header 'q'"));
                return;
            }
            Err(e) => {
                self.reject(mode, stream_id, e);
                return;
            }
        };

        trace!(peer = %self.peer, stream_id, %mode, qualifier = message.qualifier(), "Inbound call");

        match mode {
            CommunicationMode::FireAndForget => {
                tokio::spawn(async move {
                    let qualifier = message.qualifier().to_string();
                    let outcome = AssertUnwindSafe(acceptor.fire_and_forget(message))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|p| Err(panic_error(p)));
                    if let Err(e) = outcome {
                        warn!(%qualifier, error = %e, "Fire-and-forget handler failed");
                    }
                });
            }
            CommunicationMode::RequestResponse => {
                self.outbound.insert(
                    stream_id,
                    Outbound {
                        credits: Arc::new(Semaphore::new(0)),
                        task: None,
                    },
                );
                let conn = self.clone();
                let task = tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(acceptor.request_response(message))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|p| Err(panic_error(p)));
                    let frame = match outcome {
                        Ok(response) => match conn.message_frame(&response) {
                            Ok((data, headers)) => Frame::Next {
                                stream_id,
                                headers,
                                data,
                            },
                            Err(e) => Frame::error(stream_id, &e),
                        },
                        Err(e) => Frame::error(stream_id, &e),
                    };
                    let _ = conn.send(frame);
                    conn.outbound.remove(&stream_id);
                });
                if let Some(mut outbound) = self.outbound.get_mut(&stream_id) {
                    outbound.task = Some(task.abort_handle());
                }
            }
            CommunicationMode::RequestStream => {
                let responses = panic::catch_unwind(AssertUnwindSafe(|| acceptor.request_stream(message)))
                    .unwrap_or_else(|p| error_stream(panic_error(p)));
                self.spawn_pump(stream_id, responses);
            }
            CommunicationMode::RequestChannel => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.sinks.insert(stream_id, Sink::Stream(tx));
                let rest = InboundStream::new(self.clone(), stream_id, rx, false);
                let requests = stream::once(async move { Ok::<_, ServiceError>(message) }).chain(rest).boxed();
                let responses = panic::catch_unwind(AssertUnwindSafe(|| acceptor.request_channel(requests)))
                    .unwrap_or_else(|p| error_stream(panic_error(p)));
                self.spawn_pump(stream_id, responses);
            }
        }
    }

    fn reject(&self, mode: CommunicationMode, stream_id: u64, error: ServiceError) {
        warn!(peer = %self.peer, stream_id, error = %error, "Rejecting inbound call");
        if mode != CommunicationMode::FireAndForget {
            let _ = self.send(Frame::error(stream_id, &error));
        }
    }

    /// Forwards `source` as `Next` frames under flow control, then a
    /// terminal `Complete` or `Error`.
    fn spawn_pump(self: &Arc<Self>, stream_id: u64, source: MessageStream) {
        let credits = Arc::new(Semaphore::new(self.window as usize));
        self.outbound.insert(
            stream_id,
            Outbound {
                credits: credits.clone(),
                task: None,
            },
        );

        let conn = self.clone();
        let task = tokio::spawn(async move {
            let mut source = source;
            loop {
                match credits.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
                let next = AssertUnwindSafe(source.next())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|p| Some(Err(panic_error(p))));
                let frame = match next {
                    Some(Ok(message)) => match conn.message_frame(&message) {
                        Ok((data, headers)) => Frame::Next {
                            stream_id,
                            headers,
                            data,
                        },
                        Err(e) => {
                            let _ = conn.send(Frame::error(stream_id, &e));
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        let _ = conn.send(Frame::error(stream_id, &e));
                        break;
                    }
                    None => {
                        let _ = conn.send(Frame::Complete { stream_id });
                        break;
                    }
                };
                if conn.send(frame).is_err() {
                    break;
                }
            }
            conn.outbound.remove(&stream_id);
        });

        if let Some(mut outbound) = self.outbound.get_mut(&stream_id) {
            outbound.task = Some(task.abort_handle());
        }
    }

    pub(crate) async fn fire_and_forget(&self, message: Message) -> Result<()> {
        let (data, headers) = self.message_frame(&message)?;
        self.send(Frame::Request {
            mode: CommunicationMode::FireAndForget,
            stream_id: self.allocate_stream_id(),
            headers,
            data,
        })
    }

    pub(crate) async fn request_response(self: &Arc<Self>, message: Message) -> Result<Message> {
        let (data, headers) = self.message_frame(&message)?;
        let stream_id = self.allocate_stream_id();
        let (tx, rx) = oneshot::channel();
        self.register_sink(stream_id, Sink::Single(tx))?;

        let mut guard = CancelGuard {
            conn: self.clone(),
            stream_id,
            armed: true,
        };
        self.send(Frame::Request {
            mode: CommunicationMode::RequestResponse,
            stream_id,
            headers,
            data,
        })?;

        let result = rx.await;
        guard.armed = false;
        match result {
            Ok(response) => response,
            Err(_) => Err(ServiceError::connection(format!(
                "connection to {} closed before a response arrived",
                self.peer
            ))),
        }
    }

    pub(crate) fn request_stream(self: &Arc<Self>, message: Message) -> MessageStream {
        match self.open_stream(CommunicationMode::RequestStream, &message) {
            Ok((_, responses)) => responses.boxed(),
            Err(e) => error_stream(e),
        }
    }

    pub(crate) fn request_channel(self: &Arc<Self>, requests: MessageStream) -> MessageStream {
        let conn = self.clone();
        stream::once(async move {
            let mut requests = requests;
            match requests.next().await {
                Some(Ok(first)) => {
                    match conn.open_stream(CommunicationMode::RequestChannel, &first) {
                        Ok((stream_id, responses)) => {
                            conn.spawn_pump(stream_id, requests);
                            responses.boxed()
                        }
                        Err(e) => error_stream(e),
                    }
                }
                Some(Err(e)) => error_stream(e),
                None => error_stream(ServiceError::bad_request(
                    "Request channel needs at least one message",
                )),
            }
        })
        .flatten()
        .boxed()
    }

    fn open_stream(
        self: &Arc<Self>,
        mode: CommunicationMode,
        message: &Message,
    ) -> Result<(u64, InboundStream)> {
        let (data, headers) = self.message_frame(message)?;
        let stream_id = self.allocate_stream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.register_sink(stream_id, Sink::Stream(tx))?;
        let responses = InboundStream::new(self.clone(), stream_id, rx, true);
        self.send(Frame::Request {
            mode,
            stream_id,
            headers,
            data,
        })?;
        Ok((stream_id, responses))
    }
}

/// Sends `Cancel` if a request-response future is dropped before its
/// response arrives.
struct CancelGuard {
    conn: Arc<Connection>,
    stream_id: u64,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed && self.conn.sinks.remove(&self.stream_id).is_some() {
            let _ = self.conn.send(Frame::Cancel {
                stream_id: self.stream_id,
            });
        }
    }
}

/// Receiving half of a stream.
///
/// Grants credit back to the sender as items are consumed; dropping it
/// before the terminal signal cancels the stream at the peer.
pub(crate) struct InboundStream {
    conn: Arc<Connection>,
    stream_id: u64,
    rx: mpsc::UnboundedReceiver<Result<Message>>,
    consumed: u32,
    done: bool,
    requester: bool,
}

impl InboundStream {
    fn new(
        conn: Arc<Connection>,
        stream_id: u64,
        rx: mpsc::UnboundedReceiver<Result<Message>>,
        requester: bool,
    ) -> Self {
        Self {
            conn,
            stream_id,
            rx,
            consumed: 0,
            done: false,
            requester,
        }
    }

    fn replenish_threshold(&self) -> u32 {
        (self.conn.window / 2).max(1)
    }
}

impl Stream for InboundStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(message))) => {
                self.consumed += 1;
                if self.consumed >= self.replenish_threshold() {
                    let n = std::mem::take(&mut self.consumed);
                    let _ = self.conn.send(Frame::RequestN {
                        stream_id: self.stream_id,
                        n,
                    });
                }
                Poll::Ready(Some(Ok(message)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for InboundStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.conn.sinks.remove(&self.stream_id).is_some() {
            debug!(peer = %self.conn.peer, stream_id = self.stream_id, "Cancelling stream");
            let _ = self.conn.send(Frame::Cancel {
                stream_id: self.stream_id,
            });
        }
        if self.requester {
            self.conn.cancel_outbound(self.stream_id);
        }
    }
}

async fn read_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf, role: Role, max_frame_size: usize) {
    loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => conn.handle_frame(frame, &role),
            Ok(None) => {
                debug!(peer = %conn.peer, "Connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(peer = %conn.peer, error = %e, "Connection error");
                break;
            }
        }
    }
    conn.close();
}

async fn write_loop(
    conn: Weak<Connection>,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame.encode()).await {
            warn!(error = %e, "Failed to write frame");
            break;
        }
        if queue.is_empty() {
            if let Err(e) = writer.flush().await {
                warn!(error = %e, "Failed to flush connection");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    if let Some(conn) = conn.upgrade() {
        conn.close();
    }
}

/// Turns a handler panic into the error the caller receives.
fn panic_error(payload: Box<dyn Any + Send>) -> ServiceError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    warn!(%detail, "Handler panicked");
    ServiceError::internal(format!("Handler panicked: {}", detail))
}
