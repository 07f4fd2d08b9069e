//! Stream client, connection handle, and the worker that owns the websocket.
//!
//! `StreamClient::start` spawns one worker task per client. The worker owns
//! the transport handle, the liveness monitor and the subscription router;
//! every `StreamConnection` call is a command on its queue, so the
//! connection slot and interest set are never shared.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info_span, trace, warn, Instrument, Span};

use crate::stream::liveness::{classify, Heartbeat, ReceiveOutcome};
use crate::stream::proto::{Credentials, SubscribeRequest, LOGIN_METHOD};
use crate::stream::router::Router;
use crate::stream::transport::{ConnectionId, ConnectionState, TransportHandle};

/// Production websocket endpoint of the venue.
pub const STREAM_ENDPOINT: &str = "wss://api.hitbtc.com/api/2/ws";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Silence allowed on the connection before a liveness probe is sent.
    pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);
    /// Time allowed for the probe to be answered.
    pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Configuration for a stream worker.
///
/// Cloning is cheap; each call to [`StreamClient::start`] spawns an
/// independent worker with its own connection.
#[derive(Clone, Debug)]
pub struct StreamClient {
    endpoint: String,
    receive_timeout: Duration,
    ping_timeout: Duration,
    span: Option<Span>,
}

impl StreamClient {
    pub fn new() -> Self {
        Self {
            endpoint: STREAM_ENDPOINT.to_string(),
            receive_timeout: StreamDefaults::RECEIVE_TIMEOUT,
            ping_timeout: StreamDefaults::PING_TIMEOUT,
            span: None,
        }
    }

    /// Sets an explicit websocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Time allowed for the probe to be answered. Also bounds every write on
    /// the connection.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Span the worker's log events are recorded in.
    ///
    /// Defaults to an `info` span named `stream_worker` carrying the
    /// endpoint.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Spawns the stream worker and returns a handle to it.
    ///
    /// No network activity happens here: the websocket is opened by the
    /// first `acquire`, `subscribe`, `login` or `listen`. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> StreamConnection {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let span = self
            .span
            .clone()
            .unwrap_or_else(|| info_span!("stream_worker", endpoint = %self.endpoint));
        let worker = StreamWorker {
            transport: TransportHandle::new(self.endpoint.clone(), self.ping_timeout, state_tx),
            router: Router::new(),
            receive_timeout: self.receive_timeout,
            ping_timeout: self.ping_timeout,
        };
        tokio::spawn(worker.run(command_rx).instrument(span));

        StreamConnection {
            commands: command_tx,
            state: state_rx,
        }
    }
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle to a running stream worker.
///
/// The worker closes its connection and exits once every handle is dropped.
#[derive(Clone, Debug)]
pub struct StreamConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamConnection {
    /// Returns the live connection id, connecting first if none is held.
    pub async fn acquire(&self) -> Result<ConnectionId, StreamClientError> {
        self.request(|reply| Command::Acquire { reply }).await?
    }

    /// Records `name` as an active interest and sends a subscribe envelope.
    ///
    /// Re-subscribing to a known name leaves the interest set unchanged but
    /// still sends a fresh envelope.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        params: Value,
    ) -> Result<(), StreamClientError> {
        let request = SubscribeRequest::new(name, params);
        self.request(|reply| Command::Subscribe { request, reply })
            .await?
    }

    /// Sends the venue login as a `login` subscription.
    pub async fn login(&self, credentials: &Credentials) -> Result<(), StreamClientError> {
        let params = serde_json::to_value(credentials.login_params())?;
        self.subscribe(LOGIN_METHOD, params).await
    }

    /// Opens a new sequence of payloads whose method equals `name`.
    ///
    /// The sequence ends when the connection is lost, closed, or could not
    /// be opened; errors are logged, never yielded. Call `listen` again to
    /// resume after the end.
    pub async fn listen(&self, name: impl Into<String>) -> Subscription {
        let name = name.into();
        let (listener, receiver) = mpsc::unbounded_channel();
        let connection = self
            .request(|reply| Command::Listen {
                name: name.clone(),
                listener,
                reply,
            })
            .await
            .ok()
            .flatten();
        Subscription {
            name,
            connection,
            receiver,
        }
    }

    /// Snapshot of the interest set, sorted by name.
    pub async fn interests(&self) -> Result<Vec<String>, StreamClientError> {
        self.request(|reply| Command::Interests { reply }).await
    }

    /// Closes the live connection and ends every open sequence.
    ///
    /// The worker stays up; the next acquire opens a fresh connection.
    pub async fn close(&self) -> Result<(), StreamClientError> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for connection lifecycle updates.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StreamClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| StreamClientError::WorkerStopped)?;
        reply_rx.await.map_err(|_| StreamClientError::WorkerStopped)
    }
}

/// Payloads for one subscription name, in arrival order.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    connection: Option<ConnectionId>,
    receiver: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection the sequence was registered on, if one could be opened.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Waits for the next payload; `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error, including connect failures.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame was written while no connection was held.
    #[error("no live connection")]
    NotConnected,

    /// The peer did not accept a write in time; the connection was closed.
    #[error("websocket write timed out after {0:?}")]
    SendTimeout(Duration),

    /// The stream worker has exited.
    #[error("stream worker has stopped")]
    WorkerStopped,
}

impl StreamClientError {
    /// Whether a later attempt may succeed by opening a new connection.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::NotConnected | Self::SendTimeout(_)
        )
    }
}

enum Command {
    Acquire {
        reply: oneshot::Sender<Result<ConnectionId, StreamClientError>>,
    },
    Subscribe {
        request: SubscribeRequest,
        reply: oneshot::Sender<Result<(), StreamClientError>>,
    },
    Listen {
        name: String,
        listener: mpsc::UnboundedSender<Value>,
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Interests {
        reply: oneshot::Sender<Vec<String>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquire { .. } => f.write_str("Acquire"),
            Self::Subscribe { request, .. } => f
                .debug_struct("Subscribe")
                .field("method", &request.method)
                .field("id", &request.id)
                .finish(),
            Self::Listen { name, .. } => f.debug_struct("Listen").field("name", name).finish(),
            Self::Interests { .. } => f.write_str("Interests"),
            Self::Close { .. } => f.write_str("Close"),
        }
    }
}

enum SessionOutcome {
    /// Every handle was dropped.
    Shutdown,
    /// The connection ended; the worker waits for the next command.
    Ended,
}

struct StreamWorker {
    transport: TransportHandle,
    router: Router,
    receive_timeout: Duration,
    ping_timeout: Duration,
}

impl StreamWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut heartbeat = Heartbeat::new(self.receive_timeout, self.ping_timeout);
        loop {
            if self.transport.current().is_some() {
                match self.run_session(&mut commands, &mut heartbeat).await {
                    SessionOutcome::Shutdown => break,
                    SessionOutcome::Ended => continue,
                }
            }

            match commands.recv().await {
                Some(command) => self.handle_command(command).await,
                None => break,
            }
        }

        self.teardown().await;
        debug!(event = "stream_worker_stopped");
    }

    async fn run_session(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        heartbeat: &mut Heartbeat,
    ) -> SessionOutcome {
        heartbeat.reset();
        loop {
            let Some(socket) = self.transport.socket_mut() else {
                return SessionOutcome::Ended;
            };

            let outcome = tokio::select! {
                maybe_command = commands.recv() => match maybe_command {
                    Some(command) => {
                        self.handle_command(command).await;
                        continue;
                    }
                    None => return SessionOutcome::Shutdown,
                },
                frame = socket.next() => classify(frame),
                _ = heartbeat.idle() => match self.transport.socket_mut() {
                    Some(socket) => heartbeat.probe(socket).await,
                    None => return SessionOutcome::Ended,
                },
            };

            if outcome.is_terminal() {
                self.end_session(outcome).await;
                return SessionOutcome::Ended;
            }

            heartbeat.reset();
            match outcome {
                ReceiveOutcome::Message(envelope) => {
                    let method = envelope.method.clone();
                    let delivered = self.router.dispatch(envelope);
                    trace!(event = "stream_message", method = ?method, delivered);
                }
                ReceiveOutcome::Ping(payload) => {
                    let result = self.transport.send_frame(Message::Pong(payload)).await;
                    if let Err(err) = &result {
                        debug!(event = "stream_pong_failed", error = %err);
                    }
                    self.end_if_stalled(&result).await;
                }
                ReceiveOutcome::Control => {}
                ReceiveOutcome::DecodeError(err) => {
                    error!(event = "stream_decode_failed", error = %err, "error reading message");
                }
                ReceiveOutcome::Timeout | ReceiveOutcome::Closed { .. } => {}
            }
        }
    }

    async fn end_session(&mut self, outcome: ReceiveOutcome) {
        match outcome {
            ReceiveOutcome::Timeout => {
                warn!(
                    event = "stream_heartbeat_timeout",
                    "heartbeat timed out, reconnection required"
                );
            }
            ReceiveOutcome::Closed { error: Some(err) } => {
                error!(event = "stream_transport_failed", error = %err, "websocket receive failed");
            }
            _ => debug!(event = "stream_remote_closed"),
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        trace!(event = "stream_command", command = ?command);
        match command {
            Command::Acquire { reply } => {
                let _ = reply.send(self.transport.acquire().await);
            }
            Command::Subscribe { request, reply } => {
                self.router.record_interest(&request.method);
                let result = self.send_request(&request).await;
                let stalled = matches!(result, Err(StreamClientError::SendTimeout(_)));
                let _ = reply.send(result);
                if stalled {
                    self.end_stalled_session().await;
                }
            }
            Command::Listen {
                name,
                listener,
                reply,
            } => {
                self.router.record_interest(&name);
                match self.transport.acquire().await {
                    Ok(id) => {
                        self.router.add_listener(&name, listener);
                        debug!(
                            event = "stream_listener_added",
                            name = %name,
                            connection_id = id.0,
                            listeners = self.router.listener_count(&name)
                        );
                        let _ = reply.send(Some(id));
                    }
                    Err(err) => {
                        debug!(event = "stream_listen_unavailable", name = %name, error = %err);
                        let _ = reply.send(None);
                    }
                }
            }
            Command::Interests { reply } => {
                let _ = reply.send(self.router.interests());
            }
            Command::Close { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn send_request(&mut self, request: &SubscribeRequest) -> Result<(), StreamClientError> {
        let text = request.to_text()?;
        self.transport.send_text(text).await?;
        debug!(
            event = "stream_subscribe_sent",
            method = %request.method,
            id = %request.id
        );
        Ok(())
    }

    async fn end_if_stalled(&mut self, result: &Result<(), StreamClientError>) {
        if matches!(result, Err(StreamClientError::SendTimeout(_))) {
            self.end_stalled_session().await;
        }
    }

    /// Ends a session whose peer stopped accepting writes.
    async fn end_stalled_session(&mut self) {
        warn!(
            event = "stream_send_stalled",
            timeout_ms = self.ping_timeout.as_millis() as u64,
            "websocket write timed out, reconnection required"
        );
        self.teardown().await;
    }

    /// Closes the connection first so that consumers observing the end of
    /// their sequence already see `ConnectionState::Closed`.
    async fn teardown(&mut self) {
        let closed = self.transport.close().await;
        let ended = self.router.end_listeners();
        if let Some(id) = closed {
            debug!(
                event = "stream_connection_closed",
                connection_id = id.0,
                listeners_ended = ended
            );
        }
    }
}
