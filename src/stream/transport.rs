//! Ownership slot for the single websocket connection of a client.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

use crate::retry::with_timeout;
use crate::stream::client::StreamClientError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Identity of one connection instance.
///
/// Ids increase monotonically per client; a reconnect never reuses an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Lifecycle of the current connection instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No connection has been requested yet.
    Idle,
    Connecting,
    Open,
    Closing,
    /// The last instance is gone. A new acquire starts a fresh instance.
    Closed,
}

struct LiveConnection {
    id: ConnectionId,
    socket: WsSocket,
}

pub(crate) struct TransportHandle {
    endpoint: String,
    send_timeout: Duration,
    slot: Option<LiveConnection>,
    issued: u64,
    state: watch::Sender<ConnectionState>,
}

impl TransportHandle {
    pub(crate) fn new(
        endpoint: String,
        send_timeout: Duration,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            endpoint,
            send_timeout,
            slot: None,
            issued: 0,
            state,
        }
    }

    pub(crate) fn current(&self) -> Option<ConnectionId> {
        self.slot.as_ref().map(|live| live.id)
    }

    pub(crate) fn socket_mut(&mut self) -> Option<&mut WsSocket> {
        self.slot.as_mut().map(|live| &mut live.socket)
    }

    /// Returns the live connection, opening one if the slot is empty.
    pub(crate) async fn acquire(&mut self) -> Result<ConnectionId, StreamClientError> {
        if let Some(id) = self.current() {
            return Ok(id);
        }

        self.state.send_replace(ConnectionState::Connecting);
        match connect_async(self.endpoint.as_str()).await {
            Ok((socket, _)) => {
                self.issued += 1;
                let id = ConnectionId(self.issued);
                self.slot = Some(LiveConnection { id, socket });
                self.state.send_replace(ConnectionState::Open);
                debug!(
                    event = "stream_connected",
                    endpoint = %self.endpoint,
                    connection_id = id.0
                );
                Ok(id)
            }
            Err(err) => {
                self.state.send_replace(ConnectionState::Closed);
                error!(
                    event = "stream_connect_failed",
                    endpoint = %self.endpoint,
                    error = %err,
                    "websocket connect failed"
                );
                Err(StreamClientError::WebSocket(err))
            }
        }
    }

    /// Writes one text frame, acquiring the connection first if needed.
    pub(crate) async fn send_text(&mut self, text: String) -> Result<(), StreamClientError> {
        self.acquire().await?;
        self.send_frame(Message::Text(text)).await
    }

    /// Writes one frame on the live connection without acquiring.
    ///
    /// The write is bounded by `send_timeout`; a peer that stopped reading
    /// yields `SendTimeout` instead of blocking the worker.
    pub(crate) async fn send_frame(&mut self, frame: Message) -> Result<(), StreamClientError> {
        let send_timeout = self.send_timeout;
        let socket = self.socket_mut().ok_or(StreamClientError::NotConnected)?;
        match with_timeout(send_timeout, socket.send(frame)).await {
            Ok(result) => result.map_err(StreamClientError::from),
            Err(_) => Err(StreamClientError::SendTimeout(send_timeout)),
        }
    }

    /// Shuts down the live connection, if any. Close errors are ignored.
    pub(crate) async fn close(&mut self) -> Option<ConnectionId> {
        let mut live = self.slot.take()?;
        self.state.send_replace(ConnectionState::Closing);
        let _ = with_timeout(CLOSE_TIMEOUT, live.socket.close(None)).await;
        self.state.send_replace(ConnectionState::Closed);
        Some(live.id)
    }
}
