//! Read-timeout heartbeat for the receive loop.
//!
//! Every frame re-arms an idle timer of `receive_timeout`. When it fires the
//! monitor sends a websocket ping and waits `ping_timeout` for any inbound
//! frame. Silence past that bound is terminal for the connection.

use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{sleep, Instant, Sleep};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::retry::with_timeout;
use crate::stream::client::StreamClientError;
use crate::stream::proto::InboundEnvelope;
use crate::stream::transport::WsSocket;

/// Result of one receive attempt on the live connection.
#[derive(Debug)]
pub(crate) enum ReceiveOutcome {
    /// A decoded envelope, ready for routing.
    Message(InboundEnvelope),
    /// Server ping that must be answered with the same payload.
    Ping(Vec<u8>),
    /// Pong or other control frame; proves liveness only.
    Control,
    /// The liveness probe went unanswered.
    Timeout,
    /// Remote close, end of stream, or a read error.
    Closed { error: Option<WsError> },
    /// The frame payload is not a JSON envelope; the session continues.
    DecodeError(StreamClientError),
}

impl ReceiveOutcome {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Self::Timeout | Self::Closed { .. })
    }
}

pub(crate) fn classify(frame: Option<Result<Message, WsError>>) -> ReceiveOutcome {
    match frame {
        Some(Ok(Message::Text(text))) => match InboundEnvelope::from_text(&text) {
            Ok(envelope) => ReceiveOutcome::Message(envelope),
            Err(err) => ReceiveOutcome::DecodeError(err.into()),
        },
        Some(Ok(Message::Binary(bytes))) => match InboundEnvelope::from_slice(&bytes) {
            Ok(envelope) => ReceiveOutcome::Message(envelope),
            Err(err) => ReceiveOutcome::DecodeError(err.into()),
        },
        Some(Ok(Message::Ping(payload))) => ReceiveOutcome::Ping(payload),
        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => ReceiveOutcome::Control,
        Some(Ok(Message::Close(_))) | None => ReceiveOutcome::Closed { error: None },
        Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
            ReceiveOutcome::Closed { error: None }
        }
        // The socket stops yielding frames after any read error, including
        // invalid UTF-8 and oversized messages.
        Some(Err(err)) => ReceiveOutcome::Closed { error: Some(err) },
    }
}

#[derive(Debug)]
pub(crate) struct Heartbeat {
    receive_timeout: Duration,
    ping_timeout: Duration,
    idle: Pin<Box<Sleep>>,
}

impl Heartbeat {
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(receive_timeout: Duration, ping_timeout: Duration) -> Self {
        Self {
            receive_timeout,
            ping_timeout,
            idle: Box::pin(sleep(receive_timeout)),
        }
    }

    pub(crate) fn reset(&mut self) {
        let deadline = Instant::now() + self.receive_timeout;
        self.idle.as_mut().reset(deadline);
    }

    /// Timer that completes once no frame arrived for `receive_timeout`.
    pub(crate) fn idle(&mut self) -> &mut Pin<Box<Sleep>> {
        &mut self.idle
    }

    /// Pings the peer and waits a bounded time for any frame.
    ///
    /// A ping that cannot be written within `ping_timeout` counts as an
    /// unanswered probe.
    pub(crate) async fn probe(&mut self, socket: &mut WsSocket) -> ReceiveOutcome {
        match with_timeout(self.ping_timeout, socket.send(Message::Ping(Vec::new()))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return classify(Some(Err(err))),
            Err(_) => return ReceiveOutcome::Timeout,
        }
        let outcome = match with_timeout(self.ping_timeout, socket.next()).await {
            Ok(frame) => classify(frame),
            Err(_) => ReceiveOutcome::Timeout,
        };
        self.reset();
        outcome
    }
}
