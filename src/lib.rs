//! Rust SDK for the venue's websocket stream.
//!
//! One client holds a single websocket, multiplexes named subscriptions over
//! it and fans each inbound message out to every listener of its method.
//!
//! - `stream`: connection lifecycle, heartbeat, routing and the user stream.
//! - `retry`: shared retry and timeout utilities.

/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime stream client, protocol types, and session helpers.
pub mod stream;

pub use stream::client::{
    StreamClient, StreamClientError, StreamConnection, StreamDefaults, Subscription,
};
pub use stream::proto::Credentials;
pub use stream::transport::{ConnectionId, ConnectionState};
