//! Realtime stream modules.
//!
//! - `client`: public client handle and the worker that owns the websocket.
//! - `transport`: single-connection ownership slot and lifecycle state.
//! - `liveness`: read-timeout heartbeat and receive outcome classification.
//! - `router`: interest set and per-name fan-out of inbound payloads.
//! - `proto`: wire envelopes, login parameters and correlation tokens.
//! - `session`: authenticated user stream that resubscribes after the
//!   connection ends.

/// Stream client, connection handle and subscriptions.
pub mod client;
mod liveness;
/// Stream protocol messages.
pub mod proto;
mod router;
/// User stream session built on the stream client.
pub mod session;
/// Connection identity and lifecycle types.
pub mod transport;
