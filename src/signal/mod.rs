//! # Signaling Transport
//!
//! The authenticated duplex channel to the signaling server: connect with
//! backoff-governed reconnection, an application-level heartbeat riding on
//! WebSocket ping/pong control frames, and dispatch of inbound binary and
//! legacy-text frames into a typed event stream. Grounded on
//! `flarch::web_rtc::libc::web_socket_client::WebSocketClient`'s
//! connect/split/listen shape, adapted from that file's `Broker` plumbing
//! to a plain `tokio::sync::mpsc` channel — the client at this crate's top
//! level is the single task that drains it, which is where the single
//! conceptual task queue actually lives.

pub mod transport;

pub use transport::{EphemeralPayload, HeartbeatConfig, SignalingTransport, TransportEvent};
