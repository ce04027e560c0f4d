//! # flmesh — peer-to-peer mesh connection fabric
//!
//! This crate is the connection fabric for a real-time collaborative mesh:
//! it connects a participant to a logical workspace via an authoritative
//! signaling server, discovers other participants, upgrades each pairwise
//! connection from a server-relayed transport to a direct peer-to-peer
//! datagram channel whenever possible, and presents a single uniform
//! send/receive surface that hides which transport was used.
//!
//! Everything above the fabric — a replicated map, a fixed-timestep game
//! loop, wire-format codegen, the signaling server itself — lives outside
//! this crate.
//!
//! The entry point is [`client::Client`].

pub mod codec;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod identity;
pub mod signal;
pub mod tasks;
pub mod testing;
pub mod topology;

mod client;

pub use client::{BoxFuture, Client, ClientConfig, ClientDriver, Credential, LifecycleState, PeerTransport, TokenProvider, TokenResult};
pub use connection::ConnectionStats;
pub use error::MeshError;
pub use events::{Event, EventSink};
pub use identity::PeerId;
