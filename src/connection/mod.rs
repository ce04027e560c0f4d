//! # Connection Manager
//!
//! The pairwise connection state machine: offer/answer/candidate
//! exchange, datagram channel lifecycle, glare resolution, candidate
//! queueing. Built on the `webrtc` crate the same way
//! `flarch::web_rtc::libc::web_rtc_setup` is, but organized as a plain
//! owned collection rather than one `Broker` per connection direction —
//! this crate has no wasm target to share an abstraction boundary with.

pub mod manager;
pub mod pairwise;

pub use manager::{ConnectionEvent, ConnectionManager};
pub use pairwise::{ConnectionStats, PairwiseConnection, SignalingState};
