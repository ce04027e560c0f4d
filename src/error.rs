//! Error types, one per component, aggregated into [`MeshError`] at the
//! public surface. Mirrors the layering of `flmodules`'s `NetworkError` /
//! `NCError` / `flnode`'s `NodeError`: each layer's error wraps the one
//! below it with `#[from]` instead of re-stating variants.

use thiserror::Error;

use crate::identity::PeerId;

#[derive(Error, Debug)]
/// Errors from [`crate::codec`].
pub enum CodecError {
    #[error("truncated or malformed envelope")]
    Malformed,
    #[error(transparent)]
    Binary(#[from] rmp_serde::decode::Error),
    #[error(transparent)]
    BinaryEncode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Legacy(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
/// Errors from [`crate::signal::transport`].
pub enum TransportError {
    #[error("no credential available: static token missing and no provider configured")]
    MissingCredential,
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Error, Debug)]
/// Errors from [`crate::connection`].
pub enum ConnectionError {
    #[error("no pairwise connection for peer {0}")]
    Missing(PeerId),
    #[error("invalid signaling state for this operation: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Error, Debug)]
/// Top level error surfaced by [`crate::Client`].
pub enum MeshError {
    #[error("missing workspace id")]
    MissingWorkspaceId,
    #[error("missing credentials: neither a static token nor a token provider was supplied")]
    MissingCredentials,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("client driver is no longer running")]
    DriverGone,
}
