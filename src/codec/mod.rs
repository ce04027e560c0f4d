//! # Signal Codec
//!
//! Bit-exact serialization of the envelopes exchanged with the signaling
//! server. A pre-generated binary schema compiler is assumed to exist
//! upstream of this crate; here that role is filled by `rmp-serde` over
//! `serde`-derived types, the same choice `flarch`/`flmodules` make for
//! their own wire structures (`rmp_serde::to_vec`/`from_slice` appear
//! throughout `flarch::nodeids` and `flmodules::flo`).
//!
//! Two independent formats are supported: a binary `Frame` for everything
//! this crate sends, and a legacy self-describing JSON object accepted
//! inbound only, for migration-window compatibility with older servers.

pub mod envelope;
pub mod legacy;

pub use envelope::{Frame, SignalEnvelope, SignalPayload};
pub use legacy::LegacyMessage;

use crate::error::CodecError;

/// Encodes a [`Frame`] to its wire bytes. Never fails for the frame
/// shapes this crate constructs itself; the `Result` exists because the
/// underlying serializer is fallible in principle (e.g. non-UTF8 in a
/// field that requires it), matching `flarch`'s choice to propagate
/// `rmp_serde` errors rather than unwrap them.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec(frame)?)
}

/// Decodes inbound binary bytes. Malformed input and unknown type tags
/// are *not* treated as protocol errors: both are logged and the frame
/// is dropped (`None`), and the connection is left open. There is
/// deliberately no `Err` case here — every failure mode this function
/// can hit is one that must be swallowed rather than propagated.
pub fn decode(bytes: &[u8]) -> Option<Frame> {
    match rmp_serde::from_slice::<Frame>(bytes) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::warn!("dropping malformed binary frame: {e}");
            None
        }
    }
}
