//! Binary envelope shapes.
//!
//! `Frame` is deliberately *not* a single `serde`-derived enum: a derived
//! enum's tag set is closed, but additional future types must be
//! tolerated — unknown type tags are dropped with a warning, not treated
//! as a protocol error, and that catch-all can't be expressed at the type
//! level alone. So the wire shape is a small open envelope,
//! `WireFrame { kind, body }`, decoded in
//! two passes: the outer tag first, then the inner payload only once the
//! tag is recognized. `Frame` is the typed, closed result callers see
//! after that second pass.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::identity::PeerId;

/// The untyped, always-decodable wire shape. Exists only to let
/// [`super::decode`] dispatch on `kind` before committing to a payload
/// type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub kind: String,
    pub body: Vec<u8>,
}

const KIND_SIGNAL: &str = "signal";
const KIND_SYNC: &str = "sync";
const KIND_OP: &str = "op";

/// A decoded, typed frame: one of the recognized message types.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Carries a [`SignalEnvelope`].
    Signal(SignalEnvelope),
    /// Opaque payload forwarded to the application as an authority message.
    Sync(Bytes),
    /// Opaque payload forwarded to the application as a peer message.
    Op(Bytes),
}

impl Frame {
    fn to_wire(&self) -> Result<WireFrame, CodecError> {
        Ok(match self {
            Frame::Signal(env) => WireFrame {
                kind: KIND_SIGNAL.to_string(),
                body: rmp_serde::to_vec(env)?,
            },
            Frame::Sync(bytes) => WireFrame {
                kind: KIND_SYNC.to_string(),
                body: bytes.to_vec(),
            },
            Frame::Op(bytes) => WireFrame {
                kind: KIND_OP.to_string(),
                body: bytes.to_vec(),
            },
        })
    }

    /// Decodes a recognized [`WireFrame`] into a [`Frame`]. Returns
    /// `None` (after logging) for an unrecognized `kind` or a body that
    /// fails to parse for a recognized kind — both are logged and
    /// dropped, never a hard error.
    fn from_wire(wire: WireFrame) -> Option<Frame> {
        match wire.kind.as_str() {
            KIND_SIGNAL => match rmp_serde::from_slice::<SignalEnvelope>(&wire.body) {
                Ok(env) => Some(Frame::Signal(env)),
                Err(e) => {
                    log::warn!("dropping malformed signal envelope: {e}");
                    None
                }
            },
            KIND_SYNC => Some(Frame::Sync(Bytes::from(wire.body))),
            KIND_OP => Some(Frame::Op(Bytes::from(wire.body))),
            other => {
                log::warn!("dropping frame with unrecognized type tag {other:?}");
                None
            }
        }
    }
}

impl Serialize for Frame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireFrame::deserialize(deserializer)?;
        Frame::from_wire(wire).ok_or_else(|| serde::de::Error::custom("unrecognized or malformed frame"))
    }
}

/// Addressed `{to, from, payload}` signal. `to`
/// and `from` are carried as plain strings on the wire (rather than the
/// typed [`PeerId`]) because the reserved server address `"server"` is
/// not itself a participant identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub to: String,
    pub from: String,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(to: impl Into<String>, from: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            payload,
        }
    }

    pub fn to_peer(&self) -> PeerId {
        PeerId::from(self.to.as_str())
    }

    pub fn from_peer(&self) -> PeerId {
        PeerId::from(self.from.as_str())
    }
}

/// The signal payload discriminated union. This set is closed by design
/// — unlike [`Frame`]'s `kind`, new signal kinds are a protocol version
/// bump, not something the migration window needs to silently tolerate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalPayload {
    Join { workspace_id: String },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate {
        candidate: String,
        sdp_mid: String,
        sdp_m_line_index: u32,
    },
    Relay { data: Bytes },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn roundtrip(payload: SignalPayload) {
        let frame = Frame::Signal(SignalEnvelope::new("zzz", "aaa", payload));
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn join_roundtrips() {
        roundtrip(SignalPayload::Join {
            workspace_id: "".to_string(),
        });
        roundtrip(SignalPayload::Join {
            workspace_id: "w".repeat(512),
        });
    }

    #[test]
    fn offer_and_answer_roundtrip() {
        roundtrip(SignalPayload::Offer { sdp: String::new() });
        roundtrip(SignalPayload::Offer {
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_string(),
        });
        roundtrip(SignalPayload::Answer { sdp: "sdp".to_string() });
    }

    #[test]
    fn candidate_roundtrips() {
        roundtrip(SignalPayload::Candidate {
            candidate: "candidate:1 1 UDP 1 0.0.0.0 0 typ host".to_string(),
            sdp_mid: "0".to_string(),
            sdp_m_line_index: 0,
        });
        roundtrip(SignalPayload::Candidate {
            candidate: String::new(),
            sdp_mid: String::new(),
            sdp_m_line_index: u32::MAX,
        });
    }

    #[test]
    fn relay_roundtrips_arbitrary_bytes() {
        roundtrip(SignalPayload::Relay { data: Bytes::new() });
        roundtrip(SignalPayload::Relay {
            data: Bytes::from_static(&[0x00, 0xff, 0x01, 0x02, 0x03]),
        });
    }

    #[test]
    fn sync_and_op_roundtrip() {
        let sync = Frame::Sync(Bytes::from_static(b"hello"));
        assert_eq!(decode(&encode(&sync).unwrap()).unwrap(), sync);
        let op = Frame::Op(Bytes::from_static(b"world"));
        assert_eq!(decode(&encode(&op).unwrap()).unwrap(), op);
    }

    #[test]
    fn unknown_type_tag_is_dropped_not_errored() {
        let wire = WireFrame {
            kind: "future_type_v2".to_string(),
            body: vec![1, 2, 3],
        };
        let bytes = rmp_serde::to_vec(&wire).unwrap();
        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn truncated_input_is_dropped_not_errored() {
        let bytes = vec![0xffu8; 3];
        assert!(decode(&bytes).is_none());
    }
}
