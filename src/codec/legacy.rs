//! Legacy JSON signaling format, accepted inbound only for the duration
//! of a migration window; this crate never sends it.
//!
//! Modeled as a `type`-discriminated `serde_json` enum, the same shape
//! `flnet::signal::websocket`'s older text protocol uses before the
//! workspace moved to a binary schema.

use serde::{Deserialize, Serialize};

/// A legacy text-protocol message. Only ever produced by [`decode`]; this
/// crate has no encoder for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LegacyMessage {
    /// Full peer presence list, as previously pushed by the server on
    /// connect and on every membership change.
    Presence { peers: Vec<String> },
    /// One-time initialization payload (workspace id echoed back,
    /// assigned peer id).
    Init { workspace_id: String, peer_id: String },
    /// A signal envelope carried as JSON instead of the binary `Frame`
    /// shape. `payload` is left as a raw JSON value rather than
    /// [`crate::codec::SignalPayload`]: the legacy protocol's payload
    /// shapes don't necessarily match the binary protocol's field names,
    /// and re-parsing here would just move the lenient-failure burden
    /// from the caller to this module for no benefit.
    Signal {
        to: String,
        from: String,
        payload: serde_json::Value,
    },
    /// Application-defined ephemeral broadcast.
    Ephemeral { data: serde_json::Value },
}

/// Parses a legacy text frame. Malformed JSON or an unrecognized `type`
/// is logged and dropped, matching the binary decoder's tolerance for
/// both wire formats.
pub fn decode(text: &str) -> Option<LegacyMessage> {
    match serde_json::from_str::<LegacyMessage>(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::warn!("dropping malformed legacy message: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_presence() {
        let json = r#"{"type":"presence","peers":["a","b","c"]}"#;
        assert_eq!(
            decode(json),
            Some(LegacyMessage::Presence {
                peers: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            })
        );
    }

    #[test]
    fn decodes_init() {
        let json = r#"{"type":"init","workspace_id":"w1","peer_id":"p1"}"#;
        assert_eq!(
            decode(json),
            Some(LegacyMessage::Init {
                workspace_id: "w1".to_string(),
                peer_id: "p1".to_string(),
            })
        );
    }

    #[test]
    fn decodes_signal_with_opaque_payload() {
        let json = r#"{"type":"signal","to":"b","from":"a","payload":{"type":"offer","sdp":"x"}}"#;
        let msg = decode(json).unwrap();
        match msg {
            LegacyMessage::Signal { to, from, payload } => {
                assert_eq!(to, "b");
                assert_eq!(from, "a");
                assert_eq!(payload["sdp"], "x");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_ephemeral() {
        let json = r#"{"type":"ephemeral","data":{"cursor":[1,2]}}"#;
        assert!(matches!(decode(json), Some(LegacyMessage::Ephemeral { .. })));
    }

    #[test]
    fn unknown_type_returns_none() {
        assert_eq!(decode(r#"{"type":"future_thing"}"#), None);
    }

    #[test]
    fn malformed_json_returns_none() {
        assert_eq!(decode("not json"), None);
    }
}
