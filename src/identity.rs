//! Participant identity.
//!
//! Identity requires only any 128-bit value serialised as a string, with
//! glare tie-breaking done lexicographically on the string form. Unlike
//! `flarch::nodeids::U256`, which models node ids as a fixed `[u8; 32]`
//! compared byte-wise, identity here is carried as a string end to end
//! (generated locally, attested by the server in presence notifications)
//! so the natural `Ord` on `String` already gives the required
//! lexicographic comparison.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A participant's stable, locally-generated identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Generates a new random identity (128 bits of entropy).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` is the deterministic initiator against `other`
    /// (glare tie-break: the greater id initiates).
    pub fn initiates_over(&self, other: &PeerId) -> bool {
        self > other
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The reserved recipient id used to address the signaling server itself
/// in a signal envelope's `to` field.
pub const SERVER_ID: &str = "server";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_tie_break() {
        let zzz = PeerId::from("zzz");
        let aaa = PeerId::from("aaa");
        assert!(zzz.initiates_over(&aaa));
        assert!(!aaa.initiates_over(&zzz));
    }

    #[test]
    fn random_ids_are_unique() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn display_roundtrips_through_string() {
        let id = PeerId::from("abc-123");
        assert_eq!(id.to_string(), "abc-123");
        assert_eq!(id.as_str(), "abc-123");
    }
}
