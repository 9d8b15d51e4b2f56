//! Participant identity
//!
//! Every participant in a room is addressed by the same opaque string on the
//! coordination server and on the alternate backend, so a single newtype is
//! shared by every component of the adapter.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identifier of a participant in a room
///
/// Wire form is the bare string (`peerId` on the signaling channel, `userId`
/// on the alternate backend).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new participant identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (the alternate backend reports
    /// anonymous streams this way)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
        assert!(!id.is_empty());
        assert!(PeerId::new("").is_empty());
    }

    #[test]
    fn test_peer_id_wire_form_is_bare_string() {
        let id = PeerId::from("bob");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bob\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
