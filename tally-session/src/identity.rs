//! Session-scoped identities.
//!
//! A `PlayerIdentity` is minted once at session start and never changes;
//! it rides along as a connection parameter so the server can key presence
//! on it across transport reconnects.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable per-session player identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerIdentity {
    id: Uuid,
}

impl PlayerIdentity {
    /// Generate a fresh identity. Called exactly once per session.
    pub fn generate() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl std::fmt::Display for PlayerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A room to join, either freshly created or named by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomIdentity {
    id: String,
}

impl RoomIdentity {
    /// Mint a new room id (for room creation flows).
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Use a caller-supplied room id (joining an existing room).
    pub fn from_name(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Channel topic for this room.
    pub fn topic(&self) -> String {
        format!("room:{}", self.id)
    }
}

impl std::fmt::Display for RoomIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_identity_unique() {
        let a = PlayerIdentity::generate();
        let b = PlayerIdentity::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_player_identity_stable() {
        let player = PlayerIdentity::generate();
        assert_eq!(player.id(), player.id());
        assert_eq!(player.to_string(), player.id().to_string());
    }

    #[test]
    fn test_room_topic_format() {
        let room = RoomIdentity::from_name("1");
        assert_eq!(room.topic(), "room:1");
        assert_eq!(room.as_str(), "1");
    }

    #[test]
    fn test_generated_room_topic() {
        let room = RoomIdentity::generate();
        assert!(room.topic().starts_with("room:"));
        assert_eq!(room.topic(), format!("room:{}", room.as_str()));
    }
}
