use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A chat message as the data service stores it. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A message together with the display name of its author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub message: Message,
    pub sender_name: String,
}

/// Display name used until a profile lookup resolves.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Someone currently composing a message in a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub name: String,
}

/// Identifies one unread message without carrying its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadMark {
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for UnreadMark {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id,
            created_at: message.created_at,
        }
    }
}
