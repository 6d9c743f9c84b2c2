//! Database row types. These map directly to SQLite rows and stay distinct
//! from parlor-types models so the DB layer stays independent.

use anyhow::{Result, anyhow};
use parlor_types::models::{Message, Room, UnreadMark};

use crate::parse_timestamp;

pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub sender_name: Option<String>,
    pub message: String,
    pub created_at: String,
}

pub struct UnreadRow {
    pub id: String,
    pub created_at: String,
}

impl TryFrom<RoomRow> for Room {
    type Error = anyhow::Error;

    fn try_from(row: RoomRow) -> Result<Self> {
        Ok(Room {
            id: row.id.parse()?,
            created_at: parse_timestamp(&row.created_at)
                .ok_or_else(|| anyhow!("Corrupt created_at '{}' on room '{}'", row.created_at, row.id))?,
            name: row.name,
            description: row.description,
        })
    }
}

impl TryFrom<&MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: &MessageRow) -> Result<Self> {
        Ok(Message {
            id: row.id.parse()?,
            room_id: row.room_id.parse()?,
            author_id: row.user_id.parse()?,
            body: row.message.clone(),
            created_at: parse_timestamp(&row.created_at)
                .ok_or_else(|| anyhow!("Corrupt created_at '{}' on message '{}'", row.created_at, row.id))?,
        })
    }
}

impl TryFrom<UnreadRow> for UnreadMark {
    type Error = anyhow::Error;

    fn try_from(row: UnreadRow) -> Result<Self> {
        Ok(UnreadMark {
            message_id: row.id.parse()?,
            created_at: parse_timestamp(&row.created_at)
                .ok_or_else(|| anyhow!("Corrupt created_at '{}' on message '{}'", row.created_at, row.id))?,
        })
    }
}
