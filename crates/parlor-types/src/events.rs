use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tables the data service emits change events for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    ChatMessages,
    Comments,
    Confessions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Delete,
}

/// A row-level change delivered by a subscription.
///
/// `record` is the new row for inserts and the old row for deletes. It is
/// kept as raw JSON because the service gives no schema guarantee; consumers
/// decode it and drop what does not parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
}

/// Which change events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: Table,
    pub room_id: Option<Uuid>,
}

impl ChangeFilter {
    pub fn table(table: Table) -> Self {
        Self { table, room_id: None }
    }

    pub fn room(table: Table, room_id: Uuid) -> Self {
        Self {
            table,
            room_id: Some(room_id),
        }
    }

    /// Rows without a readable `room_id` never match a room-scoped filter.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        match self.room_id {
            None => true,
            Some(room_id) => event.room_id() == Some(room_id),
        }
    }
}

impl ChangeEvent {
    pub fn room_id(&self) -> Option<Uuid> {
        self.record
            .get("room_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

/// Name of the broadcast event carrying typing signals.
pub const TYPING_EVENT: &str = "user_typing";

/// Ephemeral payload sent on a room's typing channel. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: Uuid,
    pub name: String,
    pub room_id: Uuid,
    pub emitted_at: DateTime<Utc>,
}

/// Envelope for broadcast channel traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub event: String,
    pub payload: serde_json::Value,
}
