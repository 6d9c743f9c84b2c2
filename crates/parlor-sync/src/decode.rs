//! Turns raw change and broadcast payloads into typed values.

use serde::Deserialize;
use uuid::Uuid;

use parlor_types::events::{Broadcast, ChangeEvent, TYPING_EVENT, TypingPayload};
use parlor_types::models::Message;

use crate::error::{Result, SyncError};

pub fn message(event: &ChangeEvent) -> Result<Message> {
    Message::deserialize(&event.record)
        .map_err(|e| SyncError::MalformedEvent(format!("{:?} {:?} record: {}", event.table, event.kind, e)))
}

/// Delete events only need the old row's id.
pub fn deleted_id(event: &ChangeEvent) -> Result<Uuid> {
    event
        .record
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SyncError::MalformedEvent(format!("{:?} delete without a usable id", event.table)))
}

/// Returns `Ok(None)` for broadcasts that are not typing signals.
pub fn typing(broadcast: &Broadcast) -> Result<Option<TypingPayload>> {
    if broadcast.event != TYPING_EVENT {
        return Ok(None);
    }
    TypingPayload::deserialize(&broadcast.payload)
        .map(Some)
        .map_err(|e| SyncError::MalformedEvent(format!("typing payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_types::events::{ChangeKind, Table};
    use serde_json::json;

    fn change(kind: ChangeKind, record: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            table: Table::ChatMessages,
            kind,
            record,
        }
    }

    #[test]
    fn decodes_a_full_message_record() {
        let event = change(
            ChangeKind::Insert,
            json!({
                "id": "00000000-0000-0000-0000-000000000010",
                "room_id": "00000000-0000-0000-0000-000000000001",
                "author_id": "00000000-0000-0000-0000-00000000000a",
                "body": "hi",
                "created_at": "2024-03-01T10:01:00Z",
            }),
        );
        let msg = message(&event).unwrap();
        assert_eq!(msg.body, "hi");
    }

    #[test]
    fn missing_fields_are_malformed() {
        let event = change(
            ChangeKind::Insert,
            json!({ "id": "00000000-0000-0000-0000-000000000010", "body": "hi" }),
        );
        assert!(matches!(message(&event), Err(SyncError::MalformedEvent(_))));

        let delete = change(ChangeKind::Delete, json!({ "id": 42 }));
        assert!(matches!(deleted_id(&delete), Err(SyncError::MalformedEvent(_))));
    }

    #[test]
    fn other_broadcast_events_are_ignored() {
        let other = Broadcast {
            event: "cursor".into(),
            payload: json!({}),
        };
        assert!(typing(&other).unwrap().is_none());

        let broken = Broadcast {
            event: TYPING_EVENT.into(),
            payload: json!({ "user_id": "nope" }),
        };
        assert!(typing(&broken).is_err());
    }
}
