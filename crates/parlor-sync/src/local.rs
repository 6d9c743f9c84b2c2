//! In-process data service over the local SQLite database.
//!
//! Writes go to [`Database`] and are then announced on a broadcast hub, the
//! same insert-then-broadcast flow a networked backend follows. Every
//! `LocalService` clone shares one hub, so several engines in one process
//! see each other's messages and typing signals.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use parlor_db::Database;
use parlor_types::events::{Broadcast, ChangeEvent, ChangeFilter, ChangeKind, Table};
use parlor_types::models::{FeedEntry, Message, Profile, Room, UNKNOWN_SENDER, UnreadMark};

use crate::service::{DataService, Subscription, TypingReceiver, TypingSender};

/// How far a change subscriber may fall behind before it is cut off.
pub const CHANGE_CAPACITY: usize = 1024;
const TYPING_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct LocalService {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    db: Arc<Database>,

    /// Every row change; subscriptions filter on the receiving side.
    changes: broadcast::Sender<ChangeEvent>,

    /// Typing channels: room_id -> sender
    typing: RwLock<HashMap<Uuid, broadcast::Sender<Broadcast>>>,
}

impl LocalService {
    pub fn new(db: Arc<Database>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(LocalInner {
                db,
                changes,
                typing: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    /// Announces a change to every subscriber, as if another client wrote it.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.inner.changes.send(event);
    }

    pub fn create_profile(&self, name: &str) -> anyhow::Result<Profile> {
        let id = Uuid::new_v4();
        self.inner.db.create_profile(&id.to_string(), name)?;
        Ok(Profile {
            id,
            name: name.to_string(),
        })
    }

    /// Finds a profile by display name, creating it on first use.
    pub fn ensure_profile(&self, name: &str) -> anyhow::Result<Profile> {
        match self.inner.db.get_profile_id_by_name(name)? {
            Some(id) => Ok(Profile {
                id: id.parse()?,
                name: name.to_string(),
            }),
            None => self.create_profile(name),
        }
    }

    pub fn create_room(&self, name: &str, description: &str) -> anyhow::Result<Room> {
        let id = Uuid::new_v4();
        self.inner.db.create_room(&id.to_string(), name, description)?;
        Ok(Room {
            id,
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Inserts with an explicit timestamp, for seeding history.
    pub fn insert_message_at(
        &self,
        room_id: Uuid,
        author_id: Uuid,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<Message> {
        // The published copy must match what a later backfill reads back.
        let created_at = parlor_db::truncate_timestamp(created_at);
        let message = Message {
            id: Uuid::new_v4(),
            room_id,
            author_id,
            body: body.to_string(),
            created_at,
        };

        self.inner.db.insert_message(
            &message.id.to_string(),
            &room_id.to_string(),
            &author_id.to_string(),
            &message.body,
            &parlor_db::format_timestamp(&created_at),
        )?;

        self.publish(ChangeEvent {
            table: Table::ChatMessages,
            kind: ChangeKind::Insert,
            record: serde_json::to_value(&message)?,
        });

        Ok(message)
    }

    /// Author-only delete. Returns false when the message does not exist or
    /// belongs to someone else.
    pub fn delete_message(&self, message_id: Uuid, author_id: Uuid) -> anyhow::Result<bool> {
        let Some(row) = self
            .inner
            .db
            .delete_message(&message_id.to_string(), &author_id.to_string())?
        else {
            return Ok(false);
        };

        self.publish(ChangeEvent {
            table: Table::ChatMessages,
            kind: ChangeKind::Delete,
            record: serde_json::json!({ "id": row.id, "room_id": row.room_id }),
        });
        Ok(true)
    }

    async fn typing_channel(&self, room_id: Uuid) -> broadcast::Sender<Broadcast> {
        if let Some(tx) = self.inner.typing.read().await.get(&room_id) {
            return tx.clone();
        }
        self.inner
            .typing
            .write()
            .await
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(TYPING_CAPACITY).0)
            .clone()
    }
}

impl DataService for LocalService {
    async fn list_rooms(&self) -> anyhow::Result<Vec<Room>> {
        self.inner
            .db
            .list_rooms()?
            .into_iter()
            .map(Room::try_from)
            .collect()
    }

    async fn recent_messages(&self, room_id: Uuid, limit: u32) -> anyhow::Result<Vec<FeedEntry>> {
        let rows = self.inner.db.get_recent_messages(&room_id.to_string(), limit)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            match Message::try_from(row) {
                Ok(message) => entries.push(FeedEntry {
                    message,
                    sender_name: row
                        .sender_name
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
                }),
                Err(e) => warn!("Skipping corrupt message row '{}': {}", row.id, e),
            }
        }
        Ok(entries)
    }

    async fn profile_name(&self, user_id: Uuid) -> anyhow::Result<Option<String>> {
        self.inner.db.get_profile_name(&user_id.to_string())
    }

    async fn unread_messages(
        &self,
        room_id: Uuid,
        exclude_author: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<UnreadMark>> {
        let after = after.map(|ts| parlor_db::format_timestamp(&ts));
        self.inner
            .db
            .get_unread_messages(&room_id.to_string(), &exclude_author.to_string(), after.as_deref())?
            .into_iter()
            .map(UnreadMark::try_from)
            .collect()
    }

    async fn insert_message(&self, room_id: Uuid, author_id: Uuid, body: String) -> anyhow::Result<Message> {
        let message = self.insert_message_at(room_id, author_id, &body, Utc::now())?;
        debug!("Inserted message {} into room {}", message.id, room_id);
        Ok(message)
    }

    async fn subscribe(&self, filter: ChangeFilter) -> anyhow::Result<Subscription> {
        Ok(Subscription::new(self.inner.changes.subscribe(), filter))
    }

    async fn join_typing(&self, room_id: Uuid) -> anyhow::Result<(TypingSender, TypingReceiver)> {
        let tx = self.typing_channel(room_id).await;
        let rx = tx.subscribe();
        Ok((TypingSender::new(tx), TypingReceiver::new(room_id, rx)))
    }
}
