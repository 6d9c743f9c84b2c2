//! Boundary to the external data service: queries, inserts, change
//! subscriptions and the per-room typing broadcast.

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use parlor_types::events::{Broadcast, ChangeEvent, ChangeFilter};
use parlor_types::models::{FeedEntry, Message, Room, UnreadMark};

use crate::error::{Result, SyncError};

/// Everything the engine needs from the data service. Implementations are
/// handles: cheap to clone and shareable across tasks.
pub trait DataService: Clone + Send + Sync + 'static {
    fn list_rooms(&self) -> impl Future<Output = anyhow::Result<Vec<Room>>> + Send;

    /// The most recent `limit` messages of a room, oldest first.
    fn recent_messages(
        &self,
        room_id: Uuid,
        limit: u32,
    ) -> impl Future<Output = anyhow::Result<Vec<FeedEntry>>> + Send;

    fn profile_name(&self, user_id: Uuid) -> impl Future<Output = anyhow::Result<Option<String>>> + Send;

    /// Messages in a room by anyone but `exclude_author`, created strictly
    /// after `after` when given.
    fn unread_messages(
        &self,
        room_id: Uuid,
        exclude_author: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> impl Future<Output = anyhow::Result<Vec<UnreadMark>>> + Send;

    fn insert_message(
        &self,
        room_id: Uuid,
        author_id: Uuid,
        body: String,
    ) -> impl Future<Output = anyhow::Result<Message>> + Send;

    fn subscribe(&self, filter: ChangeFilter) -> impl Future<Output = anyhow::Result<Subscription>> + Send;

    fn join_typing(
        &self,
        room_id: Uuid,
    ) -> impl Future<Output = anyhow::Result<(TypingSender, TypingReceiver)>> + Send;
}

/// Stream of change events matching one filter.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>, filter: ChangeFilter) -> Self {
        Self { rx, filter }
    }

    /// Next matching event, or `None` once the source has closed.
    ///
    /// Falling behind the source loses events, so a lagged subscription
    /// ends with `SubscriptionLost`; the caller resubscribes and refetches.
    pub async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscription {:?} lagged by {} events", self.filter, n);
                    return Err(SyncError::SubscriptionLost {
                        room_id: self.filter.room_id,
                        reason: format!("fell {} events behind", n),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

/// Fire-and-forget side of a room's typing channel.
#[derive(Clone)]
pub struct TypingSender {
    tx: broadcast::Sender<Broadcast>,
}

impl TypingSender {
    pub fn new(tx: broadcast::Sender<Broadcast>) -> Self {
        Self { tx }
    }

    /// No acknowledgement and no error when nobody is listening.
    pub fn send(&self, broadcast: Broadcast) {
        let _ = self.tx.send(broadcast);
    }
}

pub struct TypingReceiver {
    room_id: Uuid,
    rx: broadcast::Receiver<Broadcast>,
}

impl TypingReceiver {
    pub fn new(room_id: Uuid, rx: broadcast::Receiver<Broadcast>) -> Self {
        Self { room_id, rx }
    }

    pub async fn recv(&mut self) -> Option<Broadcast> {
        loop {
            match self.rx.recv().await {
                Ok(broadcast) => return Some(broadcast),
                // Typing signals are disposable; skipping missed ones is fine.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("Typing channel for room {} closed", self.room_id);
                    return None;
                }
            }
        }
    }
}
