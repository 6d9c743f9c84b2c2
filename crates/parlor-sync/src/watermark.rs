//! Per-(user, room) "read up to" timestamps.
//!
//! [`WatermarkStore`] is the durable key-value contract. [`Watermarks`] sits
//! in front of it inside the engine: a write-through cache, so a room marked
//! read is treated as read by the very next event, and a single writer task
//! that persists stamps in the order they were issued. The cache is loaded
//! in one blocking read at start-up, so lookups on the engine task never
//! touch the database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use parlor_db::{Database, format_timestamp, parse_timestamp, truncate_timestamp};

use crate::error::SyncError;

pub trait WatermarkStore: Send + Sync + 'static {
    fn get(&self, user_id: Uuid, room_id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Overwrites unconditionally; the last call wins.
    fn set(&self, user_id: Uuid, room_id: Uuid, read_at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Every watermark the user has.
    fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<(Uuid, DateTime<Utc>)>>;
}

impl WatermarkStore for Database {
    fn get(&self, user_id: Uuid, room_id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
        let raw = self.get_watermark(&user_id.to_string(), &room_id.to_string())?;
        match raw {
            None => Ok(None),
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("Corrupt watermark '{}' for room {}", raw, room_id)),
        }
    }

    fn set(&self, user_id: Uuid, room_id: Uuid, read_at: DateTime<Utc>) -> anyhow::Result<()> {
        self.set_watermark(&user_id.to_string(), &room_id.to_string(), &format_timestamp(&read_at))
    }

    fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<(Uuid, DateTime<Utc>)>> {
        self.list_watermarks(&user_id.to_string())?
            .into_iter()
            .map(|(room_id, raw)| {
                let read_at = parse_timestamp(&raw)
                    .ok_or_else(|| anyhow::anyhow!("Corrupt watermark '{}' for room {}", raw, room_id))?;
                Ok((room_id.parse()?, read_at))
            })
            .collect()
    }
}

/// The signed-in user's watermarks as the engine sees them.
pub struct Watermarks<W: WatermarkStore> {
    user_id: Uuid,
    store: Arc<W>,
    cache: HashMap<Uuid, Option<DateTime<Utc>>>,
    /// Set once `load` succeeds; a miss then means "never read".
    loaded: bool,
    writes: mpsc::UnboundedSender<(Uuid, DateTime<Utc>)>,
    writer: JoinHandle<()>,
}

impl<W: WatermarkStore> Watermarks<W> {
    /// Must be called inside a tokio runtime; spawns the writer task.
    pub fn new(user_id: Uuid, store: Arc<W>) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(user_id, store.clone(), rx));
        Self {
            user_id,
            store,
            cache: HashMap::new(),
            loaded: false,
            writes,
            writer,
        }
    }

    /// Reads every stored watermark into the cache. Stamps made before the
    /// load finishes are newer than anything stored and are kept.
    pub async fn load(&mut self) {
        let store = self.store.clone();
        let user_id = self.user_id;
        match tokio::task::spawn_blocking(move || store.list(user_id)).await {
            Ok(Ok(stored)) => {
                debug!("Loaded {} watermarks", stored.len());
                for (room_id, read_at) in stored {
                    self.cache.entry(room_id).or_insert(Some(read_at));
                }
                self.loaded = true;
            }
            Ok(Err(e)) => warn!("Loading watermarks failed, reading per room instead: {}", e),
            Err(e) => error!("spawn_blocking join error: {}", e),
        }
    }

    /// Cached watermark. Before a successful `load` a miss falls back to a
    /// store read; a failed read is reported and treated as "never read"
    /// without being cached.
    pub fn get(&mut self, room_id: Uuid) -> Option<DateTime<Utc>> {
        if let Some(cached) = self.cache.get(&room_id) {
            return *cached;
        }
        if self.loaded {
            return None;
        }
        match self.store.get(self.user_id, room_id) {
            Ok(read_at) => {
                self.cache.insert(room_id, read_at);
                read_at
            }
            Err(e) => {
                warn!("Watermark read for room {} failed: {}", room_id, e);
                None
            }
        }
    }

    /// Records `read_at` immediately and queues the durable write. The
    /// cached value has the stored precision, so it agrees with the value a
    /// restart reads back.
    pub fn stamp(&mut self, room_id: Uuid, read_at: DateTime<Utc>) {
        let read_at = truncate_timestamp(read_at);
        self.cache.insert(room_id, Some(read_at));
        if self.writes.send((room_id, read_at)).is_err() {
            error!("Watermark writer is gone; room {} stamp not persisted", room_id);
        }
    }

    /// Cached entries for handing to background work.
    pub fn snapshot(&self) -> WatermarkSnapshot {
        WatermarkSnapshot {
            entries: self.cache.clone(),
            complete: self.loaded,
        }
    }

    pub fn store(&self) -> Arc<W> {
        self.store.clone()
    }

    /// Stops accepting stamps and waits for queued writes to land.
    pub async fn close(self) {
        drop(self.writes);
        if let Err(e) = self.writer.await {
            error!("Watermark writer task failed: {}", e);
        }
    }
}

/// A point-in-time copy of the cache.
#[derive(Debug, Clone)]
pub struct WatermarkSnapshot {
    pub entries: HashMap<Uuid, Option<DateTime<Utc>>>,
    /// Whether a room missing from `entries` is known to be unread.
    pub complete: bool,
}

async fn run_writer<W: WatermarkStore>(
    user_id: Uuid,
    store: Arc<W>,
    mut rx: mpsc::UnboundedReceiver<(Uuid, DateTime<Utc>)>,
) {
    while let Some((room_id, read_at)) = rx.recv().await {
        let store = store.clone();
        let result = tokio::task::spawn_blocking(move || store.set(user_id, room_id, read_at)).await;
        match result {
            Ok(Ok(())) => debug!("Watermark for room {} set to {}", room_id, read_at),
            Ok(Err(e)) => warn!("{} (room {})", SyncError::Persistence(e), room_id),
            Err(e) => error!("spawn_blocking join error: {}", e),
        }
    }
}
