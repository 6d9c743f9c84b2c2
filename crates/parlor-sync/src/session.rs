//! State for the one room the user currently has open.
//!
//! A session is created on open and dropped on close; dropping it aborts
//! every task that feeds it. Events coming back from those tasks carry a
//! [`StreamToken`], and the engine discards anything whose token no longer
//! matches, so a reopen of the same room never sees its predecessor's
//! leftovers.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use parlor_types::events::TypingPayload;
use parlor_types::models::{FeedEntry, Message, TypingUser, UNKNOWN_SENDER};

use crate::config::EngineConfig;
use crate::feed::Feed;
use crate::presence::{Presence, TypingThrottle};
use crate::service::TypingSender;

/// Identifies the session and the incarnation of its streams that produced
/// an event. `stream` changes on resync; `session` only on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamToken {
    pub session: u64,
    pub stream: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum FeedStatus {
    /// No room open.
    Idle,
    /// Backfill or live subscription still starting.
    Loading,
    Live,
    /// Live subscription unavailable; events may be missing.
    Stale(String),
    /// Backfill failed; the feed is empty until a resync.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedView {
    pub room_id: Option<Uuid>,
    pub session: u64,
    pub status: FeedStatus,
    pub entries: Vec<FeedEntry>,
}

impl FeedView {
    pub fn idle() -> Self {
        Self {
            room_id: None,
            session: 0,
            status: FeedStatus::Idle,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backfill {
    Pending,
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Live {
    Pending,
    Up,
    Lost(String),
}

pub struct RoomSession {
    pub room_id: Uuid,
    token: StreamToken,
    feed: Feed,
    presence: Presence,
    throttle: TypingThrottle,
    backfill: Backfill,
    live: Live,
    names: HashMap<Uuid, String>,
    pending_names: HashSet<Uuid>,
    typing_sender: Option<TypingSender>,
    tasks: Vec<JoinHandle<()>>,
}

impl RoomSession {
    pub fn new(room_id: Uuid, token: StreamToken, config: &EngineConfig) -> Self {
        Self {
            room_id,
            token,
            feed: Feed::new(),
            presence: Presence::new(config.typing_ttl),
            throttle: TypingThrottle::new(config.typing_throttle),
            backfill: Backfill::Pending,
            live: Live::Pending,
            names: HashMap::new(),
            pending_names: HashSet::new(),
            typing_sender: None,
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> StreamToken {
        self.token
    }

    /// True for events from this session's current streams.
    pub fn accepts(&self, token: StreamToken) -> bool {
        self.token == token
    }

    /// True for results that only need the same session, not the same
    /// stream incarnation (profile lookups, sent messages).
    pub fn owns(&self, session: u64) -> bool {
        self.token.session == session
    }

    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Aborts the current streams and starts a new incarnation. Feed and
    /// presence are kept; the next backfill merges into them.
    pub fn restart(&mut self, stream: u64) {
        self.abort_tasks();
        self.token.stream = stream;
        self.typing_sender = None;
        // Events missed while the stream was down may fall outside the next
        // backfill window; start from the backfill alone rather than leave a gap.
        if matches!(self.backfill, Backfill::Failed(_)) || matches!(self.live, Live::Lost(_)) {
            self.feed.clear();
        }
        self.backfill = Backfill::Pending;
        self.live = Live::Pending;
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn status(&self) -> FeedStatus {
        match (&self.backfill, &self.live) {
            (Backfill::Failed(reason), _) => FeedStatus::Failed(reason.clone()),
            (_, Live::Lost(reason)) => FeedStatus::Stale(reason.clone()),
            (Backfill::Done, Live::Up) => FeedStatus::Live,
            _ => FeedStatus::Loading,
        }
    }

    pub fn view(&self) -> FeedView {
        FeedView {
            room_id: Some(self.room_id),
            session: self.token.session,
            status: self.status(),
            entries: self.feed.entries().to_vec(),
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn apply_backfill(&mut self, entries: Vec<FeedEntry>) -> usize {
        for entry in &entries {
            if entry.sender_name != UNKNOWN_SENDER {
                self.names
                    .entry(entry.message.author_id)
                    .or_insert_with(|| entry.sender_name.clone());
            }
        }
        let added = self.feed.merge_all(entries);
        self.backfill = Backfill::Done;
        debug!("Room {} backfill merged {} new messages", self.room_id, added);
        added
    }

    pub fn fail_backfill(&mut self, reason: String) {
        self.feed.clear();
        self.backfill = Backfill::Failed(reason);
    }

    pub fn live_up(&mut self) {
        self.live = Live::Up;
    }

    pub fn live_lost(&mut self, reason: String) {
        self.live = Live::Lost(reason);
    }

    /// Merges a live insert and clears its author from the typing set.
    /// Returns whether the feed changed, whether presence changed, and the
    /// author id if their display name still needs a lookup.
    pub fn apply_insert(&mut self, message: Message) -> InsertOutcome {
        let author_id = message.author_id;
        let sender_name = self
            .names
            .get(&author_id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let needs_lookup = !self.names.contains_key(&author_id) && self.pending_names.insert(author_id);

        let feed_changed = self.feed.merge(FeedEntry { message, sender_name }).changed();
        let typing_changed = self.presence.clear(author_id);

        InsertOutcome {
            feed_changed,
            typing_changed,
            lookup: needs_lookup.then_some(author_id),
        }
    }

    pub fn apply_delete(&mut self, message_id: Uuid) -> bool {
        self.feed.remove(message_id).is_some()
    }

    /// Records a resolved display name. Returns whether any entry changed.
    pub fn resolve_name(&mut self, user_id: Uuid, name: Option<String>) -> bool {
        self.pending_names.remove(&user_id);
        let Some(name) = name else {
            return false;
        };
        let changed = self.feed.rename_author(user_id, &name) > 0;
        self.names.insert(user_id, name);
        changed
    }

    /// Applies someone's typing signal. Signals from `self_id` or for a
    /// different room are ignored.
    pub fn apply_typing(&mut self, payload: &TypingPayload, self_id: Uuid, now: Instant) -> bool {
        if payload.user_id == self_id {
            return false;
        }
        if payload.room_id != self.room_id {
            trace!("Typing signal for room {} on room {} channel", payload.room_id, self.room_id);
            return false;
        }
        self.names
            .entry(payload.user_id)
            .or_insert_with(|| payload.name.clone());
        self.presence.observe(payload.user_id, &payload.name, now)
    }

    pub fn typing(&mut self, now: Instant) -> Vec<TypingUser> {
        self.presence.snapshot(now)
    }

    pub fn expire_typing(&mut self, now: Instant) -> bool {
        self.presence.purge(now)
    }

    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.presence.next_deadline()
    }

    pub fn set_typing_sender(&mut self, sender: TypingSender) {
        self.typing_sender = Some(sender);
    }

    /// The sender to use for an outgoing typing signal, if the throttle
    /// window allows one and the channel is joined.
    pub fn typing_slot(&mut self, now: Instant) -> Option<TypingSender> {
        let sender = self.typing_sender.clone()?;
        self.throttle.try_acquire(now).then_some(sender)
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub feed_changed: bool,
    pub typing_changed: bool,
    pub lookup: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    const ROOM: Uuid = Uuid::from_u128(1);
    const ME: Uuid = Uuid::from_u128(0xa);
    const BOB: Uuid = Uuid::from_u128(0xb);

    fn session() -> RoomSession {
        RoomSession::new(ROOM, StreamToken { session: 1, stream: 1 }, &EngineConfig::default())
    }

    fn msg(n: u128, author_id: Uuid) -> Message {
        Message {
            id: Uuid::from_u128(100 + n),
            room_id: ROOM,
            author_id,
            body: format!("m{}", n),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, n as u32, 0).unwrap(),
        }
    }

    fn entry(message: Message, name: &str) -> FeedEntry {
        FeedEntry {
            message,
            sender_name: name.to_string(),
        }
    }

    fn typing(user_id: Uuid, name: &str) -> TypingPayload {
        TypingPayload {
            user_id,
            name: name.to_string(),
            room_id: ROOM,
            emitted_at: Utc::now(),
        }
    }

    #[test]
    fn live_only_once_backfill_and_subscription_are_up() {
        let mut s = session();
        assert_eq!(s.status(), FeedStatus::Loading);
        s.apply_backfill(vec![]);
        assert_eq!(s.status(), FeedStatus::Loading);
        s.live_up();
        assert_eq!(s.status(), FeedStatus::Live);
        s.live_lost("gone".into());
        assert_eq!(s.status(), FeedStatus::Stale("gone".into()));
    }

    #[test]
    fn restart_rejects_old_stream_and_clears_failed_feed() {
        let mut s = session();
        let old = s.token();
        s.apply_insert(msg(1, BOB));
        s.fail_backfill("boom".into());
        assert!(s.feed().entries().is_empty());
        s.apply_insert(msg(2, BOB));

        s.restart(7);
        assert!(!s.accepts(old));
        assert!(s.owns(old.session));
        assert!(s.feed().entries().is_empty());
        assert_eq!(s.status(), FeedStatus::Loading);
    }

    #[test]
    fn restart_after_lost_stream_starts_from_backfill() {
        let mut s = session();
        s.apply_backfill(vec![entry(msg(1, BOB), "bob")]);
        s.live_up();
        s.apply_insert(msg(2, BOB));
        s.live_lost("fell 76 events behind".into());
        assert_eq!(s.feed().entries().len(), 2);

        s.restart(7);
        assert!(s.feed().entries().is_empty());
        s.apply_backfill(vec![entry(msg(9, BOB), "bob")]);
        s.live_up();
        let ids: Vec<Uuid> = s.feed().entries().iter().map(|e| e.message.id).collect();
        assert_eq!(ids, [msg(9, BOB).id]);
        assert_eq!(s.status(), FeedStatus::Live);
    }

    #[test]
    fn unknown_author_is_looked_up_once() {
        let mut s = session();
        let first = s.apply_insert(msg(1, BOB));
        assert!(first.feed_changed);
        assert_eq!(first.lookup, Some(BOB));
        assert_eq!(s.feed().entries()[0].sender_name, UNKNOWN_SENDER);

        let second = s.apply_insert(msg(2, BOB));
        assert_eq!(second.lookup, None);

        assert!(s.resolve_name(BOB, Some("bob".into())));
        assert!(s.feed().entries().iter().all(|e| e.sender_name == "bob"));
        assert_eq!(s.apply_insert(msg(3, BOB)).lookup, None);
    }

    #[test]
    fn backfill_names_are_reused_for_live_inserts() {
        let mut s = session();
        s.apply_backfill(vec![FeedEntry {
            message: msg(1, BOB),
            sender_name: "bob".into(),
        }]);
        let outcome = s.apply_insert(msg(2, BOB));
        assert_eq!(outcome.lookup, None);
        assert_eq!(s.feed().entries()[1].sender_name, "bob");
    }

    #[test]
    fn delete_landing_before_backfill_is_not_undone() {
        let mut s = session();
        let doomed = msg(2, BOB);
        assert!(!s.apply_delete(doomed.id));

        s.apply_backfill(vec![
            FeedEntry {
                message: msg(1, BOB),
                sender_name: "bob".into(),
            },
            FeedEntry {
                message: doomed,
                sender_name: "bob".into(),
            },
        ]);
        let ids: Vec<Uuid> = s.feed().entries().iter().map(|e| e.message.id).collect();
        assert_eq!(ids, vec![msg(1, BOB).id]);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Backfill(Vec<u128>),
        Insert(u128),
        Delete(u128),
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let first = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, first.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn any_interleaving_converges_to_the_same_feed() {
        // 3 and 4 share a timestamp; 4 is redelivered and later deleted.
        let minute = |n: u128| if n == 4 { 3 } else { n as u32 };
        let at = |n: u128| Message {
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, minute(n), 0).unwrap(),
            ..msg(n, BOB)
        };
        let events = [
            Event::Backfill(vec![1, 2, 3]),
            Event::Insert(3),
            Event::Insert(4),
            Event::Insert(4),
            Event::Delete(2),
            Event::Delete(4),
        ];

        for order in permutations(&events) {
            let mut s = session();
            for event in &order {
                match event {
                    Event::Backfill(ids) => {
                        s.apply_backfill(
                            ids.iter()
                                .map(|&n| FeedEntry {
                                    message: at(n),
                                    sender_name: "bob".into(),
                                })
                                .collect(),
                        );
                    }
                    Event::Insert(n) => {
                        s.apply_insert(at(*n));
                    }
                    Event::Delete(n) => {
                        s.apply_delete(at(*n).id);
                    }
                }

                let entries = s.feed().entries();
                let unique: HashSet<Uuid> = entries.iter().map(|e| e.message.id).collect();
                assert_eq!(unique.len(), entries.len(), "duplicate after {:?}", order);
                assert!(
                    entries.windows(2).all(|w| w[0].message.created_at <= w[1].message.created_at),
                    "out of order after {:?}",
                    order
                );
            }

            let ids: Vec<Uuid> = s.feed().entries().iter().map(|e| e.message.id).collect();
            assert_eq!(ids, vec![at(1).id, at(3).id], "final feed for {:?}", order);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn message_clears_its_author_from_typing() {
        let mut s = session();
        let now = Instant::now();
        assert!(!s.apply_typing(&typing(ME, "me"), ME, now));
        assert!(s.apply_typing(&typing(BOB, "bob"), ME, now));
        assert_eq!(s.typing(now).len(), 1);

        let outcome = s.apply_insert(msg(1, BOB));
        assert!(outcome.typing_changed);
        assert!(s.typing(now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_slot_needs_a_joined_channel_and_respects_the_throttle() {
        let mut s = session();
        let now = Instant::now();
        assert!(s.typing_slot(now).is_none());

        let (tx, _rx) = tokio::sync::broadcast::channel(4);
        s.set_typing_sender(TypingSender::new(tx));
        assert!(s.typing_slot(now).is_some());
        assert!(s.typing_slot(now + Duration::from_secs(1)).is_none());
        assert!(s.typing_slot(now + Duration::from_secs(3)).is_some());
    }
}
