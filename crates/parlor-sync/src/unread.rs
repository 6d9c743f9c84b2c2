//! Per-room unread counts for the signed-in user.
//!
//! A room's unread state is the set of message ids counted as unread, so
//! at-least-once delivery and a refresh racing live events cannot count
//! the same message twice. The open room is always zero: the engine marks
//! it read on entry and live inserts for it are not counted.
//!
//! Each counted mark remembers the sequence number of the event that
//! added it. A refresh remembers the sequence it was issued at, and when
//! its results come back every mark added after that point survives the
//! replacement. Marks from either source are then filtered against the
//! room's current watermark, which covers a room marked read while the
//! refresh was in flight.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;
use uuid::Uuid;

use parlor_types::models::{Message, UnreadMark};

#[derive(Debug, Clone, Copy)]
struct Tracked {
    created_at: DateTime<Utc>,
    seq: u64,
}

/// What watchers see. `total` is always the sum of `counts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadView {
    pub counts: BTreeMap<Uuid, usize>,
    pub total: usize,
}

impl UnreadView {
    pub fn count(&self, room_id: Uuid) -> usize {
        self.counts.get(&room_id).copied().unwrap_or(0)
    }
}

/// Badge text for a room list: nothing at zero, capped at "99+".
pub fn badge(count: usize) -> Option<String> {
    match count {
        0 => None,
        1..=99 => Some(count.to_string()),
        _ => Some("99+".to_string()),
    }
}

/// Issued when a refresh starts; hand it back with the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    seq: u64,
}

#[derive(Debug)]
pub struct UnreadCounter {
    user_id: Uuid,
    rooms: BTreeMap<Uuid, HashMap<Uuid, Tracked>>,
    open_room: Option<Uuid>,
    seq: u64,
}

impl UnreadCounter {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            rooms: BTreeMap::new(),
            open_room: None,
            seq: 0,
        }
    }

    pub fn set_open_room(&mut self, room_id: Option<Uuid>) {
        self.open_room = room_id;
    }

    /// Whether a live insert by someone else could be unread at all,
    /// before paying for a watermark lookup.
    pub fn is_candidate(&self, message: &Message) -> bool {
        message.author_id != self.user_id && self.open_room != Some(message.room_id)
    }

    /// Applies one live insert. Counts it when it is by someone else, in a
    /// room that is not open, and strictly newer than `watermark` (or the
    /// room was never read). Returns whether the count changed.
    pub fn on_insert(&mut self, message: &Message, watermark: Option<DateTime<Utc>>) -> bool {
        if !self.is_candidate(message) {
            return false;
        }
        if watermark.is_some_and(|read_at| message.created_at <= read_at) {
            trace!(message_id = %message.id, "insert at or before watermark, not unread");
            return false;
        }

        self.seq += 1;
        let seq = self.seq;
        let marks = self.rooms.entry(message.room_id).or_default();
        if marks.contains_key(&message.id) {
            return false;
        }
        marks.insert(
            message.id,
            Tracked {
                created_at: message.created_at,
                seq,
            },
        );
        true
    }

    pub fn begin_refresh(&self) -> RefreshTicket {
        RefreshTicket { seq: self.seq }
    }

    /// Replaces the cached state with a full recount. `results` holds one
    /// entry per room that exists; rooms missing from it are forgotten unless
    /// live events arrived for them after the refresh was issued.
    pub fn apply_refresh(
        &mut self,
        ticket: RefreshTicket,
        results: Vec<(Uuid, Vec<UnreadMark>)>,
        mut watermark: impl FnMut(Uuid) -> Option<DateTime<Utc>>,
    ) {
        let mut previous = std::mem::take(&mut self.rooms);

        for (room_id, marks) in results {
            let mut next: HashMap<Uuid, Tracked> = previous
                .remove(&room_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|(_, tracked)| tracked.seq > ticket.seq)
                .collect();

            for mark in marks {
                next.entry(mark.message_id).or_insert(Tracked {
                    created_at: mark.created_at,
                    seq: ticket.seq,
                });
            }

            self.rooms.insert(room_id, next);
        }

        for (room_id, marks) in previous {
            let recent: HashMap<Uuid, Tracked> = marks
                .into_iter()
                .filter(|(_, tracked)| tracked.seq > ticket.seq)
                .collect();
            if !recent.is_empty() {
                self.rooms.insert(room_id, recent);
            }
        }

        for (room_id, marks) in self.rooms.iter_mut() {
            if self.open_room == Some(*room_id) {
                marks.clear();
                continue;
            }
            if let Some(read_at) = watermark(*room_id) {
                marks.retain(|_, tracked| tracked.created_at > read_at);
            }
        }
    }

    /// Zeroes a room. The caller persists the new watermark.
    pub fn mark_read(&mut self, room_id: Uuid) {
        self.rooms.entry(room_id).or_default().clear();
    }

    pub fn count(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map_or(0, HashMap::len)
    }

    pub fn view(&self) -> UnreadView {
        let counts: BTreeMap<Uuid, usize> = self
            .rooms
            .iter()
            .map(|(room_id, marks)| (*room_id, marks.len()))
            .collect();
        let total = counts.values().sum();
        UnreadView { counts, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ME: Uuid = Uuid::from_u128(0xa);
    const OTHER: Uuid = Uuid::from_u128(0xb);
    const ROOM: Uuid = Uuid::from_u128(1);
    const ELSEWHERE: Uuid = Uuid::from_u128(2);

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn msg(n: u128, room_id: Uuid, author_id: Uuid, minute: u32) -> Message {
        Message {
            id: Uuid::from_u128(1000 + n),
            room_id,
            author_id,
            body: String::new(),
            created_at: at(minute),
        }
    }

    #[test]
    fn watermark_scenario_skips_self_and_old() {
        let mut counter = UnreadCounter::new(ME);
        let watermark = Some(at(0));

        assert!(counter.on_insert(&msg(1, ROOM, OTHER, 1), watermark));
        assert!(!counter.on_insert(&msg(2, ROOM, ME, 2), watermark));
        assert!(!counter.on_insert(&msg(3, ROOM, OTHER, 0), watermark));

        assert_eq!(counter.count(ROOM), 1);
    }

    #[test]
    fn never_read_room_counts_everything_from_others() {
        let mut counter = UnreadCounter::new(ME);
        for n in 0..4 {
            counter.on_insert(&msg(n, ROOM, OTHER, n as u32), None);
        }
        counter.on_insert(&msg(9, ROOM, ME, 9), None);
        assert_eq!(counter.count(ROOM), 4);
    }

    #[test]
    fn redelivered_insert_counts_once() {
        let mut counter = UnreadCounter::new(ME);
        let m = msg(1, ROOM, OTHER, 1);
        assert!(counter.on_insert(&m, None));
        assert!(!counter.on_insert(&m, None));
        assert_eq!(counter.view().total, 1);
    }

    #[test]
    fn open_room_is_not_counted() {
        let mut counter = UnreadCounter::new(ME);
        counter.set_open_room(Some(ROOM));
        assert!(!counter.on_insert(&msg(1, ROOM, OTHER, 1), None));
        assert!(counter.on_insert(&msg(2, ELSEWHERE, OTHER, 1), None));
        assert_eq!(counter.view().total, 1);
    }

    #[test]
    fn mark_read_zeroes_the_room() {
        let mut counter = UnreadCounter::new(ME);
        counter.on_insert(&msg(1, ROOM, OTHER, 1), None);
        counter.on_insert(&msg(2, ELSEWHERE, OTHER, 1), None);

        counter.mark_read(ROOM);
        assert_eq!(counter.count(ROOM), 0);
        assert_eq!(counter.view().total, 1);
        assert_eq!(counter.view().counts.get(&ROOM), Some(&0));
    }

    #[test]
    fn refresh_and_live_converge_in_either_order() {
        let live = msg(5, ROOM, OTHER, 5);
        let marks: Vec<UnreadMark> = (0..5)
            .map(|n| UnreadMark::from(&msg(n, ROOM, OTHER, n as u32)))
            .chain(std::iter::once(UnreadMark::from(&live)))
            .collect();

        // live event first, refresh issued afterwards
        let mut a = UnreadCounter::new(ME);
        a.on_insert(&live, None);
        let ticket = a.begin_refresh();
        a.apply_refresh(ticket, vec![(ROOM, marks.clone())], |_| None);

        // refresh issued, live event lands while it is in flight
        let mut b = UnreadCounter::new(ME);
        let ticket = b.begin_refresh();
        b.on_insert(&live, None);
        b.apply_refresh(ticket, vec![(ROOM, marks)], |_| None);

        assert_eq!(a.count(ROOM), 6);
        assert_eq!(b.count(ROOM), 6);
    }

    #[test]
    fn live_event_newer_than_refresh_survives_it() {
        let mut counter = UnreadCounter::new(ME);
        let ticket = counter.begin_refresh();
        counter.on_insert(&msg(7, ROOM, OTHER, 7), None);

        counter.apply_refresh(ticket, vec![(ROOM, vec![]), (ELSEWHERE, vec![])], |_| None);
        assert_eq!(counter.count(ROOM), 1);
        assert_eq!(counter.view().counts.len(), 2);
    }

    #[test]
    fn refresh_respects_a_watermark_moved_while_in_flight() {
        let mut counter = UnreadCounter::new(ME);
        let ticket = counter.begin_refresh();
        let stale = vec![UnreadMark::from(&msg(1, ROOM, OTHER, 1))];

        counter.mark_read(ROOM);
        counter.apply_refresh(ticket, vec![(ROOM, stale)], |_| Some(at(30)));

        assert_eq!(counter.count(ROOM), 0);
    }

    #[test]
    fn refresh_keeps_open_room_at_zero() {
        let mut counter = UnreadCounter::new(ME);
        counter.set_open_room(Some(ROOM));
        let ticket = counter.begin_refresh();
        let marks = vec![UnreadMark::from(&msg(1, ROOM, OTHER, 1))];

        counter.apply_refresh(ticket, vec![(ROOM, marks)], |_| None);
        assert_eq!(counter.count(ROOM), 0);
    }

    #[test]
    fn badges() {
        assert_eq!(badge(0), None);
        assert_eq!(badge(7).as_deref(), Some("7"));
        assert_eq!(badge(100).as_deref(), Some("99+"));
    }
}
