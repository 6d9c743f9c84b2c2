//! Ordered, duplicate-free message sequence for one open room.
//!
//! Backfill results and live inserts both go through [`Feed::merge`]. An id
//! already present is discarded; anything else lands after every entry
//! whose timestamp is less than or equal to its own, so ties keep arrival
//! order and the common live case is a plain append.
//!
//! Deleted ids are remembered for the life of the feed. A backfill snapshot
//! taken before a delete can land after it, and must not bring the message
//! back.

use std::collections::HashSet;

use uuid::Uuid;

use parlor_types::models::FeedEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Appended,
    Inserted(usize),
    Duplicate,
    Deleted,
}

impl Merge {
    pub fn changed(self) -> bool {
        !matches!(self, Merge::Duplicate | Merge::Deleted)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Feed {
    entries: Vec<FeedEntry>,
    ids: HashSet<Uuid>,
    tombstones: HashSet<Uuid>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, entry: FeedEntry) -> Merge {
        if self.tombstones.contains(&entry.message.id) {
            return Merge::Deleted;
        }
        if !self.ids.insert(entry.message.id) {
            return Merge::Duplicate;
        }

        let created_at = entry.message.created_at;
        let at = self
            .entries
            .partition_point(|e| e.message.created_at <= created_at);

        if at == self.entries.len() {
            self.entries.push(entry);
            Merge::Appended
        } else {
            self.entries.insert(at, entry);
            Merge::Inserted(at)
        }
    }

    /// Merges a batch and returns how many entries were new.
    pub fn merge_all(&mut self, entries: impl IntoIterator<Item = FeedEntry>) -> usize {
        entries
            .into_iter()
            .map(|entry| self.merge(entry))
            .filter(|outcome| outcome.changed())
            .count()
    }

    /// Removing an id that is not present is not an error; the id is still
    /// tombstoned so a later merge of it is refused.
    pub fn remove(&mut self, id: Uuid) -> Option<FeedEntry> {
        self.tombstones.insert(id);
        if !self.ids.remove(&id) {
            return None;
        }
        let at = self.entries.iter().position(|e| e.message.id == id)?;
        Some(self.entries.remove(at))
    }

    /// Relabels every entry by `author_id`. Returns how many changed.
    pub fn rename_author(&mut self, author_id: Uuid, name: &str) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.message.author_id == author_id) {
            if entry.sender_name != name {
                entry.sender_name = name.to_string();
                changed += 1;
            }
        }
        changed
    }

    /// Drops every entry. Tombstones survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn entries(&self) -> &[FeedEntry] {
        &self.entries
    }

}
