//! Ephemeral "is typing" state for the open room.
//!
//! Every entry carries its own deadline. Reads evict expired entries first,
//! so a late or missed timer never leaves a stale name on screen; the engine
//! still arms a timer for [`Presence::next_deadline`] so expiry is pushed
//! to watchers without waiting for the next read.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use parlor_types::models::TypingUser;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct Presence {
    ttl: Duration,
    entries: HashMap<Uuid, Entry>,
}

impl Presence {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Records a typing signal. A repeat signal from the same user moves the
    /// deadline instead of adding a second entry. Returns whether the
    /// visible set changed.
    pub fn observe(&mut self, user_id: Uuid, name: &str, now: Instant) -> bool {
        let deadline = now + self.ttl;
        match self.entries.get_mut(&user_id) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = deadline;
                if entry.name == name {
                    false
                } else {
                    entry.name = name.to_string();
                    true
                }
            }
            _ => {
                self.entries.insert(
                    user_id,
                    Entry {
                        name: name.to_string(),
                        deadline,
                    },
                );
                true
            }
        }
    }

    /// Drops a user right away, e.g. because their message just landed.
    pub fn clear(&mut self, user_id: Uuid) -> bool {
        self.entries.remove(&user_id).is_some()
    }

    /// Evicts everything whose deadline has passed. Returns whether anything
    /// was removed.
    pub fn purge(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.deadline > now);
        self.entries.len() != before
    }

    /// Current typists ordered by name, after evicting expired entries.
    pub fn snapshot(&mut self, now: Instant) -> Vec<TypingUser> {
        self.purge(now);
        let mut users: Vec<TypingUser> = self
            .entries
            .iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: *user_id,
                name: entry.name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        users
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }
}

/// Local suppression for outgoing typing broadcasts: at most one per window.
#[derive(Debug, Clone)]
pub struct TypingThrottle {
    window: Duration,
    last_sent: Option<Instant>,
}

impl TypingThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: None,
        }
    }

    /// Returns true, and starts a new window, when a broadcast may go out.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(sent) if now.duration_since(sent) < self.window => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

/// "Ada is typing..." / "Ada, Bob are typing...", or `None` when nobody is.
pub fn typing_label(users: &[TypingUser]) -> Option<String> {
    match users {
        [] => None,
        [one] => Some(format!("{} is typing...", one.name)),
        many => {
            let names: Vec<&str> = many.iter().map(|u| u.name.as_str()).collect();
            Some(format!("{} are typing...", names.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3);

    fn user(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn entry_expires_exactly_at_ttl() {
        let start = Instant::now();
        let mut presence = Presence::new(TTL);
        assert!(presence.observe(user(1), "Ada", start));

        assert_eq!(presence.snapshot(start + Duration::from_millis(2999)).len(), 1);
        assert!(presence.snapshot(start + TTL).is_empty());
    }

    #[test]
    fn repeat_signal_resets_instead_of_stacking() {
        let start = Instant::now();
        let mut presence = Presence::new(TTL);
        presence.observe(user(1), "Ada", start);
        assert!(!presence.observe(user(1), "Ada", start + Duration::from_secs(2)));

        let later = start + Duration::from_secs(4);
        assert_eq!(presence.snapshot(later).len(), 1);
        assert_eq!(presence.next_deadline(), Some(start + Duration::from_secs(5)));
    }

    #[test]
    fn message_clears_before_expiry() {
        let start = Instant::now();
        let mut presence = Presence::new(TTL);
        presence.observe(user(1), "Ada", start);
        presence.observe(user(2), "Bob", start);

        assert!(presence.clear(user(1)));
        assert!(!presence.clear(user(1)));
        let names: Vec<String> = presence.snapshot(start).into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["Bob"]);
    }

    #[test]
    fn expired_entry_counts_as_new_when_signalled_again() {
        let start = Instant::now();
        let mut presence = Presence::new(TTL);
        presence.observe(user(1), "Ada", start);
        assert!(presence.observe(user(1), "Ada", start + Duration::from_secs(10)));
    }

    #[test]
    fn throttle_allows_one_send_per_window() {
        let start = Instant::now();
        let mut throttle = TypingThrottle::new(TTL);

        assert!(throttle.try_acquire(start));
        assert!(!throttle.try_acquire(start + Duration::from_secs(1)));
        assert!(!throttle.try_acquire(start + Duration::from_millis(2999)));
        assert!(throttle.try_acquire(start + TTL));
    }

    #[test]
    fn labels() {
        let ada = TypingUser { user_id: user(1), name: "Ada".into() };
        let bob = TypingUser { user_id: user(2), name: "Bob".into() };

        assert_eq!(typing_label(&[]), None);
        assert_eq!(typing_label(&[ada.clone()]).as_deref(), Some("Ada is typing..."));
        assert_eq!(typing_label(&[ada, bob]).as_deref(), Some("Ada, Bob are typing..."));
    }
}
