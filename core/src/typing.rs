/// Typing indicator: outbound debounce and inbound expiry
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Coalesces local keystrokes per conversation.
///
/// The first keystroke opens a window and the caller schedules a flush after the
/// debounce delay; further keystrokes inside the window are absorbed. One signal
/// goes out when the window is flushed.
#[derive(Debug, Default)]
pub struct TypingDebouncer {
    open: HashSet<u64>,
}

impl TypingDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this keystroke opened a new window.
    pub fn keystroke(&mut self, conversation_id: u64) -> bool {
        self.open.insert(conversation_id)
    }

    /// Close the window; returns false if none was open.
    pub fn flush(&mut self, conversation_id: u64) -> bool {
        self.open.remove(&conversation_id)
    }

    pub fn is_open(&self, conversation_id: u64) -> bool {
        self.open.contains(&conversation_id)
    }
}

/// Who is typing where, on the receiving side
#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    active: HashMap<(u64, String), Instant>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            active: HashMap::new(),
        }
    }

    /// Record a signal. Returns true if `contact` was not already typing.
    pub fn on_signal(&mut self, conversation_id: u64, contact: &str, now: Instant) -> bool {
        self.active
            .insert((conversation_id, contact.to_string()), now + self.expiry)
            .is_none()
    }

    /// A message from `contact` ends their typing state immediately.
    pub fn clear(&mut self, conversation_id: u64, contact: &str) -> bool {
        self.active
            .remove(&(conversation_id, contact.to_string()))
            .is_some()
    }

    pub fn is_typing(&self, conversation_id: u64, contact: &str, now: Instant) -> bool {
        self.active
            .get(&(conversation_id, contact.to_string()))
            .is_some_and(|deadline| *deadline > now)
    }

    pub fn typing_in(&self, conversation_id: u64, now: Instant) -> Vec<String> {
        let mut contacts: Vec<String> = self
            .active
            .iter()
            .filter(|((conv, _), deadline)| *conv == conversation_id && **deadline > now)
            .map(|((_, contact), _)| contact.clone())
            .collect();
        contacts.sort();
        contacts
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(u64, String)> {
        let lapsed: Vec<(u64, String)> = self
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &lapsed {
            self.active.remove(key);
        }
        lapsed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().min().copied()
    }
}
