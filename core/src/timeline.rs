/// Ordered, deduplicated message list for one conversation
use crate::model::Message;
use std::cmp::Ordering;

/// What a merge did to the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New entry
    Inserted,
    /// A pending entry was replaced by its durable copy
    Confirmed,
    /// Already present
    Duplicate,
}

/// Sorted by (created_at, id). One entry per logical message.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge a message from any source: optimistic send, broadcast, store.
    pub fn merge(&mut self, incoming: Message) -> MergeOutcome {
        if let Some(durable) = incoming.id.durable() {
            if let Some(existing) = self
                .entries
                .iter_mut()
                .find(|m| m.id.durable() == Some(durable))
            {
                existing.is_read |= incoming.is_read;
                return MergeOutcome::Duplicate;
            }
        }

        if !incoming.client_id.is_empty() {
            if let Some(idx) = self
                .entries
                .iter()
                .position(|m| m.client_id == incoming.client_id)
            {
                if self.entries[idx].is_pending() && !incoming.is_pending() {
                    self.entries.remove(idx);
                    self.insert_sorted(incoming);
                    return MergeOutcome::Confirmed;
                }
                return MergeOutcome::Duplicate;
            }
        }

        self.insert_sorted(incoming);
        MergeOutcome::Inserted
    }

    /// Remove a still-pending entry. Confirmed entries are never rolled back.
    pub fn rollback(&mut self, client_id: &str) -> Option<Message> {
        let idx = self
            .entries
            .iter()
            .position(|m| m.client_id == client_id && m.is_pending())?;
        Some(self.entries.remove(idx))
    }

    /// Oldest entry the store knows about; the cursor for loading older pages.
    pub fn oldest_durable(&self) -> Option<&Message> {
        self.entries.iter().find(|m| !m.is_pending())
    }

    pub fn unread_from(&self, sender: &str, reader: &str) -> usize {
        self.entries
            .iter()
            .filter(|m| !m.is_read && m.sender_id == sender && m.receiver_id == reader)
            .count()
    }

    /// Flag everything `sender` sent to `reader` as read. Returns how many changed.
    pub fn mark_read_from(&mut self, sender: &str, reader: &str) -> usize {
        let mut changed = 0;
        for message in self
            .entries
            .iter_mut()
            .filter(|m| !m.is_read && m.sender_id == sender && m.receiver_id == reader)
        {
            message.is_read = true;
            changed += 1;
        }
        changed
    }

    fn insert_sorted(&mut self, message: Message) {
        let pos = self
            .entries
            .partition_point(|m| m.order_cmp(&message) != Ordering::Greater);
        self.entries.insert(pos, message);
    }
}
