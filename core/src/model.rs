/// Domain types shared by the store, the reconciler and the presence tracker
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Message identifier: a client-generated placeholder until the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Pending(String),
    Durable(u64),
}

impl MessageId {
    pub fn durable(&self) -> Option<u64> {
        match self {
            MessageId::Durable(id) => Some(*id),
            MessageId::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending(_))
    }
}

// Durable ids are zero-padded so string order equals numeric order.
impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Durable(id) => write!(f, "{:020}", id),
            MessageId::Pending(tmp) => write!(f, "tmp-{}", tmp),
        }
    }
}

/// One chat message as rendered in a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Shared id minted at send time; travels in the broadcast payload and the stored row.
    pub client_id: String,
    pub conversation_id: u64,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.id.is_pending()
    }

    /// Timeline ordering: creation time, then id string.
    pub fn order_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.to_string().cmp(&other.id.to_string()))
    }
}

/// Insert request handed to the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub client_id: String,
    pub conversation_id: u64,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
}

/// Identity of a conversation: one per (listing, buyer, seller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub listing_id: String,
    pub buyer_id: String,
    pub seller_id: String,
}

impl ConversationKey {
    pub fn new(
        listing_id: impl Into<String>,
        buyer_id: impl Into<String>,
        seller_id: impl Into<String>,
    ) -> Self {
        Self {
            listing_id: listing_id.into(),
            buyer_id: buyer_id.into(),
            seller_id: seller_id.into(),
        }
    }
}

/// Buyer/seller pairing tied to a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: u64,
    pub listing_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user: &str) -> bool {
        self.buyer_id == user || self.seller_id == user
    }

    /// The other participant, from `user`'s point of view.
    pub fn counterpart(&self, user: &str) -> Option<&str> {
        if self.buyer_id == user {
            Some(&self.seller_id)
        } else if self.seller_id == user {
            Some(&self.buyer_id)
        } else {
            None
        }
    }
}

/// Contact availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Away => write!(f, "away"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Last observed presence of one contact in the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub status_text: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a presence lookup. `Unknown` is not the same as offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PresenceLookup {
    Unknown,
    Known(PresenceRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: MessageId, secs: i64) -> Message {
        Message {
            id,
            client_id: "c".into(),
            conversation_id: 1,
            sender_id: "a".into(),
            receiver_id: "b".into(),
            body: "x".into(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            is_read: false,
        }
    }

    #[test]
    fn test_order_ties_break_on_id() {
        let a = msg(MessageId::Durable(9), 10);
        let b = msg(MessageId::Durable(10), 10);
        assert_eq!(a.order_cmp(&b), Ordering::Less);
        let c = msg(MessageId::Durable(1), 11);
        assert_eq!(b.order_cmp(&c), Ordering::Less);
    }

    #[test]
    fn test_counterpart() {
        let conv = Conversation {
            id: 1,
            listing_id: "l".into(),
            buyer_id: "buyer".into(),
            seller_id: "seller".into(),
            created_at: Utc::now(),
        };
        assert_eq!(conv.counterpart("buyer"), Some("seller"));
        assert_eq!(conv.counterpart("seller"), Some("buyer"));
        assert_eq!(conv.counterpart("eve"), None);
    }
}
