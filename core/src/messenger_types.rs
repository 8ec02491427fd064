/// Shared types for the Messenger layer
use crate::model::{Conversation, Message, PresenceRecord};
use crate::realtime::connection::ConnectionState;
use crate::reconciler::TimelineEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the conversation list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    /// The other participant's bare jid
    pub counterpart: String,
    /// Newest stored message, for the preview line
    pub last_message: Option<Message>,
}

/// Real-time events streamed over SSE (/events endpoint)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessengerEvent {
    /// Connection lifecycle changed; drives the connectivity banner
    ConnectionChanged { state: ConnectionState },
    SessionStarted { jid: String },
    /// Reconnect budget exhausted or credentials rejected; needs a new login
    ConnectivityFatal { reason: String },
    /// A message entered a timeline (pending or durable)
    MessageAdded { message: Message },
    /// A pending message got its durable id and timestamp
    MessageConfirmed { client_id: String, message: Message },
    /// A send failed and its pending entry was removed
    MessageRolledBack {
        conversation_id: u64,
        client_id: String,
        reason: String,
    },
    MessagesRead {
        conversation_id: u64,
        sender_id: String,
        reader_id: String,
    },
    HistoryPrepended {
        conversation_id: u64,
        added: usize,
        has_more: bool,
    },
    ConversationClosed { conversation_id: u64 },
    PresenceChanged {
        contact: String,
        record: PresenceRecord,
    },
    TypingStarted { conversation_id: u64, contact: String },
    TypingStopped { conversation_id: u64, contact: String },
    /// Plain message stanza addressed to the local user, outside any conversation
    DirectMessage {
        from: String,
        to: String,
        body: String,
        received_at: DateTime<Utc>,
    },
}

impl From<TimelineEvent> for MessengerEvent {
    fn from(event: TimelineEvent) -> Self {
        match event {
            TimelineEvent::Added { message } => MessengerEvent::MessageAdded { message },
            TimelineEvent::Confirmed { client_id, message } => {
                MessengerEvent::MessageConfirmed { client_id, message }
            }
            TimelineEvent::RolledBack {
                conversation_id,
                client_id,
                reason,
            } => MessengerEvent::MessageRolledBack {
                conversation_id,
                client_id,
                reason,
            },
            TimelineEvent::Read {
                conversation_id,
                sender_id,
                reader_id,
            } => MessengerEvent::MessagesRead {
                conversation_id,
                sender_id,
                reader_id,
            },
            TimelineEvent::Prepended {
                conversation_id,
                added,
                has_more,
            } => MessengerEvent::HistoryPrepended {
                conversation_id,
                added,
                has_more,
            },
            TimelineEvent::Closed { conversation_id } => {
                MessengerEvent::ConversationClosed { conversation_id }
            }
        }
    }
}
