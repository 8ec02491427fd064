/// Realtime broadcast channels: payloads, naming and the client-side publisher
use crate::error::{ChatError, Result};
use crate::model::Message;
use crate::realtime::connection::ConnectionHandle;
use crate::realtime::protocol::Stanza;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const CONVERSATION_PREFIX: &str = "conversation:";

/// Channel carrying one conversation's live traffic
pub fn conversation_channel(conversation_id: u64) -> String {
    format!("{}{}", CONVERSATION_PREFIX, conversation_id)
}

/// Inverse of [`conversation_channel`]
pub fn parse_conversation_channel(channel: &str) -> Option<u64> {
    channel.strip_prefix(CONVERSATION_PREFIX)?.parse().ok()
}

/// What travels over a conversation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BroadcastPayload {
    NewMessage { message: Message },
    Typing { conversation_id: u64, from: String },
}

impl BroadcastPayload {
    /// Parse and check an opaque channel payload.
    pub fn try_from_value(value: serde_json::Value) -> Result<Self> {
        let payload: BroadcastPayload = serde_json::from_value(value)
            .map_err(|e| ChatError::Protocol(format!("invalid broadcast payload: {}", e)))?;
        match &payload {
            BroadcastPayload::NewMessage { message } => {
                if message.id.is_pending() {
                    return Err(ChatError::Protocol(
                        "broadcast message without a durable id".to_string(),
                    ));
                }
                if message.client_id.is_empty() || message.sender_id.is_empty() {
                    return Err(ChatError::Protocol(
                        "broadcast message missing identity fields".to_string(),
                    ));
                }
            }
            BroadcastPayload::Typing { from, .. } => {
                if from.is_empty() {
                    return Err(ChatError::Protocol("typing signal without sender".to_string()));
                }
            }
        }
        Ok(payload)
    }

    pub fn conversation_id(&self) -> u64 {
        match self {
            BroadcastPayload::NewMessage { message } => message.conversation_id,
            BroadcastPayload::Typing { conversation_id, .. } => *conversation_id,
        }
    }
}

/// Publish side of the broadcast channel
pub trait Broadcaster: Send + Sync + 'static {
    /// Best-effort fan-out to every member of `channel`.
    fn publish(
        &self,
        channel: &str,
        payload: &BroadcastPayload,
    ) -> impl Future<Output = Result<()>> + Send;

    fn join(&self, channel: &str) -> impl Future<Output = Result<()>> + Send;

    fn leave(&self, channel: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Broadcaster over the shared connection. Remembers joined channels so they can
/// be re-joined when a new session starts.
#[derive(Clone)]
pub struct ConnectionBroadcaster {
    connection: ConnectionHandle,
    joined: Arc<RwLock<BTreeSet<String>>>,
}

impl ConnectionBroadcaster {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            joined: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    pub async fn joined(&self) -> Vec<String> {
        self.joined.read().await.iter().cloned().collect()
    }

    /// Subscribe again to every remembered channel on the new session.
    pub async fn rejoin_all(&self) {
        for channel in self.joined().await {
            if let Err(e) = self
                .connection
                .send(Stanza::Subscribe {
                    channel: channel.clone(),
                })
                .await
            {
                debug!("Re-join of {} failed: {}", channel, e);
            }
        }
    }
}

impl Broadcaster for ConnectionBroadcaster {
    async fn publish(&self, channel: &str, payload: &BroadcastPayload) -> Result<()> {
        let payload = serde_json::to_value(payload).map_err(ChatError::Serialization)?;
        self.connection
            .send(Stanza::Broadcast {
                channel: channel.to_string(),
                from: None,
                payload,
            })
            .await
    }

    async fn join(&self, channel: &str) -> Result<()> {
        self.joined.write().await.insert(channel.to_string());
        // Not connected yet is fine: rejoin_all runs when the session starts.
        match self
            .connection
            .send(Stanza::Subscribe {
                channel: channel.to_string(),
            })
            .await
        {
            Ok(()) | Err(ChatError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.joined.write().await.remove(channel);
        match self
            .connection
            .send(Stanza::Unsubscribe {
                channel: channel.to_string(),
            })
            .await
        {
            Ok(()) | Err(ChatError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageId;
    use chrono::Utc;

    fn message(id: MessageId) -> Message {
        Message {
            id,
            client_id: "c-1".into(),
            conversation_id: 4,
            sender_id: "alice@d".into(),
            receiver_id: "bob@d".into(),
            body: "hi".into(),
            created_at: Utc::now(),
            is_read: false,
        }
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(conversation_channel(12), "conversation:12");
        assert_eq!(parse_conversation_channel("conversation:12"), Some(12));
        assert_eq!(parse_conversation_channel("typing:12"), None);
        assert_eq!(parse_conversation_channel("conversation:x"), None);
    }

    #[test]
    fn test_payload_validation() {
        let ok = serde_json::to_value(BroadcastPayload::NewMessage {
            message: message(MessageId::Durable(9)),
        })
        .unwrap();
        assert!(BroadcastPayload::try_from_value(ok).is_ok());

        let pending = serde_json::to_value(BroadcastPayload::NewMessage {
            message: message(MessageId::Pending("c-1".into())),
        })
        .unwrap();
        assert!(BroadcastPayload::try_from_value(pending).is_err());

        let junk = serde_json::json!({ "event": "new_message", "message": { "body": 3 } });
        assert!(BroadcastPayload::try_from_value(junk).is_err());
    }
}
