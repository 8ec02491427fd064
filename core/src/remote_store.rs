/// Durable store shared through the hub
///
/// The hub owns the one `SledStore` every client writes to, so durable ids
/// stay unique across users. Clients reach it with [`RemoteStore`], which
/// sends each call as a framed stanza over the session and waits for the
/// matching reply; the hub answers through [`StoreService`] under the
/// session's identity and pushes row changes to both participants.
use crate::error::{ChatError, Result};
use crate::message_store::{DurableStore, PageCursor, SledStore, StoreChange};
use crate::model::{Conversation, ConversationKey, Message, NewMessage};
use crate::realtime::connection::{ConnectionHandle, SessionSignal};
use crate::realtime::protocol::{InboundEvent, Stanza};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};

/// One store operation on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreCall {
    FindOrCreateConversation {
        key: ConversationKey,
    },
    GetConversation {
        conversation_id: u64,
    },
    ListConversations {
        user: String,
    },
    DeleteConversation {
        conversation_id: u64,
    },
    InsertMessage {
        message: NewMessage,
    },
    FetchPage {
        conversation_id: u64,
        before: Option<PageCursor>,
        limit: usize,
    },
    MarkRead {
        conversation_id: u64,
        sender: String,
        reader: String,
    },
}

impl StoreCall {
    pub fn name(&self) -> &'static str {
        match self {
            StoreCall::FindOrCreateConversation { .. } => "find_or_create_conversation",
            StoreCall::GetConversation { .. } => "get_conversation",
            StoreCall::ListConversations { .. } => "list_conversations",
            StoreCall::DeleteConversation { .. } => "delete_conversation",
            StoreCall::InsertMessage { .. } => "insert_message",
            StoreCall::FetchPage { .. } => "fetch_page",
            StoreCall::MarkRead { .. } => "mark_read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StoreOutcome {
    Conversation { conversation: Conversation },
    MaybeConversation { conversation: Option<Conversation> },
    Conversations { conversations: Vec<Conversation> },
    Deleted { deleted: bool },
    Message { message: Message },
    Page { messages: Vec<Message> },
    Marked { updated: usize },
    Failed { failure: StoreFailure },
}

/// Error classes that survive the trip back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum StoreFailure {
    NotFound { conversation_id: u64 },
    Forbidden { reason: String },
    Rejected { reason: String },
    Unavailable { reason: String },
}

impl From<&ChatError> for StoreFailure {
    fn from(e: &ChatError) -> Self {
        match e {
            ChatError::ConversationNotFound(id) => StoreFailure::NotFound {
                conversation_id: *id,
            },
            ChatError::Forbidden(reason) => StoreFailure::Forbidden {
                reason: reason.clone(),
            },
            ChatError::SendFailed(reason) => StoreFailure::Rejected {
                reason: reason.clone(),
            },
            other => StoreFailure::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

impl From<StoreFailure> for ChatError {
    fn from(failure: StoreFailure) -> Self {
        match failure {
            StoreFailure::NotFound { conversation_id } => {
                ChatError::ConversationNotFound(conversation_id)
            }
            StoreFailure::Forbidden { reason } => ChatError::Forbidden(reason),
            StoreFailure::Rejected { reason } => ChatError::SendFailed(reason),
            StoreFailure::Unavailable { reason } => ChatError::Storage(reason),
        }
    }
}

/// Hub side: runs calls against the shared store as the session's user.
#[derive(Clone)]
pub struct StoreService {
    store: SledStore,
}

impl StoreService {
    pub fn new(store: SledStore) -> Self {
        Self { store }
    }

    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.store.changes()
    }

    pub async fn is_participant(&self, user: &str, conversation_id: u64) -> Result<bool> {
        Ok(self
            .store
            .get_conversation(conversation_id)
            .await?
            .is_some_and(|c| c.has_participant(user)))
    }

    // Outsiders get the same answer as for a missing conversation.
    async fn participant_conversation(&self, user: &str, conversation_id: u64) -> Result<Conversation> {
        match self.store.get_conversation(conversation_id).await? {
            Some(conversation) if conversation.has_participant(user) => Ok(conversation),
            _ => Err(ChatError::ConversationNotFound(conversation_id)),
        }
    }

    /// Execute `call` for the bare jid `user`; failures become [`StoreOutcome::Failed`].
    pub async fn answer(&self, user: &str, call: StoreCall) -> StoreOutcome {
        let op = call.name();
        match self.execute(user, call).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Store call {} from {} failed: {}", op, user, e);
                StoreOutcome::Failed {
                    failure: StoreFailure::from(&e),
                }
            }
        }
    }

    async fn execute(&self, user: &str, call: StoreCall) -> Result<StoreOutcome> {
        match call {
            StoreCall::FindOrCreateConversation { key } => {
                if key.buyer_id == key.seller_id || !(key.buyer_id == user || key.seller_id == user) {
                    return Err(ChatError::Forbidden(format!(
                        "{} is not a party to listing {}",
                        user, key.listing_id
                    )));
                }
                let conversation = self.store.find_or_create_conversation(&key).await?;
                Ok(StoreOutcome::Conversation { conversation })
            }
            StoreCall::GetConversation { conversation_id } => {
                let conversation = self
                    .store
                    .get_conversation(conversation_id)
                    .await?
                    .filter(|c| c.has_participant(user));
                Ok(StoreOutcome::MaybeConversation { conversation })
            }
            StoreCall::ListConversations { user: requested } => {
                if requested != user {
                    return Err(ChatError::Forbidden(format!(
                        "{} cannot list conversations of {}",
                        user, requested
                    )));
                }
                let conversations = self.store.list_conversations(user).await?;
                Ok(StoreOutcome::Conversations { conversations })
            }
            StoreCall::DeleteConversation { conversation_id } => {
                self.participant_conversation(user, conversation_id).await?;
                let deleted = self.store.delete_conversation(conversation_id).await?;
                Ok(StoreOutcome::Deleted { deleted })
            }
            StoreCall::InsertMessage { message } => {
                let conversation = self
                    .participant_conversation(user, message.conversation_id)
                    .await?;
                if message.sender_id != user
                    || conversation.counterpart(user) != Some(message.receiver_id.as_str())
                {
                    return Err(ChatError::Forbidden(format!(
                        "{} cannot send as {} to {}",
                        user, message.sender_id, message.receiver_id
                    )));
                }
                let message = self.store.insert_message(message).await?;
                Ok(StoreOutcome::Message { message })
            }
            StoreCall::FetchPage {
                conversation_id,
                before,
                limit,
            } => {
                self.participant_conversation(user, conversation_id).await?;
                let messages = self.store.fetch_page(conversation_id, before, limit).await?;
                Ok(StoreOutcome::Page { messages })
            }
            StoreCall::MarkRead {
                conversation_id,
                sender,
                reader,
            } => {
                self.participant_conversation(user, conversation_id).await?;
                if reader != user {
                    return Err(ChatError::Forbidden(format!(
                        "{} cannot mark messages read for {}",
                        user, reader
                    )));
                }
                let updated = self.store.mark_read(conversation_id, &sender, &reader).await?;
                Ok(StoreOutcome::Marked { updated })
            }
        }
    }
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<StoreOutcome>>>>;

/// Client side: a [`DurableStore`] backed by the hub's store.
///
/// Calls fail with [`ChatError::NotConnected`] while no session is up;
/// calls in flight when the session ends fail with [`ChatError::Connection`].
#[derive(Clone)]
pub struct RemoteStore {
    connection: ConnectionHandle,
    pending: PendingReplies,
    next_request: Arc<AtomicU64>,
    changes: broadcast::Sender<StoreChange>,
}

impl RemoteStore {
    /// Spawns the task that routes replies and change notifications off `connection`.
    pub fn new(connection: ConnectionHandle) -> Self {
        let (changes, _) = broadcast::channel(1024);
        let pending: PendingReplies = Arc::default();
        tokio::spawn(route_replies(
            connection.subscribe(),
            pending.clone(),
            changes.clone(),
        ));
        Self {
            connection,
            pending,
            next_request: Arc::new(AtomicU64::new(1)),
            changes,
        }
    }

    async fn call(&self, call: StoreCall) -> Result<StoreOutcome> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let op = call.name();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        if let Err(e) = self
            .connection
            .send(Stanza::StoreRequest { request_id, call })
            .await
        {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match reply_rx.await {
            Ok(StoreOutcome::Failed { failure }) => Err(failure.into()),
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(ChatError::Connection(format!(
                "session ended before {} was answered",
                op
            ))),
        }
    }
}

fn unexpected(op: &str, outcome: StoreOutcome) -> ChatError {
    ChatError::Protocol(format!("unexpected reply to {}: {:?}", op, outcome))
}

async fn route_replies(
    mut signals: broadcast::Receiver<SessionSignal>,
    pending: PendingReplies,
    changes: broadcast::Sender<StoreChange>,
) {
    loop {
        match signals.recv().await {
            Ok(SessionSignal::Inbound(InboundEvent::StoreResponse {
                request_id,
                outcome,
            })) => match pending.lock().await.remove(&request_id) {
                Some(reply) => {
                    let _ = reply.send(outcome);
                }
                None => debug!("Store reply {} arrived after its caller gave up", request_id),
            },
            Ok(SessionSignal::Inbound(InboundEvent::StoreChanged { change })) => {
                let _ = changes.send(change);
            }
            Ok(SessionSignal::Ended) | Ok(SessionSignal::Fatal(_)) => {
                let abandoned = std::mem::take(&mut *pending.lock().await);
                if !abandoned.is_empty() {
                    debug!("{} store calls abandoned with the session", abandoned.len());
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Store reply router lagged by {} session signals", skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

impl DurableStore for RemoteStore {
    async fn find_or_create_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        let call = StoreCall::FindOrCreateConversation { key: key.clone() };
        match self.call(call).await? {
            StoreOutcome::Conversation { conversation } => Ok(conversation),
            other => Err(unexpected("find_or_create_conversation", other)),
        }
    }

    async fn get_conversation(&self, id: u64) -> Result<Option<Conversation>> {
        match self
            .call(StoreCall::GetConversation { conversation_id: id })
            .await?
        {
            StoreOutcome::MaybeConversation { conversation } => Ok(conversation),
            other => Err(unexpected("get_conversation", other)),
        }
    }

    async fn list_conversations(&self, user: &str) -> Result<Vec<Conversation>> {
        let call = StoreCall::ListConversations {
            user: user.to_string(),
        };
        match self.call(call).await? {
            StoreOutcome::Conversations { conversations } => Ok(conversations),
            other => Err(unexpected("list_conversations", other)),
        }
    }

    async fn delete_conversation(&self, id: u64) -> Result<bool> {
        match self
            .call(StoreCall::DeleteConversation { conversation_id: id })
            .await?
        {
            StoreOutcome::Deleted { deleted } => Ok(deleted),
            other => Err(unexpected("delete_conversation", other)),
        }
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        match self.call(StoreCall::InsertMessage { message }).await? {
            StoreOutcome::Message { message } => Ok(message),
            other => Err(unexpected("insert_message", other)),
        }
    }

    async fn fetch_page(
        &self,
        conversation_id: u64,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let call = StoreCall::FetchPage {
            conversation_id,
            before,
            limit,
        };
        match self.call(call).await? {
            StoreOutcome::Page { messages } => Ok(messages),
            other => Err(unexpected("fetch_page", other)),
        }
    }

    async fn mark_read(&self, conversation_id: u64, sender: &str, reader: &str) -> Result<usize> {
        let call = StoreCall::MarkRead {
            conversation_id,
            sender: sender.to_string(),
            reader: reader.to_string(),
        };
        match self.call(call).await? {
            StoreOutcome::Marked { updated } => Ok(updated),
            other => Err(unexpected("mark_read", other)),
        }
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "alice@tradepost.local";
    const BOB: &str = "bob@tradepost.local";
    const EVE: &str = "eve@tradepost.local";

    async fn service_with_conversation() -> (StoreService, Conversation) {
        let service = StoreService::new(SledStore::temporary().unwrap());
        let outcome = service
            .answer(
                ALICE,
                StoreCall::FindOrCreateConversation {
                    key: ConversationKey::new("lamp", ALICE, BOB),
                },
            )
            .await;
        match outcome {
            StoreOutcome::Conversation { conversation } => (service, conversation),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    fn new_message(conversation: &Conversation, sender: &str, receiver: &str) -> NewMessage {
        NewMessage {
            client_id: "c-1".to_string(),
            conversation_id: conversation.id,
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            body: "still available?".to_string(),
        }
    }

    #[tokio::test]
    async fn test_participants_reach_their_conversation() {
        let (service, conversation) = service_with_conversation().await;

        let outcome = service
            .answer(BOB, StoreCall::InsertMessage { message: new_message(&conversation, BOB, ALICE) })
            .await;
        assert!(matches!(outcome, StoreOutcome::Message { .. }), "{:?}", outcome);

        let outcome = service
            .answer(
                ALICE,
                StoreCall::FetchPage {
                    conversation_id: conversation.id,
                    before: None,
                    limit: 10,
                },
            )
            .await;
        let messages = match outcome {
            StoreOutcome::Page { messages } => messages,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, BOB);
    }

    #[tokio::test]
    async fn test_outsider_sees_nothing() {
        let (service, conversation) = service_with_conversation().await;

        let outcome = service
            .answer(EVE, StoreCall::GetConversation { conversation_id: conversation.id })
            .await;
        assert_eq!(outcome, StoreOutcome::MaybeConversation { conversation: None });

        let outcome = service
            .answer(
                EVE,
                StoreCall::FetchPage {
                    conversation_id: conversation.id,
                    before: None,
                    limit: 10,
                },
            )
            .await;
        assert_eq!(
            outcome,
            StoreOutcome::Failed {
                failure: StoreFailure::NotFound { conversation_id: conversation.id }
            }
        );

        let outcome = service
            .answer(EVE, StoreCall::ListConversations { user: ALICE.to_string() })
            .await;
        assert!(matches!(
            outcome,
            StoreOutcome::Failed { failure: StoreFailure::Forbidden { .. } }
        ));

        let outcome = service
            .answer(
                EVE,
                StoreCall::FindOrCreateConversation {
                    key: ConversationKey::new("lamp", ALICE, BOB),
                },
            )
            .await;
        assert!(matches!(
            outcome,
            StoreOutcome::Failed { failure: StoreFailure::Forbidden { .. } }
        ));
    }

    #[tokio::test]
    async fn test_participant_cannot_impersonate_counterpart() {
        let (service, conversation) = service_with_conversation().await;

        let outcome = service
            .answer(ALICE, StoreCall::InsertMessage { message: new_message(&conversation, BOB, ALICE) })
            .await;
        assert!(matches!(
            outcome,
            StoreOutcome::Failed { failure: StoreFailure::Forbidden { .. } }
        ));

        let outcome = service
            .answer(
                ALICE,
                StoreCall::MarkRead {
                    conversation_id: conversation.id,
                    sender: ALICE.to_string(),
                    reader: BOB.to_string(),
                },
            )
            .await;
        assert!(matches!(
            outcome,
            StoreOutcome::Failed { failure: StoreFailure::Forbidden { .. } }
        ));
    }

    #[test]
    fn test_failures_keep_their_error_class() {
        let cases = [
            ChatError::ConversationNotFound(3),
            ChatError::Forbidden("no".to_string()),
            ChatError::SendFailed("rejected".to_string()),
        ];
        for error in cases {
            let back = ChatError::from(StoreFailure::from(&error));
            assert_eq!(back.to_string(), error.to_string());
        }
        let back = ChatError::from(StoreFailure::from(&ChatError::Timeout("slow".to_string())));
        assert!(matches!(back, ChatError::Storage(_)));
    }
}
