/// Durable conversation and message storage in sled
use crate::error::{ChatError, Result};
use crate::model::{Conversation, ConversationKey, Message, MessageId, NewMessage};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Transactional};
use std::future::Future;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Row-level change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum StoreChange {
    ConversationCreated { conversation: Conversation },
    ConversationDeleted { conversation: Conversation },
    MessageInserted { message: Message },
    MessagesRead {
        conversation_id: u64,
        sender_id: String,
        reader_id: String,
    },
}

impl StoreChange {
    /// The two users the change concerns
    pub fn participants(&self) -> [&str; 2] {
        match self {
            StoreChange::ConversationCreated { conversation }
            | StoreChange::ConversationDeleted { conversation } => {
                [&conversation.buyer_id, &conversation.seller_id]
            }
            StoreChange::MessageInserted { message } => [&message.sender_id, &message.receiver_id],
            StoreChange::MessagesRead {
                sender_id,
                reader_id,
                ..
            } => [sender_id, reader_id],
        }
    }
}

/// Position in a conversation's history; pages are fetched strictly before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: u64,
}

impl PageCursor {
    pub fn of(message: &Message) -> Option<Self> {
        Some(Self {
            created_at: message.created_at,
            id: message.id.durable()?,
        })
    }
}

/// The authoritative store behind every timeline
pub trait DurableStore: Clone + Send + Sync + 'static {
    /// Idempotent per (listing, buyer, seller)
    fn find_or_create_conversation(
        &self,
        key: &ConversationKey,
    ) -> impl Future<Output = Result<Conversation>> + Send;

    fn get_conversation(&self, id: u64) -> impl Future<Output = Result<Option<Conversation>>> + Send;

    fn list_conversations(&self, user: &str) -> impl Future<Output = Result<Vec<Conversation>>> + Send;

    /// Removes the conversation and all of its messages
    fn delete_conversation(&self, id: u64) -> impl Future<Output = Result<bool>> + Send;

    /// Assigns the durable id and timestamp
    fn insert_message(&self, message: NewMessage) -> impl Future<Output = Result<Message>> + Send;

    /// Up to `limit` messages older than `before`, newest first
    fn fetch_page(
        &self,
        conversation_id: u64,
        before: Option<PageCursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Mark everything `sender` sent to `reader` in the conversation as read, in one batch
    fn mark_read(
        &self,
        conversation_id: u64,
        sender: &str,
        reader: &str,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn changes(&self) -> broadcast::Receiver<StoreChange>;
}

fn storage_err(op: &str, e: sled::Error) -> ChatError {
    ChatError::Storage(format!("{}: {}", op, e))
}

fn index_key(key: &ConversationKey) -> Vec<u8> {
    format!("{}\0{}\0{}", key.listing_id, key.buyer_id, key.seller_id).into_bytes()
}

// Sign bit flipped so negative timestamps sort before positive ones.
fn time_bytes(at: &DateTime<Utc>) -> [u8; 8] {
    ((at.timestamp_micros() as u64) ^ (1 << 63)).to_be_bytes()
}

fn message_key(conversation_id: u64, created_at: &DateTime<Utc>, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&conversation_id.to_be_bytes());
    key.extend_from_slice(&time_bytes(created_at));
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_id(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| ChatError::Storage(format!("corrupt id of {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    conversations: sled::Tree,
    conversation_index: sled::Tree,
    messages: sled::Tree,
    changes: broadcast::Sender<StoreChange>,
}

impl SledStore {
    /// Open (or create) `messages.db` under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(ChatError::Io)?;
        let db = sled::open(data_dir.join("messages.db"))
            .map_err(|e| storage_err("Failed to open messages DB", e))?;
        Self::with_db(db)
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage_err("Failed to open temporary DB", e))?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self> {
        let conversations = db
            .open_tree("conversations")
            .map_err(|e| storage_err("conversations tree", e))?;
        let conversation_index = db
            .open_tree("conversation_index")
            .map_err(|e| storage_err("conversation_index tree", e))?;
        let messages = db
            .open_tree("messages")
            .map_err(|e| storage_err("messages tree", e))?;
        let (changes, _) = broadcast::channel(1024);
        Ok(Self {
            db,
            conversations,
            conversation_index,
            messages,
            changes,
        })
    }

    fn next_id(&self) -> Result<u64> {
        // sled ids start at 0; keep 0 free.
        Ok(self.db.generate_id().map_err(|e| storage_err("generate_id", e))? + 1)
    }

    fn load_conversation(&self, id: u64) -> Result<Option<Conversation>> {
        match self
            .conversations
            .get(id.to_be_bytes())
            .map_err(|e| storage_err("get_conversation", e))?
        {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(ChatError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    /// Row behind an index entry. A dangling entry is dropped so the key can be
    /// created again.
    fn resolve_index(&self, index: &[u8], raw: &IVec) -> Result<Option<Conversation>> {
        let id = decode_id(raw)?;
        if let Some(conversation) = self.load_conversation(id)? {
            return Ok(Some(conversation));
        }
        warn!("Conversation index entry points at missing row {}; dropping it", id);
        // Losing this swap means someone else already fixed or replaced the entry.
        let _ = self
            .conversation_index
            .compare_and_swap(index, Some(&raw[..]), None::<&[u8]>)
            .map_err(|e| storage_err("conversation_index heal", e))?;
        Ok(None)
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// Message count across all conversations
    pub fn count(&self) -> usize {
        self.messages.len()
    }
}

impl DurableStore for SledStore {
    async fn find_or_create_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        let index = index_key(key);
        loop {
            if let Some(raw) = self
                .conversation_index
                .get(&index)
                .map_err(|e| storage_err("conversation_index", e))?
            {
                match self.resolve_index(&index, &raw)? {
                    Some(conversation) => return Ok(conversation),
                    None => continue,
                }
            }

            let conversation = Conversation {
                id: self.next_id()?,
                listing_id: key.listing_id.clone(),
                buyer_id: key.buyer_id.clone(),
                seller_id: key.seller_id.clone(),
                created_at: Utc::now().trunc_subsecs(6),
            };
            let id_bytes = conversation.id.to_be_bytes();
            let row = serde_json::to_vec(&conversation).map_err(ChatError::Serialization)?;

            // Row first, so a winning index entry always points at a row.
            self.conversations
                .insert(id_bytes, row)
                .map_err(|e| storage_err("insert conversation", e))?;

            let swapped = self
                .conversation_index
                .compare_and_swap(&index, None::<&[u8]>, Some(id_bytes.to_vec()))
                .map_err(|e| storage_err("conversation_index cas", e))?;

            match swapped {
                Ok(()) => {
                    debug!(
                        "Created conversation {} for listing {}",
                        conversation.id, conversation.listing_id
                    );
                    self.notify(StoreChange::ConversationCreated {
                        conversation: conversation.clone(),
                    });
                    return Ok(conversation);
                }
                Err(_) => {
                    // Lost the race; the next pass reads the winner.
                    self.conversations
                        .remove(id_bytes)
                        .map_err(|e| storage_err("remove conversation", e))?;
                }
            }
        }
    }

    async fn get_conversation(&self, id: u64) -> Result<Option<Conversation>> {
        self.load_conversation(id)
    }

    async fn list_conversations(&self, user: &str) -> Result<Vec<Conversation>> {
        let mut out = Vec::new();
        for entry in self.conversations.iter() {
            let (_, raw) = entry.map_err(|e| storage_err("list_conversations", e))?;
            if let Ok(conversation) = serde_json::from_slice::<Conversation>(&raw) {
                if conversation.has_participant(user) {
                    out.push(conversation);
                }
            }
        }
        Ok(out)
    }

    async fn delete_conversation(&self, id: u64) -> Result<bool> {
        let Some(conversation) = self.load_conversation(id)? else {
            return Ok(false);
        };

        let mut message_keys = Vec::new();
        for entry in self.messages.scan_prefix(id.to_be_bytes()) {
            let (key, _) = entry.map_err(|e| storage_err("scan messages", e))?;
            message_keys.push(key);
        }
        let index = index_key(&ConversationKey::new(
            conversation.listing_id.clone(),
            conversation.buyer_id.clone(),
            conversation.seller_id.clone(),
        ));

        // Messages, index entry and row go together or not at all.
        (&self.messages, &self.conversation_index, &self.conversations)
            .transaction(|(messages, conversation_index, conversations)| {
                for key in &message_keys {
                    messages.remove(key.clone())?;
                }
                conversation_index.remove(index.clone())?;
                conversations.remove(id.to_be_bytes().to_vec())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                ChatError::Storage(format!("delete conversation {}: {:?}", id, e))
            })?;

        debug!("Deleted conversation {} with {} messages", id, message_keys.len());
        self.notify(StoreChange::ConversationDeleted { conversation });
        Ok(true)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        if self.load_conversation(message.conversation_id)?.is_none() {
            return Err(ChatError::ConversationNotFound(message.conversation_id));
        }

        let id = self.next_id()?;
        let stored = Message {
            id: MessageId::Durable(id),
            client_id: message.client_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            body: message.body,
            created_at: Utc::now().trunc_subsecs(6),
            is_read: false,
        };
        let row = serde_json::to_vec(&stored).map_err(ChatError::Serialization)?;
        self.messages
            .insert(message_key(stored.conversation_id, &stored.created_at, id), row)
            .map_err(|e| storage_err("insert_message", e))?;

        self.notify(StoreChange::MessageInserted {
            message: stored.clone(),
        });
        Ok(stored)
    }

    async fn fetch_page(
        &self,
        conversation_id: u64,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let start = conversation_id.to_be_bytes().to_vec();
        let end = match before {
            Some(cursor) => message_key(conversation_id, &cursor.created_at, cursor.id),
            None => match conversation_id.checked_add(1) {
                Some(next) => next.to_be_bytes().to_vec(),
                None => vec![0xff; 25],
            },
        };

        let mut page = Vec::with_capacity(limit);
        for entry in self.messages.range(start..end).rev().take(limit) {
            let (_, raw) = entry.map_err(|e| storage_err("fetch_page", e))?;
            page.push(serde_json::from_slice::<Message>(&raw).map_err(ChatError::Serialization)?);
        }
        Ok(page)
    }

    async fn mark_read(&self, conversation_id: u64, sender: &str, reader: &str) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut updated = 0usize;
        for entry in self.messages.scan_prefix(conversation_id.to_be_bytes()) {
            let (key, raw) = entry.map_err(|e| storage_err("scan messages", e))?;
            let mut message: Message =
                serde_json::from_slice(&raw).map_err(ChatError::Serialization)?;
            if message.is_read || message.sender_id != sender || message.receiver_id != reader {
                continue;
            }
            message.is_read = true;
            batch.insert(key, serde_json::to_vec(&message).map_err(ChatError::Serialization)?);
            updated += 1;
        }

        if updated > 0 {
            self.messages
                .apply_batch(batch)
                .map_err(|e| storage_err("mark_read", e))?;
            self.notify(StoreChange::MessagesRead {
                conversation_id,
                sender_id: sender.to_string(),
                reader_id: reader.to_string(),
            });
        }
        Ok(updated)
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
