/// Message reconciler: one ordered, deduplicated timeline per open conversation
use crate::error::{ChatError, Result};
use crate::message_store::{DurableStore, PageCursor, StoreChange};
use crate::model::{Conversation, ConversationKey, Message, MessageId, NewMessage};
use crate::realtime::broadcast::{conversation_channel, BroadcastPayload, Broadcaster};
use crate::timeline::{MergeOutcome, Timeline};
use crate::viewport::should_load_older;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub page_size: usize,
    pub store_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            page_size: 30,
            store_timeout: Duration::from_secs(10),
        }
    }
}

/// Timeline-level changes, for consumers that want deltas rather than snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    Added {
        message: Message,
    },
    Confirmed {
        client_id: String,
        message: Message,
    },
    RolledBack {
        conversation_id: u64,
        client_id: String,
        reason: String,
    },
    Read {
        conversation_id: u64,
        sender_id: String,
        reader_id: String,
    },
    Prepended {
        conversation_id: u64,
        added: usize,
        has_more: bool,
    },
    Closed {
        conversation_id: u64,
    },
}

/// Result of a load-older request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrependOutcome {
    pub added: usize,
    pub has_more: bool,
}

struct ConversationView {
    conversation: Conversation,
    timeline: Timeline,
    updates: watch::Sender<Vec<Message>>,
    subscribers: usize,
    has_more: bool,
    loading: bool,
}

impl ConversationView {
    fn publish(&self) {
        self.updates.send_replace(self.timeline.entries().to_vec());
    }
}

pub struct MessageReconciler<S: DurableStore, B: Broadcaster> {
    local_user: String,
    store: S,
    broadcaster: Arc<B>,
    settings: ReconcilerSettings,
    views: Arc<RwLock<HashMap<u64, ConversationView>>>,
    events: broadcast::Sender<TimelineEvent>,
}

impl<S: DurableStore, B: Broadcaster> Clone for MessageReconciler<S, B> {
    fn clone(&self) -> Self {
        Self {
            local_user: self.local_user.clone(),
            store: self.store.clone(),
            broadcaster: self.broadcaster.clone(),
            settings: self.settings,
            views: self.views.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: DurableStore, B: Broadcaster> MessageReconciler<S, B> {
    /// `local_user` is the bare jid messages are sent as.
    pub fn new(
        local_user: impl Into<String>,
        store: S,
        broadcaster: Arc<B>,
        settings: ReconcilerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            local_user: local_user.into(),
            store,
            broadcaster,
            settings,
            views: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn events(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TimelineEvent) {
        let _ = self.events.send(event);
    }

    async fn timed<T>(&self, op: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.settings.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Store call {} timed out after {:?}", op, self.settings.store_timeout);
                Err(ChatError::Timeout(format!(
                    "{} exceeded {:?}",
                    op, self.settings.store_timeout
                )))
            }
        }
    }

    async fn conversation(&self, conversation_id: u64) -> Result<Conversation> {
        if let Some(view) = self.views.read().await.get(&conversation_id) {
            return Ok(view.conversation.clone());
        }
        let conversation = self
            .timed("get_conversation", self.store.get_conversation(conversation_id))
            .await?
            .ok_or(ChatError::ConversationNotFound(conversation_id))?;
        if !conversation.has_participant(&self.local_user) {
            return Err(ChatError::ConversationNotFound(conversation_id));
        }
        Ok(conversation)
    }

    /// Find or create the conversation for a listing. The local user must be the
    /// buyer or the seller.
    pub async fn find_or_create_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        if key.buyer_id == key.seller_id
            || (key.buyer_id != self.local_user && key.seller_id != self.local_user)
        {
            return Err(ChatError::SendFailed(format!(
                "{} cannot open a conversation between {} and {}",
                self.local_user, key.buyer_id, key.seller_id
            )));
        }
        self.timed(
            "find_or_create_conversation",
            self.store.find_or_create_conversation(key),
        )
        .await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.timed(
            "list_conversations",
            self.store.list_conversations(&self.local_user),
        )
        .await
    }

    /// Newest stored message of a conversation
    pub async fn latest_message(&self, conversation_id: u64) -> Result<Option<Message>> {
        let page = self
            .timed(
                "fetch_page",
                self.store.fetch_page(conversation_id, None, 1),
            )
            .await?;
        Ok(page.into_iter().next())
    }

    /// Delete a conversation and its messages; open views of it are closed.
    pub async fn delete_conversation(&self, conversation_id: u64) -> Result<bool> {
        self.conversation(conversation_id).await?;
        let deleted = self
            .timed(
                "delete_conversation",
                self.store.delete_conversation(conversation_id),
            )
            .await?;
        if deleted {
            info!("Deleted conversation {}", conversation_id);
            self.close_view(conversation_id).await;
        }
        Ok(deleted)
    }

    /// Open a conversation: load the newest page, join its channel and hand out
    /// a live-updating, oldest-first snapshot. Pair every call with [`release`].
    ///
    /// [`release`]: MessageReconciler::release
    pub async fn subscribe(&self, conversation_id: u64) -> Result<watch::Receiver<Vec<Message>>> {
        if let Some(view) = self.views.write().await.get_mut(&conversation_id) {
            view.subscribers += 1;
            return Ok(view.updates.subscribe());
        }

        let conversation = self.conversation(conversation_id).await?;

        // Registered before the first page is read, so live traffic arriving
        // meanwhile has a timeline to land in.
        let updates = match self.views.write().await.entry(conversation_id) {
            Entry::Occupied(mut entry) => {
                let view = entry.get_mut();
                view.subscribers += 1;
                return Ok(view.updates.subscribe());
            }
            Entry::Vacant(entry) => {
                let (updates, receiver) = watch::channel(Vec::new());
                entry.insert(ConversationView {
                    conversation,
                    timeline: Timeline::new(),
                    updates,
                    subscribers: 1,
                    has_more: false,
                    loading: true,
                });
                receiver
            }
        };

        if let Err(e) = self
            .broadcaster
            .join(&conversation_channel(conversation_id))
            .await
        {
            warn!("Join of conversation {} failed: {}", conversation_id, e);
        }

        let page = self
            .timed(
                "fetch_page",
                self.store
                    .fetch_page(conversation_id, None, self.settings.page_size),
            )
            .await;

        let mut views = self.views.write().await;
        let Some(view) = views.get_mut(&conversation_id) else {
            // Deleted while the page was in flight
            return Err(ChatError::ConversationNotFound(conversation_id));
        };
        view.loading = false;

        let page = match page {
            Ok(page) => page,
            Err(e) => {
                view.subscribers = view.subscribers.saturating_sub(1);
                if view.subscribers > 0 {
                    // Others keep the view; load_older can fetch the newest page later.
                    view.has_more = true;
                    return Err(e);
                }
                views.remove(&conversation_id);
                drop(views);
                if let Err(leave) = self
                    .broadcaster
                    .leave(&conversation_channel(conversation_id))
                    .await
                {
                    debug!("Leave of conversation {} failed: {}", conversation_id, leave);
                }
                return Err(e);
            }
        };

        view.has_more = page.len() >= self.settings.page_size;
        for message in page.into_iter().rev() {
            view.timeline.merge(message);
        }
        view.publish();
        debug!(
            "Subscribed to conversation {} ({} messages, {} subscribers)",
            conversation_id,
            view.timeline.len(),
            view.subscribers
        );
        Ok(updates)
    }

    /// Drop one subscription; the channel is left with the last one.
    pub async fn release(&self, conversation_id: u64) -> bool {
        let closed = {
            let mut views = self.views.write().await;
            let Some(view) = views.get_mut(&conversation_id) else {
                return false;
            };
            view.subscribers = view.subscribers.saturating_sub(1);
            if view.subscribers == 0 {
                views.remove(&conversation_id);
                true
            } else {
                false
            }
        };

        if closed {
            if let Err(e) = self
                .broadcaster
                .leave(&conversation_channel(conversation_id))
                .await
            {
                debug!("Leave of conversation {} failed: {}", conversation_id, e);
            }
            debug!("Released conversation {}", conversation_id);
            self.emit(TimelineEvent::Closed { conversation_id });
        }
        true
    }

    pub async fn open_conversations(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.views.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current oldest-first entries of an open conversation
    pub async fn timeline(&self, conversation_id: u64) -> Option<Vec<Message>> {
        self.views
            .read()
            .await
            .get(&conversation_id)
            .map(|view| view.timeline.entries().to_vec())
    }

    pub async fn has_more(&self, conversation_id: u64) -> bool {
        self.views
            .read()
            .await
            .get(&conversation_id)
            .is_some_and(|view| view.has_more)
    }

    /// Send a message: optimistic entry first, then the durable write, then the
    /// broadcast. A failed write rolls the entry back and publishes nothing.
    pub async fn send(&self, conversation_id: u64, body: &str) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(ChatError::SendFailed("message body is empty".to_string()));
        }

        let conversation = self.conversation(conversation_id).await?;
        let receiver = conversation
            .counterpart(&self.local_user)
            .ok_or(ChatError::ConversationNotFound(conversation_id))?
            .to_string();

        let client_id = Uuid::new_v4().to_string();
        let pending = Message {
            id: MessageId::Pending(client_id.clone()),
            client_id: client_id.clone(),
            conversation_id,
            sender_id: self.local_user.clone(),
            receiver_id: receiver.clone(),
            body: body.to_string(),
            created_at: Utc::now(),
            is_read: false,
        };

        if let Some(view) = self.views.write().await.get_mut(&conversation_id) {
            view.timeline.merge(pending.clone());
            view.publish();
        }
        self.emit(TimelineEvent::Added { message: pending });

        let insert = NewMessage {
            client_id: client_id.clone(),
            conversation_id,
            sender_id: self.local_user.clone(),
            receiver_id: receiver,
            body: body.to_string(),
        };
        let stored = match self
            .timed("insert_message", self.store.insert_message(insert))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    "Send to conversation {} failed, rolling back {}: {}",
                    conversation_id, client_id, e
                );
                if let Some(view) = self.views.write().await.get_mut(&conversation_id) {
                    view.timeline.rollback(&client_id);
                    view.publish();
                }
                self.emit(TimelineEvent::RolledBack {
                    conversation_id,
                    client_id,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.merge_remote(stored.clone()).await;

        let payload = BroadcastPayload::NewMessage {
            message: stored.clone(),
        };
        if let Err(e) = self
            .broadcaster
            .publish(&conversation_channel(conversation_id), &payload)
            .await
        {
            // The store's change feed still delivers it.
            warn!("Broadcast of message {} failed: {}", stored.id, e);
        }

        Ok(stored)
    }

    /// Merge a durable message from the broadcast channel or the store feed.
    /// Returns `None` when the conversation is not open.
    pub async fn merge_remote(&self, message: Message) -> Option<MergeOutcome> {
        if message.is_pending() {
            debug!("Ignoring remote message without a durable id");
            return None;
        }
        let mut views = self.views.write().await;
        let view = views.get_mut(&message.conversation_id)?;
        let outcome = view.timeline.merge(message.clone());
        match outcome {
            MergeOutcome::Inserted => {
                view.publish();
                self.emit(TimelineEvent::Added { message });
            }
            MergeOutcome::Confirmed => {
                view.publish();
                self.emit(TimelineEvent::Confirmed {
                    client_id: message.client_id.clone(),
                    message,
                });
            }
            MergeOutcome::Duplicate => {}
        }
        Some(outcome)
    }

    /// Apply a payload received on a conversation channel.
    pub async fn on_broadcast(
        &self,
        channel_conversation: u64,
        payload: BroadcastPayload,
    ) -> Option<MergeOutcome> {
        match payload {
            BroadcastPayload::NewMessage { message } => {
                if message.conversation_id != channel_conversation {
                    warn!(
                        "Dropping message for conversation {} received on channel {}",
                        message.conversation_id, channel_conversation
                    );
                    return None;
                }
                self.merge_remote(message).await
            }
            BroadcastPayload::Typing { .. } => None,
        }
    }

    /// Apply a row-level store change that concerns the local user.
    pub async fn on_store_change(&self, change: StoreChange) {
        match change {
            StoreChange::MessageInserted { message } => {
                if message.sender_id == self.local_user || message.receiver_id == self.local_user {
                    self.merge_remote(message).await;
                }
            }
            StoreChange::MessagesRead {
                conversation_id,
                sender_id,
                reader_id,
            } => {
                let changed = match self.views.write().await.get_mut(&conversation_id) {
                    Some(view) => {
                        let changed = view.timeline.mark_read_from(&sender_id, &reader_id);
                        if changed > 0 {
                            view.publish();
                        }
                        changed
                    }
                    None => 0,
                };
                if changed > 0 {
                    self.emit(TimelineEvent::Read {
                        conversation_id,
                        sender_id,
                        reader_id,
                    });
                }
            }
            StoreChange::ConversationDeleted { conversation } => {
                self.close_view(conversation.id).await;
            }
            StoreChange::ConversationCreated { .. } => {}
        }
    }

    async fn close_view(&self, conversation_id: u64) {
        if self.views.write().await.remove(&conversation_id).is_some() {
            if let Err(e) = self
                .broadcaster
                .leave(&conversation_channel(conversation_id))
                .await
            {
                debug!("Leave of conversation {} failed: {}", conversation_id, e);
            }
            self.emit(TimelineEvent::Closed { conversation_id });
        }
    }

    /// Fetch the next older page and merge it in front of the timeline.
    pub async fn load_older(&self, conversation_id: u64) -> Result<PrependOutcome> {
        let cursor = {
            let mut views = self.views.write().await;
            let view = views
                .get_mut(&conversation_id)
                .ok_or(ChatError::ConversationNotFound(conversation_id))?;
            if !should_load_older(0, view.has_more, view.loading) {
                return Ok(PrependOutcome {
                    added: 0,
                    has_more: view.has_more,
                });
            }
            view.loading = true;
            view.timeline.oldest_durable().and_then(PageCursor::of)
        };

        let page = self
            .timed(
                "fetch_page",
                self.store
                    .fetch_page(conversation_id, cursor, self.settings.page_size),
            )
            .await;

        let mut views = self.views.write().await;
        let Some(view) = views.get_mut(&conversation_id) else {
            return Err(ChatError::ConversationNotFound(conversation_id));
        };
        view.loading = false;
        let page = page?;

        view.has_more = page.len() >= self.settings.page_size;
        let mut added = 0;
        for message in page.into_iter().rev() {
            if view.timeline.merge(message) == MergeOutcome::Inserted {
                added += 1;
            }
        }
        if added > 0 {
            view.publish();
        }
        let outcome = PrependOutcome {
            added,
            has_more: view.has_more,
        };
        drop(views);

        debug!(
            "Loaded {} older messages into conversation {}",
            added, conversation_id
        );
        self.emit(TimelineEvent::Prepended {
            conversation_id,
            added,
            has_more: outcome.has_more,
        });
        Ok(outcome)
    }

    /// Mark everything the counterpart sent as read, in one store write.
    /// Nothing is written when there is nothing unread.
    pub async fn mark_read(&self, conversation_id: u64) -> Result<usize> {
        let counterpart = {
            let views = self.views.read().await;
            let view = views
                .get(&conversation_id)
                .ok_or(ChatError::ConversationNotFound(conversation_id))?;
            let Some(counterpart) = view.conversation.counterpart(&self.local_user) else {
                return Ok(0);
            };
            if view.timeline.unread_from(counterpart, &self.local_user) == 0 {
                return Ok(0);
            }
            counterpart.to_string()
        };

        let updated = self
            .timed(
                "mark_read",
                self.store
                    .mark_read(conversation_id, &counterpart, &self.local_user),
            )
            .await?;

        let changed = match self.views.write().await.get_mut(&conversation_id) {
            Some(view) => {
                let changed = view.timeline.mark_read_from(&counterpart, &self.local_user);
                if changed > 0 {
                    view.publish();
                }
                changed
            }
            None => 0,
        };
        if changed > 0 {
            self.emit(TimelineEvent::Read {
                conversation_id,
                sender_id: counterpart,
                reader_id: self.local_user.clone(),
            });
        }
        Ok(updated)
    }

    /// Re-read the newest page of every open conversation. Run on each new session,
    /// since anything broadcast while offline was missed.
    pub async fn resync_open(&self) {
        for conversation_id in self.open_conversations().await {
            match self
                .timed(
                    "fetch_page",
                    self.store
                        .fetch_page(conversation_id, None, self.settings.page_size),
                )
                .await
            {
                Ok(page) => {
                    let mut merged = 0;
                    for message in page.into_iter().rev() {
                        if matches!(
                            self.merge_remote(message).await,
                            Some(MergeOutcome::Inserted | MergeOutcome::Confirmed)
                        ) {
                            merged += 1;
                        }
                    }
                    if merged > 0 {
                        info!(
                            "Re-sync added {} messages to conversation {}",
                            merged, conversation_id
                        );
                    }
                }
                Err(e) => warn!("Re-sync of conversation {} failed: {}", conversation_id, e),
            }
        }
    }
}
