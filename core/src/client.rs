/// Chat client: wires the connection, presence, reconciler and typing together
use crate::config::Config;
use crate::error::Result;
use crate::identity::{bare, Credentials};
use crate::message_store::{DurableStore, StoreChange};
use crate::messenger_types::{ConversationSummary, MessengerEvent};
use crate::model::{Conversation, ConversationKey, Message, PresenceLookup, PresenceRecord, PresenceStatus};
use crate::presence::PresenceTracker;
use crate::remote_store::RemoteStore;
use crate::realtime::broadcast::{
    conversation_channel, parse_conversation_channel, BroadcastPayload, Broadcaster,
    ConnectionBroadcaster,
};
use crate::realtime::connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, Connector, ReconnectPolicy,
    SessionSignal,
};
use crate::realtime::protocol::InboundEvent;
use crate::reconciler::{MessageReconciler, PrependOutcome, ReconcilerSettings};
use crate::typing::{TypingDebouncer, TypingTracker};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Handle to a running client. Cheap to clone.
#[derive(Clone)]
pub struct ChatClient<S: DurableStore> {
    credentials: Credentials,
    local_user: String,
    typing_debounce: Duration,
    connection: ConnectionHandle,
    presence: PresenceTracker,
    broadcaster: Arc<ConnectionBroadcaster>,
    reconciler: MessageReconciler<S, ConnectionBroadcaster>,
    debouncer: Arc<RwLock<TypingDebouncer>>,
    typing: Arc<RwLock<TypingTracker>>,
    events: broadcast::Sender<MessengerEvent>,
}

fn credentials(config: &Config) -> Result<Credentials> {
    let credentials = Credentials::new(
        config.username.clone(),
        config.password.clone(),
        config.domain.clone(),
        config.resource.clone(),
    );
    credentials.validate()?;
    Ok(credentials)
}

impl ChatClient<RemoteStore> {
    /// Client whose durable store is the one hosted by the hub. Nothing
    /// connects until [`login`](ChatClient::login).
    pub fn connect<C: Connector>(config: &Config, connector: C) -> Result<(Self, JoinHandle<()>)> {
        credentials(config)?;
        let policy = ReconnectPolicy {
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.backoff_base,
        };
        let (connection, _manager) = ConnectionManager::spawn(connector, policy);
        let store = RemoteStore::new(connection.clone());
        Self::attach(config, connection, store)
    }
}

impl<S: DurableStore> ChatClient<S> {
    /// Build a client around a running connection manager and spawn its
    /// dispatch loop.
    pub fn attach(config: &Config, connection: ConnectionHandle, store: S) -> Result<(Self, JoinHandle<()>)> {
        let credentials = credentials(config)?;
        let local_user = credentials.bare_jid();

        let broadcaster = Arc::new(ConnectionBroadcaster::new(connection.clone()));
        let reconciler = MessageReconciler::new(
            local_user.clone(),
            store,
            broadcaster.clone(),
            ReconcilerSettings {
                page_size: config.page_size,
                store_timeout: config.store_timeout,
            },
        );
        let (events, _) = broadcast::channel(1024);

        let client = Self {
            credentials,
            local_user,
            typing_debounce: config.typing_debounce,
            connection,
            presence: PresenceTracker::new(),
            broadcaster,
            reconciler,
            debouncer: Arc::new(RwLock::new(TypingDebouncer::new())),
            typing: Arc::new(RwLock::new(TypingTracker::new(config.typing_expiry))),
            events,
        };

        let dispatch = tokio::spawn(client.clone().dispatch());
        info!("Chat client ready for {}", client.local_user);
        Ok((client, dispatch))
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn events(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MessengerEvent) {
        let _ = self.events.send(event);
    }

    pub async fn login(&self) -> Result<()> {
        self.connection.login(self.credentials.clone()).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.connection.logout().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub async fn send(&self, conversation_id: u64, body: &str) -> Result<Message> {
        self.reconciler.send(conversation_id, body).await
    }

    pub async fn subscribe(&self, conversation_id: u64) -> Result<watch::Receiver<Vec<Message>>> {
        self.reconciler.subscribe(conversation_id).await
    }

    pub async fn release(&self, conversation_id: u64) -> bool {
        self.reconciler.release(conversation_id).await
    }

    pub async fn timeline(&self, conversation_id: u64) -> Option<Vec<Message>> {
        self.reconciler.timeline(conversation_id).await
    }

    pub async fn has_more(&self, conversation_id: u64) -> bool {
        self.reconciler.has_more(conversation_id).await
    }

    pub async fn load_older(&self, conversation_id: u64) -> Result<PrependOutcome> {
        self.reconciler.load_older(conversation_id).await
    }

    pub async fn mark_read(&self, conversation_id: u64) -> Result<usize> {
        self.reconciler.mark_read(conversation_id).await
    }

    pub async fn lookup(&self, contact: &str) -> PresenceLookup {
        self.presence.lookup(contact).await
    }

    pub async fn presence_snapshot(&self) -> HashMap<String, PresenceRecord> {
        self.presence.snapshot().await
    }

    pub async fn own_presence(&self) -> PresenceStatus {
        self.presence.own_status().await
    }

    pub async fn set_presence(&self, status: PresenceStatus, status_text: Option<String>) {
        info!("Local presence -> {}", status);
        self.presence
            .announce(&self.connection, status, status_text)
            .await;
    }

    /// Register a keystroke. At most one typing signal per debounce window is
    /// published.
    pub async fn notify_typing(&self, conversation_id: u64) {
        if !self.debouncer.write().await.keystroke(conversation_id) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            sleep(client.typing_debounce).await;
            client.debouncer.write().await.flush(conversation_id);
            let payload = BroadcastPayload::Typing {
                conversation_id,
                from: client.local_user.clone(),
            };
            if let Err(e) = client
                .broadcaster
                .publish(&conversation_channel(conversation_id), &payload)
                .await
            {
                debug!("Typing signal for {} not sent: {}", conversation_id, e);
            }
        });
    }

    pub async fn typing_in(&self, conversation_id: u64) -> Vec<String> {
        self.typing
            .read()
            .await
            .typing_in(conversation_id, Instant::now())
    }

    pub async fn find_or_create_conversation(
        &self,
        listing_id: &str,
        buyer_id: &str,
        seller_id: &str,
    ) -> Result<Conversation> {
        let key = ConversationKey::new(listing_id, bare(buyer_id), bare(seller_id));
        self.reconciler.find_or_create_conversation(&key).await
    }

    pub async fn delete_conversation(&self, conversation_id: u64) -> Result<bool> {
        self.reconciler.delete_conversation(conversation_id).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let mut summaries = Vec::new();
        for conversation in self.reconciler.list_conversations().await? {
            let counterpart = conversation
                .counterpart(&self.local_user)
                .unwrap_or_default()
                .to_string();
            let last_message = self.reconciler.latest_message(conversation.id).await?;
            summaries.push(ConversationSummary {
                conversation,
                counterpart,
                last_message,
            });
        }
        // Most recent activity first
        summaries.sort_by(|a, b| {
            let at = |s: &ConversationSummary| {
                s.last_message
                    .as_ref()
                    .map(|m| m.created_at)
                    .unwrap_or(s.conversation.created_at)
            };
            at(b).cmp(&at(a))
        });
        Ok(summaries)
    }

    async fn dispatch(self) {
        let mut signals = self.connection.subscribe();
        let mut changes = self.reconciler.store().changes();
        let mut timeline = self.reconciler.events();
        let mut state = self.connection.watch_state();

        loop {
            let next_expiry = self.typing.read().await.next_deadline();
            let far = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                signal = signals.recv() => match signal {
                    Ok(signal) => self.on_session_signal(signal).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Dispatch lagged {} session signals; re-syncing", n);
                        self.reconciler.resync_open().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                change = changes.recv() => match change {
                    Ok(change) => self.on_store_change(change).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Dispatch lagged {} store changes; re-syncing", n);
                        self.reconciler.resync_open().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                event = timeline.recv() => match event {
                    Ok(event) => self.emit(event.into()),
                    Err(RecvError::Lagged(n)) => warn!("SSE feed lagged {} timeline events", n),
                    Err(RecvError::Closed) => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    debug!("Connection state -> {:?}", current);
                    self.emit(MessengerEvent::ConnectionChanged { state: current });
                },
                _ = sleep_until(next_expiry.unwrap_or(far)), if next_expiry.is_some() => {
                    let lapsed = self.typing.write().await.expire(Instant::now());
                    for (conversation_id, contact) in lapsed {
                        self.emit(MessengerEvent::TypingStopped { conversation_id, contact });
                    }
                },
            }
        }
        debug!("Chat client dispatch stopped");
    }

    async fn on_session_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::Started { jid } => {
                info!("Session started as {}", jid);
                self.presence.begin_session().await;
                self.presence.reannounce(&self.connection).await;
                self.broadcaster.rejoin_all().await;
                self.reconciler.resync_open().await;
                self.emit(MessengerEvent::SessionStarted { jid });
            }
            SessionSignal::Ended => {
                let stale: Vec<(u64, String)> =
                    self.typing.write().await.expire(Instant::now() + Duration::from_secs(3600));
                for (conversation_id, contact) in stale {
                    self.emit(MessengerEvent::TypingStopped {
                        conversation_id,
                        contact,
                    });
                }
            }
            SessionSignal::Fatal(reason) => {
                error!("Connectivity lost: {}", reason);
                self.emit(MessengerEvent::ConnectivityFatal { reason });
            }
            SessionSignal::Inbound(event) => self.on_inbound(event).await,
        }
    }

    async fn on_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::Presence { from, update } => {
                let contact = bare(&from).to_string();
                if contact == self.local_user {
                    return;
                }
                let record = self.presence.on_presence_event(&contact, update).await;
                self.emit(MessengerEvent::PresenceChanged { contact, record });
            }
            InboundEvent::Message { from, to, body } => {
                if bare(&to) != self.local_user {
                    debug!("Dropping message stanza addressed to {}", to);
                    return;
                }
                self.emit(MessengerEvent::DirectMessage {
                    from,
                    to,
                    body,
                    received_at: Utc::now(),
                });
            }
            InboundEvent::Broadcast {
                channel,
                from,
                payload,
            } => self.on_broadcast(&channel, from, payload).await,
            InboundEvent::Pong { timestamp } => debug!("Pong {}", timestamp),
            InboundEvent::Close { reason } => info!("Hub closed the session: {}", reason),
            // Routed by the remote store
            InboundEvent::StoreResponse { .. } | InboundEvent::StoreChanged { .. } => {}
        }
    }

    async fn on_broadcast(&self, channel: &str, from: Option<String>, payload: serde_json::Value) {
        let Some(conversation_id) = parse_conversation_channel(channel) else {
            debug!("Ignoring broadcast on unknown channel {}", channel);
            return;
        };
        let payload = match BroadcastPayload::try_from_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping broadcast on {}: {}", channel, e);
                return;
            }
        };
        if payload.conversation_id() != conversation_id {
            warn!("Dropping broadcast for another conversation on {}", channel);
            return;
        }

        match payload {
            BroadcastPayload::Typing {
                conversation_id,
                from: typist,
            } => {
                if from.as_deref().is_some_and(|hub_from| bare(hub_from) != typist) {
                    warn!("Dropping typing signal with mismatched sender {}", typist);
                    return;
                }
                if typist == self.local_user {
                    return;
                }
                let started = self
                    .typing
                    .write()
                    .await
                    .on_signal(conversation_id, &typist, Instant::now());
                if started {
                    self.emit(MessengerEvent::TypingStarted {
                        conversation_id,
                        contact: typist,
                    });
                }
            }
            BroadcastPayload::NewMessage { message } => {
                if from
                    .as_deref()
                    .is_some_and(|hub_from| bare(hub_from) != message.sender_id)
                {
                    warn!(
                        "Dropping message broadcast claiming sender {}",
                        message.sender_id
                    );
                    return;
                }
                if message.sender_id != self.local_user
                    && self
                        .typing
                        .write()
                        .await
                        .clear(conversation_id, &message.sender_id)
                {
                    self.emit(MessengerEvent::TypingStopped {
                        conversation_id,
                        contact: message.sender_id.clone(),
                    });
                }
                self.reconciler
                    .on_broadcast(conversation_id, BroadcastPayload::NewMessage { message })
                    .await;
            }
        }
    }

    async fn on_store_change(&self, change: StoreChange) {
        self.reconciler.on_store_change(change).await;
    }
}
