/// Message reconciler against a temporary store and a recording broadcaster
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tradepost_core::message_store::{DurableStore, PageCursor, SledStore, StoreChange};
use tradepost_core::model::{Conversation, ConversationKey, Message, MessageId, NewMessage};
use tradepost_core::realtime::broadcast::{conversation_channel, BroadcastPayload, Broadcaster};
use tradepost_core::reconciler::{MessageReconciler, ReconcilerSettings, TimelineEvent};
use tradepost_core::timeline::MergeOutcome;
use tradepost_core::viewport::ScrollAnchor;
use tradepost_core::{ChatError, Result};

const BUYER: &str = "buyer@tradepost.local";
const SELLER: &str = "seller@tradepost.local";

#[derive(Default)]
struct RecordingBroadcaster {
    published: Mutex<Vec<(String, BroadcastPayload)>>,
    joined: Mutex<Vec<String>>,
    left: Mutex<Vec<String>>,
}

impl RecordingBroadcaster {
    fn published(&self) -> Vec<(String, BroadcastPayload)> {
        self.published.lock().unwrap().clone()
    }
}

impl Broadcaster for RecordingBroadcaster {
    async fn publish(&self, channel: &str, payload: &BroadcastPayload) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.clone()));
        Ok(())
    }

    async fn join(&self, channel: &str) -> Result<()> {
        self.joined.lock().unwrap().push(channel.to_string());
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.left.lock().unwrap().push(channel.to_string());
        Ok(())
    }
}

/// Store wrapper that can fail, hang, or hold inserts after they are written,
/// and hold history pages after they are read
#[derive(Clone)]
struct TestStore {
    inner: SledStore,
    fail_inserts: Arc<AtomicBool>,
    hang_inserts: Arc<AtomicBool>,
    hold_inserts: Arc<AtomicBool>,
    gate: Arc<Semaphore>,
    hold_pages: Arc<AtomicBool>,
    pages_read: Arc<AtomicUsize>,
    page_gate: Arc<Semaphore>,
}

impl TestStore {
    fn new() -> Self {
        Self {
            inner: SledStore::temporary().unwrap(),
            fail_inserts: Arc::new(AtomicBool::new(false)),
            hang_inserts: Arc::new(AtomicBool::new(false)),
            hold_inserts: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(Semaphore::new(0)),
            hold_pages: Arc::new(AtomicBool::new(false)),
            pages_read: Arc::new(AtomicUsize::new(0)),
            page_gate: Arc::new(Semaphore::new(0)),
        }
    }
}

impl DurableStore for TestStore {
    async fn find_or_create_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        self.inner.find_or_create_conversation(key).await
    }

    async fn get_conversation(&self, id: u64) -> Result<Option<Conversation>> {
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self, user: &str) -> Result<Vec<Conversation>> {
        self.inner.list_conversations(user).await
    }

    async fn delete_conversation(&self, id: u64) -> Result<bool> {
        self.inner.delete_conversation(id).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(ChatError::Storage("disk full".to_string()));
        }
        if self.hang_inserts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let stored = self.inner.insert_message(message).await?;
        if self.hold_inserts.load(Ordering::SeqCst) {
            self.gate
                .acquire()
                .await
                .map_err(|_| ChatError::Storage("gate closed".to_string()))?
                .forget();
        }
        Ok(stored)
    }

    async fn fetch_page(
        &self,
        conversation_id: u64,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let page = self.inner.fetch_page(conversation_id, before, limit).await?;
        self.pages_read.fetch_add(1, Ordering::SeqCst);
        if self.hold_pages.load(Ordering::SeqCst) {
            self.page_gate
                .acquire()
                .await
                .map_err(|_| ChatError::Storage("gate closed".to_string()))?
                .forget();
        }
        Ok(page)
    }

    async fn mark_read(&self, conversation_id: u64, sender: &str, reader: &str) -> Result<usize> {
        self.inner.mark_read(conversation_id, sender, reader).await
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes()
    }
}

struct Fixture {
    store: TestStore,
    broadcaster: Arc<RecordingBroadcaster>,
    reconciler: MessageReconciler<TestStore, RecordingBroadcaster>,
    conversation: Conversation,
}

async fn fixture(local_user: &str) -> Fixture {
    let store = TestStore::new();
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let reconciler = MessageReconciler::new(
        local_user,
        store.clone(),
        broadcaster.clone(),
        ReconcilerSettings::default(),
    );
    let conversation = reconciler
        .find_or_create_conversation(&ConversationKey::new("listing-1", BUYER, SELLER))
        .await
        .unwrap();
    Fixture {
        store,
        broadcaster,
        reconciler,
        conversation,
    }
}

async fn seed(store: &TestStore, conversation_id: u64, sender: &str, receiver: &str, body: &str) -> Message {
    store
        .inner
        .insert_message(NewMessage {
            client_id: format!("seed-{}", body),
            conversation_id,
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            body: body.to_string(),
        })
        .await
        .unwrap()
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

#[tokio::test]
async fn test_optimistic_entry_replaced_by_durable_copy() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    let mut timeline = f.reconciler.subscribe(id).await.unwrap();
    f.store.hold_inserts.store(true, Ordering::SeqCst);

    let reconciler = f.reconciler.clone();
    let send = tokio::spawn(async move { reconciler.send(id, "hello").await });

    // Visible before the store has answered
    let pending = timeline
        .wait_for(|entries| entries.len() == 1)
        .await
        .unwrap()
        .clone();
    assert!(pending[0].is_pending());
    assert_eq!(pending[0].body, "hello");
    assert!(f.broadcaster.published().is_empty());

    f.store.gate.add_permits(1);
    let stored = send.await.unwrap().unwrap();
    assert!(matches!(stored.id, MessageId::Durable(_)));

    let entries = f.reconciler.timeline(id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, stored.id);
    assert_eq!(entries[0].created_at, stored.created_at);
    assert_eq!(entries[0].body, "hello");
    assert_eq!(entries[0].client_id, pending[0].client_id);

    let published = f.broadcaster.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, conversation_channel(id));
    match &published[0].1 {
        BroadcastPayload::NewMessage { message } => {
            assert_eq!(message.client_id, pending[0].client_id)
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_send_rolls_back_without_publishing() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    f.reconciler.subscribe(id).await.unwrap();
    let mut events = f.reconciler.events();
    f.store.fail_inserts.store(true, Ordering::SeqCst);

    let err = f.reconciler.send(id, "hello").await.unwrap_err();
    assert!(matches!(err, ChatError::Storage(_)));

    assert!(f.reconciler.timeline(id).await.unwrap().is_empty());
    assert!(f.broadcaster.published().is_empty());

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(TimelineEvent::Added { .. })));
    assert!(matches!(events.last(), Some(TimelineEvent::RolledBack { conversation_id, .. }) if *conversation_id == id));
}

#[tokio::test(start_paused = true)]
async fn test_hung_store_times_out_as_retryable() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    f.reconciler.subscribe(id).await.unwrap();
    f.store.hang_inserts.store(true, Ordering::SeqCst);

    let err = f.reconciler.send(id, "hello").await.unwrap_err();
    assert!(matches!(err, ChatError::Timeout(_)));
    assert!(err.is_retryable());
    assert!(f.reconciler.timeline(id).await.unwrap().is_empty());
    assert!(f.broadcaster.published().is_empty());
}

#[tokio::test]
async fn test_store_notification_before_insert_returns() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    let mut timeline = f.reconciler.subscribe(id).await.unwrap();
    let mut changes = f.store.changes();
    f.store.hold_inserts.store(true, Ordering::SeqCst);

    let reconciler = f.reconciler.clone();
    let send = tokio::spawn(async move { reconciler.send(id, "race").await });

    // The row exists and its change notification arrives first
    let change = loop {
        match changes.recv().await.unwrap() {
            change @ StoreChange::MessageInserted { .. } => break change,
            _ => continue,
        }
    };
    timeline.wait_for(|entries| entries.len() == 1).await.unwrap();
    f.reconciler.on_store_change(change).await;
    let entries = f.reconciler.timeline(id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].is_pending());

    f.store.gate.add_permits(1);
    let stored = send.await.unwrap().unwrap();

    // Self-echo over the broadcast channel
    let echo = BroadcastPayload::NewMessage {
        message: stored.clone(),
    };
    assert_eq!(
        f.reconciler.on_broadcast(id, echo).await,
        Some(MergeOutcome::Duplicate)
    );
    let entries = f.reconciler.timeline(id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, stored.id);
}

#[tokio::test]
async fn test_remote_message_merged_once() {
    let f = fixture(SELLER).await;
    let id = f.conversation.id;
    f.reconciler.subscribe(id).await.unwrap();

    let incoming = seed(&f.store, id, BUYER, SELLER, "is it available?").await;
    let payload = BroadcastPayload::NewMessage {
        message: incoming.clone(),
    };
    assert_eq!(
        f.reconciler.on_broadcast(id, payload).await,
        Some(MergeOutcome::Inserted)
    );
    f.reconciler
        .on_store_change(StoreChange::MessageInserted { message: incoming })
        .await;
    assert_eq!(f.reconciler.timeline(id).await.unwrap().len(), 1);

    // Payload for another conversation on this channel is dropped
    let stray = seed(&f.store, id, BUYER, SELLER, "stray").await;
    let mut stray_other = stray.clone();
    stray_other.conversation_id = id + 100;
    assert_eq!(
        f.reconciler
            .on_broadcast(id, BroadcastPayload::NewMessage { message: stray_other })
            .await,
        None
    );
    assert_eq!(f.reconciler.timeline(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_pagination_prepends_older_pages() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    for i in 0..65 {
        let (from, to) = if i % 2 == 0 { (BUYER, SELLER) } else { (SELLER, BUYER) };
        seed(&f.store, id, from, to, &format!("m{:02}", i)).await;
    }

    f.reconciler.subscribe(id).await.unwrap();
    let first = f.reconciler.timeline(id).await.unwrap();
    assert_eq!(first.len(), 30);
    assert_eq!(first[0].body, "m35");
    assert_eq!(first[29].body, "m64");
    assert!(f.reconciler.has_more(id).await);

    let row = 20.0;
    let anchor = ScrollAnchor::capture(first.len() as f64 * row, 0.0);
    let outcome = f.reconciler.load_older(id).await.unwrap();
    assert_eq!(outcome.added, 30);
    assert!(outcome.has_more);

    let second = f.reconciler.timeline(id).await.unwrap();
    assert_eq!(second.len(), 60);
    // The previously topmost message sits right after the prepended page
    assert_eq!(second[outcome.added].id, first[0].id);
    let restored = anchor.restore(second.len() as f64 * row);
    assert_eq!(outcome.added as f64 * row - restored, 0.0);

    let outcome = f.reconciler.load_older(id).await.unwrap();
    assert_eq!(outcome.added, 5);
    assert!(!outcome.has_more);
    let outcome = f.reconciler.load_older(id).await.unwrap();
    assert_eq!(outcome.added, 0);

    let all = f.reconciler.timeline(id).await.unwrap();
    let bodies: Vec<String> = all.iter().map(|m| m.body.clone()).collect();
    let expected: Vec<String> = (0..65).map(|i| format!("m{:02}", i)).collect();
    assert_eq!(bodies, expected);
}

#[tokio::test]
async fn test_mark_read_is_batched() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    seed(&f.store, id, SELLER, BUYER, "one").await;
    seed(&f.store, id, SELLER, BUYER, "two").await;
    seed(&f.store, id, SELLER, BUYER, "three").await;
    seed(&f.store, id, BUYER, SELLER, "mine").await;
    let mut changes = f.store.changes();

    f.reconciler.subscribe(id).await.unwrap();
    assert_eq!(f.reconciler.mark_read(id).await.unwrap(), 3);
    // Nothing unread, nothing written
    assert_eq!(f.reconciler.mark_read(id).await.unwrap(), 0);

    let reads = drain(&mut changes)
        .into_iter()
        .filter(|c| matches!(c, StoreChange::MessagesRead { .. }))
        .count();
    assert_eq!(reads, 1);

    let entries = f.reconciler.timeline(id).await.unwrap();
    for message in entries {
        assert_eq!(message.is_read, message.sender_id == SELLER, "{}", message.body);
    }
}

#[tokio::test]
async fn test_conversation_creation_is_idempotent() {
    let f = fixture(BUYER).await;
    let again = f
        .reconciler
        .find_or_create_conversation(&ConversationKey::new("listing-1", BUYER, SELLER))
        .await
        .unwrap();
    assert_eq!(again.id, f.conversation.id);
    assert_eq!(f.reconciler.list_conversations().await.unwrap().len(), 1);

    let outsider = f
        .reconciler
        .find_or_create_conversation(&ConversationKey::new("listing-1", "eve@d", SELLER))
        .await;
    assert!(outsider.is_err());
}

#[tokio::test]
async fn test_release_leaves_channel_with_last_subscriber() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    f.reconciler.subscribe(id).await.unwrap();
    f.reconciler.subscribe(id).await.unwrap();
    assert_eq!(f.broadcaster.joined.lock().unwrap().len(), 1);

    assert!(f.reconciler.release(id).await);
    assert!(f.broadcaster.left.lock().unwrap().is_empty());
    assert!(f.reconciler.release(id).await);
    assert_eq!(*f.broadcaster.left.lock().unwrap(), vec![conversation_channel(id)]);
    assert!(f.reconciler.open_conversations().await.is_empty());
    assert!(!f.reconciler.release(id).await);
}

#[tokio::test]
async fn test_outsider_cannot_open_conversation() {
    let f = fixture(BUYER).await;
    let eve = MessageReconciler::new(
        "eve@tradepost.local",
        f.store.clone(),
        f.broadcaster.clone(),
        ReconcilerSettings {
            page_size: 30,
            store_timeout: Duration::from_secs(1),
        },
    );
    let err = eve.subscribe(f.conversation.id).await.unwrap_err();
    assert!(matches!(err, ChatError::ConversationNotFound(_)));
    assert!(eve.send(f.conversation.id, "hi").await.is_err());
}

#[tokio::test]
async fn test_delete_closes_open_view() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    seed(&f.store, id, SELLER, BUYER, "bye").await;
    f.reconciler.subscribe(id).await.unwrap();

    assert!(f.reconciler.delete_conversation(id).await.unwrap());
    assert!(f.reconciler.timeline(id).await.is_none());
    assert!(f.store.get_conversation(id).await.unwrap().is_none());
    assert!(f.store.fetch_page(id, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_message_arriving_during_first_page_load_is_kept() {
    let f = fixture(BUYER).await;
    let id = f.conversation.id;
    seed(&f.store, id, SELLER, BUYER, "earlier").await;
    f.store.hold_pages.store(true, Ordering::SeqCst);

    let reconciler = f.reconciler.clone();
    let opening = tokio::spawn(async move { reconciler.subscribe(id).await });
    while f.store.pages_read.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // Written after the page was read, delivered before the view finished opening
    let late = seed(&f.store, id, SELLER, BUYER, "just now").await;
    f.reconciler
        .on_store_change(StoreChange::MessageInserted { message: late })
        .await;

    f.store.page_gate.add_permits(1);
    let timeline = opening.await.unwrap().unwrap();
    let bodies: Vec<String> = timeline.borrow().iter().map(|m| m.body.clone()).collect();
    assert_eq!(bodies, vec!["earlier", "just now"]);
    assert!(!f.reconciler.has_more(id).await);
}
