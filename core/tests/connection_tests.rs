/// Connection manager lifecycle against a scripted transport
/// Timer-driven behaviour runs on tokio's paused clock.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, Instant};
use tradepost_core::identity::Credentials;
use tradepost_core::realtime::connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, Connector, ReconnectPolicy,
    SessionSignal, TransportEvent, TransportHandle, TransportSink,
};
use tradepost_core::realtime::protocol::{InboundEvent, Stanza, CLOSE_REPLACED};
use tradepost_core::{ChatError, Result};

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Refuse,
    Reject,
    Accept,
    /// Accept once the test releases the gate
    Held,
}

#[derive(Clone)]
struct ScriptedConnector {
    script: Arc<Mutex<VecDeque<Outcome>>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    logins: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<Stanza>>>,
    sinks: Arc<Mutex<Vec<TransportSink>>>,
    gate: Arc<Semaphore>,
}

impl ScriptedConnector {
    fn new(script: Vec<Outcome>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            attempts: Arc::default(),
            logins: Arc::default(),
            sent: Arc::default(),
            sinks: Arc::default(),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn logins(&self) -> Vec<String> {
        self.logins.lock().unwrap().clone()
    }

    fn push(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    fn sent(&self) -> Vec<Stanza> {
        self.sent.lock().unwrap().clone()
    }

    fn sink(&self, index: usize) -> TransportSink {
        self.sinks.lock().unwrap()[index].clone()
    }
}

impl Connector for ScriptedConnector {
    async fn connect(&self, credentials: Credentials, sink: TransportSink) -> Result<TransportHandle> {
        self.attempts.lock().unwrap().push(Instant::now());
        self.logins.lock().unwrap().push(credentials.jid());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Refuse);
        match outcome {
            Outcome::Refuse => Err(ChatError::Connection("connection refused".to_string())),
            Outcome::Reject => Err(ChatError::Credentials("not-authorized".to_string())),
            Outcome::Accept => Ok(self.accept(sink)),
            Outcome::Held => {
                let permit = self.gate.acquire().await;
                permit.map_err(|_| ChatError::Connection("gate closed".to_string()))?.forget();
                Ok(self.accept(sink))
            }
        }
    }
}

impl ScriptedConnector {
    fn accept(&self, sink: TransportSink) -> TransportHandle {
        let (tx, mut rx) = mpsc::channel::<Stanza>(64);
        let sent = self.sent.clone();
        tokio::spawn(async move {
            while let Some(stanza) = rx.recv().await {
                sent.lock().unwrap().push(stanza);
            }
        });
        self.sinks.lock().unwrap().push(sink);
        TransportHandle::new(tx, Vec::new())
    }
}

fn credentials() -> Credentials {
    Credentials::new("alice", "secret", "tradepost.local", "web")
}

async fn wait_for(handle: &ConnectionHandle, target: ConnectionState) {
    let mut state = handle.watch_state();
    while *state.borrow_and_update() != target {
        state.changed().await.unwrap();
    }
}

fn is_unavailable(stanza: &Stanza) -> bool {
    matches!(stanza, Stanza::Presence { kind: Some(kind), .. } if kind == "unavailable")
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_disconnected() {
    let connector = ScriptedConnector::new(Vec::new());
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    let mut signals = handle.subscribe();

    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Disconnected).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 6, "initial attempt plus five retries");
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![1, 2, 4, 8, 16]);

    // No sixth retry is ever scheduled
    sleep(Duration::from_secs(300)).await;
    assert_eq!(connector.attempts().len(), 6);
    assert_eq!(handle.state(), ConnectionState::Disconnected);

    let mut fatal = false;
    while let Ok(signal) = signals.try_recv() {
        if matches!(signal, SessionSignal::Fatal(_)) {
            fatal = true;
        }
    }
    assert!(fatal, "exhausted budget is reported as fatal");
}

#[tokio::test(start_paused = true)]
async fn test_fresh_credentials_after_disconnect() {
    let connector = ScriptedConnector::new(Vec::new());
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Disconnected).await;

    connector.push(Outcome::Accept);
    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Connected).await;
    assert_eq!(connector.attempts().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_are_not_retried() {
    let connector = ScriptedConnector::new(vec![Outcome::Reject]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    let mut signals = handle.subscribe();

    handle.login(credentials()).await.unwrap();
    loop {
        if let SessionSignal::Fatal(reason) = signals.recv().await.unwrap() {
            assert!(reason.contains("not-authorized"));
            break;
        }
    }

    sleep(Duration::from_secs(60)).await;
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_credentials_fail_before_connecting() {
    let connector = ScriptedConnector::new(vec![Outcome::Accept]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());

    let err = handle
        .login(Credentials::new("alice@evil", "secret", "tradepost.local", "web"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Credentials(_)));
    assert!(!err.is_retryable());

    sleep(Duration::from_secs(5)).await;
    assert!(connector.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_online_presence_and_graceful_logout() {
    let connector = ScriptedConnector::new(vec![Outcome::Accept]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    let mut signals = handle.subscribe();

    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Connected).await;
    match signals.recv().await.unwrap() {
        SessionSignal::Started { jid } => assert_eq!(jid, "alice@tradepost.local/web"),
        other => panic!("unexpected signal {:?}", other),
    }

    sleep(Duration::from_millis(10)).await;
    let sent = connector.sent();
    assert!(matches!(
        sent.first(),
        Some(Stanza::Presence { kind: None, show: None, .. })
    ));

    handle.logout().await.unwrap();
    wait_for(&handle, ConnectionState::Idle).await;
    sleep(Duration::from_millis(10)).await;

    let sent = connector.sent();
    assert!(sent.last().is_some_and(is_unavailable));
    assert!(matches!(
        handle.send(Stanza::Ping { timestamp: 1 }).await,
        Err(ChatError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_drop_reconnects_and_ignores_stale_transport() {
    let connector = ScriptedConnector::new(vec![Outcome::Accept, Outcome::Accept]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    let mut signals = handle.subscribe();

    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Connected).await;

    let first = connector.sink(0);
    assert!(first.emit(TransportEvent::Closed).await);
    wait_for(&handle, ConnectionState::Reconnecting).await;
    wait_for(&handle, ConnectionState::Connected).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!((attempts[1] - attempts[0]).as_secs(), 1);

    // The old transport's late events belong to a closed generation
    first.emit(TransportEvent::Closed).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), ConnectionState::Connected);

    let mut started = 0;
    let mut ended = 0;
    while let Ok(signal) = signals.try_recv() {
        match signal {
            SessionSignal::Started { .. } => started += 1,
            SessionSignal::Ended => ended += 1,
            _ => {}
        }
    }
    assert_eq!((started, ended), (2, 1));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_inbound_is_dropped() {
    let connector = ScriptedConnector::new(vec![Outcome::Accept]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Connected).await;
    let mut signals = handle.subscribe();

    let sink = connector.sink(0);
    sink.emit(TransportEvent::Stanza(Stanza::Presence {
        from: None,
        to: None,
        kind: None,
        show: None,
        status: None,
    }))
    .await;
    sink.emit(TransportEvent::Stanza(Stanza::Presence {
        from: Some("bob@tradepost.local/web".to_string()),
        to: None,
        kind: None,
        show: Some("away".to_string()),
        status: Some("lunch".to_string()),
    }))
    .await;

    match signals.recv().await.unwrap() {
        SessionSignal::Inbound(InboundEvent::Presence { from, update }) => {
            assert_eq!(from, "bob@tradepost.local/web");
            assert_eq!(update.status_text.as_deref(), Some("lunch"));
        }
        other => panic!("unexpected signal {:?}", other),
    }
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_replaced_session_stays_disconnected() {
    let connector = ScriptedConnector::new(vec![Outcome::Accept, Outcome::Accept]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    let mut signals = handle.subscribe();

    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Connected).await;

    let sink = connector.sink(0);
    sink.emit(TransportEvent::Stanza(Stanza::Close {
        reason: CLOSE_REPLACED.to_string(),
    }))
    .await;
    sink.emit(TransportEvent::Closed).await;
    wait_for(&handle, ConnectionState::Disconnected).await;

    // Reconnecting would take the account back from the newer login.
    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(handle.state(), ConnectionState::Disconnected);

    let mut ended = false;
    let mut fatal = None;
    while let Ok(signal) = signals.try_recv() {
        match signal {
            SessionSignal::Ended => ended = true,
            SessionSignal::Fatal(reason) => fatal = Some(reason),
            _ => {}
        }
    }
    assert!(ended);
    assert!(fatal.is_some_and(|reason| reason.contains("replaced")));
}

#[tokio::test(start_paused = true)]
async fn test_relogin_waits_for_abandoned_attempt() {
    let connector = ScriptedConnector::new(vec![Outcome::Held, Outcome::Accept]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());
    let mut signals = handle.subscribe();

    handle.login(credentials()).await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(connector.attempts().len(), 1);

    handle.logout().await.unwrap();
    wait_for(&handle, ConnectionState::Idle).await;
    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Connecting).await;

    // The first connect call is still running, so no second one may start.
    sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(handle.state(), ConnectionState::Connecting);

    connector.release();
    wait_for(&handle, ConnectionState::Connected).await;
    assert_eq!(connector.attempts().len(), 2);

    // The late transport was closed on arrival; its events are ignored.
    connector.sink(0).emit(TransportEvent::Closed).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), ConnectionState::Connected);

    let mut started = 0;
    while let Ok(signal) = signals.try_recv() {
        if matches!(signal, SessionSignal::Started { .. }) {
            started += 1;
        }
    }
    assert_eq!(started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_login_while_connected_keeps_session_credentials() {
    let connector = ScriptedConnector::new(vec![Outcome::Accept, Outcome::Accept]);
    let (handle, _task) = ConnectionManager::spawn(connector.clone(), ReconnectPolicy::default());

    handle.login(credentials()).await.unwrap();
    wait_for(&handle, ConnectionState::Connected).await;

    handle
        .login(Credentials::new("mallory", "other", "tradepost.local", "web"))
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), ConnectionState::Connected);

    // The reconnect still authenticates as the live session's user.
    connector.sink(0).emit(TransportEvent::Closed).await;
    wait_for(&handle, ConnectionState::Reconnecting).await;
    wait_for(&handle, ConnectionState::Connected).await;
    assert_eq!(
        connector.logins(),
        vec!["alice@tradepost.local/web".to_string(); 2]
    );
}
