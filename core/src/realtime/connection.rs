/// Connection lifecycle: a pure state machine plus the task that drives it
use crate::error::{ChatError, Result};
use crate::identity::Credentials;
use crate::realtime::protocol::{InboundEvent, Stanza, CLOSE_REPLACED};
use crate::model::PresenceStatus;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the realtime connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No credentials, or logged out
    Idle,
    /// Attempt in flight
    Connecting,
    /// Transport up, initial presence sent
    Connected,
    /// Transport failed; about to retry or give up
    Error,
    /// Retry scheduled
    Reconnecting,
    /// Retry budget exhausted; waits for fresh credentials
    Disconnected,
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    CredentialsAvailable,
    Online,
    Offline,
    TransportError(String),
    CredentialsRejected(String),
    /// The hub handed the account to a newer login
    Replaced,
    RetryDue,
    Logout,
}

/// Work the driver performs after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport,
    CloseTransport,
    SendUnavailable,
    ScheduleRetry(Duration),
    CancelRetry,
    SessionStarted,
    SessionEnded,
    ReportFatal(String),
}

/// Exponential backoff with a fixed attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
}

impl Machine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Apply one event. Events that make no sense in the current state are ignored.
    pub fn step(self, event: ConnectionEvent) -> (Machine, Vec<Effect>) {
        use ConnectionState::*;

        let mut next = self;
        let mut effects = Vec::new();

        match (self.state, event) {
            (Idle, ConnectionEvent::Logout) => {}
            (_, ConnectionEvent::Logout) => {
                effects.push(Effect::CancelRetry);
                if self.state == Connected {
                    effects.push(Effect::SendUnavailable);
                    effects.push(Effect::SessionEnded);
                }
                effects.push(Effect::CloseTransport);
                next.state = Idle;
                next.attempt = 0;
            }
            (Idle | Disconnected, ConnectionEvent::CredentialsAvailable) => {
                next.state = Connecting;
                next.attempt = 0;
                effects.push(Effect::OpenTransport);
            }
            (Connecting, ConnectionEvent::Online) => {
                next.state = Connected;
                next.attempt = 0;
                effects.push(Effect::SessionStarted);
            }
            (Connecting | Connected, ConnectionEvent::TransportError(_)) => {
                if self.state == Connected {
                    effects.push(Effect::SessionEnded);
                }
                effects.push(Effect::CloseTransport);
                next.state = Error;
            }
            (Connecting | Connected | Error, ConnectionEvent::Offline) => {
                if self.state == Connected {
                    effects.push(Effect::SessionEnded);
                }
                if self.state != Error {
                    effects.push(Effect::CloseTransport);
                }
                next.fail(&mut effects);
            }
            (Connecting | Connected, ConnectionEvent::CredentialsRejected(reason)) => {
                if self.state == Connected {
                    effects.push(Effect::SessionEnded);
                }
                effects.push(Effect::CloseTransport);
                effects.push(Effect::ReportFatal(format!("credentials rejected: {}", reason)));
                next.state = Idle;
                next.attempt = 0;
            }
            // Retrying would evict the newer login in turn.
            (Connecting | Connected, ConnectionEvent::Replaced) => {
                if self.state == Connected {
                    effects.push(Effect::SessionEnded);
                }
                effects.push(Effect::CloseTransport);
                effects.push(Effect::ReportFatal(
                    "session replaced by another login of this account".to_string(),
                ));
                next.state = Disconnected;
                next.attempt = 0;
            }
            (Reconnecting, ConnectionEvent::RetryDue) => {
                next.state = Connecting;
                effects.push(Effect::OpenTransport);
            }
            _ => {}
        }

        (next, effects)
    }

    fn fail(&mut self, effects: &mut Vec<Effect>) {
        if self.attempt < self.policy.max_attempts {
            effects.push(Effect::ScheduleRetry(self.policy.delay_for(self.attempt)));
            self.attempt += 1;
            self.state = ConnectionState::Reconnecting;
        } else {
            effects.push(Effect::ReportFatal(format!(
                "gave up after {} reconnect attempts",
                self.policy.max_attempts
            )));
            self.state = ConnectionState::Disconnected;
        }
    }
}

/// What a live transport reports back to the manager
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Stanza(Stanza),
    Closed,
    Failed(String),
}

/// Session-level notifications for the presence tracker and the reconciler
#[derive(Debug, Clone)]
pub enum SessionSignal {
    Started { jid: String },
    Inbound(InboundEvent),
    Ended,
    Fatal(String),
}

enum Input {
    Login(Credentials),
    Logout,
    Opened {
        generation: u64,
        result: Result<TransportHandle>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    RetryDue {
        token: u64,
    },
}

/// Channel a transport uses to report events; tagged with the attempt it belongs to.
#[derive(Clone)]
pub struct TransportSink {
    generation: u64,
    inputs: mpsc::Sender<Input>,
}

impl TransportSink {
    /// Returns false once the manager is gone.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.inputs
            .send(Input::Transport {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }
}

/// A live transport. Dropping the outbound sender lets the writer drain and exit.
pub struct TransportHandle {
    outbound: mpsc::Sender<Stanza>,
    abort_on_close: Vec<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::Sender<Stanza>, abort_on_close: Vec<JoinHandle<()>>) -> Self {
        Self {
            outbound,
            abort_on_close,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Stanza> {
        self.outbound.clone()
    }

    pub fn close(self) {
        for task in self.abort_on_close {
            task.abort();
        }
    }
}

/// Opens transports to the realtime endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        credentials: Credentials,
        sink: TransportSink,
    ) -> impl Future<Output = Result<TransportHandle>> + Send;
}

enum Slot {
    Empty,
    Pending,
    /// Torn down while its connect call was still running. No new attempt
    /// starts until that call reports back; `reopen` records one that was asked for.
    Closing { reopen: bool },
    Active(TransportHandle),
}

/// Shared, non-owning view of the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inputs: mpsc::Sender<Input>,
    state: watch::Receiver<ConnectionState>,
    outbound: Arc<RwLock<Option<mpsc::Sender<Stanza>>>>,
    signals: broadcast::Sender<SessionSignal>,
}

impl ConnectionHandle {
    /// Hand credentials to the manager. Malformed credentials fail here and are never retried.
    pub async fn login(&self, credentials: Credentials) -> Result<()> {
        credentials.validate()?;
        self.inputs
            .send(Input::Login(credentials))
            .await
            .map_err(|_| ChatError::Connection("connection manager stopped".to_string()))
    }

    pub async fn logout(&self) -> Result<()> {
        self.inputs
            .send(Input::Logout)
            .await
            .map_err(|_| ChatError::Connection("connection manager stopped".to_string()))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    /// Queue a stanza on the live transport.
    pub async fn send(&self, stanza: Stanza) -> Result<()> {
        let sender = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(ChatError::NotConnected)?;
        sender
            .send(stanza)
            .await
            .map_err(|_| ChatError::Connection("transport closed".to_string()))
    }
}

/// Owns the transport and runs the state machine
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    machine: Machine,
    credentials: Option<Credentials>,
    slot: Slot,
    early: Vec<TransportEvent>,
    generation: u64,
    retry: Option<JoinHandle<()>>,
    retry_token: u64,
    inputs: mpsc::WeakSender<Input>,
    outbound: Arc<RwLock<Option<mpsc::Sender<Stanza>>>>,
    state_tx: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<SessionSignal>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Start the manager task and return a handle to it.
    pub fn spawn(connector: C, policy: ReconnectPolicy) -> (ConnectionHandle, JoinHandle<()>) {
        let (inputs_tx, inputs_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (signals, _) = broadcast::channel(1024);
        let outbound = Arc::new(RwLock::new(None));

        let manager = Self {
            connector: Arc::new(connector),
            machine: Machine::new(policy),
            credentials: None,
            slot: Slot::Empty,
            early: Vec::new(),
            generation: 0,
            retry: None,
            retry_token: 0,
            inputs: inputs_tx.downgrade(),
            outbound: outbound.clone(),
            state_tx,
            signals: signals.clone(),
        };

        let handle = ConnectionHandle {
            inputs: inputs_tx,
            state: state_rx,
            outbound,
            signals,
        };

        let task = tokio::spawn(manager.run(inputs_rx));
        (handle, task)
    }

    async fn run(mut self, mut inputs: mpsc::Receiver<Input>) {
        while let Some(input) = inputs.recv().await {
            self.handle_input(input).await;
        }
        self.execute(Effect::CancelRetry).await;
        self.execute(Effect::CloseTransport).await;
        debug!("Connection manager stopped");
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Login(credentials) => {
                let state = self.machine.state();
                if !matches!(state, ConnectionState::Idle | ConnectionState::Disconnected) {
                    warn!("Login for {} ignored while {:?}", credentials.jid(), state);
                    return;
                }
                debug!("Credentials available for {}", credentials.jid());
                self.credentials = Some(credentials);
                self.apply(ConnectionEvent::CredentialsAvailable).await;
            }
            Input::Logout => {
                self.apply(ConnectionEvent::Logout).await;
                self.credentials = None;
            }
            Input::Opened { generation, result } => {
                if let Slot::Closing { reopen } = self.slot {
                    debug!("Connection attempt {} finished after teardown", generation);
                    if let Ok(handle) = result {
                        handle.close();
                    }
                    self.slot = Slot::Empty;
                    if reopen {
                        self.open_transport();
                    }
                    return;
                }
                if generation != self.generation || !matches!(self.slot, Slot::Pending) {
                    debug!("Discarding stale connection attempt {}", generation);
                    if let Ok(handle) = result {
                        handle.close();
                    }
                    return;
                }
                match result {
                    Ok(handle) => {
                        *self.outbound.write().await = Some(handle.sender());
                        self.slot = Slot::Active(handle);
                        self.apply(ConnectionEvent::Online).await;
                        for event in std::mem::take(&mut self.early) {
                            if self.generation != generation {
                                break;
                            }
                            self.on_transport_event(event).await;
                        }
                    }
                    Err(ChatError::Credentials(reason)) => {
                        self.slot = Slot::Empty;
                        self.apply(ConnectionEvent::CredentialsRejected(reason)).await;
                    }
                    Err(e) => {
                        warn!("Connection attempt failed: {}", e);
                        self.slot = Slot::Empty;
                        self.apply(ConnectionEvent::TransportError(e.to_string())).await;
                    }
                }
            }
            Input::Transport { generation, event } => {
                if generation != self.generation {
                    debug!("Ignoring event from closed transport {}", generation);
                    return;
                }
                // The hub may talk before the connect task has reported back.
                if matches!(self.slot, Slot::Pending) {
                    self.early.push(event);
                    return;
                }
                self.on_transport_event(event).await;
            }
            Input::RetryDue { token } => {
                if token == self.retry_token {
                    self.retry = None;
                    self.apply(ConnectionEvent::RetryDue).await;
                }
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Stanza(Stanza::Close { reason }) if reason == CLOSE_REPLACED => {
                warn!("Session taken over by another login of this account");
                self.apply(ConnectionEvent::Replaced).await;
            }
            TransportEvent::Stanza(stanza) => match InboundEvent::from_stanza(stanza) {
                Ok(event) => {
                    let _ = self.signals.send(SessionSignal::Inbound(event));
                }
                Err(e) => warn!("Dropping inbound stanza: {}", e),
            },
            TransportEvent::Closed => {
                info!("Transport closed");
                self.apply(ConnectionEvent::Offline).await;
            }
            TransportEvent::Failed(reason) => {
                warn!("Transport error: {}", reason);
                self.apply(ConnectionEvent::TransportError(reason)).await;
            }
        }
    }

    async fn apply(&mut self, event: ConnectionEvent) {
        let mut pending = Some(event);
        while let Some(event) = pending.take() {
            let before = self.machine.state();
            let (next, effects) = self.machine.step(event);
            self.machine = next;
            if before != next.state() {
                info!("Connection {:?} -> {:?}", before, next.state());
                self.state_tx.send_replace(next.state());
            }
            for effect in effects {
                self.execute(effect).await;
            }
            // The failed transport is closed by now; that is the offline edge.
            if self.machine.state() == ConnectionState::Error {
                pending = Some(ConnectionEvent::Offline);
            }
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport => self.open_transport(),
            Effect::CloseTransport => {
                *self.outbound.write().await = None;
                self.early.clear();
                self.generation += 1;
                match std::mem::replace(&mut self.slot, Slot::Empty) {
                    Slot::Active(handle) => handle.close(),
                    // The connect call still owns whatever it opens.
                    Slot::Pending | Slot::Closing { .. } => {
                        self.slot = Slot::Closing { reopen: false };
                    }
                    Slot::Empty => {}
                }
            }
            Effect::SendUnavailable => {
                let sender = self.outbound.read().await.clone();
                if let Some(sender) = sender {
                    if sender.send(Stanza::unavailable()).await.is_err() {
                        debug!("Unavailable presence not sent: transport already closed");
                    }
                }
            }
            Effect::ScheduleRetry(delay) => {
                self.cancel_retry();
                let Some(inputs) = self.inputs.upgrade() else {
                    return;
                };
                let token = self.retry_token;
                info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    self.machine.attempt(),
                    self.machine.policy.max_attempts
                );
                self.retry = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inputs.send(Input::RetryDue { token }).await;
                }));
            }
            Effect::CancelRetry => self.cancel_retry(),
            Effect::SessionStarted => {
                let jid = self
                    .credentials
                    .as_ref()
                    .map(Credentials::jid)
                    .unwrap_or_default();
                info!("Session started as {}", jid);
                let sender = self.outbound.read().await.clone();
                if let Some(sender) = sender {
                    if sender
                        .send(Stanza::presence(PresenceStatus::Online, None))
                        .await
                        .is_err()
                    {
                        debug!("Initial presence not sent: transport already closed");
                    }
                }
                let _ = self.signals.send(SessionSignal::Started { jid });
            }
            Effect::SessionEnded => {
                let _ = self.signals.send(SessionSignal::Ended);
            }
            Effect::ReportFatal(reason) => {
                error!("Connection failed permanently: {}", reason);
                let _ = self.signals.send(SessionSignal::Fatal(reason));
            }
        }
    }

    fn open_transport(&mut self) {
        match &mut self.slot {
            Slot::Empty => {}
            Slot::Closing { reopen } => {
                debug!("Connection attempt deferred until the previous one finishes");
                *reopen = true;
                return;
            }
            Slot::Pending | Slot::Active(_) => {
                warn!("Connection attempt skipped: a transport already exists");
                return;
            }
        }
        let Some(credentials) = self.credentials.clone() else {
            warn!("Connection attempt skipped: no credentials");
            return;
        };
        let Some(inputs) = self.inputs.upgrade() else {
            return;
        };

        self.generation += 1;
        self.slot = Slot::Pending;
        let generation = self.generation;
        let sink = TransportSink {
            generation,
            inputs: inputs.clone(),
        };
        let connector = self.connector.clone();

        debug!("Opening transport for {} (generation {})", credentials.jid(), generation);
        tokio::spawn(async move {
            let result = connector.connect(credentials, sink).await;
            let _ = inputs.send(Input::Opened { generation, result }).await;
        });
    }

    fn cancel_retry(&mut self) {
        self.retry_token += 1;
        if let Some(task) = self.retry.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(machine: Machine, events: Vec<ConnectionEvent>) -> (Machine, Vec<Effect>) {
        let mut machine = machine;
        let mut all = Vec::new();
        for event in events {
            let (next, effects) = machine.step(event);
            machine = next;
            all.extend(effects);
        }
        (machine, all)
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (0..5).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_connect_and_online() {
        let (machine, effects) = run(
            Machine::new(ReconnectPolicy::default()),
            vec![ConnectionEvent::CredentialsAvailable, ConnectionEvent::Online],
        );
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(effects, vec![Effect::OpenTransport, Effect::SessionStarted]);
    }

    #[test]
    fn test_retry_schedule_exhausts_budget() {
        let mut machine = Machine::new(ReconnectPolicy::default());
        let (next, _) = machine.step(ConnectionEvent::CredentialsAvailable);
        machine = next;

        let mut delays = Vec::new();
        for _ in 0..6 {
            let (next, effects) = machine.step(ConnectionEvent::Offline);
            machine = next;
            for effect in effects {
                if let Effect::ScheduleRetry(d) = effect {
                    delays.push(d.as_secs());
                }
            }
            if machine.state() == ConnectionState::Reconnecting {
                let (next, effects) = machine.step(ConnectionEvent::RetryDue);
                machine = next;
                assert_eq!(effects, vec![Effect::OpenTransport]);
            }
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        // No automatic way out.
        let (still, effects) = machine.step(ConnectionEvent::RetryDue);
        assert_eq!(still.state(), ConnectionState::Disconnected);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_online_resets_attempts() {
        let (machine, _) = run(
            Machine::new(ReconnectPolicy::default()),
            vec![
                ConnectionEvent::CredentialsAvailable,
                ConnectionEvent::Offline,
                ConnectionEvent::RetryDue,
                ConnectionEvent::Offline,
                ConnectionEvent::RetryDue,
            ],
        );
        assert_eq!(machine.attempt(), 2);
        let (machine, _) = machine.step(ConnectionEvent::Online);
        assert_eq!(machine.attempt(), 0);
        let (_, effects) = machine.step(ConnectionEvent::Offline);
        assert!(effects.contains(&Effect::ScheduleRetry(Duration::from_secs(1))));
    }

    #[test]
    fn test_transport_error_passes_through_error_state() {
        let (machine, effects) = run(
            Machine::new(ReconnectPolicy::default()),
            vec![
                ConnectionEvent::CredentialsAvailable,
                ConnectionEvent::Online,
                ConnectionEvent::TransportError("reset".into()),
            ],
        );
        assert_eq!(machine.state(), ConnectionState::Error);
        assert!(effects.ends_with(&[Effect::SessionEnded, Effect::CloseTransport]));

        let (machine, effects) = machine.step(ConnectionEvent::Offline);
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert_eq!(effects, vec![Effect::ScheduleRetry(Duration::from_secs(1))]);
    }

    #[test]
    fn test_credentials_rejected_is_not_retried() {
        let (machine, effects) = run(
            Machine::new(ReconnectPolicy::default()),
            vec![
                ConnectionEvent::CredentialsAvailable,
                ConnectionEvent::CredentialsRejected("bad password".into()),
            ],
        );
        assert_eq!(machine.state(), ConnectionState::Idle);
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleRetry(_))));
        assert!(effects.iter().any(|e| matches!(e, Effect::ReportFatal(_))));
    }

    #[test]
    fn test_logout_from_connected() {
        let (machine, effects) = run(
            Machine::new(ReconnectPolicy::default()),
            vec![
                ConnectionEvent::CredentialsAvailable,
                ConnectionEvent::Online,
                ConnectionEvent::Logout,
            ],
        );
        assert_eq!(machine.state(), ConnectionState::Idle);
        assert_eq!(
            &effects[2..],
            &[
                Effect::CancelRetry,
                Effect::SendUnavailable,
                Effect::SessionEnded,
                Effect::CloseTransport
            ]
        );
    }

    #[test]
    fn test_second_login_while_connecting_is_ignored() {
        let (machine, effects) = run(
            Machine::new(ReconnectPolicy::default()),
            vec![
                ConnectionEvent::CredentialsAvailable,
                ConnectionEvent::CredentialsAvailable,
            ],
        );
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(effects, vec![Effect::OpenTransport]);
    }

    #[test]
    fn test_replaced_session_is_not_retried() {
        let (machine, effects) = run(
            Machine::new(ReconnectPolicy::default()),
            vec![
                ConnectionEvent::CredentialsAvailable,
                ConnectionEvent::Online,
                ConnectionEvent::Replaced,
            ],
        );
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(
            &effects[2..4],
            &[Effect::SessionEnded, Effect::CloseTransport]
        );
        assert!(matches!(effects.last(), Some(Effect::ReportFatal(_))));
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleRetry(_))));

        // The late EOF of the closed transport changes nothing.
        let (machine, effects) = machine.step(ConnectionEvent::Offline);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_fresh_credentials_leave_disconnected() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            base_delay: Duration::from_secs(1),
        };
        let (machine, _) = run(
            Machine::new(policy),
            vec![ConnectionEvent::CredentialsAvailable, ConnectionEvent::Offline],
        );
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        let (machine, effects) = machine.step(ConnectionEvent::CredentialsAvailable);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(effects, vec![Effect::OpenTransport]);
    }
}
