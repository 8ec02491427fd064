/// Realtime hub: authenticates sessions, routes presence and messages, fans out
/// channel broadcasts and serves the shared message store.
use crate::config::HubConfig;
use crate::error::{ChatError, Result};
use crate::identity::{bare, Credentials};
use crate::message_store::SledStore;
use crate::realtime::broadcast::parse_conversation_channel;
use crate::realtime::protocol::{read_stanza, write_stanza, Stanza, CLOSE_REPLACED, PRESENCE_UNAVAILABLE};
use crate::remote_store::StoreService;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

struct Session {
    id: u64,
    jid: String,
    tx: mpsc::Sender<Stanza>,
    presence: Option<Stanza>,
    channels: HashSet<String>,
}

#[derive(Clone)]
pub struct Hub {
    config: Arc<HubConfig>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    next_session: Arc<AtomicU64>,
    store: StoreService,
}

impl Hub {
    pub fn new(config: HubConfig, store: SledStore) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_session: Arc::new(AtomicU64::new(1)),
            store: StoreService::new(store),
        }
    }

    /// Run until Ctrl+C
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(ChatError::Io)?;
        info!("Hub listening on {}", self.config.listen_addr);

        tokio::select! {
            result = self.serve(listener) => result,
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, stopping hub");
                Ok(())
            }
        }
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tokio::spawn(self.clone().forward_store_changes());
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(stream, addr).await {
                            warn!("Session from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Push every store change to the live sessions of both participants.
    async fn forward_store_changes(self) {
        let mut changes = self.store.changes();
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let targets: Vec<mpsc::Sender<Stanza>> = {
                        let sessions = self.sessions.read().await;
                        let targets = change
                            .participants()
                            .into_iter()
                            .filter_map(|user| sessions.get(user))
                            .map(|session| session.tx.clone())
                            .collect();
                        targets
                    };
                    for tx in targets {
                        let stanza = Stanza::StoreChanged {
                            change: change.clone(),
                        };
                        if tx.try_send(stanza).is_err() {
                            warn!("Store change dropped for a saturated session");
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Hub store feed lagged by {} changes", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Bare jids with a live session
    pub async fn online(&self) -> Vec<String> {
        let mut out: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        out.sort();
        out
    }

    fn check_credentials(&self, credentials: &Credentials) -> std::result::Result<(), String> {
        credentials.validate().map_err(|e| e.to_string())?;
        if let Some(accounts) = &self.config.accounts {
            match accounts.get(&credentials.username) {
                Some(expected) if *expected == credentials.password => {}
                _ => return Err("not-authorized".to_string()),
            }
        }
        Ok(())
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<Option<Credentials>> {
        let first = timeout(self.config.auth_timeout, read_stanza(stream))
            .await
            .map_err(|_| ChatError::Timeout("Auth timeout".to_string()))??;

        let credentials = match first {
            Some(Stanza::Auth {
                username,
                password,
                domain,
                resource,
            }) => Credentials::new(username, password, domain, resource),
            Some(other) => {
                return Err(ChatError::Protocol(format!(
                    "Expected auth, got {}",
                    other.stanza_type()
                )))
            }
            None => return Ok(None),
        };

        if let Err(reason) = self.check_credentials(&credentials) {
            info!("Rejected login for {}: {}", credentials.bare_jid(), reason);
            write_stanza(stream, &Stanza::AuthFailed { reason }).await?;
            return Ok(None);
        }

        write_stanza(
            stream,
            &Stanza::AuthOk {
                jid: credentials.jid(),
            },
        )
        .await?;
        Ok(Some(credentials))
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!("Incoming connection from {}", addr);

        let Some(credentials) = self.authenticate(&mut stream).await? else {
            return Ok(());
        };
        let jid = credentials.jid();
        let bare_jid = credentials.bare_jid();
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        info!("Session {} established for {} from {}", session_id, jid, addr);

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Stanza>(256);

        let writer = tokio::spawn(async move {
            while let Some(stanza) = rx.recv().await {
                let closing = matches!(stanza, Stanza::Close { .. });
                if write_stanza(&mut write_half, &stanza).await.is_err() || closing {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        self.register(session_id, &jid, &bare_jid, tx.clone()).await;

        let result = loop {
            match read_stanza(&mut read_half).await {
                Ok(Some(Stanza::Close { reason })) => {
                    debug!("{} closed the session: {}", jid, reason);
                    break Ok(());
                }
                Ok(Some(stanza)) => self.route(&jid, &bare_jid, &tx, stanza).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.end_session(session_id, &jid, &bare_jid).await;
        drop(tx);
        let _ = writer.await;
        info!("Session {} for {} ended", session_id, jid);
        result
    }

    async fn register(&self, id: u64, jid: &str, bare_jid: &str, tx: mpsc::Sender<Stanza>) {
        let mut sessions = self.sessions.write().await;

        // Replay everybody else's presence to the newcomer.
        for session in sessions.values() {
            if session.jid == jid {
                continue;
            }
            if let Some(presence) = &session.presence {
                let _ = tx.try_send(presence.clone());
            }
        }

        let replaced = sessions.insert(
            bare_jid.to_string(),
            Session {
                id,
                jid: jid.to_string(),
                tx,
                presence: None,
                channels: HashSet::new(),
            },
        );
        if let Some(old) = replaced {
            info!("Session {} for {} replaced by {}", old.id, bare_jid, id);
            let _ = old.tx.try_send(Stanza::Close {
                reason: CLOSE_REPLACED.to_string(),
            });
        }
    }

    async fn end_session(&self, id: u64, jid: &str, bare_jid: &str) {
        let mut sessions = self.sessions.write().await;
        let still_current = sessions.get(bare_jid).map(|s| s.id == id).unwrap_or(false);
        if !still_current {
            return;
        }
        sessions.remove(bare_jid);

        let gone = Stanza::Presence {
            from: Some(jid.to_string()),
            to: None,
            kind: Some(PRESENCE_UNAVAILABLE.to_string()),
            show: None,
            status: None,
        };
        for session in sessions.values() {
            let _ = session.tx.try_send(gone.clone());
        }
    }

    async fn route(&self, jid: &str, bare_jid: &str, own_tx: &mpsc::Sender<Stanza>, stanza: Stanza) {
        match stanza {
            Stanza::Presence {
                to,
                kind,
                show,
                status,
                ..
            } => {
                let stamped = Stanza::Presence {
                    from: Some(jid.to_string()),
                    to: to.clone(),
                    kind,
                    show,
                    status,
                };
                let mut sessions = self.sessions.write().await;
                match to {
                    Some(target) => {
                        if let Some(session) = sessions.get(bare(&target)) {
                            let _ = session.tx.try_send(stamped);
                        }
                    }
                    None => {
                        if let Some(own) = sessions.get_mut(bare_jid) {
                            own.presence = Some(stamped.clone());
                        }
                        for (key, session) in sessions.iter() {
                            if key != bare_jid {
                                let _ = session.tx.try_send(stamped.clone());
                            }
                        }
                    }
                }
            }
            Stanza::Message { to, body, .. } => {
                let target = self
                    .sessions
                    .read()
                    .await
                    .get(bare(&to))
                    .map(|session| session.tx.clone());
                match target {
                    Some(tx) => {
                        let _ = tx
                            .send(Stanza::Message {
                                from: Some(jid.to_string()),
                                to,
                                body,
                            })
                            .await;
                    }
                    None => debug!("Dropping message from {} to offline {}", jid, to),
                }
            }
            Stanza::Broadcast { channel, payload, .. } => {
                let members: Vec<mpsc::Sender<Stanza>> = {
                    let sessions = self.sessions.read().await;
                    let joined = sessions
                        .get(bare_jid)
                        .is_some_and(|own| own.channels.contains(&channel));
                    if !joined {
                        warn!("Dropping broadcast from {} to unjoined {}", jid, channel);
                        return;
                    }
                    // Members include the publisher: clients rely on the self-echo.
                    let members = sessions
                        .values()
                        .filter(|session| session.channels.contains(&channel))
                        .map(|session| session.tx.clone())
                        .collect();
                    members
                };
                let stamped = Stanza::Broadcast {
                    channel,
                    from: Some(bare_jid.to_string()),
                    payload,
                };
                for tx in members {
                    if tx.try_send(stamped.clone()).is_err() {
                        debug!("Broadcast from {} dropped for a saturated member", jid);
                    }
                }
            }
            Stanza::Subscribe { channel } => {
                if !self.may_join(bare_jid, &channel).await {
                    warn!("Refused {} subscription to {}", jid, channel);
                    return;
                }
                if let Some(own) = self.sessions.write().await.get_mut(bare_jid) {
                    debug!("{} joined {}", jid, channel);
                    own.channels.insert(channel);
                }
            }
            Stanza::Unsubscribe { channel } => {
                if let Some(own) = self.sessions.write().await.get_mut(bare_jid) {
                    debug!("{} left {}", jid, channel);
                    own.channels.remove(&channel);
                }
            }
            Stanza::Ping { timestamp } => {
                let _ = own_tx.send(Stanza::Pong { timestamp }).await;
            }
            Stanza::StoreRequest { request_id, call } => {
                let outcome = self.store.answer(bare_jid, call).await;
                if own_tx
                    .send(Stanza::StoreResponse {
                        request_id,
                        outcome,
                    })
                    .await
                    .is_err()
                {
                    debug!("Store reply {} for {} had no session left", request_id, jid);
                }
            }
            other => {
                debug!("Ignoring {} from {}", other, jid);
            }
        }
    }

    /// Only participants of a conversation may join its channel.
    async fn may_join(&self, bare_jid: &str, channel: &str) -> bool {
        let Some(conversation_id) = parse_conversation_channel(channel) else {
            return false;
        };
        match self.store.is_participant(bare_jid, conversation_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Membership check for {} failed: {}", channel, e);
                false
            }
        }
    }
}
