/// TCP transport to the hub
use crate::error::{ChatError, Result};
use crate::identity::Credentials;
use crate::realtime::connection::{Connector, TransportEvent, TransportHandle, TransportSink};
use crate::realtime::protocol::{read_stanza, write_stanza, Stanza};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info};

/// Connects to a hub over length-prefixed JSON frames
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub hub_addr: SocketAddr,
    pub connection_timeout: Duration,
    pub auth_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl TcpConnector {
    pub fn new(hub_addr: SocketAddr) -> Self {
        Self {
            hub_addr,
            connection_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream, credentials: &Credentials) -> Result<String> {
        let auth = Stanza::Auth {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            domain: credentials.domain.clone(),
            resource: credentials.resource.clone(),
        };
        write_stanza(stream, &auth).await?;

        let reply = timeout(self.auth_timeout, read_stanza(stream))
            .await
            .map_err(|_| ChatError::Timeout("Auth reply timeout".to_string()))??;

        match reply {
            Some(Stanza::AuthOk { jid }) => Ok(jid),
            Some(Stanza::AuthFailed { reason }) => Err(ChatError::Credentials(reason)),
            Some(other) => Err(ChatError::Protocol(format!(
                "Expected auth reply, got {}",
                other.stanza_type()
            ))),
            None => Err(ChatError::Connection("Hub closed during auth".to_string())),
        }
    }
}

impl Connector for TcpConnector {
    async fn connect(&self, credentials: Credentials, sink: TransportSink) -> Result<TransportHandle> {
        let mut stream = timeout(self.connection_timeout, TcpStream::connect(self.hub_addr))
            .await
            .map_err(|_| ChatError::Timeout(format!("Connect to {} timed out", self.hub_addr)))?
            .map_err(ChatError::Io)?;
        debug!("TCP connection established to {}", self.hub_addr);

        let jid = self.authenticate(&mut stream, &credentials).await?;
        info!("Authenticated to {} as {}", self.hub_addr, jid);

        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Stanza>(256);

        let reader = tokio::spawn(async move {
            loop {
                match read_stanza(&mut read_half).await {
                    Ok(Some(stanza)) => {
                        if !sink.emit(TransportEvent::Stanza(stanza)).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        sink.emit(TransportEvent::Closed).await;
                        break;
                    }
                    Err(e) => {
                        sink.emit(TransportEvent::Failed(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        let keepalive = self.keepalive_interval;
        // Not aborted on close: it drains queued stanzas (the unavailable notice) first.
        tokio::spawn(async move {
            let mut idle = tokio::time::interval(keepalive);
            idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
            idle.tick().await;
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => {
                        let Some(stanza) = next else { break };
                        if let Err(e) = write_stanza(&mut write_half, &stanza).await {
                            debug!("Write to hub failed: {}", e);
                            break;
                        }
                        idle.reset();
                    }
                    _ = idle.tick() => {
                        let ping = Stanza::Ping { timestamp: chrono::Utc::now().timestamp() };
                        if write_stanza(&mut write_half, &ping).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        Ok(TransportHandle::new(outbound_tx, vec![reader]))
    }
}
