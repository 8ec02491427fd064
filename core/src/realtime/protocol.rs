/// Wire format between clients and the hub
use crate::error::{ChatError, Result};
use crate::message_store::StoreChange;
use crate::model::PresenceStatus;
use crate::remote_store::{StoreCall, StoreOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Presence type marking a contact as gone
pub const PRESENCE_UNAVAILABLE: &str = "unavailable";

/// Close reason sent to a session taken over by a newer login of the same account
pub const CLOSE_REPLACED: &str = "replaced";

/// Stanzas exchanged with the hub. Inbound fields stay optional here and are
/// checked by [`InboundEvent::from_stanza`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stanza {
    /// First frame on every connection
    Auth {
        username: String,
        password: String,
        domain: String,
        resource: String,
    },

    AuthOk {
        jid: String,
    },

    AuthFailed {
        reason: String,
    },

    Presence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, rename = "presence_type", skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        show: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default)]
        to: String,
        #[serde(default)]
        body: String,
    },

    /// Payload fanned out to every member of `channel`, sender included
    Broadcast {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        payload: serde_json::Value,
    },

    Subscribe {
        channel: String,
    },

    Unsubscribe {
        channel: String,
    },

    Ping {
        timestamp: i64,
    },

    Pong {
        timestamp: i64,
    },

    Close {
        reason: String,
    },

    /// Durable-store call executed by the hub for the session's user
    StoreRequest {
        request_id: u64,
        call: StoreCall,
    },

    StoreResponse {
        request_id: u64,
        outcome: StoreOutcome,
    },

    /// Row-level store change, sent to both participants
    StoreChanged {
        change: StoreChange,
    },
}

impl Stanza {
    /// Serialize stanza to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize stanza from JSON bytes
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn stanza_type(&self) -> &'static str {
        match self {
            Stanza::Auth { .. } => "auth",
            Stanza::AuthOk { .. } => "auth_ok",
            Stanza::AuthFailed { .. } => "auth_failed",
            Stanza::Presence { .. } => "presence",
            Stanza::Message { .. } => "message",
            Stanza::Broadcast { .. } => "broadcast",
            Stanza::Subscribe { .. } => "subscribe",
            Stanza::Unsubscribe { .. } => "unsubscribe",
            Stanza::Ping { .. } => "ping",
            Stanza::Pong { .. } => "pong",
            Stanza::Close { .. } => "close",
            Stanza::StoreRequest { .. } => "store_request",
            Stanza::StoreResponse { .. } => "store_response",
            Stanza::StoreChanged { .. } => "store_changed",
        }
    }

    /// Outbound presence announcing `status`
    pub fn presence(status: PresenceStatus, status_text: Option<String>) -> Self {
        let (kind, show) = match status {
            PresenceStatus::Online => (None, None),
            PresenceStatus::Away => (None, Some("away".to_string())),
            PresenceStatus::Offline => (Some(PRESENCE_UNAVAILABLE.to_string()), None),
        };
        Stanza::Presence {
            from: None,
            to: None,
            kind,
            show,
            status: status_text,
        }
    }

    pub fn unavailable() -> Self {
        Self::presence(PresenceStatus::Offline, None)
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stanza({})", self.stanza_type())
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame from a stanza
    pub fn from_stanza(stanza: &Stanza) -> std::result::Result<Self, serde_json::Error> {
        let payload = stanza.to_bytes()?;
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse frame from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if data.len() < 4 + length {
            return None;
        }

        Some(Self {
            length: length as u32,
            payload: data[4..4 + length].to_vec(),
        })
    }
}

/// Write one stanza as a length-prefixed frame.
pub async fn write_stanza<W>(writer: &mut W, stanza: &Stanza) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::from_stanza(stanza).map_err(ChatError::Serialization)?;
    writer.write_all(&frame.to_bytes()).await.map_err(ChatError::Io)?;
    Ok(())
}

/// Read the next well-formed stanza. `Ok(None)` on clean EOF.
///
/// Frames whose JSON does not parse are skipped; an oversized length prefix is a
/// protocol error because the stream can no longer be resynchronised.
pub async fn read_stanza<R>(reader: &mut R) -> Result<Option<Stanza>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ChatError::Io(e)),
        }

        let length = u32::from_be_bytes(len_buf) as usize;
        if length > MAX_FRAME_LEN {
            return Err(ChatError::Protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, MAX_FRAME_LEN
            )));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await.map_err(ChatError::Io)?;

        match Stanza::from_bytes(&payload) {
            Ok(stanza) => return Ok(Some(stanza)),
            Err(e) => {
                warn!("Dropping malformed stanza ({} bytes): {}", length, e);
                continue;
            }
        }
    }
}

/// Presence change carried by an inbound presence stanza
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub status: PresenceStatus,
    pub status_text: Option<String>,
}

/// Validated inbound traffic, produced at the edge from raw stanzas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Presence {
        from: String,
        update: PresenceUpdate,
    },
    Message {
        from: String,
        to: String,
        body: String,
    },
    Broadcast {
        channel: String,
        from: Option<String>,
        payload: serde_json::Value,
    },
    Pong {
        timestamp: i64,
    },
    Close {
        reason: String,
    },
    StoreResponse {
        request_id: u64,
        outcome: StoreOutcome,
    },
    StoreChanged {
        change: StoreChange,
    },
}

fn required(field: &'static str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ChatError::Protocol(format!("missing field: {}", field))),
    }
}

impl InboundEvent {
    /// Validate a stanza received from the hub.
    pub fn from_stanza(stanza: Stanza) -> Result<Self> {
        match stanza {
            Stanza::Presence {
                from,
                kind,
                show,
                status,
                ..
            } => {
                let from = required("from", from)?;
                let status_kind = match kind.as_deref() {
                    None => None,
                    Some(PRESENCE_UNAVAILABLE) => Some(PresenceStatus::Offline),
                    Some(other) => {
                        return Err(ChatError::Protocol(format!(
                            "unsupported presence type: {}",
                            other
                        )))
                    }
                };
                let status_value = match status_kind {
                    Some(offline) => offline,
                    None => match show.as_deref() {
                        None | Some("chat") => PresenceStatus::Online,
                        Some("away") | Some("xa") | Some("dnd") => PresenceStatus::Away,
                        Some(other) => {
                            return Err(ChatError::Protocol(format!(
                                "unsupported presence show: {}",
                                other
                            )))
                        }
                    },
                };
                Ok(InboundEvent::Presence {
                    from,
                    update: PresenceUpdate {
                        status: status_value,
                        status_text: status.filter(|s| !s.is_empty()),
                    },
                })
            }
            Stanza::Message { from, to, body } => Ok(InboundEvent::Message {
                from: required("from", from)?,
                to: required("to", Some(to))?,
                body: required("body", Some(body))?,
            }),
            Stanza::Broadcast {
                channel,
                from,
                payload,
            } => Ok(InboundEvent::Broadcast {
                channel: required("channel", Some(channel))?,
                from,
                payload,
            }),
            Stanza::Pong { timestamp } => Ok(InboundEvent::Pong { timestamp }),
            Stanza::Close { reason } => Ok(InboundEvent::Close { reason }),
            Stanza::StoreResponse {
                request_id,
                outcome,
            } => Ok(InboundEvent::StoreResponse {
                request_id,
                outcome,
            }),
            Stanza::StoreChanged { change } => Ok(InboundEvent::StoreChanged { change }),
            other => Err(ChatError::Protocol(format!(
                "unexpected inbound stanza: {}",
                other.stanza_type()
            ))),
        }
    }
}
