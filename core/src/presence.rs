/// Presence tracking for chat partners and the local user
use crate::identity::bare;
use crate::model::{PresenceLookup, PresenceRecord, PresenceStatus};
use crate::realtime::connection::ConnectionHandle;
use crate::realtime::protocol::{PresenceUpdate, Stanza};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OwnPresence {
    status: PresenceStatus,
    status_text: Option<String>,
}

/// Contact → presence map for the current session
#[derive(Clone)]
pub struct PresenceTracker {
    records: Arc<RwLock<HashMap<String, PresenceRecord>>>,
    own: Arc<RwLock<OwnPresence>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            own: Arc::new(RwLock::new(OwnPresence {
                status: PresenceStatus::Online,
                status_text: None,
            })),
        }
    }

    /// Record an inbound presence event. Unknown contacts get a fresh record.
    pub async fn on_presence_event(&self, from: &str, update: PresenceUpdate) -> PresenceRecord {
        let record = PresenceRecord {
            status: update.status,
            status_text: update.status_text,
            updated_at: Utc::now(),
        };
        let contact = bare(from).to_string();
        debug!("Presence {} -> {}", contact, record.status);
        self.records.write().await.insert(contact, record.clone());
        record
    }

    /// `Unknown` until an event for `contact` arrives in this session.
    pub async fn lookup(&self, contact: &str) -> PresenceLookup {
        match self.records.read().await.get(bare(contact)) {
            Some(record) => PresenceLookup::Known(record.clone()),
            None => PresenceLookup::Unknown,
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, PresenceRecord> {
        self.records.read().await.clone()
    }

    /// Drop every record from the previous session.
    pub async fn begin_session(&self) {
        let mut records = self.records.write().await;
        if !records.is_empty() {
            debug!("Clearing {} presence records from previous session", records.len());
        }
        records.clear();
    }

    pub async fn own_status(&self) -> PresenceStatus {
        self.own.read().await.status
    }

    /// Change the local user's presence and announce it. Delivery is best-effort.
    pub async fn announce(
        &self,
        connection: &ConnectionHandle,
        status: PresenceStatus,
        status_text: Option<String>,
    ) {
        {
            let mut own = self.own.write().await;
            own.status = status;
            own.status_text = status_text.clone();
        }
        if let Err(e) = connection.send(Stanza::presence(status, status_text)).await {
            debug!("Presence announcement not sent: {}", e);
        }
    }

    /// Re-send the local presence on a new session unless it is the default the
    /// connection already announced.
    pub async fn reannounce(&self, connection: &ConnectionHandle) {
        let own = self.own.read().await.clone();
        if own.status == PresenceStatus::Online && own.status_text.is_none() {
            return;
        }
        if let Err(e) = connection
            .send(Stanza::presence(own.status, own.status_text))
            .await
        {
            debug!("Presence re-announcement not sent: {}", e);
        }
    }
}
