/// Tradepost - realtime marketplace chat core
///
/// Connection lifecycle with backoff, presence tracking and per-conversation
/// message reconciliation over a durable store and a broadcast hub.

pub mod error;
pub mod config;
pub mod identity;
pub mod model;
pub mod realtime;
pub mod presence;
pub mod timeline;
pub mod typing;
pub mod viewport;
pub mod message_store;
pub mod remote_store;
pub mod reconciler;
pub mod client;
pub mod messenger_types;
pub mod messenger_api;

pub use client::ChatClient;
pub use config::{Config, HubConfig};
pub use error::{ChatError, Result};
pub use message_store::{DurableStore, SledStore};
pub use remote_store::RemoteStore;
