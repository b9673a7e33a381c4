//! Core traits for the protocol engine and session storage.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    events::{DisconnectReason, RemoteEvent},
    types::{
        Credentials, GroupMetadata, Identity, Jid, MessageKey, Presence, ProtocolVersion,
        SendOptions, WireMessage,
    },
};

/// Protocol engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection is not open")]
    NotConnected,
    #[error("Connection closed: {0}")]
    Closed(DisconnectReason),
    #[error("Request timed out")]
    Timeout,
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Engine error: {0}")]
    Other(String),
}

impl EngineError {
    /// Disconnect reason to report when this error ends a connection attempt.
    #[must_use]
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Closed(reason) => reason.clone(),
            Self::Rejected { status, message } => DisconnectReason::new(*status, message.clone()),
            other => DisconnectReason::new(500, other.to_string()),
        }
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
}

/// Server acknowledgement of a sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

/// Lookups the engine performs against the session's caches.
///
/// The engine calls these when it needs group metadata for encryption or
/// the original payload of a message a peer asked to be re-sent.
#[async_trait]
pub trait EngineLookups: Send + Sync {
    /// Group metadata, from cache when fresh.
    async fn group_metadata(&self, jid: &str) -> Option<GroupMetadata>;

    /// Original payload of a message.
    async fn message(&self, key: &MessageKey) -> Option<Value>;
}

/// Configuration handed to the engine for one connection.
#[derive(Clone)]
pub struct EngineConfig {
    pub version: ProtocolVersion,
    pub credentials: Credentials,
    pub mark_online_on_connect: bool,
    pub sync_full_history: bool,
    pub generate_high_quality_link_preview: bool,
    pub keep_alive_interval: Duration,
    pub default_query_timeout: Duration,
    pub retry_request_delay: Duration,
    pub max_msg_retry_count: u32,
    /// Conversations the engine should drop without emitting events.
    pub ignored_jids: Vec<Jid>,
    pub lookups: Arc<dyn EngineLookups>,
}

impl EngineConfig {
    /// Whether events for `jid` should be dropped.
    #[must_use]
    pub fn ignores(&self, jid: &str) -> bool {
        self.ignored_jids.iter().any(|ignored| ignored == jid)
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("version", &self.version)
            .field("registered", &self.credentials.registered)
            .field("mark_online_on_connect", &self.mark_online_on_connect)
            .field("sync_full_history", &self.sync_full_history)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("default_query_timeout", &self.default_query_timeout)
            .field("ignored_jids", &self.ignored_jids)
            .finish_non_exhaustive()
    }
}

/// An open engine connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a message to `jid`.
    async fn send_message(
        &self,
        jid: &str,
        content: &Value,
        options: &SendOptions,
    ) -> Result<SentMessage, EngineError>;

    /// Request a pairing code for `phone_number` using `code`.
    async fn request_pairing_code(&self, phone_number: &str, code: &str)
    -> Result<String, EngineError>;

    /// Advertise presence.
    async fn send_presence_update(&self, presence: Presence) -> Result<(), EngineError>;

    /// Fetch group metadata from the remote side.
    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, EngineError>;

    /// Transport-level keep-alive ping.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Whether the underlying transport is open.
    fn is_open(&self) -> bool;

    /// Authenticated account, once known.
    fn user(&self) -> Option<Identity>;

    /// Close the transport. Must be safe to call more than once.
    async fn close(&self);
}

/// A connection plus the ordered stream of its events.
pub struct EngineHandle {
    pub connection: Arc<dyn Connection>,
    /// Single-consumer event channel in remote delivery order.
    pub events: mpsc::Receiver<RemoteEvent>,
}

/// Opens engine connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Protocol version to advertise.
    async fn latest_version(&self) -> Result<ProtocolVersion, EngineError>;

    /// Open a new connection.
    async fn open(&self, config: EngineConfig) -> Result<EngineHandle, EngineError>;
}

/// Durable per-session storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Make sure the backing location exists.
    async fn prepare(&self) -> Result<(), StorageError>;

    /// Load stored credentials, if any.
    async fn load_credentials(&self) -> Result<Option<Credentials>, StorageError>;

    /// Persist credentials. Must be durable when this returns.
    async fn save_credentials(&self, credentials: &Credentials) -> Result<(), StorageError>;

    /// Persist a snapshot of the authenticated identity.
    async fn save_identity(&self, identity: &Identity) -> Result<(), StorageError>;

    /// Persist a message snapshot keyed by message id.
    async fn save_message(&self, message: &WireMessage) -> Result<(), StorageError>;

    /// Load a message snapshot.
    async fn load_message(&self, key: &MessageKey) -> Result<Option<WireMessage>, StorageError>;
}
