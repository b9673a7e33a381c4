//! Domain types shared between the session layer and the protocol engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Session identifier.
pub type SessionId = String;

/// Protocol address of a participant or group.
pub type Jid = String;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and none requested.
    Disconnected,
    /// A connection attempt (initial or reconnect) is in flight or scheduled.
    Connecting,
    /// The remote side reported the link as open.
    Connected,
    /// An explicit shutdown is releasing the connection.
    Closing,
    /// Final state. The session will not reconnect.
    Terminated,
}

impl ConnectionState {
    /// Whether a new `connect()` call should be ignored in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Structural identity of a message: conversation plus message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Conversation the message belongs to.
    pub remote_jid: Jid,
    /// Message identifier, unique within the conversation.
    pub id: String,
    /// Whether this device sent the message.
    #[serde(default)]
    pub from_me: bool,
    /// Sender inside a group conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Jid>,
}

impl MessageKey {
    /// Create a key for a message received in `remote_jid`.
    #[must_use]
    pub fn new(remote_jid: impl Into<Jid>, id: impl Into<String>) -> Self {
        Self {
            remote_jid: remote_jid.into(),
            id: id.into(),
            from_me: false,
            participant: None,
        }
    }
}

/// A message as delivered by the protocol engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub key: MessageKey,
    /// Decoded message content. Absent for stubs and protocol messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    /// Unix epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<i64>,
}

impl WireMessage {
    /// Plain text body, if the message is a simple conversation message.
    #[must_use]
    pub fn conversation(&self) -> Option<&str> {
        self.message.as_ref()?.get("conversation")?.as_str()
    }
}

/// How a batch of upserted messages reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    /// New messages delivered live.
    Notify,
    /// Messages appended from history sync.
    Append,
}

/// Batch of messages reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesUpsert {
    pub messages: Vec<WireMessage>,
    #[serde(rename = "type")]
    pub kind: UpsertKind,
}

/// The authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<Jid>,
}

/// Durable authentication material.
///
/// Only the fields the session layer inspects are typed; everything else the
/// engine needs is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Whether the device finished pairing.
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Identity>,
    #[serde(flatten)]
    pub material: Map<String, Value>,
}

/// Group participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<String>,
}

/// Remote group metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: Jid,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Jid>,
    /// Unix epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<i64>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

/// Presence advertised to contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Available,
    Unavailable,
    Composing,
    Paused,
}

/// Per-send options passed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    /// Message to quote in the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted: Option<MessageKey>,
    /// Wait for the server acknowledgement before resolving.
    #[serde(default)]
    pub wait_for_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Engine-specific extras.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Protocol version advertised during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub [u32; 3]);

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [major, minor, patch] = self.0;
        write!(f, "{major}.{minor}.{patch}")
    }
}
