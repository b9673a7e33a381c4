//! Events consumed from the protocol engine and events emitted to consumers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Credentials, Identity, Jid, MessagesUpsert};

/// Link state reported in a connection update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Close,
}

/// Well-known disconnect status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCode {
    /// The remote party logged this device out.
    LoggedOut,
    ConnectionClosed,
    /// Network drop or timed out query.
    ConnectionLost,
    /// Another client took over the session.
    ConnectionReplaced,
    MultideviceMismatch,
    Forbidden,
    BadSession,
    RestartRequired,
    UnavailableService,
    /// Any status the table below does not name.
    Other,
}

impl DisconnectCode {
    /// Map a protocol status code to a known disconnect code.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            401 => Self::LoggedOut,
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            411 => Self::MultideviceMismatch,
            403 => Self::Forbidden,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            503 => Self::UnavailableService,
            _ => Self::Other,
        }
    }
}

/// Why the remote connection closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReason {
    /// Protocol status code. Errors without one are reported as 500.
    pub status: u16,
    #[serde(default)]
    pub message: String,
}

impl DisconnectReason {
    /// Create a reason from a status code.
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The remote party logged the session out.
    #[must_use]
    pub fn logged_out() -> Self {
        Self::new(401, "logged out")
    }

    /// The link dropped without a protocol status.
    #[must_use]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(408, message)
    }

    /// Classified status code.
    #[must_use]
    pub const fn code(&self) -> DisconnectCode {
        DisconnectCode::from_status(self.status)
    }

    /// Terminal authentication failure: reconnecting cannot help.
    #[must_use]
    pub const fn is_logged_out(&self) -> bool {
        matches!(self.code(), DisconnectCode::LoggedOut)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "status {}", self.status)
        } else {
            write!(f, "status {}: {}", self.status, self.message)
        }
    }
}

/// Connection lifecycle update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<LinkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DisconnectReason>,
    /// QR or pairing payload to show to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    /// Update reporting an open link.
    #[must_use]
    pub fn open() -> Self {
        Self {
            connection: Some(LinkState::Open),
            ..Self::default()
        }
    }

    /// Update reporting a closed link.
    #[must_use]
    pub fn close(reason: DisconnectReason) -> Self {
        Self {
            connection: Some(LinkState::Close),
            last_disconnect: Some(reason),
            qr: None,
        }
    }
}

/// Partial update of a group (subject, settings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Jid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// Membership change in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantsUpdate {
    pub id: Jid,
    pub participants: Vec<Jid>,
    pub action: ParticipantAction,
}

/// Event delivered by the protocol engine, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    ConnectionUpdate(ConnectionUpdate),
    CredsUpdate(Credentials),
    GroupsUpdate(Vec<GroupUpdate>),
    GroupParticipantsUpdate(ParticipantsUpdate),
    MessagesUpsert(MessagesUpsert),
}

/// Why a session stopped for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum DisconnectCause {
    /// Remote logout. Credentials are no longer valid.
    LoggedOut,
    /// Reconnect attempts exceeded the configured maximum.
    Exhausted { attempts: u32 },
    /// The owner called `disconnect()`.
    Requested,
}

/// Event emitted to consumers of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The link is open.
    Connected(Option<Identity>),
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// The session reached its terminal state.
    Disconnected {
        cause: DisconnectCause,
        reason: Option<DisconnectReason>,
    },
    /// Messages arrived.
    MessagesUpsert(MessagesUpsert),
    /// QR/pairing payload for linking a device.
    PairingCode(String),
}

impl SessionEvent {
    /// Event name as exposed to consumers.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Disconnected { .. } => "disconnected",
            Self::MessagesUpsert(_) => "messages.upsert",
            Self::PairingCode(_) => "pairing.code",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logged_out_detection() {
        assert!(DisconnectReason::logged_out().is_logged_out());
        assert!(!DisconnectReason::connection_lost("reset").is_logged_out());
        assert!(!DisconnectReason::new(515, "restart").is_logged_out());
    }

    #[test]
    fn test_status_table() {
        assert_eq!(DisconnectCode::from_status(440), DisconnectCode::ConnectionReplaced);
        assert_eq!(DisconnectCode::from_status(515), DisconnectCode::RestartRequired);
        assert_eq!(DisconnectCode::from_status(999), DisconnectCode::Other);
    }

    #[test]
    fn test_event_names() {
        let ev = SessionEvent::Disconnected {
            cause: DisconnectCause::Requested,
            reason: None,
        };
        assert_eq!(ev.name(), "disconnected");
        assert_eq!(SessionEvent::Connected(None).name(), "connected");
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(DisconnectReason::new(428, "").to_string(), "status 428");
        assert_eq!(
            DisconnectReason::logged_out().to_string(),
            "status 401: logged out"
        );
    }
}
