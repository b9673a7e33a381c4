//! Core abstractions for resilient messaging sessions.
//!
//! This crate provides the building blocks the session layer is made of:
//! - `ReconnectPolicy` - Backoff and stop/continue decisions
//! - `MetadataCache` / `MessageCache` - Time-bounded caches
//! - `RetryingSender` - Bounded retry for outbound sends
//! - `PairingCodeGenerator` - Random device-linking codes
//! - `EventHub` - Broadcast + history for session events
//! - Protocol engine and storage traits

pub mod cache;
pub mod config;
pub mod event_hub;
pub mod events;
pub mod pairing;
pub mod reconnect;
pub mod retry;
pub mod traits;
pub mod types;

pub use cache::{MessageCache, MetadataCache, TtlCache};
pub use config::{DurableMessages, SessionConfig};
pub use event_hub::EventHub;
pub use events::{DisconnectCause, DisconnectReason, RemoteEvent, SessionEvent};
pub use pairing::{PairingCodeGenerator, PairingError};
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use retry::{RetryingSender, SendFailure};
pub use traits::{Connection, ConnectionFactory, EngineError, SessionStore, StorageError};
pub use types::{ConnectionState, Credentials, GroupMetadata, Identity, MessageKey, WireMessage};
