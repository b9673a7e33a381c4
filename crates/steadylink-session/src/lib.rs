//! Session orchestration and storage for steadylink.
//!
//! Provides:
//! - `SessionManager` - Keeps one messaging session connected
//! - `EventBridge` - Routes engine events into caches, storage and session events
//! - Storage implementations (memory, file)

pub mod bridge;
pub mod manager;
pub mod storage;
mod timers;

#[cfg(test)]
mod testing;

pub use bridge::{EventBridge, Lifecycle, PairingCallback};
pub use manager::{SessionError, SessionInfo, SessionManager, SessionManagerBuilder};
#[cfg(feature = "file")]
pub use storage::FileStore;
#[cfg(feature = "memory")]
pub use storage::MemoryStore;
