//! Broadcast + history hub for session events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::events::SessionEvent;

/// Default number of events kept for late subscribers.
const HISTORY_LEN: usize = 256;

/// Event hub with broadcast and history support.
///
/// A consumer that subscribes after the session connected still sees the
/// `Connected` event: history first, then live updates.
pub struct EventHub {
    history: RwLock<VecDeque<SessionEvent>>,
    capacity: usize,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create a hub with the default history length.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HISTORY_LEN)
    }

    /// Create a hub that remembers the last `capacity` events.
    #[must_use]
    pub fn with_history(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Push an event to live subscribers and history.
    pub fn push(&self, event: SessionEvent) {
        tracing::trace!(event = event.name(), "Session event");
        let _ = self.sender.send(event.clone()); // no subscribers is fine

        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Receiver for live events only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    ///
    /// Events dropped because a slow consumer lagged are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Event subscriber lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}
