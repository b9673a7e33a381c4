//! Background timers owned by a session.
//!
//! Every task handle is tracked here so a terminal transition can cancel
//! all of them.

use std::{sync::Arc, time::Duration};

use steadylink_core::{
    cache::{MessageCache, MetadataCache},
    traits::Connection,
    types::Presence,
};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

/// Handles of the tasks running for one session.
#[derive(Default)]
pub(crate) struct Timers {
    pub bridge: Option<JoinHandle<()>>,
    pub reconnect: Option<JoinHandle<()>>,
    pub keep_alive: Option<JoinHandle<()>>,
    pub presence: Option<JoinHandle<()>>,
    pub sweep: Option<JoinHandle<()>>,
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

impl Timers {
    /// Stop the timers bound to the current connection.
    pub fn cancel_heartbeats(&mut self) {
        abort(&mut self.keep_alive);
        abort(&mut self.presence);
    }

    /// Forget the bridge and reconnect handles without aborting them.
    ///
    /// Used when the caller is running inside one of those tasks.
    pub fn detach_tasks(&mut self) {
        self.bridge = None;
        self.reconnect = None;
    }

    /// Abort everything.
    pub fn cancel_all(&mut self) {
        abort(&mut self.bridge);
        abort(&mut self.reconnect);
        abort(&mut self.sweep);
        self.cancel_heartbeats();
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Ping the transport every `period` while it is open.
///
/// Returns `None` when `period` is zero (disabled).
pub(crate) fn spawn_keep_alive(
    connection: Arc<dyn Connection>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            if !connection.is_open() {
                continue;
            }
            if let Err(e) = connection.ping().await {
                tracing::debug!(error = %e, "Keep-alive ping failed");
            }
        }
    }))
}

/// Re-advertise `available` presence every `period` once logged in.
pub(crate) fn spawn_presence_refresh(
    connection: Arc<dyn Connection>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            if connection.user().is_none() {
                continue;
            }
            // Presence is advisory; the next tick tries again.
            if let Err(e) = connection.send_presence_update(Presence::Available).await {
                tracing::trace!(error = %e, "Presence refresh failed");
            }
        }
    }))
}

/// Reclaim expired cache entries every `period`.
pub(crate) fn spawn_cache_sweep(
    groups: Arc<MetadataCache>,
    messages: Arc<MessageCache>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            let (g, m) = (groups.sweep(), messages.sweep());
            if g + m > 0 {
                tracing::trace!(groups = g, messages = m, "Swept expired cache entries");
            }
        }
    }))
}
