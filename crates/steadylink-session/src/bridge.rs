//! Bridges protocol engine events into caches, storage and session events.
//!
//! The bridge is the only place remote events mutate caches or trigger
//! persistence. It consumes one connection's event channel in delivery
//! order, finishing each event before taking the next.

use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use steadylink_core::{
    DurableMessages, EventHub,
    cache::{MessageCache, MetadataCache},
    events::{ConnectionUpdate, DisconnectReason, LinkState, RemoteEvent, SessionEvent},
    traits::{Connection, SessionStore},
    types::{Credentials, Identity, MessagesUpsert, Presence, SessionId},
};
use tokio::{sync::mpsc, task::JoinHandle};

/// Callback receiving QR/pairing payloads.
pub type PairingCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Session-level reactions to lifecycle events.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// The link opened. Returns `false` if the open is stale and should be
    /// ignored.
    async fn on_open(&self, identity: Option<Identity>) -> bool;

    /// The link closed.
    async fn on_close(&self, reason: DisconnectReason);

    /// Credentials changed and were persisted.
    async fn on_credentials(&self, credentials: Credentials);
}

/// Everything the bridge needs from its session.
pub struct BridgeContext {
    pub session_id: SessionId,
    pub connection: Arc<dyn Connection>,
    pub store: Arc<dyn SessionStore>,
    pub groups: Arc<MetadataCache>,
    pub messages: Arc<MessageCache>,
    pub hub: Arc<EventHub>,
    pub durable: DurableMessages,
    pub mark_online_on_connect: bool,
    pub pairing_callback: Option<PairingCallback>,
    pub lifecycle: Arc<dyn Lifecycle>,
    /// Incremented for every durable snapshot that failed.
    pub durable_failures: Arc<AtomicU64>,
}

/// Consumes one connection's event stream.
pub struct EventBridge {
    ctx: BridgeContext,
}

impl EventBridge {
    /// Bridge for one connection.
    #[must_use]
    pub const fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// Run the bridge on its own task.
    pub fn spawn(self, events: mpsc::Receiver<RemoteEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Process events until the connection closes.
    ///
    /// A channel that ends without a close event is reported as a lost
    /// connection.
    pub async fn run(self, mut events: mpsc::Receiver<RemoteEvent>) {
        while let Some(event) = events.recv().await {
            if self.handle(event).await.is_break() {
                return;
            }
        }
        tracing::debug!(
            session_id = %self.ctx.session_id,
            "Event stream ended without a close event"
        );
        self.ctx
            .lifecycle
            .on_close(DisconnectReason::connection_lost("event stream ended"))
            .await;
    }

    /// Handle a single event. Breaks once the connection has closed.
    pub async fn handle(&self, event: RemoteEvent) -> ControlFlow<()> {
        match event {
            RemoteEvent::ConnectionUpdate(update) => return self.on_connection_update(update).await,
            RemoteEvent::CredsUpdate(credentials) => self.on_credentials(credentials).await,
            RemoteEvent::GroupsUpdate(updates) => {
                for id in updates.into_iter().filter_map(|u| u.id) {
                    self.refresh_group(&id).await;
                }
            }
            RemoteEvent::GroupParticipantsUpdate(update) => {
                tracing::debug!(
                    jid = %update.id,
                    action = ?update.action,
                    count = update.participants.len(),
                    "Group membership changed"
                );
                self.refresh_group(&update.id).await;
            }
            RemoteEvent::MessagesUpsert(upsert) => self.on_messages(upsert).await,
        }
        ControlFlow::Continue(())
    }

    async fn on_connection_update(&self, update: ConnectionUpdate) -> ControlFlow<()> {
        let ctx = &self.ctx;

        if let Some(qr) = update.qr {
            match &ctx.pairing_callback {
                Some(callback) => callback(&qr),
                None => tracing::info!(session_id = %ctx.session_id, qr = %qr, "Pairing payload"),
            }
            ctx.hub.push(SessionEvent::PairingCode(qr));
        }

        match update.connection {
            Some(LinkState::Connecting) => {
                tracing::debug!(session_id = %ctx.session_id, "Engine connecting");
            }
            Some(LinkState::Open) => self.on_open().await,
            Some(LinkState::Close) => {
                let reason = update
                    .last_disconnect
                    .unwrap_or_else(|| DisconnectReason::new(500, "closed without reason"));
                ctx.lifecycle.on_close(reason).await;
                return ControlFlow::Break(());
            }
            None => {}
        }
        ControlFlow::Continue(())
    }

    async fn on_open(&self) {
        let ctx = &self.ctx;
        let identity = ctx.connection.user();
        if !ctx.lifecycle.on_open(identity.clone()).await {
            return;
        }

        if ctx.mark_online_on_connect {
            if let Err(e) = ctx.connection.send_presence_update(Presence::Available).await {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "Failed to mark online");
            }
        }

        if let Some(identity) = identity {
            if let Err(e) = ctx.store.save_identity(&identity).await {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    error = %e,
                    "Failed to persist identity snapshot"
                );
            }
        }
    }

    async fn on_credentials(&self, credentials: Credentials) {
        let ctx = &self.ctx;
        if let Err(e) = ctx.store.save_credentials(&credentials).await {
            tracing::error!(session_id = %ctx.session_id, error = %e, "Failed to persist credentials");
        }
        ctx.lifecycle.on_credentials(credentials).await;
    }

    /// Drop the cached entry, then try to load a fresh one.
    async fn refresh_group(&self, jid: &str) {
        let ctx = &self.ctx;
        ctx.groups.invalidate(jid);
        match ctx.connection.group_metadata(jid).await {
            Ok(metadata) => ctx.groups.set(jid, metadata),
            Err(e) => {
                tracing::debug!(jid, error = %e, "Group metadata refetch failed, loading lazily");
            }
        }
    }

    async fn on_messages(&self, upsert: MessagesUpsert) {
        let ctx = &self.ctx;
        for message in &upsert.messages {
            // A stub without payload could never serve a lookup.
            if let Some(payload) = &message.message {
                ctx.messages.set(message.key.clone(), payload.clone());
            }

            if ctx.durable.should_persist(message) {
                if let Err(e) = ctx.store.save_message(message).await {
                    ctx.durable_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        id = %message.key.id,
                        error = %e,
                        "Failed to persist message snapshot"
                    );
                }
            }
        }
        ctx.hub.push(SessionEvent::MessagesUpsert(upsert));
    }
}
