//! Loopback demo: a session over an in-process engine that drops its first
//! connection and echoes every sent message back as an incoming one.
//!
//! Run with: cargo run -p loopback-demo [config.json]

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use steadylink_core::{
    SessionConfig,
    events::{ConnectionUpdate, DisconnectReason, RemoteEvent, SessionEvent},
    traits::{Connection, ConnectionFactory, EngineConfig, EngineError, EngineHandle, SentMessage},
    types::{
        ConnectionState, GroupMetadata, Identity, MessageKey, MessagesUpsert, Presence,
        ProtocolVersion, SendOptions, UpsertKind, WireMessage,
    },
};
use steadylink_session::SessionManager;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PEER: &str = "15550001111@s.whatsapp.net";

struct LoopbackConnection {
    events: mpsc::Sender<RemoteEvent>,
    user: Identity,
    sent: AtomicU32,
    open: Mutex<bool>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send_message(
        &self,
        jid: &str,
        content: &Value,
        _options: &SendOptions,
    ) -> Result<SentMessage, EngineError> {
        if !self.is_open() {
            return Err(EngineError::NotConnected);
        }
        let n = self.sent.fetch_add(1, Ordering::Relaxed);
        let key = MessageKey::new(jid, format!("LOOP{n:04}"));

        let echo = WireMessage {
            key: key.clone(),
            message: Some(content.clone()),
            push_name: Some("Loopback".into()),
            message_timestamp: None,
        };
        self.events
            .send(RemoteEvent::MessagesUpsert(MessagesUpsert {
                messages: vec![echo],
                kind: UpsertKind::Notify,
            }))
            .await
            .map_err(|_| EngineError::NotConnected)?;

        Ok(SentMessage {
            key: MessageKey { from_me: true, ..key },
            message: Some(content.clone()),
        })
    }

    async fn request_pairing_code(
        &self,
        _phone_number: &str,
        code: &str,
    ) -> Result<String, EngineError> {
        Ok(code.to_string())
    }

    async fn send_presence_update(&self, presence: Presence) -> Result<(), EngineError> {
        tracing::debug!(?presence, "Presence update");
        Ok(())
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, EngineError> {
        Ok(GroupMetadata {
            id: jid.to_string(),
            subject: "Loopback group".into(),
            owner: Some(self.user.id.clone()),
            creation: None,
            participants: Vec::new(),
        })
    }

    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user(&self) -> Option<Identity> {
        Some(self.user.clone())
    }

    async fn close(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Opens loopback connections. The first one is dropped after `drop_after`.
struct LoopbackFactory {
    opens: AtomicU32,
    drop_after: Duration,
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn latest_version(&self) -> Result<ProtocolVersion, EngineError> {
        Ok(ProtocolVersion([2, 3000, 1_015_901_307]))
    }

    async fn open(&self, config: EngineConfig) -> Result<EngineHandle, EngineError> {
        let n = self.opens.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection = n, ?config, "Opening loopback connection");

        let (tx, rx) = mpsc::channel(64);
        let connection = Arc::new(LoopbackConnection {
            events: tx.clone(),
            user: Identity {
                id: "15550000000:1@s.whatsapp.net".into(),
                name: Some("Demo".into()),
                lid: None,
            },
            sent: AtomicU32::new(0),
            open: Mutex::new(true),
        });

        let drop_after = (n == 0).then_some(self.drop_after);
        tokio::spawn(async move {
            let _ = tx
                .send(RemoteEvent::ConnectionUpdate(ConnectionUpdate::open()))
                .await;
            if let Some(delay) = drop_after {
                tokio::time::sleep(delay).await;
                let _ = tx
                    .send(RemoteEvent::ConnectionUpdate(ConnectionUpdate::close(
                        DisconnectReason::connection_lost("loopback link dropped"),
                    )))
                    .await;
            }
        });

        Ok(EngineHandle {
            connection,
            events: rx,
        })
    }
}

fn load_config() -> anyhow::Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => Ok(SessionConfig::from_json_file(path)?),
        None => Ok(SessionConfig {
            reconnect_interval_ms: 500,
            ..SessionConfig::new(std::env::temp_dir().join("steadylink-loopback"))
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,steadylink_session=debug".into()),
        )
        .init();

    let config = load_config()?;
    let factory = Arc::new(LoopbackFactory {
        opens: AtomicU32::new(0),
        drop_after: Duration::from_secs(1),
    });
    let manager = SessionManager::with_file_store(factory, config);
    tracing::info!(session_id = manager.id(), "Session created");

    let mut events = manager.events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match &event {
                SessionEvent::MessagesUpsert(upsert) => {
                    for message in &upsert.messages {
                        tracing::info!(
                            from = %message.key.remote_jid,
                            text = message.conversation().unwrap_or("<non-text>"),
                            "Incoming message"
                        );
                    }
                }
                other => tracing::info!(event = other.name(), ?other, "Session event"),
            }
        }
    });

    manager.connect().await?;

    // Wait for the reconnect that follows the scripted drop.
    let mut state = manager.watch_state();
    for want in [
        ConnectionState::Connected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
    ] {
        state.wait_for(|s| *s == want).await?;
    }

    let sent = manager
        .send_with_retry(PEER, &json!({ "conversation": "hello over loopback" }), None, None)
        .await?;
    tracing::info!(id = %sent.key.id, "Message acknowledged");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let echoed = MessageKey::new(PEER, sent.key.id.clone());
    tracing::info!(payload = ?manager.get_message(&echoed).await, "Cached echo");

    let info = manager.info().await;
    tracing::info!(?info, "Session info");

    manager.disconnect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    Ok(())
}
