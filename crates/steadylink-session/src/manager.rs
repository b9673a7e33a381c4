//! Session manager: owns one logical session and keeps it connected.

use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use steadylink_core::{
    EventHub, SessionConfig,
    cache::{MessageCache, MetadataCache},
    events::{DisconnectCause, DisconnectReason, SessionEvent},
    pairing::{PairingCodeGenerator, PairingError, normalize_custom_code, normalize_phone},
    reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState},
    retry::{DEFAULT_MAX_RETRIES, RetryingSender, SendFailure},
    traits::{
        Connection, ConnectionFactory, EngineConfig, EngineError, EngineLookups, SentMessage,
        SessionStore, StorageError,
    },
    types::{
        ConnectionState, Credentials, GroupMetadata, Identity, MessageKey, Presence,
        ProtocolVersion, SendOptions, SessionId,
    },
};
use tokio::sync::{Mutex, broadcast, watch};
use uuid::Uuid;

use crate::{
    bridge::{BridgeContext, EventBridge, Lifecycle, PairingCallback},
    timers::{self, Timers},
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Connection(#[from] EngineError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Session was logged out by the remote party")]
    TerminalAuth,
    #[error("Reconnect attempts exhausted after {attempts} attempt(s)")]
    ReconnectExhausted { attempts: u32 },
    #[error("Session is terminated")]
    Terminated,
}

impl SessionError {
    fn from_cause(cause: Option<&DisconnectCause>) -> Self {
        match cause {
            Some(DisconnectCause::LoggedOut) => Self::TerminalAuth,
            Some(DisconnectCause::Exhausted { attempts }) => Self::ReconnectExhausted {
                attempts: *attempts,
            },
            Some(DisconnectCause::Requested) | None => Self::Terminated,
        }
    }

    /// Close reason to feed the reconnect policy when an attempt fails.
    fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Connection(e) => e.disconnect_reason(),
            Self::TerminalAuth => DisconnectReason::logged_out(),
            other => DisconnectReason::new(500, other.to_string()),
        }
    }
}

/// Snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub auth_folder: PathBuf,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

/// Mutable session state. Never held across network or storage awaits.
struct Inner {
    /// Bumped for every connection attempt and shutdown.
    epoch: u64,
    connection: Option<Arc<dyn Connection>>,
    credentials: Credentials,
    reconnect: ReconnectState,
    timers: Timers,
    terminal_cause: Option<DisconnectCause>,
}

pub(crate) struct Shared {
    id: SessionId,
    config: SessionConfig,
    factory: Arc<dyn ConnectionFactory>,
    store: Arc<dyn SessionStore>,
    policy: ReconnectPolicy,
    sender: RetryingSender,
    pairing_codes: PairingCodeGenerator,
    groups: Arc<MetadataCache>,
    messages: Arc<MessageCache>,
    hub: Arc<EventHub>,
    pairing_callback: Option<PairingCallback>,
    durable_failures: Arc<AtomicU64>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    factory: Arc<dyn ConnectionFactory>,
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    pairing_callback: Option<PairingCallback>,
}

impl SessionManagerBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive QR/pairing payloads instead of having them logged.
    #[must_use]
    pub fn pairing_callback(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.pairing_callback = Some(Arc::new(callback));
        self
    }

    /// Build the manager. No connection is made until `connect`.
    #[must_use]
    pub fn build(self) -> SessionManager {
        let config = self.config;
        let id = config
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session_{}", Uuid::new_v4().simple()));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Shared {
            id,
            policy: config.reconnect_policy(),
            sender: config.retrying_sender(),
            pairing_codes: PairingCodeGenerator::new(),
            groups: Arc::new(config.metadata_cache()),
            messages: Arc::new(config.message_cache()),
            hub: Arc::new(EventHub::new()),
            pairing_callback: self.pairing_callback,
            durable_failures: Arc::new(AtomicU64::new(0)),
            factory: self.factory,
            store: self.store,
            state,
            inner: Mutex::new(Inner {
                epoch: 0,
                connection: None,
                credentials: Credentials::default(),
                reconnect: ReconnectState::default(),
                timers: Timers::default(),
                terminal_cause: None,
            }),
            config,
        };
        SessionManager {
            shared: Arc::new(shared),
        }
    }
}

/// Keeps one authenticated session alive across network failures.
///
/// Cloning yields another handle to the same session. Dropping the last
/// handle cancels every timer the session started.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Start building a manager over an engine and a store.
    #[must_use]
    pub fn builder(
        factory: Arc<dyn ConnectionFactory>,
        store: Arc<dyn SessionStore>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            factory,
            store,
            config: SessionConfig::default(),
            pairing_callback: None,
        }
    }

    /// Manager persisting to a [`crate::storage::FileStore`] in the auth folder.
    #[cfg(feature = "file")]
    #[must_use]
    pub fn with_file_store(factory: Arc<dyn ConnectionFactory>, config: SessionConfig) -> Self {
        let store = Arc::new(crate::storage::FileStore::new(config.auth_folder.clone()));
        Self::builder(factory, store).config(config).build()
    }

    /// Session id, configured or generated.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Live session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.hub.subscribe()
    }

    /// Recent session events followed by live ones.
    #[must_use]
    pub fn events(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        self.shared.hub.history_plus_stream()
    }

    /// Snapshot of id, auth folder, state and reconnect attempts.
    pub async fn info(&self) -> SessionInfo {
        let inner = self.shared.inner.lock().await;
        SessionInfo {
            id: self.shared.id.clone(),
            auth_folder: self.shared.config.auth_folder.clone(),
            state: self.shared.state(),
            reconnect_attempts: inner.reconnect.attempts(),
        }
    }

    /// Group metadata cache owned by this session.
    #[must_use]
    pub fn group_cache(&self) -> &MetadataCache {
        &self.shared.groups
    }

    /// Recent message payload cache owned by this session.
    #[must_use]
    pub fn message_cache(&self) -> &MessageCache {
        &self.shared.messages
    }

    /// Number of durable message snapshots that failed to write.
    #[must_use]
    pub fn durable_failures(&self) -> u64 {
        self.shared.durable_failures.load(Ordering::Relaxed)
    }

    /// Establish the connection.
    ///
    /// Does nothing while a connection is already being established or is
    /// open. A failed initial attempt is returned to the caller and leaves
    /// the session `Disconnected`.
    ///
    /// # Errors
    /// Returns error if the session is terminated or the attempt fails.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let epoch = {
            let mut inner = shared.inner.lock().await;
            match shared.state() {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    tracing::debug!(session_id = %shared.id, "Already connecting, ignoring connect()");
                    return Ok(());
                }
                ConnectionState::Closing | ConnectionState::Terminated => {
                    return Err(SessionError::from_cause(inner.terminal_cause.as_ref()));
                }
                ConnectionState::Disconnected => {}
            }
            inner.epoch += 1;
            shared.set_state(ConnectionState::Connecting);
            inner.epoch
        };

        if let Err(e) = shared.establish(epoch).await {
            let inner = shared.inner.lock().await;
            if inner.epoch == epoch && shared.state() == ConnectionState::Connecting {
                shared.set_state(ConnectionState::Disconnected);
            }
            tracing::error!(session_id = %shared.id, error = %e, "Connection failed");
            return Err(e);
        }
        Ok(())
    }

    /// Request a pairing code to link this session to `phone_number`.
    ///
    /// Uses `custom_code` when given, otherwise a random 8 character code.
    ///
    /// # Errors
    /// Returns [`PairingError::AlreadyRegistered`] if the credentials are
    /// already registered, or an error if the request fails.
    pub async fn request_pairing(
        &self,
        phone_number: &str,
        custom_code: Option<&str>,
    ) -> Result<String, PairingError> {
        let (connection, registered) = {
            let inner = self.shared.inner.lock().await;
            (inner.connection.clone(), inner.credentials.registered)
        };
        if registered {
            tracing::info!(session_id = %self.shared.id, "Already registered, not pairing");
            return Err(PairingError::AlreadyRegistered);
        }
        let connection = connection.ok_or(PairingError::NotConnected)?;

        let phone = normalize_phone(phone_number)?;
        let code = match custom_code {
            Some(code) => normalize_custom_code(code)?,
            None => self.shared.pairing_codes.generate(),
        };

        connection
            .request_pairing_code(&phone, &code)
            .await
            .map_err(|e| {
                tracing::error!(session_id = %self.shared.id, error = %e, "Pairing request failed");
                PairingError::Request(e)
            })
    }

    /// Send with bounded retry and exponential backoff.
    ///
    /// Each attempt uses whichever connection is current at that moment and
    /// waits for the server acknowledgement. `max_retries` defaults to 3.
    ///
    /// # Errors
    /// Returns [`SendFailure`] with the attempt count once every attempt failed.
    pub async fn send_with_retry(
        &self,
        jid: &str,
        content: &Value,
        options: Option<SendOptions>,
        max_retries: Option<u32>,
    ) -> Result<SentMessage, SendFailure> {
        let shared = &self.shared;
        let timeout = Duration::from_millis(shared.config.send_timeout_ms);
        let options = SendOptions {
            wait_for_ack: true,
            timeout_ms: Some(shared.config.send_timeout_ms),
            ..options.unwrap_or_default()
        };
        let options = &options;

        shared
            .sender
            .run(max_retries.unwrap_or(DEFAULT_MAX_RETRIES), move |_| async move {
                let connection = shared
                    .current_connection()
                    .await
                    .ok_or(EngineError::NotConnected)?;
                tokio::time::timeout(timeout, connection.send_message(jid, content, options))
                    .await
                    .map_err(|_| EngineError::Timeout)?
            })
            .await
    }

    /// Send once on the current connection.
    ///
    /// # Errors
    /// Returns error if there is no connection or the engine rejects the send.
    pub async fn send_message(
        &self,
        jid: &str,
        content: &Value,
        options: &SendOptions,
    ) -> Result<SentMessage, EngineError> {
        self.shared
            .require_connection()
            .await?
            .send_message(jid, content, options)
            .await
    }

    /// Group metadata, served from cache while fresh.
    ///
    /// # Errors
    /// Returns error on a cache miss when the remote fetch fails.
    pub async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, EngineError> {
        self.shared.group_metadata(jid).await
    }

    /// Advertise presence on the current connection.
    ///
    /// # Errors
    /// Returns error if there is no connection or the update fails.
    pub async fn send_presence_update(&self, presence: Presence) -> Result<(), EngineError> {
        self.shared
            .require_connection()
            .await?
            .send_presence_update(presence)
            .await
    }

    /// Authenticated account of the current connection.
    pub async fn user(&self) -> Option<Identity> {
        self.shared.current_connection().await?.user()
    }

    /// Payload of a recent message: cache first, then the durable snapshot.
    pub async fn get_message(&self, key: &MessageKey) -> Option<Value> {
        self.shared.message(key).await
    }

    /// Close the session for good.
    ///
    /// Cancels every timer, releases the connection and moves to
    /// `Terminated`. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let connection = {
            let mut inner = shared.inner.lock().await;
            if matches!(
                shared.state(),
                ConnectionState::Closing | ConnectionState::Terminated
            ) {
                return;
            }
            inner.epoch += 1;
            shared.set_state(ConnectionState::Closing);
            inner.timers.cancel_all();
            inner.connection.take()
        };

        if let Some(connection) = connection {
            connection.close().await;
        }

        let mut inner = shared.inner.lock().await;
        inner.terminal_cause = Some(DisconnectCause::Requested);
        shared.set_state(ConnectionState::Terminated);
        drop(inner);

        tracing::info!(session_id = %shared.id, "Session disconnected");
        shared.hub.push(SessionEvent::Disconnected {
            cause: DisconnectCause::Requested,
            reason: None,
        });
    }

    /// Same as [`Self::disconnect`].
    pub async fn cleanup(&self) {
        self.disconnect().await;
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(session_id = %self.id, from = ?previous, to = ?state, "State change");
        }
    }

    async fn current_connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.lock().await.connection.clone()
    }

    async fn require_connection(&self) -> Result<Arc<dyn Connection>, EngineError> {
        self.current_connection()
            .await
            .ok_or(EngineError::NotConnected)
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, EngineError> {
        if let Some(metadata) = self.groups.get(jid) {
            return Ok(metadata);
        }
        let generation = self.groups.generation(jid);
        let metadata = self.require_connection().await?.group_metadata(jid).await?;
        if !self.groups.set_if_unchanged(jid, generation, metadata.clone()) {
            tracing::debug!(jid, "Group changed during fetch, not caching the result");
        }
        Ok(metadata)
    }

    async fn message(&self, key: &MessageKey) -> Option<Value> {
        if let Some(payload) = self.messages.get(key) {
            return Some(payload);
        }
        match self.store.load_message(key).await {
            // Snapshots are stored by message id alone.
            Ok(Some(stored))
                if stored.key.remote_jid == key.remote_jid && stored.key.id == key.id =>
            {
                let payload = stored.message?;
                self.messages.set(key.clone(), payload.clone());
                Some(payload)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(id = %key.id, error = %e, "Failed to load message snapshot");
                None
            }
        }
    }

    fn engine_config(
        self: &Arc<Self>,
        version: ProtocolVersion,
        credentials: Credentials,
    ) -> EngineConfig {
        EngineConfig {
            version,
            credentials,
            mark_online_on_connect: self.config.mark_online_on_connect,
            sync_full_history: self.config.sync_full_history,
            generate_high_quality_link_preview: true,
            keep_alive_interval: self.config.keep_alive_interval(),
            default_query_timeout: self.config.default_query_timeout(),
            retry_request_delay: Duration::from_secs(1),
            max_msg_retry_count: 5,
            ignored_jids: self.config.ignored_jids.clone(),
            lookups: Arc::new(SessionLookups {
                shared: Arc::downgrade(self),
            }),
        }
    }

    /// Open a connection for attempt `epoch` and wire it up.
    async fn establish(self: &Arc<Self>, epoch: u64) -> Result<(), SessionError> {
        let version = self.factory.latest_version().await?;
        tracing::info!(session_id = %self.id, %version, "Connecting");

        self.store.prepare().await?;
        let credentials = self.store.load_credentials().await?.unwrap_or_default();
        let handle = self
            .factory
            .open(self.engine_config(version, credentials.clone()))
            .await?;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || self.state() != ConnectionState::Connecting {
            drop(inner);
            tracing::debug!(session_id = %self.id, "Discarding connection of a stale attempt");
            handle.connection.close().await;
            return Err(SessionError::Terminated);
        }

        let connection = handle.connection;
        inner.connection = Some(Arc::clone(&connection));
        inner.credentials = credentials;

        inner.timers.cancel_heartbeats();
        inner.timers.bridge = Some(
            EventBridge::new(BridgeContext {
                session_id: self.id.clone(),
                connection: Arc::clone(&connection),
                store: Arc::clone(&self.store),
                groups: Arc::clone(&self.groups),
                messages: Arc::clone(&self.messages),
                hub: Arc::clone(&self.hub),
                durable: self.config.durable_messages,
                mark_online_on_connect: self.config.mark_online_on_connect,
                pairing_callback: self.pairing_callback.clone(),
                lifecycle: Arc::new(EpochLifecycle {
                    shared: Arc::downgrade(self),
                    epoch,
                }),
                durable_failures: Arc::clone(&self.durable_failures),
            })
            .spawn(handle.events),
        );
        inner.timers.keep_alive =
            timers::spawn_keep_alive(Arc::clone(&connection), self.config.keep_alive_interval());
        inner.timers.presence = timers::spawn_presence_refresh(
            connection,
            self.config.presence_refresh_interval(),
        );
        if inner.timers.sweep.is_none() {
            inner.timers.sweep = timers::spawn_cache_sweep(
                Arc::clone(&self.groups),
                Arc::clone(&self.messages),
                self.config.cache_sweep_interval(),
            );
        }
        Ok(())
    }

    async fn handle_open(&self, epoch: u64, identity: Option<Identity>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || self.state() != ConnectionState::Connecting {
            return false;
        }
        inner.reconnect.reset();
        self.set_state(ConnectionState::Connected);
        drop(inner);

        tracing::info!(
            session_id = %self.id,
            user = identity.as_ref().map_or("unknown", |i| i.id.as_str()),
            "Connected"
        );
        self.hub.push(SessionEvent::Connected(identity));
        true
    }

    async fn handle_credentials(&self, credentials: Credentials) {
        let mut inner = self.inner.lock().await;
        if self.state() != ConnectionState::Terminated {
            inner.credentials = credentials;
        }
    }

    /// React to the connection of attempt `epoch` closing.
    async fn handle_close(self: &Arc<Self>, epoch: u64, reason: DisconnectReason) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || !self.state().is_active() {
            tracing::debug!(session_id = %self.id, %reason, "Ignoring close of a stale connection");
            return;
        }

        // The caller is the bridge or the reconnect timer of this epoch.
        inner.timers.detach_tasks();
        inner.timers.cancel_heartbeats();
        let connection = inner.connection.take();

        let attempt = inner.reconnect.next_attempt();
        match self.policy.decide(&reason, attempt) {
            ReconnectDecision::Retry { attempt, delay } => {
                inner.reconnect.record(attempt, delay);
                inner.epoch += 1;
                let next_epoch = inner.epoch;
                self.set_state(ConnectionState::Connecting);
                inner.timers.reconnect = Some(self.schedule_reconnect(next_epoch, delay));
                drop(inner);

                tracing::warn!(
                    session_id = %self.id,
                    attempt,
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %reason,
                    "Connection closed, reconnecting"
                );
                self.hub.push(SessionEvent::Reconnecting { attempt, delay });
            }
            ReconnectDecision::Stop(cause) => {
                inner.epoch += 1;
                inner.timers.cancel_all();
                inner.terminal_cause = Some(cause.clone());
                self.set_state(ConnectionState::Terminated);
                drop(inner);

                tracing::error!(session_id = %self.id, %reason, ?cause, "Connection closed permanently");
                self.hub.push(SessionEvent::Disconnected {
                    cause,
                    reason: Some(reason),
                });
            }
        }

        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, epoch: u64, delay: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.reconnect(epoch).await;
            }
        })
    }

    async fn reconnect(self: &Arc<Self>, epoch: u64) {
        {
            let inner = self.inner.lock().await;
            if inner.epoch != epoch || self.state() != ConnectionState::Connecting {
                tracing::debug!(session_id = %self.id, "Reconnect timer fired for a finished attempt");
                return;
            }
        }

        match self.establish(epoch).await {
            Ok(()) | Err(SessionError::Terminated) => {}
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Reconnect attempt failed");
                self.handle_close(epoch, e.disconnect_reason()).await;
            }
        }
    }
}

/// Lifecycle hooks bound to one connection attempt.
struct EpochLifecycle {
    shared: Weak<Shared>,
    epoch: u64,
}

#[async_trait]
impl Lifecycle for EpochLifecycle {
    async fn on_open(&self, identity: Option<Identity>) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.handle_open(self.epoch, identity).await,
            None => false,
        }
    }

    async fn on_close(&self, reason: DisconnectReason) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_close(self.epoch, reason).await;
        }
    }

    async fn on_credentials(&self, credentials: Credentials) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_credentials(credentials).await;
        }
    }
}

/// Cache lookups handed to the engine.
struct SessionLookups {
    shared: Weak<Shared>,
}

#[async_trait]
impl EngineLookups for SessionLookups {
    async fn group_metadata(&self, jid: &str) -> Option<GroupMetadata> {
        let shared = self.shared.upgrade()?;
        shared.group_metadata(jid).await.ok()
    }

    async fn message(&self, key: &MessageKey) -> Option<Value> {
        let shared = self.shared.upgrade()?;
        shared.message(key).await
    }
}
