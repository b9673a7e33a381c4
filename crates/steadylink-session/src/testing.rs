//! In-process fakes of the protocol engine and storage.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use steadylink_core::{
    events::{ConnectionUpdate, RemoteEvent},
    traits::{
        Connection, ConnectionFactory, EngineConfig, EngineError, EngineHandle, SentMessage,
        SessionStore, StorageError,
    },
    types::{
        Credentials, GroupMetadata, Identity, MessageKey, Presence, ProtocolVersion, SendOptions,
        WireMessage,
    },
};
use tokio::sync::{Notify, mpsc};

type GroupTable = Arc<Mutex<HashMap<String, GroupMetadata>>>;

/// Decrement `counter` if it is positive. Returns whether it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn group(id: &str, subject: &str) -> GroupMetadata {
    GroupMetadata {
        id: id.to_string(),
        subject: subject.to_string(),
        owner: None,
        creation: None,
        participants: Vec::new(),
    }
}

/// Scripted connection recording everything asked of it.
#[derive(Default)]
pub struct FakeConnection {
    groups: GroupTable,
    user: Mutex<Option<Identity>>,
    closed: AtomicBool,
    failing_sends: AtomicU32,
    send_attempts: AtomicU32,
    last_send_options: Mutex<Option<SendOptions>>,
    pairing_requests: Mutex<Vec<(String, String)>>,
    presences: Mutex<Vec<Presence>>,
    group_fetches: AtomicU32,
    /// Holds the next group fetch after it read the table.
    group_gate: Mutex<Option<Arc<Notify>>>,
    pings: AtomicU32,
}

impl FakeConnection {
    fn with_groups(groups: GroupTable, user: Option<Identity>) -> Self {
        Self {
            groups,
            user: Mutex::new(user),
            ..Self::default()
        }
    }

    pub fn set_user(&self, user: Option<Identity>) {
        *self.user.lock().unwrap() = user;
    }

    pub fn put_group(&self, metadata: GroupMetadata) {
        self.groups
            .lock()
            .unwrap()
            .insert(metadata.id.clone(), metadata);
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn last_send_options(&self) -> Option<SendOptions> {
        self.last_send_options.lock().unwrap().clone()
    }

    pub fn pairing_requests(&self) -> Vec<(String, String)> {
        self.pairing_requests.lock().unwrap().clone()
    }

    pub fn presences(&self) -> Vec<Presence> {
        self.presences.lock().unwrap().clone()
    }

    /// Make the next group fetch wait until the returned gate is notified.
    pub fn gate_next_group_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.group_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn group_fetches(&self) -> u32 {
        self.group_fetches.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send_message(
        &self,
        jid: &str,
        content: &Value,
        options: &SendOptions,
    ) -> Result<SentMessage, EngineError> {
        let n = self.send_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_send_options.lock().unwrap() = Some(options.clone());
        if take_one(&self.failing_sends) {
            return Err(EngineError::Other("send failed".into()));
        }
        Ok(SentMessage {
            key: MessageKey {
                from_me: true,
                ..MessageKey::new(jid, format!("FAKE{n}"))
            },
            message: Some(content.clone()),
        })
    }

    async fn request_pairing_code(
        &self,
        phone_number: &str,
        code: &str,
    ) -> Result<String, EngineError> {
        self.pairing_requests
            .lock()
            .unwrap()
            .push((phone_number.to_string(), code.to_string()));
        Ok(code.to_string())
    }

    async fn send_presence_update(&self, presence: Presence) -> Result<(), EngineError> {
        self.presences.lock().unwrap().push(presence);
        Ok(())
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, EngineError> {
        let found = self.groups.lock().unwrap().get(jid).cloned();
        self.group_fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.group_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        found.ok_or_else(|| EngineError::Rejected {
            status: 404,
            message: format!("unknown group {jid}"),
        })
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn user(&self) -> Option<Identity> {
        self.user.lock().unwrap().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FactoryState {
    auto_open: bool,
    failing_opens: AtomicU32,
    opens: AtomicU32,
    groups: GroupTable,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    senders: Mutex<Vec<mpsc::Sender<RemoteEvent>>>,
    configs: Mutex<Vec<EngineConfig>>,
}

/// Engine fake handing out [`FakeConnection`]s.
#[derive(Clone)]
pub struct FakeFactory {
    state: Arc<FactoryState>,
}

impl FakeFactory {
    /// Every connection reports `open` as its first event.
    pub fn auto_open() -> Self {
        Self {
            state: Arc::new(FactoryState {
                auto_open: true,
                ..FactoryState::default()
            }),
        }
    }

    /// Connections stay in `connecting` until an event is pushed.
    pub fn manual() -> Self {
        Self {
            state: Arc::new(FactoryState::default()),
        }
    }

    /// Make the next `n` calls to `open` fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Calls to `open`, failed ones included.
    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn connection(&self, index: usize) -> Option<Arc<FakeConnection>> {
        self.state.connections.lock().unwrap().get(index).cloned()
    }

    pub fn last_config(&self) -> Option<EngineConfig> {
        self.state.configs.lock().unwrap().last().cloned()
    }

    pub fn put_group(&self, metadata: GroupMetadata) {
        self.state
            .groups
            .lock()
            .unwrap()
            .insert(metadata.id.clone(), metadata);
    }

    pub fn remove_group(&self, jid: &str) {
        self.state.groups.lock().unwrap().remove(jid);
    }

    /// Deliver `event` on the most recently opened connection.
    pub async fn push(&self, event: RemoteEvent) {
        let sender = self.state.senders.lock().unwrap().last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn latest_version(&self) -> Result<ProtocolVersion, EngineError> {
        Ok(ProtocolVersion([2, 3000, 1_015_901_307]))
    }

    async fn open(&self, config: EngineConfig) -> Result<EngineHandle, EngineError> {
        let state = &self.state;
        state.opens.fetch_add(1, Ordering::SeqCst);
        state.configs.lock().unwrap().push(config);
        if take_one(&state.failing_opens) {
            return Err(EngineError::Other("connection refused".into()));
        }

        let user = state.auto_open.then(|| Identity {
            id: "62812345678:1@s.whatsapp.net".into(),
            name: Some("Fake".into()),
            lid: None,
        });
        let connection = Arc::new(FakeConnection::with_groups(Arc::clone(&state.groups), user));
        let (tx, rx) = mpsc::channel(64);
        if state.auto_open {
            let _ = tx.try_send(RemoteEvent::ConnectionUpdate(ConnectionUpdate::open()));
        }
        state
            .connections
            .lock()
            .unwrap()
            .push(Arc::clone(&connection));
        state.senders.lock().unwrap().push(tx);

        Ok(EngineHandle {
            connection,
            events: rx,
        })
    }
}

/// Store whose message snapshots always fail.
#[derive(Default)]
pub struct FailingStore;

#[async_trait]
impl SessionStore for FailingStore {
    async fn prepare(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_credentials(&self) -> Result<Option<Credentials>, StorageError> {
        Ok(None)
    }

    async fn save_credentials(&self, _credentials: &Credentials) -> Result<(), StorageError> {
        Ok(())
    }

    async fn save_identity(&self, _identity: &Identity) -> Result<(), StorageError> {
        Ok(())
    }

    async fn save_message(&self, _message: &WireMessage) -> Result<(), StorageError> {
        Err(StorageError::Io(std::io::Error::other("disk full")))
    }

    async fn load_message(&self, _key: &MessageKey) -> Result<Option<WireMessage>, StorageError> {
        Ok(None)
    }
}
