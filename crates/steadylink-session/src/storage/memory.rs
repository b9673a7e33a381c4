//! In-memory session storage.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use steadylink_core::{
    traits::{SessionStore, StorageError},
    types::{Credentials, Identity, MessageKey, WireMessage},
};

/// In-memory storage implementation.
///
/// Useful for tests and short-lived sessions.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    credentials: RwLock<Option<Credentials>>,
    identity: RwLock<Option<Identity>>,
    messages: RwLock<HashMap<String, WireMessage>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds credentials.
    #[must_use]
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: RwLock::new(Some(credentials)),
            ..Self::default()
        }
    }

    /// Last saved credentials.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last saved identity snapshot.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ids of all stored message snapshots.
    #[must_use]
    pub fn message_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn prepare(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_credentials(&self) -> Result<Option<Credentials>, StorageError> {
        Ok(self.credentials())
    }

    async fn save_credentials(&self, credentials: &Credentials) -> Result<(), StorageError> {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
        Ok(())
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), StorageError> {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
        Ok(())
    }

    async fn save_message(&self, message: &WireMessage) -> Result<(), StorageError> {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.key.id.clone(), message.clone());
        Ok(())
    }

    async fn load_message(&self, key: &MessageKey) -> Result<Option<WireMessage>, StorageError> {
        Ok(self
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_credentials_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load_credentials().await.unwrap().is_none());

        let creds = Credentials {
            registered: true,
            ..Credentials::default()
        };
        store.save_credentials(&creds).await.unwrap();
        assert_eq!(store.load_credentials().await.unwrap(), Some(creds));
    }

    #[tokio::test]
    async fn test_messages_keyed_by_id() {
        let store = MemoryStore::new();
        let msg = WireMessage {
            key: MessageKey::new("a@s.whatsapp.net", "ID1"),
            message: Some(json!({ "conversation": "hi" })),
            push_name: None,
            message_timestamp: Some(1_700_000_000),
        };
        store.save_message(&msg).await.unwrap();

        let loaded = store.load_message(&msg.key).await.unwrap();
        assert_eq!(loaded, Some(msg));
        assert_eq!(store.message_ids(), vec!["ID1".to_string()]);
        assert!(
            store
                .load_message(&MessageKey::new("a@s.whatsapp.net", "ID2"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
