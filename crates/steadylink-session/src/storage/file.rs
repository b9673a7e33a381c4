//! File-backed session storage.
//!
//! Layout under the auth folder:
//! - `creds.json` - credential material
//! - `user.json` - authenticated identity snapshot
//! - `messages/<id>.json` - durable message snapshots

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use steadylink_core::{
    traits::{SessionStore, StorageError},
    types::{Credentials, Identity, MessageKey, WireMessage},
};
use tokio::io::AsyncWriteExt;

const CREDS_FILE: &str = "creds.json";
const USER_FILE: &str = "user.json";
const MESSAGES_DIR: &str = "messages";

/// Storage rooted at one session's auth folder.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Store rooted at `root`. Nothing is created until `prepare`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Auth folder this store writes to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn message_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        let valid = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(StorageError::InvalidKey(id.to_string()));
        }
        Ok(self.root.join(MESSAGES_DIR).join(format!("{id}.json")))
    }
}

/// Write pretty JSON through a temporary file and rename it into place.
async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn prepare(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.root.join(MESSAGES_DIR)).await?;
        Ok(())
    }

    async fn load_credentials(&self) -> Result<Option<Credentials>, StorageError> {
        read_json(&self.root.join(CREDS_FILE)).await
    }

    async fn save_credentials(&self, credentials: &Credentials) -> Result<(), StorageError> {
        write_json(&self.root.join(CREDS_FILE), credentials).await
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), StorageError> {
        write_json(&self.root.join(USER_FILE), identity).await
    }

    async fn save_message(&self, message: &WireMessage) -> Result<(), StorageError> {
        let path = self.message_path(&message.key.id)?;
        write_json(&path, message).await
    }

    async fn load_message(&self, key: &MessageKey) -> Result<Option<WireMessage>, StorageError> {
        let path = self.message_path(&key.id)?;
        read_json(&path).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn text_message(id: &str) -> WireMessage {
        WireMessage {
            key: MessageKey::new("62812@s.whatsapp.net", id),
            message: Some(json!({ "conversation": "persist me" })),
            push_name: Some("Ana".into()),
            message_timestamp: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("session"));
        store.prepare().await.unwrap();

        let creds = Credentials {
            registered: true,
            ..Credentials::default()
        };
        store.save_credentials(&creds).await.unwrap();
        store
            .save_identity(&Identity {
                id: "62812:1@s.whatsapp.net".into(),
                name: Some("Ana".into()),
                lid: None,
            })
            .await
            .unwrap();
        store.save_message(&text_message("3EB0AB")).await.unwrap();

        let root = store.root();
        assert!(root.join("creds.json").is_file());
        assert!(root.join("user.json").is_file());
        assert!(root.join("messages/3EB0AB.json").is_file());
        assert!(!root.join("creds.json.tmp").exists());

        let raw = std::fs::read_to_string(root.join("user.json")).unwrap();
        assert!(raw.contains("\n  \"id\""), "snapshots are pretty printed");
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.prepare().await.unwrap();
        assert!(store.load_credentials().await.unwrap().is_none());

        let msg = text_message("ABC_123");
        store.save_message(&msg).await.unwrap();

        let reopened = FileStore::new(dir.path());
        assert_eq!(reopened.load_message(&msg.key).await.unwrap(), Some(msg));
        assert!(
            reopened
                .load_message(&MessageKey::new("x@s.whatsapp.net", "MISSING"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.prepare().await.unwrap();

        let err = store.save_message(&text_message("../creds")).await;
        assert!(matches!(err, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::write(dir.path().join("creds.json"), b"{not json").unwrap();
        assert!(matches!(
            store.load_credentials().await,
            Err(StorageError::Serialization(_))
        ));
    }
}
