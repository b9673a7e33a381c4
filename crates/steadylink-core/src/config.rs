//! Session configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cache::{MessageCache, MetadataCache},
    reconnect::ReconnectPolicy,
    retry::RetryingSender,
    types::{Jid, WireMessage},
};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which upserted messages get a durable snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurableMessages {
    /// Never snapshot.
    Off,
    /// Plain text conversation messages only.
    #[default]
    PlainText,
    /// Every message with a payload.
    All,
}

impl DurableMessages {
    /// Whether `message` gets a durable snapshot.
    #[must_use]
    pub fn should_persist(self, message: &WireMessage) -> bool {
        match self {
            Self::Off => false,
            Self::PlainText => message.conversation().is_some(),
            Self::All => message.message.is_some(),
        }
    }
}

/// Configuration for one session.
///
/// Every field has a default, so a config file only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Session identifier used in logs. Generated when absent.
    pub session_id: Option<String>,
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub reconnect_interval_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub reconnect_growth: f64,
    /// Directory holding credentials and snapshots.
    pub auth_folder: PathBuf,
    pub mark_online_on_connect: bool,
    pub sync_full_history: bool,
    pub keep_alive_interval_ms: u64,
    pub presence_refresh_interval_ms: u64,
    pub default_query_timeout_ms: u64,
    pub group_cache_ttl_secs: u64,
    pub message_cache_ttl_secs: u64,
    pub message_cache_max_entries: usize,
    pub cache_sweep_interval_secs: u64,
    pub send_retry_base_ms: u64,
    /// Cap for a single send-retry delay. Uncapped when absent.
    pub send_retry_max_delay_ms: Option<u64>,
    pub send_timeout_ms: u64,
    pub durable_messages: DurableMessages,
    pub ignored_jids: Vec<Jid>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            max_reconnect_attempts: 50,
            reconnect_interval_ms: 3000,
            max_reconnect_delay_ms: 30_000,
            reconnect_growth: 1.5,
            auth_folder: PathBuf::from("steadylink-session"),
            mark_online_on_connect: false,
            sync_full_history: true,
            keep_alive_interval_ms: 25_000,
            presence_refresh_interval_ms: 60_000,
            default_query_timeout_ms: 10_000,
            group_cache_ttl_secs: 5 * 60,
            message_cache_ttl_secs: 60,
            message_cache_max_entries: 1000,
            cache_sweep_interval_secs: 60,
            send_retry_base_ms: 1000,
            send_retry_max_delay_ms: None,
            send_timeout_ms: 10_000,
            durable_messages: DurableMessages::default(),
            ignored_jids: vec!["status@broadcast".to_string()],
        }
    }
}

impl SessionConfig {
    /// Config with a specific auth folder and defaults otherwise.
    #[must_use]
    pub fn new(auth_folder: impl Into<PathBuf>) -> Self {
        Self {
            auth_folder: auth_folder.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or has wrongly typed fields.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Reconnect policy built from the reconnect fields.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_interval_ms),
            self.reconnect_growth,
            Duration::from_millis(self.max_reconnect_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    /// Sender built from the send retry fields.
    #[must_use]
    pub fn retrying_sender(&self) -> RetryingSender {
        let sender = RetryingSender::new(Duration::from_millis(self.send_retry_base_ms));
        match self.send_retry_max_delay_ms {
            Some(max) => sender.with_max_delay(Duration::from_millis(max)),
            None => sender,
        }
    }

    /// Empty group metadata cache with the configured TTL.
    #[must_use]
    pub fn metadata_cache(&self) -> MetadataCache {
        MetadataCache::new(Duration::from_secs(self.group_cache_ttl_secs))
    }

    /// Empty message cache with the configured TTL and bound.
    #[must_use]
    pub fn message_cache(&self) -> MessageCache {
        MessageCache::new(
            Duration::from_secs(self.message_cache_ttl_secs),
            self.message_cache_max_entries,
        )
    }

    /// Keep-alive ping period. Zero disables it.
    #[must_use]
    pub const fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Presence refresh period. Zero disables it.
    #[must_use]
    pub const fn presence_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.presence_refresh_interval_ms)
    }

    /// Cache sweep period. Zero disables it.
    #[must_use]
    pub const fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// Timeout the engine applies to queries.
    #[must_use]
    pub const fn default_query_timeout(&self) -> Duration {
        Duration::from_millis(self.default_query_timeout_ms)
    }
}
