//! Time-bounded caches for group metadata and recent message payloads.
//!
//! Expiry is checked when an entry is read; [`TtlCache::sweep`] reclaims
//! whatever expired without being read again.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::time::Instant;

use crate::types::{GroupMetadata, Jid, MessageKey};

/// Default TTL for group metadata (5 minutes).
pub const GROUP_METADATA_TTL: Duration = Duration::from_secs(5 * 60);
/// Default TTL for message payloads.
pub const MESSAGE_TTL: Duration = Duration::from_secs(60);
/// Default maximum number of cached message payloads.
pub const MESSAGE_MAX_ENTRIES: usize = 1000;

/// A cached value and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    /// Whether the entry is stale at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct Slot<V> {
    entry: CacheEntry<V>,
    seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Insertion sequence -> key, oldest first.
    order: BTreeMap<u64, K>,
    next_seq: u64,
    /// Invalidation count per key, for fetches that race an invalidation.
    generations: HashMap<K, u64>,
    /// Bumped by `clear`.
    clears: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn generation(&self, key: &K) -> u64 {
        self.clears + self.generations.get(key).copied().unwrap_or(0)
    }

    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Key/value cache with a fixed TTL and an optional entry bound.
///
/// When the bound is reached, expired entries are purged first and then the
/// earliest inserted entry is evicted. Reads do not affect eviction order.
pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: Option<usize>,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// Create an unbounded cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_entries: None,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                generations: HashMap::new(),
                clears: 0,
            }),
        }
    }

    /// Create a cache holding at most `max_entries` values.
    #[must_use]
    pub fn bounded(ttl: Duration, max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::new(ttl)
        }
    }

    /// Lifetime of each entry.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a live value. An expired entry is evicted and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = inner.entries.get(key)?.entry.is_expired(now);
        if expired {
            inner.remove(key);
            return None;
        }
        inner.entries.get(key).map(|slot| slot.entry.value.clone())
    }

    /// Full entry for `key`, including timestamps.
    pub fn entry(&self, key: &K) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.clone())
    }

    /// Insert or replace a value. Replacing refreshes expiry and insertion order.
    pub fn set(&self, key: K, value: V) {
        Self::insert(&mut self.lock(), key, value, self.ttl, self.max_entries);
    }

    /// Token to pass to [`Self::set_if_unchanged`] before starting a fetch.
    pub fn generation(&self, key: &K) -> u64 {
        self.lock().generation(key)
    }

    /// Store a fetched value unless `key` was invalidated since `generation`
    /// was taken. Returns whether the value was stored.
    pub fn set_if_unchanged(&self, key: K, generation: u64, value: V) -> bool {
        let mut inner = self.lock();
        if inner.generation(&key) != generation {
            return false;
        }
        Self::insert(&mut inner, key, value, self.ttl, self.max_entries);
        true
    }

    fn insert(
        inner: &mut Inner<K, V>,
        key: K,
        value: V,
        ttl: Duration,
        max_entries: Option<usize>,
    ) {
        let now = Instant::now();
        inner.remove(&key);

        if let Some(max) = max_entries {
            if inner.entries.len() >= max {
                inner.purge_expired(now);
            }
            while inner.entries.len() >= max {
                if inner.evict_oldest().is_none() {
                    break;
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            Slot {
                entry: CacheEntry {
                    value,
                    inserted_at: now,
                    expires_at: now + ttl,
                },
                seq,
            },
        );
    }

    /// Drop `key` immediately. Returns whether an entry was present.
    ///
    /// Fetches of `key` that started earlier can no longer store their result.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut inner = self.lock();
        *inner.generations.entry(key.clone()).or_insert(0) += 1;
        inner.remove(key).is_some()
    }

    /// Reclaim expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.clears += 1;
    }
}

/// Group metadata keyed by group JID. Unbounded, 5 minute TTL by default.
pub struct MetadataCache {
    inner: TtlCache<Jid, GroupMetadata>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(GROUP_METADATA_TTL)
    }
}

impl MetadataCache {
    /// Create a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(ttl),
        }
    }

    /// Fresh metadata for `jid`, if cached.
    pub fn get(&self, jid: &str) -> Option<GroupMetadata> {
        self.inner.get(&jid.to_string())
    }

    /// Cache metadata for `jid`.
    pub fn set(&self, jid: impl Into<Jid>, metadata: GroupMetadata) {
        self.inner.set(jid.into(), metadata);
    }

    /// Token taken before fetching `jid` remotely.
    pub fn generation(&self, jid: &str) -> u64 {
        self.inner.generation(&jid.to_string())
    }

    /// Cache fetched metadata unless `jid` was invalidated during the fetch.
    pub fn set_if_unchanged(
        &self,
        jid: impl Into<Jid>,
        generation: u64,
        metadata: GroupMetadata,
    ) -> bool {
        self.inner.set_if_unchanged(jid.into(), generation, metadata)
    }

    /// Drop the entry for `jid`.
    pub fn invalidate(&self, jid: &str) -> bool {
        self.inner.invalidate(&jid.to_string())
    }

    /// Reclaim expired entries.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Recent message payloads keyed by message identity.
pub struct MessageCache {
    inner: TtlCache<MessageKey, Value>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(MESSAGE_TTL, MESSAGE_MAX_ENTRIES)
    }
}

impl MessageCache {
    /// Create a cache of at most `max_entries` payloads living for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: TtlCache::bounded(ttl, max_entries),
        }
    }

    /// Payload of a live entry.
    pub fn get(&self, key: &MessageKey) -> Option<Value> {
        self.inner.get(key)
    }

    /// Cached record with its insertion instant.
    pub fn record(&self, key: &MessageKey) -> Option<CacheEntry<Value>> {
        self.inner.entry(key)
    }

    /// Cache `payload`, evicting the oldest entry when full.
    pub fn set(&self, key: MessageKey, payload: Value) {
        self.inner.set(key, payload);
    }

    /// Reclaim expired entries.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
