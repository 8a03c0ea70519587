//! This module provides the sharded, in-memory key-value store.
//!
//! The store is a fixed array of [`TABLE_SIZE`] buckets, each an unordered
//! key-to-entry map behind its own reader/writer lock. A key's bucket is
//! decided by [`hash`], so bucket-local uniqueness under the write lock is
//! whole-store uniqueness. Entries carry their subscriber sets; mutation
//! notifications fan out while the bucket write lock is still held, which is
//! what makes delivery race-free with respect to unsubscribe and disconnect
//! (see the `subscription` submodule).

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::debug;

use crate::session::{Session, SessionId};
use crate::{KvsubError, Result};

mod batch;
mod subscription;

pub use self::batch::render_entries;
pub use self::subscription::{SubscribeOutcome, UnsubscribeOutcome};

/// number of buckets in the store; fixed at compile time.
/// The first-byte hash maps the alphabet onto 0..=25, so 26 buckets cover
/// its whole range.
pub const TABLE_SIZE: usize = 26;

/// largest accepted key, in bytes
pub const MAX_KEY_SIZE: usize = 40;

/// largest accepted value, in bytes
pub const MAX_VALUE_SIZE: usize = 40;

/// Buckets a key by its first byte: `a..=z` (case folded) map to 0..=25 and
/// `0..=9` map to 0..=9, landing digits in the same buckets as `a..=j`.
/// Anything else is unhashable and the key is rejected.
///
/// The digit collapse stays: test fixtures depend on the exact
/// key-to-bucket mapping, so this function must not change within a run or
/// across releases.
pub fn hash(key: &str) -> Option<usize> {
    let first = *key.as_bytes().first()?;
    match first.to_ascii_lowercase() {
        b @ b'a'..=b'z' => Some((b - b'a') as usize),
        b @ b'0'..=b'9' => Some((b - b'0') as usize),
        _ => None,
    }
}

/// checks shape and returns the owning bucket index
pub(crate) fn validate_key(key: &str) -> Result<usize> {
    if key.is_empty() {
        return Err(KvsubError::InvalidKey("empty key".to_string()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(KvsubError::InvalidKey(format!(
            "key longer than {} bytes: {:?}",
            MAX_KEY_SIZE, key
        )));
    }
    hash(key).ok_or_else(|| {
        KvsubError::InvalidKey(format!("key starts outside [a-z0-9]: {:?}", key))
    })
}

pub(crate) fn validate_value(value: &str) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvsubError::InvalidKey(format!(
            "value longer than {} bytes",
            MAX_VALUE_SIZE
        )));
    }
    Ok(())
}

/// One stored pair plus the sessions observing it. The subscriber side of
/// the bidirectional index: weak references keyed by session id, owned by
/// the session table, never by the store.
pub(crate) struct KeyEntry {
    pub(crate) value: String,
    pub(crate) subscribers: HashMap<SessionId, Weak<Session>>,
}

impl KeyEntry {
    fn new(value: String) -> KeyEntry {
        KeyEntry {
            value,
            subscribers: HashMap::new(),
        }
    }
}

pub(crate) type Bucket = HashMap<String, KeyEntry>;

/// The sharded key-value store.
///
/// All operations are safe under concurrent invocation from any thread.
/// Multi-key operations and the whole-store snapshot take the bucket locks
/// they need in ascending index order, the crate-wide deadlock rule.
pub struct KvStore {
    buckets: Vec<RwLock<Bucket>>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    /// creates an empty store with [`TABLE_SIZE`] buckets
    pub fn new() -> KvStore {
        let buckets = (0..TABLE_SIZE).map(|_| RwLock::new(Bucket::new())).collect();
        KvStore { buckets }
    }

    pub(crate) fn read_bucket(&self, index: usize) -> Result<RwLockReadGuard<'_, Bucket>> {
        self.buckets[index]
            .read()
            .map_err(|_| KvsubError::Locking(format!("bucket {} read lock poisoned", index)))
    }

    pub(crate) fn write_bucket(&self, index: usize) -> Result<RwLockWriteGuard<'_, Bucket>> {
        self.buckets[index]
            .write()
            .map_err(|_| KvsubError::Locking(format!("bucket {} write lock poisoned", index)))
    }

    /// acquires write locks for a deduplicated, ascending list of bucket
    /// indices, the only multi-bucket order the crate permits
    pub(crate) fn write_buckets(
        &self,
        indices: &[usize],
    ) -> Result<BTreeMap<usize, RwLockWriteGuard<'_, Bucket>>> {
        let mut guards = BTreeMap::new();
        for &index in indices {
            guards.insert(index, self.write_bucket(index)?);
        }
        Ok(guards)
    }

    /// read-lock variant of [`KvStore::write_buckets`]
    pub(crate) fn read_buckets(
        &self,
        indices: &[usize],
    ) -> Result<BTreeMap<usize, RwLockReadGuard<'_, Bucket>>> {
        let mut guards = BTreeMap::new();
        for &index in indices {
            guards.insert(index, self.read_bucket(index)?);
        }
        Ok(guards)
    }

    /// Inserts `key` with `value`, overwriting any previous value.
    ///
    /// An overwrite preserves the entry's subscribers and fans a `Changed`
    /// event out to them before the bucket write lock is released. A fresh
    /// insert has no subscribers yet (subscribing requires the key to
    /// exist), so nothing is delivered.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let index = validate_key(key)?;
        validate_value(value)?;
        let mut bucket = self.write_bucket(index)?;
        match bucket.get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                subscription::fan_out_changed(entry, key);
            }
            None => {
                bucket.insert(key.to_string(), KeyEntry::new(value.to_string()));
            }
        }
        Ok(())
    }

    /// Retrieves the value stored under `key`. A miss is `None`, not an
    /// error. Unhashable keys cannot be stored, so they also miss.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let index = match hash(key) {
            Some(index) => index,
            None => return Ok(None),
        };
        let bucket = self.read_bucket(index)?;
        Ok(bucket.get(key).map(|entry| entry.value.clone()))
    }

    /// Deletes `key`, returning whether it existed.
    ///
    /// Subscribers are sent the `Deleted` event and their key sets are
    /// stripped of `key` while the bucket write lock is still held, so no
    /// subscriber can miss an event that precedes its own unsubscribe.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let index = match hash(key) {
            Some(index) => index,
            None => return Ok(false),
        };
        let mut bucket = self.write_bucket(index)?;
        match bucket.remove(key) {
            Some(mut entry) => {
                subscription::fan_out_deleted(&mut entry, key);
                subscription::strip_backlinks(&entry, key);
                debug!(key, "deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Point-in-time copy of the whole store: every bucket's read lock is
    /// taken in ascending order before any entry is copied, then all are
    /// released. Entries come back sorted by key.
    pub fn snapshot(&self) -> Result<Vec<(String, String)>> {
        let mut guards = Vec::with_capacity(TABLE_SIZE);
        for index in 0..TABLE_SIZE {
            guards.push(self.read_bucket(index)?);
        }
        let mut entries = Vec::new();
        for bucket in &guards {
            let mut in_bucket: Vec<(String, String)> = bucket
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect();
            in_bucket.sort();
            entries.extend(in_bucket);
        }
        Ok(entries)
    }

    /// number of stored pairs; takes every read lock in ascending order
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for index in 0..TABLE_SIZE {
            total += self.read_bucket(index)?.len();
        }
        Ok(total)
    }

    /// true when no pair is stored
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
