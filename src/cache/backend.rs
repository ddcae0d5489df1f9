//! Key-value contract shared by the file-backed entry store and alternate backends.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::bucket::Expiry;
use super::clock::{Clock, SystemClock};
use super::error::{CacheResult, validate_record_key};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::backend";

/// Options for a single `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetOptions {
    pub expiry: Expiry,
    pub locked: bool,
}

impl SetOptions {
    pub fn ttl(seconds: u64) -> Self {
        Self {
            expiry: Expiry::ttl(seconds),
            locked: false,
        }
    }

    pub fn expire_after(seconds: u64) -> Self {
        Self {
            expiry: Expiry::expire_after(seconds),
            locked: false,
        }
    }

    pub fn never() -> Self {
        Self::default()
    }

    /// Keep the record on disk after it expires until it is deleted explicitly.
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

/// Whether a write reached durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted,
    /// Kept in memory only; the backing file could not be written.
    Volatile,
}

/// Raw key-value operations over JSON payloads.
pub trait KeyValueStore: Send + Sync {
    /// Fresh payload for `key`, if any.
    fn get_raw(&self, key: &str) -> CacheResult<Option<String>>;

    fn set_raw(&self, key: &str, payload: String, options: SetOptions)
    -> CacheResult<WriteOutcome>;

    fn has(&self, key: &str) -> bool;

    fn delete(&self, key: &str) -> CacheResult<bool>;

    fn delete_items(&self, keys: &[&str]) -> CacheResult<usize>;

    fn clear(&self) -> CacheResult<()>;

    /// Batch fetch; missing and expired keys are left out of the result.
    fn get_many(&self, keys: &[&str]) -> CacheResult<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(payload) = self.get_raw(key)? {
                found.insert((*key).to_string(), payload);
            }
        }
        Ok(found)
    }
}

/// Typed access on top of any [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    fn get<V: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<V>> {
        match self.get_raw(key)? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn set<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        options: SetOptions,
    ) -> CacheResult<WriteOutcome> {
        let payload = serde_json::to_string(value)?;
        self.set_raw(key, payload, options)
    }

    /// Return the cached value, or compute, store and return a fresh one.
    ///
    /// With [`Expiry::Never`] nothing is read or stored and `producer` always runs.
    fn on_expired<V, F>(&self, key: &str, options: SetOptions, producer: F) -> CacheResult<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> V,
    {
        validate_record_key(key)?;
        if options.expiry.is_never() {
            return Ok(producer());
        }

        match self.get::<V>(key) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) if err.is_validation() => return Err(err),
            Err(err) => {
                warn!(
                    op = "cache::on_expired",
                    result = "read_error",
                    key,
                    error = %err,
                    "Cached value unusable; recomputing"
                );
            }
        }

        let value = producer();
        self.set(key, &value, options)?;
        Ok(value)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreExt for T {}

#[derive(Debug, Clone)]
struct MemoryItem {
    payload: String,
    expires_at: Option<i64>,
}

/// In-process stand-in for a remote key-value server.
///
/// Expiration is enforced by the "server" on read, as memcached does, so the
/// `locked` flag has no effect here.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    items: Arc<RwLock<HashMap<String, MemoryItem>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        let now = self.clock.unix_now();
        rw_read(&self.items, SOURCE, "memory_len")
            .values()
            .filter(|item| item.expires_at.is_none_or(|at| now < at))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        validate_record_key(key)?;
        let now = self.clock.unix_now();
        let items = rw_read(&self.items, SOURCE, "memory_get");
        Ok(items
            .get(key)
            .filter(|item| item.expires_at.is_none_or(|at| now < at))
            .map(|item| item.payload.clone()))
    }

    fn set_raw(
        &self,
        key: &str,
        payload: String,
        options: SetOptions,
    ) -> CacheResult<WriteOutcome> {
        validate_record_key(key)?;
        let expires_at = options.expiry.seconds().map(|seconds| {
            self.clock
                .unix_now()
                .saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX))
        });
        rw_write(&self.items, SOURCE, "memory_set").insert(
            key.to_string(),
            MemoryItem {
                payload,
                expires_at,
            },
        );
        Ok(WriteOutcome::Persisted)
    }

    fn has(&self, key: &str) -> bool {
        matches!(self.get_raw(key), Ok(Some(_)))
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        validate_record_key(key)?;
        Ok(rw_write(&self.items, SOURCE, "memory_delete")
            .remove(key)
            .is_some())
    }

    fn delete_items(&self, keys: &[&str]) -> CacheResult<usize> {
        let mut items = rw_write(&self.items, SOURCE, "memory_delete_items");
        Ok(keys
            .iter()
            .filter(|key| items.remove(**key).is_some())
            .count())
    }

    fn clear(&self) -> CacheResult<()> {
        rw_write(&self.items, SOURCE, "memory_clear").clear();
        Ok(())
    }
}
