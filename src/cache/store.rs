//! File-backed entry store.
//!
//! One bucket file per storage name under `<root>/<namespace>/`. The whole
//! bucket is loaded when the store is opened and committed after every
//! mutation. Commits take a writer lock, re-read the file and replay this
//! handle's pending changes on top, so two processes updating different keys
//! do not drop each other's writes.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use metrics::counter;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use super::backend::{KeyValueStore, SetOptions, WriteOutcome};
use super::bucket::{self, BucketFormat, CacheRecord, PayloadEncoding, Records};
use super::clock::{Clock, SystemClock};
use super::error::{CacheError, CacheResult, validate_record_key};
use super::fs::{ensure_dir, remove_dir_all, remove_file, write_atomic};
use super::lock::{FileLock, rw_read, rw_write};

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_STORE_HIT: &str = "pagecache_store_hit_total";
pub(crate) const METRIC_STORE_MISS: &str = "pagecache_store_miss_total";
pub(crate) const METRIC_STORE_CORRUPT: &str = "pagecache_store_corrupt_total";
pub(crate) const METRIC_STORE_COMMIT_FAILED: &str = "pagecache_store_commit_failed_total";

/// What to do when a commit cannot reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the fault and keep serving from memory.
    #[default]
    Degrade,
    /// Return the I/O error to the caller.
    Raise,
}

#[derive(Debug, Clone)]
pub struct EntryStoreConfig {
    pub root: PathBuf,
    pub namespace: String,
    pub format: BucketFormat,
    pub encoding: PayloadEncoding,
    pub failure_policy: FailurePolicy,
}

impl EntryStoreConfig {
    pub fn new(root: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            namespace: namespace.into(),
            format: BucketFormat::default(),
            encoding: PayloadEncoding::default(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn namespace_dir(&self) -> PathBuf {
        self.root.join(&self.namespace)
    }

    /// `<root>/<namespace>/<sha256(storage_name)>.<ext>`
    pub fn bucket_path(&self, storage_name: &str) -> PathBuf {
        let hashed = hex::encode(Sha256::digest(storage_name.as_bytes()));
        self.namespace_dir()
            .join(format!("{hashed}.{}", self.format.extension()))
    }
}

#[derive(Debug, Default)]
struct BucketState {
    records: Records,
    /// Changes not yet merged into the file; `None` marks a deletion.
    pending: BTreeMap<String, Option<CacheRecord>>,
}

/// Handle on one bucket file.
#[derive(Debug)]
pub struct EntryStore {
    config: EntryStoreConfig,
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: RwLock<BucketState>,
}

impl EntryStore {
    pub fn open(config: EntryStoreConfig, storage_name: &str) -> CacheResult<Self> {
        Self::open_with_clock(config, storage_name, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: EntryStoreConfig,
        storage_name: &str,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        if config.namespace.trim().is_empty() {
            return Err(CacheError::validation("namespace must not be empty"));
        }
        if storage_name.trim().is_empty() {
            return Err(CacheError::validation("storage name must not be empty"));
        }

        let path = config.bucket_path(storage_name);
        let records = load_bucket(&path, config.format);
        debug!(
            op = "store::open",
            path = %path.display(),
            records = records.len(),
            "Entry store bucket loaded"
        );

        Ok(Self {
            config,
            path,
            clock,
            state: RwLock::new(BucketState {
                records,
                pending: BTreeMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EntryStoreConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.state, SOURCE, "keys")
            .records
            .keys()
            .cloned()
            .collect()
    }

    /// Stored record for `key`, expired or not.
    pub fn record(&self, key: &str) -> Option<CacheRecord> {
        rw_read(&self.state, SOURCE, "record")
            .records
            .get(key)
            .cloned()
    }

    /// True when `key` is missing or past its expiry, locked or not.
    pub fn has_expired(&self, key: &str) -> bool {
        let now = self.clock.unix_now();
        rw_read(&self.state, SOURCE, "has_expired")
            .records
            .get(key)
            .is_none_or(|record| record.is_expired(now))
    }

    /// Remove every expired, unlocked record and commit once.
    pub fn delete_expired(&self) -> CacheResult<usize> {
        let now = self.clock.unix_now();
        let mut state = rw_write(&self.state, SOURCE, "delete_expired");
        let expired: Vec<String> = state
            .records
            .iter()
            .filter(|(_, record)| record.is_evictable(now))
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        for key in &expired {
            state.records.remove(key);
            state.pending.insert(key.clone(), None);
        }
        self.commit(&mut state)?;

        debug!(
            op = "store::delete_expired",
            path = %self.path.display(),
            removed = expired.len(),
            "Swept expired cache records"
        );
        Ok(expired.len())
    }

    /// Drop every record. With `also_delete_directory` the namespace directory goes too.
    pub fn clear_all(&self, also_delete_directory: bool) -> CacheResult<()> {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.records.clear();
        state.pending.clear();

        let result = if also_delete_directory {
            remove_dir_all(&self.config.namespace_dir()).map(|_| ())
        } else {
            remove_file(&self.path).map(|_| ())
        };
        self.apply_policy(result.map(|_| WriteOutcome::Persisted), "clear")
            .map(|_| ())
    }

    /// Merge pending changes into the on-disk bucket and write it back.
    fn commit(&self, state: &mut BucketState) -> CacheResult<WriteOutcome> {
        let result = self.try_commit(state);
        self.apply_policy(result, "commit")
    }

    fn try_commit(&self, state: &mut BucketState) -> CacheResult<WriteOutcome> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let _lock = FileLock::acquire(&self.path)?;

        let mut merged = load_bucket(&self.path, self.config.format);
        for (key, change) in &state.pending {
            match change {
                Some(record) => merged.insert(key.clone(), record.clone()),
                None => merged.remove(key),
            };
        }

        let bytes = bucket::encode(&merged, self.config.format)?;
        write_atomic(&self.path, &bytes)?;

        state.records = merged;
        state.pending.clear();
        Ok(WriteOutcome::Persisted)
    }

    fn apply_policy(
        &self,
        result: CacheResult<WriteOutcome>,
        op: &'static str,
    ) -> CacheResult<WriteOutcome> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_validation() => Err(err),
            Err(err) => {
                counter!(METRIC_STORE_COMMIT_FAILED).increment(1);
                error!(
                    op,
                    target_module = SOURCE,
                    result = "error",
                    path = %self.path.display(),
                    error = %err,
                    "Failed to persist cache bucket"
                );
                match self.config.failure_policy {
                    FailurePolicy::Degrade => Ok(WriteOutcome::Volatile),
                    FailurePolicy::Raise => Err(err),
                }
            }
        }
    }
}

impl KeyValueStore for EntryStore {
    fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        validate_record_key(key)?;
        let now = self.clock.unix_now();
        let state = rw_read(&self.state, SOURCE, "get");
        match state.records.get(key) {
            Some(record) if !record.is_expired(now) => {
                counter!(METRIC_STORE_HIT).increment(1);
                record.decoded_payload().map(Some)
            }
            _ => {
                counter!(METRIC_STORE_MISS).increment(1);
                Ok(None)
            }
        }
    }

    fn set_raw(
        &self,
        key: &str,
        payload: String,
        options: SetOptions,
    ) -> CacheResult<WriteOutcome> {
        validate_record_key(key)?;
        let record = CacheRecord {
            created_at: self.clock.unix_now(),
            expiry: options.expiry,
            payload: self.config.encoding.encode(&payload),
            encoding: self.config.encoding,
            locked: options.locked,
        };

        let mut state = rw_write(&self.state, SOURCE, "set");
        state.records.insert(key.to_string(), record.clone());
        state.pending.insert(key.to_string(), Some(record));
        self.commit(&mut state)
    }

    fn has(&self, key: &str) -> bool {
        !self.has_expired(key)
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        validate_record_key(key)?;
        let mut state = rw_write(&self.state, SOURCE, "delete");
        if state.records.remove(key).is_none() {
            return Ok(false);
        }
        state.pending.insert(key.to_string(), None);
        self.commit(&mut state)?;
        Ok(true)
    }

    fn delete_items(&self, keys: &[&str]) -> CacheResult<usize> {
        for key in keys {
            validate_record_key(key)?;
        }
        let mut state = rw_write(&self.state, SOURCE, "delete_items");
        let mut removed = 0;
        for key in keys {
            if state.records.remove(*key).is_some() {
                state.pending.insert((*key).to_string(), None);
                removed += 1;
            }
        }
        if removed > 0 {
            self.commit(&mut state)?;
        }
        Ok(removed)
    }

    fn clear(&self) -> CacheResult<()> {
        self.clear_all(false)
    }
}

/// Read a bucket file. Missing or unreadable files are a cold cache; corrupt
/// files are deleted and also read as empty.
fn load_bucket(path: &Path, format: BucketFormat) -> Records {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Records::new(),
        Err(err) => {
            warn!(
                op = "store::load",
                result = "read_error",
                path = %path.display(),
                error = %err,
                "Cache bucket unreadable; starting cold"
            );
            return Records::new();
        }
    };

    match bucket::decode(&bytes, format) {
        Ok(records) => records,
        Err(corruption) => {
            counter!(METRIC_STORE_CORRUPT).increment(1);
            warn!(
                op = "store::load",
                result = "corrupt",
                reason = corruption.reason(),
                path = %path.display(),
                "Discarding corrupt cache bucket"
            );
            if let Err(err) = remove_file(path) {
                warn!(
                    op = "store::load",
                    result = "remove_failed",
                    path = %path.display(),
                    error = %err,
                    "Failed to delete corrupt cache bucket"
                );
            }
            Records::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::backend::KeyValueStoreExt;
    use crate::cache::clock::ManualClock;

    fn open(dir: &TempDir, clock: Arc<ManualClock>) -> EntryStore {
        let config = EntryStoreConfig::new(dir.path(), "settings");
        EntryStore::open_with_clock(config, "default", clock).expect("open store")
    }

    #[test]
    fn greeting_scenario() {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::at_unix(0));
        let store = open(&dir, clock.clone());

        store
            .set("greeting", "hello", SetOptions::ttl(10))
            .expect("set");

        clock.advance(Duration::from_secs(5));
        assert_eq!(
            store.get::<String>("greeting").expect("get"),
            Some("hello".to_string())
        );

        clock.advance(Duration::from_secs(10));
        assert!(store.has_expired("greeting"));
        assert_eq!(store.get::<String>("greeting").expect("get"), None);
    }

    #[test]
    fn bucket_path_hashes_storage_name() {
        let config = EntryStoreConfig {
            format: BucketFormat::Guarded,
            ..EntryStoreConfig::new("/var/cache", "views")
        };
        let path = config.bucket_path("default");
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(path.starts_with("/var/cache/views"));
        assert!(name.ends_with(".php"));
        assert_eq!(name.len(), 64 + 4);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::at_unix(100));
        {
            let store = open(&dir, clock.clone());
            let outcome = store
                .set("answer", &42_u32, SetOptions::ttl(60))
                .expect("set");
            assert_eq!(outcome, WriteOutcome::Persisted);
        }

        let reopened = open(&dir, clock);
        assert_eq!(reopened.get::<u32>("answer").expect("get"), Some(42));
    }

    #[test]
    fn locked_entries_survive_sweeps() {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::at_unix(0));
        let store = open(&dir, clock.clone());

        store.set("plain", "a", SetOptions::ttl(1)).expect("set");
        store
            .set("pinned", "b", SetOptions::ttl(1).locked())
            .expect("set");
        store.set("forever", "c", SetOptions::never()).expect("set");

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.delete_expired().expect("sweep"), 1);
        assert!(store.has_expired("pinned"));
        assert_eq!(store.get::<String>("pinned").expect("get"), None);
        assert!(store.record("pinned").is_some());
        assert_eq!(
            store.get::<String>("forever").expect("get"),
            Some("c".to_string())
        );
        assert_eq!(store.delete_expired().expect("second sweep"), 0);
    }

    #[test]
    fn tampered_checksum_empties_bucket_and_removes_file() {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::at_unix(0));
        let path = {
            let store = open(&dir, clock.clone());
            store.set("k", "v", SetOptions::ttl(60)).expect("set");
            store.path().to_path_buf()
        };

        let contents = fs::read_to_string(&path).expect("bucket file");
        let document: serde_json::Value = serde_json::from_str(&contents).expect("json");
        let checksum = document["checksum"].as_str().expect("checksum").to_string();
        fs::write(&path, contents.replace(&checksum, &"0".repeat(64))).expect("tamper");

        let store = open(&dir, clock);
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn base64_encoding_hides_payload_on_disk() {
        let dir = TempDir::new().expect("temp dir");
        let config = EntryStoreConfig {
            encoding: PayloadEncoding::Base64,
            ..EntryStoreConfig::new(dir.path(), "secrets")
        };
        let store = EntryStore::open(config, "default").expect("open");
        store
            .set("token", "plain-text-value", SetOptions::never())
            .expect("set");

        let raw = fs::read_to_string(store.path()).expect("read");
        assert!(!raw.contains("plain-text-value"));
        assert_eq!(
            store.get::<String>("token").expect("get"),
            Some("plain-text-value".to_string())
        );
    }

    #[test]
    fn concurrent_handles_do_not_lose_updates() {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::at_unix(0));
        let first = open(&dir, clock.clone());
        let second = open(&dir, clock.clone());

        first.set("a", &1, SetOptions::never()).expect("set a");
        second.set("b", &2, SetOptions::never()).expect("set b");

        let third = open(&dir, clock);
        assert_eq!(third.get::<i32>("a").expect("a"), Some(1));
        assert_eq!(third.get::<i32>("b").expect("b"), Some(2));
    }

    #[test]
    fn delete_and_clear() {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::at_unix(0));
        let store = open(&dir, clock);

        store.set("a", &1, SetOptions::never()).expect("set");
        store.set("b", &2, SetOptions::never()).expect("set");
        assert!(store.delete("a").expect("delete"));
        assert!(!store.delete("a").expect("delete again"));
        assert_eq!(store.delete_items(&["b", "zzz"]).expect("delete items"), 1);

        store.set("c", &3, SetOptions::never()).expect("set");
        store.clear_all(true).expect("clear");
        assert!(store.is_empty());
        assert!(!store.config().namespace_dir().exists());
    }

    #[test]
    fn raise_policy_surfaces_write_failures() {
        let dir = TempDir::new().expect("temp dir");
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"not a directory").expect("blocker file");

        let config = EntryStoreConfig {
            failure_policy: FailurePolicy::Raise,
            ..EntryStoreConfig::new(&blocker, "ns")
        };
        let store = EntryStore::open(config.clone(), "default").expect("open");
        let err = store
            .set("k", "v", SetOptions::never())
            .expect_err("cannot create directory under a file");
        assert!(matches!(err, CacheError::Io { .. }));

        let degraded = EntryStore::open(
            EntryStoreConfig {
                failure_policy: FailurePolicy::Degrade,
                ..config
            },
            "default",
        )
        .expect("open");
        let outcome = degraded
            .set("k", "v", SetOptions::never())
            .expect("degraded write");
        assert_eq!(outcome, WriteOutcome::Volatile);
        assert_eq!(
            degraded.get::<String>("k").expect("get"),
            Some("v".to_string())
        );
    }

    #[test]
    fn empty_keys_are_validation_errors() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir, Arc::new(ManualClock::at_unix(0)));
        let err = store
            .set("", "v", SetOptions::never())
            .expect_err("empty key");
        assert!(err.is_validation());
        assert!(!store.path().exists());
    }
}
