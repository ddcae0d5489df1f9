//! Sidecar layout: raw content files plus one JSON index per version directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::entry::{ContentRef, RenderedCacheEntry};
use crate::cache::error::{CacheError, CacheResult};
use crate::cache::fs::write_atomic;
use crate::cache::lock::FileLock;

pub(crate) const INDEX_FILE: &str = "pagecache.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SidecarRecord {
    #[serde(rename = "Expiry")]
    pub expiry: i64,
    #[serde(rename = "MaxAge")]
    pub max_age: u64,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Date")]
    pub date: i64,
    #[serde(rename = "Content-Type")]
    pub content_type: String,
    #[serde(
        rename = "Content-Encoding",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_encoding: Option<String>,
    #[serde(rename = "Last-Modified", default)]
    pub last_modified: Option<i64>,
    #[serde(rename = "Immutable", default)]
    pub immutable: bool,
    #[serde(rename = "Headers", default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

impl SidecarRecord {
    pub(crate) fn from_entry(entry: &RenderedCacheEntry) -> Self {
        Self {
            expiry: entry.expiry,
            max_age: entry.ttl,
            etag: entry.etag.clone(),
            date: entry.date,
            content_type: entry.content_type.clone(),
            content_encoding: entry.content_encoding.clone(),
            last_modified: Some(entry.last_modified),
            immutable: entry.immutable,
            headers: entry.headers.clone(),
        }
    }

    pub(crate) fn into_entry(
        self,
        key: &str,
        version: &str,
        content_length: u64,
    ) -> RenderedCacheEntry {
        RenderedCacheEntry {
            key: key.to_string(),
            version: version.to_string(),
            content_type: self.content_type,
            expiry: self.expiry,
            immutable: self.immutable,
            last_modified: self.last_modified.unwrap_or(self.date),
            date: self.date,
            ttl: self.max_age,
            etag: self.etag,
            headers: self.headers,
            content_encoding: self.content_encoding,
            content_length,
            content: ContentRef::Inline,
        }
    }
}

type Index = BTreeMap<String, SidecarRecord>;

pub(crate) fn index_path(version_dir: &Path) -> PathBuf {
    version_dir.join(INDEX_FILE)
}

/// Raw content file for `key` inside a version directory.
pub(crate) fn content_path(version_dir: &Path, key: &str, extension: &str) -> PathBuf {
    version_dir.join(format!("{key}.{extension}"))
}

pub(crate) fn lookup(version_dir: &Path, key: &str) -> Option<SidecarRecord> {
    read_index(&index_path(version_dir)).remove(key)
}

pub(crate) fn upsert(version_dir: &Path, key: &str, record: SidecarRecord) -> CacheResult<()> {
    update(version_dir, |index| {
        index.insert(key.to_string(), record);
        true
    })
    .map(|_| ())
}

/// Drop `key` from the index. Returns whether it was listed.
pub(crate) fn remove(version_dir: &Path, key: &str) -> CacheResult<bool> {
    update(version_dir, |index| index.remove(key).is_some())
}

fn update<F>(version_dir: &Path, mutate: F) -> CacheResult<bool>
where
    F: FnOnce(&mut Index) -> bool,
{
    let path = index_path(version_dir);
    let _lock = FileLock::acquire(&path)?;
    let mut index = read_index(&path);
    if !mutate(&mut index) {
        return Ok(false);
    }
    let bytes = serde_json::to_vec_pretty(&index)?;
    write_atomic(&path, &bytes)?;
    Ok(true)
}

fn read_index(path: &Path) -> Index {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Index::new(),
        Err(err) => {
            warn!(
                op = "sidecar::read_index",
                result = "unreadable",
                path = %path.display(),
                error = %CacheError::io(path, err),
                "Sidecar index unreadable; treating as empty"
            );
            return Index::new();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(index) => index,
        Err(err) => {
            warn!(
                op = "sidecar::read_index",
                result = "malformed",
                path = %path.display(),
                error = %err,
                "Sidecar index malformed; treating as empty"
            );
            Index::new()
        }
    }
}
