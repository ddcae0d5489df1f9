//! Bundled entry format.
//!
//! ```text
//! b"PCE1" | u32 BE metadata length | metadata JSON | inline content bytes
//! ```
//!
//! Content stored by reference has no trailing bytes; the metadata carries the
//! path of the file that produces it.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::error::{CacheError, CacheResult};

pub(crate) const BUNDLE_EXTENSION: &str = "entry";
const MAGIC: &[u8; 4] = b"PCE1";
const HEADER_LEN: usize = 8;
/// Metadata records are small; anything bigger is a damaged length prefix.
const MAX_METADATA_LEN: u32 = 1024 * 1024;
/// Effective max-age when the configured ttl is zero.
pub const FIVE_YEARS_SECS: u64 = 5 * 365 * 24 * 60 * 60;

/// Where the entry's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentRef {
    /// Stored right after the metadata, or next to the sidecar index.
    Inline,
    /// Produced by reading this file at serve time.
    File { path: PathBuf },
}

/// Metadata for one persisted rendered artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedCacheEntry {
    pub key: String,
    pub version: String,
    pub content_type: String,
    /// Unix seconds after which the entry is stale unless `immutable`.
    pub expiry: i64,
    pub immutable: bool,
    pub last_modified: i64,
    /// Unix seconds of the write.
    pub date: i64,
    /// Configured ttl; zero stands for [`FIVE_YEARS_SECS`].
    pub ttl: u64,
    pub etag: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub content_encoding: Option<String>,
    pub content_length: u64,
    pub content: ContentRef,
}

impl RenderedCacheEntry {
    pub fn max_age(&self) -> u64 {
        effective_ttl(self.ttl)
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        self.immutable || now < self.expiry
    }
}

pub fn effective_ttl(ttl: u64) -> u64 {
    if ttl == 0 { FIVE_YEARS_SECS } else { ttl }
}

/// Deterministic validator over the entry's describing fields, not its bytes.
pub fn compute_etag(
    content_type: &str,
    last_modified: i64,
    content_length: u64,
    ttl: u64,
    version: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(last_modified.to_be_bytes());
    hasher.update(content_length.to_be_bytes());
    hasher.update(ttl.to_be_bytes());
    hasher.update(version.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

pub(crate) fn encode_bundle(
    entry: &RenderedCacheEntry,
    inline: Option<&[u8]>,
) -> CacheResult<Vec<u8>> {
    let metadata = serde_json::to_vec(entry)?;
    let length = u32::try_from(metadata.len())
        .ok()
        .filter(|len| *len <= MAX_METADATA_LEN)
        .ok_or_else(|| CacheError::validation("entry metadata is too large"))?;

    let body_len = inline.map_or(0, <[u8]>::len);
    let mut out = Vec::with_capacity(HEADER_LEN + metadata.len() + body_len);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&metadata);
    if let Some(bytes) = inline {
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

/// Read only the metadata block of a bundle.
pub(crate) fn read_metadata(path: &Path) -> CacheResult<RenderedCacheEntry> {
    let mut file = File::open(path).map_err(|err| CacheError::io(path, err))?;
    read_header(&mut file, path)
}

/// Load the bytes an entry refers to. `bundle` is the file the metadata came from.
pub(crate) fn read_content(bundle: &Path, entry: &RenderedCacheEntry) -> CacheResult<Bytes> {
    let bytes = match &entry.content {
        ContentRef::File { path } => {
            std::fs::read(path).map_err(|err| CacheError::io(path, err))?
        }
        ContentRef::Inline => {
            let mut file = File::open(bundle).map_err(|err| CacheError::io(bundle, err))?;
            read_header(&mut file, bundle)?;
            let mut body = Vec::new();
            file.read_to_end(&mut body)
                .map_err(|err| CacheError::io(bundle, err))?;
            body
        }
    };

    if bytes.len() as u64 != entry.content_length {
        return Err(CacheError::Decode(format!(
            "content length mismatch for `{}`: expected {}, found {}",
            entry.key,
            entry.content_length,
            bytes.len()
        )));
    }
    Ok(Bytes::from(bytes))
}

/// Parse the magic, length prefix and metadata, leaving `file` at the content bytes.
fn read_header(file: &mut File, path: &Path) -> CacheResult<RenderedCacheEntry> {
    let mut header = [0_u8; HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|err| truncated(path, err))?;
    if &header[..4] != MAGIC {
        return Err(CacheError::Decode(format!(
            "`{}` is not a cache entry",
            path.display()
        )));
    }

    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if length > MAX_METADATA_LEN {
        return Err(CacheError::Decode(format!(
            "`{}` declares {length} metadata bytes",
            path.display()
        )));
    }

    let mut metadata = vec![0_u8; length as usize];
    file.read_exact(&mut metadata)
        .map_err(|err| truncated(path, err))?;
    serde_json::from_slice(&metadata)
        .map_err(|err| CacheError::Decode(format!("`{}`: {err}", path.display())))
}

fn truncated(path: &Path, err: io::Error) -> CacheError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        CacheError::Decode(format!("`{}` is truncated", path.display()))
    } else {
        CacheError::io(path, err)
    }
}
