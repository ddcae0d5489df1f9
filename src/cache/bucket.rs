//! On-disk bucket format for the entry store.
//!
//! A bucket is a JSON document `{"checksum": "<sha256 hex>", "records": {...}}`.
//! The checksum covers the serialized `records` map only. A bucket that fails
//! to parse, lacks a checksum or carries the wrong one is corrupt and is never
//! partially trusted.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{CacheError, CacheResult};

/// First line written by [`BucketFormat::Guarded`]; a web server executing the
/// file directly answers 403 instead of leaking the bucket.
pub const GUARD_MARKER: &str = "<?php http_response_code(403); exit; ?>";

pub type Records = BTreeMap<String, CacheRecord>;

/// How long a record stays fresh, measured from its `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "seconds", rename_all = "snake_case")]
pub enum Expiry {
    #[default]
    Never,
    Ttl(u64),
    ExpireAfter(u64),
}

impl Expiry {
    /// Absolute window; zero means the record never expires.
    pub fn ttl(seconds: u64) -> Self {
        if seconds == 0 {
            Self::Never
        } else {
            Self::Ttl(seconds)
        }
    }

    /// Relative window; zero means unset.
    pub fn expire_after(seconds: u64) -> Self {
        if seconds == 0 {
            Self::Never
        } else {
            Self::ExpireAfter(seconds)
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }

    pub fn seconds(&self) -> Option<u64> {
        match self {
            Self::Never => None,
            Self::Ttl(seconds) | Self::ExpireAfter(seconds) => Some(*seconds),
        }
    }

    pub fn is_expired(&self, created_at: i64, now: i64) -> bool {
        match self.seconds() {
            None => false,
            Some(window) => {
                let elapsed = now.saturating_sub(created_at);
                elapsed >= i64::try_from(window).unwrap_or(i64::MAX)
            }
        }
    }
}

/// Secondary encoding applied to the serialized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Plain,
    Base64,
}

impl PayloadEncoding {
    pub fn encode(&self, payload: &str) -> String {
        match self {
            Self::Plain => payload.to_string(),
            Self::Base64 => STANDARD.encode(payload.as_bytes()),
        }
    }

    pub fn decode(&self, stored: &str) -> CacheResult<String> {
        match self {
            Self::Plain => Ok(stored.to_string()),
            Self::Base64 => {
                let bytes = STANDARD
                    .decode(stored)
                    .map_err(|err| CacheError::Decode(err.to_string()))?;
                String::from_utf8(bytes).map_err(|err| CacheError::Decode(err.to_string()))
            }
        }
    }
}

/// One cached value with its expiration and lock metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub created_at: i64,
    #[serde(default)]
    pub expiry: Expiry,
    pub payload: String,
    #[serde(default)]
    pub encoding: PayloadEncoding,
    #[serde(default)]
    pub locked: bool,
}

impl CacheRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry.is_expired(self.created_at, now)
    }

    /// Expired records that are not locked may be swept.
    pub fn is_evictable(&self, now: i64) -> bool {
        !self.locked && self.is_expired(now)
    }

    pub fn decoded_payload(&self) -> CacheResult<String> {
        self.encoding.decode(&self.payload)
    }
}

/// File flavour of a bucket; only the extension and the optional guard line differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketFormat {
    #[default]
    Json,
    Text,
    Guarded,
}

impl BucketFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
            Self::Guarded => "php",
        }
    }
}

/// Why a bucket file was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    Malformed(String),
    MissingGuard,
    MissingChecksum,
    ChecksumMismatch { expected: String, actual: String },
}

impl Corruption {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingGuard => "missing_guard",
            Self::MissingChecksum => "missing_checksum",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
        }
    }
}

#[derive(Serialize)]
struct BucketOut<'a> {
    checksum: String,
    records: &'a Records,
}

#[derive(Deserialize)]
struct BucketIn {
    checksum: Option<String>,
    records: Records,
}

/// SHA-256 hex digest over the serialized records map.
pub fn checksum(records: &Records) -> CacheResult<String> {
    let serialized = serde_json::to_vec(records)?;
    Ok(hex::encode(Sha256::digest(&serialized)))
}

pub fn encode(records: &Records, format: BucketFormat) -> CacheResult<Vec<u8>> {
    let document = BucketOut {
        checksum: checksum(records)?,
        records,
    };
    let mut out = Vec::new();
    if format == BucketFormat::Guarded {
        out.extend_from_slice(GUARD_MARKER.as_bytes());
        out.push(b'\n');
    }
    serde_json::to_writer(&mut out, &document)?;
    Ok(out)
}

pub fn decode(bytes: &[u8], format: BucketFormat) -> Result<Records, Corruption> {
    let body = match format {
        BucketFormat::Guarded => strip_guard(bytes).ok_or(Corruption::MissingGuard)?,
        BucketFormat::Json | BucketFormat::Text => bytes,
    };

    let document: BucketIn =
        serde_json::from_slice(body).map_err(|err| Corruption::Malformed(err.to_string()))?;
    let expected = document.checksum.ok_or(Corruption::MissingChecksum)?;
    let actual =
        checksum(&document.records).map_err(|err| Corruption::Malformed(err.to_string()))?;
    if expected != actual {
        return Err(Corruption::ChecksumMismatch { expected, actual });
    }
    Ok(document.records)
}

fn strip_guard(bytes: &[u8]) -> Option<&[u8]> {
    let newline = bytes.iter().position(|byte| *byte == b'\n')?;
    let (first, rest) = bytes.split_at(newline);
    (first == GUARD_MARKER.as_bytes()).then(|| &rest[1..])
}
