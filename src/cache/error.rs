use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the entry store and the rendered output cache.
///
/// `Validation` is a caller mistake and is raised before any I/O happens.
/// Everything else describes the environment.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache request: {0}")]
    Validation(String),
    #[error("cache io error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize cache value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to decode cached payload: {0}")]
    Decode(String),
    #[error("no media type is known for content type `{0}`")]
    UnknownContentType(String),
    #[error("timed out waiting for lock `{}`", .0.display())]
    LockTimeout(PathBuf),
}

impl CacheError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true when the error comes from the caller rather than the environment.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Record keys only live inside a bucket, so any non-blank string is accepted.
pub(crate) fn validate_record_key(key: &str) -> CacheResult<()> {
    if key.trim().is_empty() {
        return Err(CacheError::validation("cache key must not be empty"));
    }
    Ok(())
}

/// Reject keys that are empty or could escape the cache directory.
pub(crate) fn validate_key(key: &str) -> CacheResult<()> {
    validate_record_key(key)?;
    if key.contains('/') || key.contains('\\') || key.contains("..") || key.contains('\0') {
        return Err(CacheError::validation(format!(
            "cache key `{key}` must not contain path separators"
        )));
    }
    Ok(())
}
