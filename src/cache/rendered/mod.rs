//! Rendered output cache.
//!
//! Persists rendered artifacts under `<directory>/<app_version>/` and serves
//! them back with conditional request semantics. Page, view and template
//! caches are the same type with different configuration.
//!
//! Lookups go through [`VersionResolver`], so a deploy can keep answering
//! from the previous version's artifacts until the new version renders them,
//! except for URIs listed in `exclude_patterns`.

mod entry;
mod sidecar;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub use entry::{ContentRef, FIVE_YEARS_SECS, RenderedCacheEntry, compute_etag, effective_ttl};

use self::entry::{BUNDLE_EXTENSION, encode_bundle, read_content, read_metadata};
use self::sidecar::SidecarRecord;
use super::clock::{Clock, SystemClock};
use super::error::{CacheError, CacheResult, validate_key};
use super::fs::{ensure_dir, remove_dir_all, remove_file, write_atomic};
use super::negotiate::{self, BurstWindow, Negotiation, RequestValidators};
use super::version::{ExcludePatterns, VersionResolver};

pub(crate) const METRIC_RENDERED_HIT: &str = "pagecache_rendered_hit_total";
pub(crate) const METRIC_RENDERED_MISS: &str = "pagecache_rendered_miss_total";
pub(crate) const METRIC_RENDERED_NOT_MODIFIED: &str = "pagecache_rendered_not_modified_total";
pub(crate) const METRIC_RENDERED_WRITE: &str = "pagecache_rendered_write_total";

/// On-disk arrangement of a version directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// One `<key>.entry` file holding metadata and content.
    #[default]
    Bundled,
    /// Raw `<key>.<content_type>` files next to a shared JSON index.
    Sidecar,
}

#[derive(Debug, Clone)]
pub struct RenderedCacheConfig {
    pub directory: PathBuf,
    pub app_version: String,
    /// Searched in order when the current version has no artifact.
    pub historical_versions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Default content type tag for lookups and sidecar file names.
    pub content_type: String,
    pub immutable: bool,
    /// Seconds; zero means five years.
    pub ttl: u64,
    pub burst: BurstWindow,
    pub layout: Layout,
}

impl RenderedCacheConfig {
    pub fn new(directory: impl Into<PathBuf>, app_version: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            app_version: app_version.into(),
            historical_versions: Vec::new(),
            exclude_patterns: Vec::new(),
            content_type: "html".to_string(),
            immutable: false,
            ttl: 3600,
            burst: BurstWindow::None,
            layout: Layout::Bundled,
        }
    }
}

/// Bytes to persist, or a file that produces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Bytes(Bytes),
    File(PathBuf),
}

impl From<Bytes> for Content {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for Content {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<PathBuf> for Content {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Modification time of the source; defaults to the write time.
    pub source_mtime: Option<OffsetDateTime>,
    /// Extra response headers replayed on every full response.
    pub headers: Vec<(String, String)>,
    pub content_encoding: Option<String>,
    /// Overrides the configured immutability for this entry.
    pub immutable: Option<bool>,
}

/// Parameters of a freshness or serve query.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    pub key: &'a str,
    /// Compared against the stored tag when given.
    pub content_type: Option<&'a str>,
    /// Request URI, checked against the exclusion patterns.
    pub uri: Option<&'a str>,
}

impl<'a> Lookup<'a> {
    pub fn new(key: &'a str) -> Self {
        Self {
            key,
            content_type: None,
            uri: None,
        }
    }

    pub fn content_type(mut self, content_type: &'a str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn uri(mut self, uri: &'a str) -> Self {
        self.uri = Some(uri);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Missing, or past its expiry and not immutable.
    Expired,
    TypeMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
    pub entry: RenderedCacheEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    NotFound,
    TypeMismatch,
    NotModified { headers: Vec<(String, String)> },
    Content(CachedContent),
}

impl ServeOutcome {
    /// HTTP status code the outcome maps to.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound | Self::TypeMismatch => 404,
            Self::NotModified { .. } => 304,
            Self::Content(_) => 200,
        }
    }
}

/// An artifact found on disk with its metadata.
#[derive(Debug)]
struct Located {
    entry: RenderedCacheEntry,
    /// Bundle file, or raw content file for the sidecar layout.
    source: PathBuf,
    fallback: bool,
}

#[derive(Debug, Clone)]
pub struct RenderedCache {
    config: RenderedCacheConfig,
    resolver: VersionResolver,
    clock: Arc<dyn Clock>,
}

impl RenderedCache {
    pub fn new(config: RenderedCacheConfig) -> CacheResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RenderedCacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        validate_version(&config.app_version)?;
        for version in &config.historical_versions {
            validate_version(version)?;
        }
        validate_content_type(&config.content_type)?;

        let resolver = VersionResolver::new(
            config.directory.clone(),
            config.app_version.clone(),
            config.historical_versions.clone(),
            ExcludePatterns::new(config.exclude_patterns.iter().cloned()),
        );
        Ok(Self {
            config,
            resolver,
            clock,
        })
    }

    pub fn config(&self) -> &RenderedCacheConfig {
        &self.config
    }

    pub fn current_dir(&self) -> PathBuf {
        self.resolver.current_dir()
    }

    /// Persist `content` for `key` under the current version directory.
    pub fn write(
        &self,
        key: &str,
        content_type: &str,
        content: impl Into<Content>,
        options: WriteOptions,
    ) -> CacheResult<RenderedCacheEntry> {
        validate_key(key)?;
        validate_content_type(content_type)?;

        let content = content.into();
        let content_length = match &content {
            Content::Bytes(bytes) => bytes.len() as u64,
            Content::File(path) => fs::metadata(path)
                .map_err(|err| CacheError::io(path, err))?
                .len(),
        };

        let date = self.clock.unix_now();
        let last_modified = options
            .source_mtime
            .map_or(date, OffsetDateTime::unix_timestamp);
        let ttl = self.config.ttl;
        let max_age = i64::try_from(effective_ttl(ttl)).unwrap_or(i64::MAX);
        let version = &self.config.app_version;

        let mut entry = RenderedCacheEntry {
            key: key.to_string(),
            version: version.clone(),
            content_type: content_type.to_string(),
            expiry: date.saturating_add(max_age),
            immutable: options.immutable.unwrap_or(self.config.immutable),
            last_modified,
            date,
            ttl,
            etag: compute_etag(content_type, last_modified, content_length, ttl, version),
            headers: options.headers,
            content_encoding: options.content_encoding,
            content_length,
            content: ContentRef::Inline,
        };

        let dir = self.resolver.current_dir();
        ensure_dir(&dir)?;
        let target = match (self.config.layout, &content) {
            (Layout::Bundled, Content::Bytes(bytes)) => {
                let target = dir.join(bundle_name(key));
                write_atomic(&target, &encode_bundle(&entry, Some(&bytes[..]))?)?;
                target
            }
            (Layout::Bundled, Content::File(path)) => {
                entry.content = ContentRef::File { path: path.clone() };
                let target = dir.join(bundle_name(key));
                write_atomic(&target, &encode_bundle(&entry, None)?)?;
                target
            }
            (Layout::Sidecar, content) => {
                let bytes = match content {
                    Content::Bytes(bytes) => bytes.clone(),
                    Content::File(path) => read_file(path)?,
                };
                let target = sidecar::content_path(&dir, key, &self.config.content_type);
                write_atomic(&target, &bytes)?;
                sidecar::upsert(&dir, key, SidecarRecord::from_entry(&entry))?;
                target
            }
        };

        counter!(METRIC_RENDERED_WRITE).increment(1);
        debug!(
            op = "rendered::write",
            key,
            version = %entry.version,
            content_type,
            path = %target.display(),
            bytes = content_length,
            "Rendered artifact written"
        );
        Ok(entry)
    }

    pub fn is_expired(&self, lookup: Lookup<'_>) -> CacheResult<Freshness> {
        validate_key(lookup.key)?;
        let Some(located) = self.locate(lookup.key, lookup.uri) else {
            return Ok(Freshness::Expired);
        };
        if let Some(wanted) = lookup.content_type
            && located.entry.content_type != wanted
        {
            return Ok(Freshness::TypeMismatch);
        }
        if located.entry.is_fresh(self.clock.unix_now()) {
            Ok(Freshness::Fresh)
        } else {
            Ok(Freshness::Expired)
        }
    }

    /// Answer a request from the cache.
    ///
    /// Expired artifacts are reported as [`ServeOutcome::NotFound`] and left on
    /// disk for the next `write` to replace.
    pub fn serve(
        &self,
        lookup: Lookup<'_>,
        validators: &RequestValidators,
    ) -> CacheResult<ServeOutcome> {
        validate_key(lookup.key)?;
        let Some(located) = self.locate(lookup.key, lookup.uri) else {
            counter!(METRIC_RENDERED_MISS).increment(1);
            return Ok(ServeOutcome::NotFound);
        };

        let entry = &located.entry;
        if let Some(wanted) = lookup.content_type
            && entry.content_type != wanted
        {
            debug!(
                op = "rendered::serve",
                result = "type_mismatch",
                key = lookup.key,
                stored = %entry.content_type,
                wanted,
                "Cached artifact has a different content type"
            );
            counter!(METRIC_RENDERED_MISS).increment(1);
            return Ok(ServeOutcome::TypeMismatch);
        }

        let now = self.clock.now();
        if !entry.is_fresh(now.unix_timestamp()) {
            debug!(
                op = "rendered::serve",
                result = "expired",
                key = lookup.key,
                expiry = entry.expiry,
                "Cached artifact expired"
            );
            counter!(METRIC_RENDERED_MISS).increment(1);
            return Ok(ServeOutcome::NotFound);
        }

        let mime = media_type(&entry.content_type)?;
        let burst_active = self.config.burst.is_active(entry.date, now);
        if negotiate::negotiate(validators, entry, burst_active) == Negotiation::NotModified {
            counter!(METRIC_RENDERED_NOT_MODIFIED).increment(1);
            return Ok(ServeOutcome::NotModified {
                headers: negotiate::not_modified_headers(entry),
            });
        }

        let body = match self.read_body(&located) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    op = "rendered::serve",
                    result = "unreadable",
                    key = lookup.key,
                    path = %located.source.display(),
                    error = %err,
                    "Cached artifact unreadable; treating as miss"
                );
                if matches!(err, CacheError::Decode(_)) {
                    let _ = remove_file(&located.source);
                }
                counter!(METRIC_RENDERED_MISS).increment(1);
                return Ok(ServeOutcome::NotFound);
            }
        };

        counter!(METRIC_RENDERED_HIT).increment(1);
        debug!(
            op = "rendered::serve",
            result = "hit",
            key = lookup.key,
            version = %entry.version,
            fallback = located.fallback,
            burst = burst_active,
            "Serving cached artifact"
        );
        let headers = negotiate::full_headers(entry, &mime, burst_active);
        Ok(ServeOutcome::Content(CachedContent {
            body,
            headers,
            entry: located.entry,
        }))
    }

    /// Remove `key` from `version`, or from the current version.
    pub fn delete(&self, key: &str, version: Option<&str>) -> CacheResult<bool> {
        validate_key(key)?;
        let dir = self.version_dir(version)?;
        match self.config.layout {
            Layout::Bundled => remove_file(&dir.join(bundle_name(key))),
            Layout::Sidecar => {
                if !dir.is_dir() {
                    return Ok(false);
                }
                let listed = sidecar::remove(&dir, key)?;
                let raw = remove_file(&sidecar::content_path(
                    &dir,
                    key,
                    &self.config.content_type,
                ))?;
                Ok(listed || raw)
            }
        }
    }

    /// Remove a whole version directory, the current one by default.
    pub fn clear(&self, version: Option<&str>) -> CacheResult<bool> {
        let dir = self.version_dir(version)?;
        let removed = remove_dir_all(&dir)?;
        info!(
            op = "rendered::clear",
            path = %dir.display(),
            removed,
            "Rendered cache version cleared"
        );
        Ok(removed)
    }

    /// Version directories present on disk, sorted by name.
    pub fn versions(&self) -> CacheResult<Vec<String>> {
        let directory = &self.config.directory;
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io(directory, err)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(directory, err))?;
            let is_dir = entry
                .file_type()
                .map_err(|err| CacheError::io(entry.path(), err))?
                .is_dir();
            if is_dir && let Some(name) = entry.file_name().to_str() {
                versions.push(name.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn version_dir(&self, version: Option<&str>) -> CacheResult<PathBuf> {
        match version {
            Some(version) => {
                validate_version(version)?;
                Ok(self.resolver.version_dir(version))
            }
            None => Ok(self.resolver.current_dir()),
        }
    }

    fn locate(&self, key: &str, uri: Option<&str>) -> Option<Located> {
        match self.config.layout {
            Layout::Bundled => {
                let resolved = self.resolver.resolve(&bundle_name(key), uri)?;
                match read_metadata(&resolved.path) {
                    Ok(entry) => Some(Located {
                        entry,
                        source: resolved.path,
                        fallback: resolved.fallback,
                    }),
                    Err(err) => {
                        warn!(
                            op = "rendered::locate",
                            result = "corrupt",
                            key,
                            path = %resolved.path.display(),
                            error = %err,
                            "Discarding unreadable cache entry"
                        );
                        let _ = remove_file(&resolved.path);
                        None
                    }
                }
            }
            Layout::Sidecar => {
                let file_name = format!("{key}.{}", self.config.content_type);
                let resolved = self.resolver.resolve(&file_name, uri)?;
                let dir = resolved.path.parent()?;
                let record = sidecar::lookup(dir, key)?;
                let content_length = fs::metadata(&resolved.path).ok()?.len();
                Some(Located {
                    entry: record.into_entry(key, &resolved.version, content_length),
                    source: resolved.path,
                    fallback: resolved.fallback,
                })
            }
        }
    }

    fn read_body(&self, located: &Located) -> CacheResult<Bytes> {
        match self.config.layout {
            Layout::Bundled => read_content(&located.source, &located.entry),
            Layout::Sidecar => read_file(&located.source),
        }
    }
}

/// MIME type for a content type tag, with a charset for textual types.
pub fn media_type(content_type: &str) -> CacheResult<String> {
    let mime = mime_guess::from_ext(content_type)
        .first()
        .ok_or_else(|| CacheError::UnknownContentType(content_type.to_string()))?;
    let essence = mime.essence_str();
    if mime.type_().as_str() == "text" || mime.subtype().as_str() == "json" {
        Ok(format!("{essence}; charset=utf-8"))
    } else {
        Ok(essence.to_string())
    }
}

fn bundle_name(key: &str) -> String {
    format!("{key}.{BUNDLE_EXTENSION}")
}

fn read_file(path: &Path) -> CacheResult<Bytes> {
    fs::read(path)
        .map(Bytes::from)
        .map_err(|err| CacheError::io(path, err))
}

fn validate_version(version: &str) -> CacheResult<()> {
    validate_key(version).map_err(|_| {
        CacheError::validation(format!("version `{version}` is not a valid directory name"))
    })
}

fn validate_content_type(content_type: &str) -> CacheResult<()> {
    validate_key(content_type).map_err(|_| {
        CacheError::validation(format!("content type `{content_type}` is not a valid tag"))
    })
}
