//! Pagecache storage engine.
//!
//! Two caches share this module:
//!
//! - **Entry store**: a keyed store persisted as one checksum-verified bucket
//!   file per namespace and storage name. See [`EntryStore`].
//! - **Rendered output cache**: pre-rendered artifacts stored per application
//!   version and served back with `ETag` / `Last-Modified` validation. See
//!   [`RenderedCache`].
//!
//! ## Layout
//!
//! ```text
//! <store root>/<namespace>/<sha256(storage name)>.<json|txt|php>
//! <rendered dir>/<app version>/<key>.entry
//! ```
//!
//! Both caches use synchronous file I/O and are safe to share across threads.

mod backend;
mod bucket;
mod clock;
mod error;
mod fs;
mod lock;
mod negotiate;
mod rendered;
mod store;
mod version;

pub use backend::{KeyValueStore, KeyValueStoreExt, MemoryStore, SetOptions, WriteOutcome};
pub use bucket::{
    BucketFormat, CacheRecord, Corruption, Expiry, GUARD_MARKER, PayloadEncoding, Records,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, CacheResult};
pub use negotiate::{
    BurstWindow, HEADER_CACHE_CONTROL, HEADER_CONTENT_ENCODING, HEADER_CONTENT_LENGTH,
    HEADER_CONTENT_TYPE, HEADER_ETAG, HEADER_EXPIRES, HEADER_LAST_MODIFIED, Negotiation,
    RequestValidators, cache_control, full_headers, http_date, is_managed_header, negotiate,
    not_modified_headers, quote_etag,
};
pub use rendered::{
    CachedContent, Content, ContentRef, FIVE_YEARS_SECS, Freshness, Layout, Lookup,
    RenderedCache, RenderedCacheConfig, RenderedCacheEntry, ServeOutcome, WriteOptions,
    compute_etag, effective_ttl, media_type,
};
pub use store::{EntryStore, EntryStoreConfig, FailurePolicy};
pub use version::{ExcludePatterns, Resolved, VersionResolver};

/// Names of every counter the caches emit.
pub const METRIC_NAMES: [&str; 8] = [
    store::METRIC_STORE_HIT,
    store::METRIC_STORE_MISS,
    store::METRIC_STORE_CORRUPT,
    store::METRIC_STORE_COMMIT_FAILED,
    rendered::METRIC_RENDERED_HIT,
    rendered::METRIC_RENDERED_MISS,
    rendered::METRIC_RENDERED_NOT_MODIFIED,
    rendered::METRIC_RENDERED_WRITE,
];
