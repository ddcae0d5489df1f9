//! Conditional request negotiation for rendered cache entries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;

use super::rendered::RenderedCacheEntry;

pub const HEADER_ETAG: &str = "ETag";
pub const HEADER_LAST_MODIFIED: &str = "Last-Modified";
pub const HEADER_EXPIRES: &str = "Expires";
pub const HEADER_CACHE_CONTROL: &str = "Cache-Control";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_CONTENT_ENCODING: &str = "Content-Encoding";

const REVALIDATE_CACHE_CONTROL: &str = "no-store, must-revalidate";

/// Validators sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestValidators {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

impl RequestValidators {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn if_none_match(mut self, value: impl Into<String>) -> Self {
        self.if_none_match = Some(value.into());
        self
    }

    pub fn if_modified_since(mut self, value: impl Into<String>) -> Self {
        self.if_modified_since = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Full,
    NotModified,
}

/// Forced revalidation after a deploy, without touching the stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BurstWindow {
    #[default]
    None,
    /// Active until this instant.
    Until(OffsetDateTime),
    /// Active for this long after the entry was written.
    For(Duration),
}

impl BurstWindow {
    pub fn is_active(&self, written_at: i64, now: OffsetDateTime) -> bool {
        match self {
            Self::None => false,
            Self::Until(until) => now < *until,
            Self::For(window) => {
                let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
                now.unix_timestamp() < written_at.saturating_add(window)
            }
        }
    }
}

/// Decide between a full response and a 304. First match wins:
/// burst, then `If-None-Match`, then `If-Modified-Since`.
pub fn negotiate(
    validators: &RequestValidators,
    entry: &RenderedCacheEntry,
    burst_active: bool,
) -> Negotiation {
    if burst_active {
        return Negotiation::Full;
    }

    if let Some(header) = validators.if_none_match.as_deref()
        && etag_matches(header, &entry.etag)
    {
        return Negotiation::NotModified;
    }

    if let Some(since) = validators
        .if_modified_since
        .as_deref()
        .and_then(|value| httpdate::parse_http_date(value).ok())
        && since >= unix_to_system(entry.last_modified)
    {
        return Negotiation::NotModified;
    }

    Negotiation::Full
}

fn etag_matches(header: &str, etag: &str) -> bool {
    let quoted = quote_etag(etag);
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == quoted)
}

pub fn quote_etag(etag: &str) -> String {
    format!("\"{etag}\"")
}

pub(crate) fn unix_to_system(seconds: i64) -> SystemTime {
    match u64::try_from(seconds) {
        Ok(secs) => UNIX_EPOCH + Duration::from_secs(secs),
        Err(_) => UNIX_EPOCH,
    }
}

pub fn http_date(seconds: i64) -> String {
    httpdate::fmt_http_date(unix_to_system(seconds))
}

/// Headers for a 200 response carrying the entry's content.
pub fn full_headers(
    entry: &RenderedCacheEntry,
    mime: &str,
    burst_active: bool,
) -> Vec<(String, String)> {
    let mut headers = vec![(HEADER_CONTENT_TYPE.to_string(), mime.to_string())];

    if burst_active {
        headers.push((
            HEADER_CACHE_CONTROL.to_string(),
            REVALIDATE_CACHE_CONTROL.to_string(),
        ));
    } else {
        headers.extend(validator_headers(entry));
    }

    headers.push((
        HEADER_CONTENT_LENGTH.to_string(),
        entry.content_length.to_string(),
    ));
    if let Some(encoding) = entry.content_encoding.as_ref() {
        headers.push((HEADER_CONTENT_ENCODING.to_string(), encoding.clone()));
    }
    headers.extend(
        entry
            .headers
            .iter()
            .filter(|(name, _)| !is_managed_header(name))
            .cloned(),
    );
    headers
}

/// Headers for a 304 response.
pub fn not_modified_headers(entry: &RenderedCacheEntry) -> Vec<(String, String)> {
    validator_headers(entry)
}

fn validator_headers(entry: &RenderedCacheEntry) -> Vec<(String, String)> {
    vec![
        (HEADER_ETAG.to_string(), quote_etag(&entry.etag)),
        (
            HEADER_LAST_MODIFIED.to_string(),
            http_date(entry.last_modified),
        ),
        (HEADER_EXPIRES.to_string(), http_date(entry.expiry)),
        (HEADER_CACHE_CONTROL.to_string(), cache_control(entry)),
    ]
}

/// `public, max-age=<ttl>[, immutable]`
pub fn cache_control(entry: &RenderedCacheEntry) -> String {
    let mut value = format!("public, max-age={}", entry.max_age());
    if entry.immutable {
        value.push_str(", immutable");
    }
    value
}

/// Headers the cache writes itself and never takes from stored extras.
pub fn is_managed_header(name: &str) -> bool {
    [
        HEADER_ETAG,
        HEADER_LAST_MODIFIED,
        HEADER_EXPIRES,
        HEADER_CACHE_CONTROL,
        HEADER_CONTENT_TYPE,
        HEADER_CONTENT_LENGTH,
        HEADER_CONTENT_ENCODING,
    ]
    .iter()
    .any(|managed| managed.eq_ignore_ascii_case(name))
}
