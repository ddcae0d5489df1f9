//! Rendered cache middleware and response logging.
//!
//! GET requests are answered from the rendered cache when a fresh artifact
//! exists. Otherwise the inner handler renders the page, a 200 body is
//! written to the cache and the stored artifact is served back so the first
//! response already carries validators.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, error, instrument, warn};

use crate::cache::{
    CacheError, Lookup, RenderedCache, RequestValidators, ServeOutcome, WriteOptions,
    is_managed_header,
};

use super::{error::ErrorReport, error::HttpError, outcome_response, request_validators};

/// Shared state for [`rendered_cache_layer`].
#[derive(Clone)]
pub struct CacheState {
    pub cache: Arc<RenderedCache>,
    /// Largest rendered body captured into the cache.
    pub max_body_bytes: usize,
}

/// Request coordinates shared by the lookup and the write.
#[derive(Debug, Clone)]
struct CacheTarget {
    key: String,
    content_type: String,
    path: String,
}

impl CacheTarget {
    fn from_request(request: &Request<Body>, default_type: &str) -> Self {
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or("");
        Self {
            key: cache_key(&path, query),
            content_type: content_type_tag(&path, default_type),
            path,
        }
    }

    fn lookup(&self) -> Lookup<'_> {
        Lookup::new(&self.key)
            .content_type(&self.content_type)
            .uri(&self.path)
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn rendered_cache_layer(
    State(state): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let target = CacheTarget::from_request(&request, &state.cache.config().content_type);
    let validators = request_validators(request.headers());

    match serve_cached(&state, &target, &validators).await {
        Ok(Some(response)) => return response,
        Ok(None) => {}
        Err(response) => return response,
    }

    debug!(cache = "rendered", outcome = "miss", "executing handler");
    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let options = WriteOptions {
        source_mtime: last_modified(&parts.headers),
        content_encoding: parts
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        headers: replayable_headers(&parts.headers),
        ..WriteOptions::default()
    };

    let cache = state.cache.clone();
    let write_target = target.clone();
    let body = bytes.clone();
    let written = tokio::task::spawn_blocking(move || {
        cache.write(
            &write_target.key,
            &write_target.content_type,
            body,
            options,
        )
    })
    .await;

    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            warn!(
                op = "http::rendered_cache_layer",
                result = "write_failed",
                key = %target.key,
                error = %err,
                "Rendered response not cached"
            );
            return Response::from_parts(parts, Body::from(bytes));
        }
        Err(err) => {
            error!(
                op = "http::rendered_cache_layer",
                result = "write_panicked",
                error = %err,
                "Cache write task failed"
            );
            return Response::from_parts(parts, Body::from(bytes));
        }
    }

    match serve_cached(&state, &target, &validators).await {
        Ok(Some(response)) => response,
        Ok(None) | Err(_) => Response::from_parts(parts, Body::from(bytes)),
    }
}

/// `Ok(None)` means the caller should render.
async fn serve_cached(
    state: &CacheState,
    target: &CacheTarget,
    validators: &RequestValidators,
) -> Result<Option<Response>, Response> {
    let cache = state.cache.clone();
    let target = target.clone();
    let validators = validators.clone();
    let outcome = tokio::task::spawn_blocking(move || cache.serve(target.lookup(), &validators))
        .await;

    match outcome {
        Ok(Ok(ServeOutcome::NotFound)) => Ok(None),
        Ok(Ok(ServeOutcome::TypeMismatch)) => {
            debug!(
                cache = "rendered",
                outcome = "type_mismatch",
                "cached artifact has another content type"
            );
            Err(outcome_response(ServeOutcome::TypeMismatch))
        }
        Ok(Ok(outcome)) => {
            debug!(
                cache = "rendered",
                outcome = "hit",
                status = outcome.status(),
                "serving cached artifact"
            );
            Ok(Some(outcome_response(outcome)))
        }
        Ok(Err(err @ CacheError::UnknownContentType(_))) => {
            Err(HttpError::from(err).into_response())
        }
        Ok(Err(err)) => {
            warn!(
                op = "http::serve_cached",
                result = "cache_error",
                error = %err,
                "Rendered cache lookup failed; rendering instead"
            );
            Ok(None)
        }
        Err(err) => {
            error!(
                op = "http::serve_cached",
                result = "task_failed",
                error = %err,
                "Cache lookup task failed"
            );
            Ok(None)
        }
    }
}

/// Stable, path-safe key for a request path and query.
pub fn cache_key(path: &str, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"?");
    hasher.update(query.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Content type tag from the path extension, when it names a known type.
pub fn content_type_tag(path: &str, default_type: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| mime_guess::from_ext(ext).first().is_some())
        .unwrap_or_else(|| default_type.to_string())
}

/// Handler headers worth storing with the artifact.
fn replayable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !is_managed_header(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
    .contains(name)
        || name.as_str() == "keep-alive"
}

fn last_modified(headers: &HeaderMap) -> Option<OffsetDateTime> {
    headers
        .get(header::LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .map(OffsetDateTime::from)
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "pagecache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                "request failed",
            );
        } else {
            warn!(
                target = "pagecache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                "client request error",
            );
        }
    }

    response
}
