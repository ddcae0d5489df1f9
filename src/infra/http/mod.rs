mod delivery;
mod error;
mod middleware;
mod public;

pub use delivery::download;
pub use error::{ErrorReport, HttpError};
pub use middleware::{CacheState, cache_key, content_type_tag, log_responses, rendered_cache_layer};
pub use public::{HttpState, build_router};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::cache::{RequestValidators, ServeOutcome};

/// Extract conditional request validators from request headers.
pub fn request_validators(headers: &HeaderMap) -> RequestValidators {
    let value = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    RequestValidators {
        if_none_match: value(header::IF_NONE_MATCH),
        if_modified_since: value(header::IF_MODIFIED_SINCE),
    }
}

/// Turn a cache answer into an HTTP response.
pub fn outcome_response(outcome: ServeOutcome) -> Response {
    const SOURCE: &str = "infra::http::outcome_response";
    match outcome {
        ServeOutcome::NotFound => {
            HttpError::not_found(SOURCE, "no cached artifact").into_response()
        }
        ServeOutcome::TypeMismatch => {
            HttpError::not_found(SOURCE, "cached artifact has another content type")
                .into_response()
        }
        ServeOutcome::NotModified { headers } => {
            with_headers(StatusCode::NOT_MODIFIED, headers, Body::empty())
        }
        ServeOutcome::Content(content) => {
            with_headers(StatusCode::OK, content.headers, Body::from(content.body))
        }
    }
}

fn with_headers(status: StatusCode, headers: Vec<(String, String)>, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let map = response.headers_mut();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => warn!(
                op = "http::with_headers",
                header = %name,
                "Skipping header that is not valid HTTP"
            ),
        }
    }
    response
}
