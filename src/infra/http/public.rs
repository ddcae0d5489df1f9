use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{
        HeaderValue, Method, StatusCode, Uri,
        header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::infra::content::{ContentFile, ContentRoot};

use super::{
    HttpError,
    delivery::download,
    middleware::{CacheState, log_responses, rendered_cache_layer},
};

#[derive(Clone)]
pub struct HttpState {
    pub content: Arc<ContentRoot>,
}

impl HttpState {
    pub fn new(content: ContentRoot) -> Self {
        Self {
            content: Arc::new(content),
        }
    }
}

pub fn build_router(state: HttpState, cache: Option<CacheState>) -> Router {
    // Pages go through the rendered cache; downloads and health never do.
    let cached_routes = Router::new().fallback(serve_content);
    let cached_routes = if let Some(cache_state) = cache {
        cached_routes.layer(middleware::from_fn_with_state(
            cache_state,
            rendered_cache_layer,
        ))
    } else {
        cached_routes
    };

    let static_routes = Router::new()
        .route("/_download/{*path}", get(download))
        .route("/_health", get(health));

    cached_routes
        .merge(static_routes)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn serve_content(State(state): State<HttpState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    match state.content.read_page(uri.path()).await {
        Ok(file) => page_response(file),
        Err(err) => HttpError::from(err).into_response(),
    }
}

fn page_response(file: ContentFile) -> Response {
    let mime = mime_guess::from_path(&file.path).first_or_octet_stream();
    let content_type = if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    };
    let length = file.bytes.len();

    let mut response = Response::new(Body::from(file.bytes));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    if let Some(modified) = file.modified
        && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified))
    {
        headers.insert(LAST_MODIFIED, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;

    use super::*;

    #[test]
    fn html_pages_get_utf8_content_type() {
        let response = page_response(ContentFile {
            path: PathBuf::from("public/index.html"),
            bytes: Bytes::from_static(b"<h1>hi</h1>"),
            modified: None,
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/html; charset=utf-8"))
        );
        assert!(response.headers().get(LAST_MODIFIED).is_none());
    }
}
