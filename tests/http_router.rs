use std::fs;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get as get_route,
};
use pagecache::{
    cache::{RenderedCache, RenderedCacheConfig, WriteOptions},
    infra::{
        content::ContentRoot,
        http::{CacheState, HttpState, build_router, cache_key, rendered_cache_layer},
    },
};
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    content: TempDir,
    cache_dir: TempDir,
    router: Router,
}

fn harness() -> Harness {
    let content = TempDir::new().expect("content dir");
    fs::write(content.path().join("index.html"), "<h1>home</h1>").expect("index");
    fs::write(content.path().join("about.html"), "<h1>about</h1>").expect("about");
    fs::create_dir_all(content.path().join("files")).expect("files dir");
    fs::write(content.path().join("files/report.pdf"), b"%PDF-1.7").expect("report");

    let cache_dir = TempDir::new().expect("cache dir");
    let cache = RenderedCache::new(RenderedCacheConfig::new(cache_dir.path(), "1.0.0"))
        .expect("rendered cache");
    let router = build_router(
        HttpState::new(ContentRoot::new(content.path())),
        Some(CacheState {
            cache: Arc::new(cache),
            max_body_bytes: 1024 * 1024,
        }),
    );

    Harness {
        content,
        cache_dir,
        router,
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

#[tokio::test]
async fn home_is_cached_and_revalidated() {
    let harness = harness();

    let first = send(&harness.router, get("/")).await;
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first
        .headers()
        .get(header::ETAG)
        .expect("etag on first response")
        .clone();
    assert_eq!(
        first.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("text/html; charset=utf-8")
    );
    let body = to_bytes(first.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&body[..], b"<h1>home</h1>");
    assert!(harness.cache_dir.path().join("1.0.0").is_dir());

    let revalidated = send(
        &harness.router,
        Request::builder()
            .uri("/")
            .header(header::IF_NONE_MATCH, etag.clone())
            .body(Body::empty())
            .expect("request should build"),
    )
    .await;
    assert_eq!(revalidated.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(revalidated.headers().get(header::ETAG), Some(&etag));
    let body = to_bytes(revalidated.into_body(), usize::MAX)
        .await
        .expect("body");
    assert!(body.is_empty());
}

#[tokio::test]
async fn cached_pages_survive_source_removal() {
    let harness = harness();
    let first = send(&harness.router, get("/about")).await;
    assert_eq!(first.status(), StatusCode::OK);

    fs::remove_file(harness.content.path().join("about.html")).expect("remove source");
    let second = send(&harness.router, get("/about")).await;
    assert_eq!(second.status(), StatusCode::OK);
    let body = to_bytes(second.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&body[..], b"<h1>about</h1>");
}

#[tokio::test]
async fn downloads_are_attachments() {
    let harness = harness();
    let response = send(&harness.router, get("/_download/files/report.pdf")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"report.pdf\"")
    );
    assert!(response.headers().get(header::ETAG).is_none());
}

#[tokio::test]
async fn missing_pages_and_health() {
    let harness = harness();

    let missing = send(&harness.router, get("/nowhere")).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let traversal = send(&harness.router, get("/_download/../secret")).await;
    assert_eq!(traversal.status(), StatusCode::NOT_FOUND);

    let health = send(&harness.router, get("/_health")).await;
    assert_eq!(health.status(), StatusCode::NO_CONTENT);

    let post = send(
        &harness.router,
        Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::empty())
            .expect("request should build"),
    )
    .await;
    assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
}

async fn framed_page() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::X_FRAME_OPTIONS, "DENY"),
            (header::CONNECTION, "close"),
        ],
        "<h1>framed</h1>",
    )
}

#[tokio::test]
async fn handler_headers_are_replayed_from_the_cache() {
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = RenderedCache::new(RenderedCacheConfig::new(cache_dir.path(), "1.0.0"))
        .expect("rendered cache");
    let state = CacheState {
        cache: Arc::new(cache),
        max_body_bytes: 1024 * 1024,
    };
    let router = Router::new()
        .route("/framed", get_route(framed_page))
        .layer(from_fn_with_state(state, rendered_cache_layer));

    for attempt in ["rendered", "cached"] {
        let response = send(&router, get("/framed")).await;
        assert_eq!(response.status(), StatusCode::OK, "{attempt}");
        assert!(response.headers().get(header::ETAG).is_some(), "{attempt}");
        assert_eq!(
            response
                .headers()
                .get(header::X_FRAME_OPTIONS)
                .and_then(|v| v.to_str().ok()),
            Some("DENY"),
            "{attempt}"
        );
        assert!(response.headers().get(header::CONNECTION).is_none(), "{attempt}");
    }
}

#[tokio::test]
async fn artifact_under_another_type_is_not_found() {
    let harness = harness();
    let other_writer =
        RenderedCache::new(RenderedCacheConfig::new(harness.cache_dir.path(), "1.0.0"))
            .expect("second cache handle");
    other_writer
        .write(
            &cache_key("/about", ""),
            "json",
            r#"{"about":true}"#,
            WriteOptions::default(),
        )
        .expect("write json artifact");

    let response = send(&harness.router, get("/about")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
