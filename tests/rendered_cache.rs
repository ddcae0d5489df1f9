use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pagecache::cache::{
    Freshness, HEADER_ETAG, HEADER_LAST_MODIFIED, Layout, Lookup, ManualClock, RenderedCache,
    RenderedCacheConfig, RequestValidators, ServeOutcome, WriteOptions,
};
use tempfile::TempDir;

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn body_of(outcome: ServeOutcome) -> (Vec<u8>, Vec<(String, String)>) {
    match outcome {
        ServeOutcome::Content(content) => (content.body.to_vec(), content.headers),
        other => panic!("expected content, got status {}", other.status()),
    }
}

#[test]
fn deploy_upgrade_falls_back_then_takes_over() {
    let dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));

    let v1 = RenderedCache::with_clock(
        RenderedCacheConfig::new(dir.path(), "1.0.0"),
        clock.clone(),
    )
    .expect("v1 cache");
    v1.write("home", "html", "<h1>v1</h1>", WriteOptions::default())
        .expect("write v1 home");
    v1.write("admin", "html", "<h1>admin v1</h1>", WriteOptions::default())
        .expect("write v1 admin");

    let v2 = RenderedCache::with_clock(
        RenderedCacheConfig {
            historical_versions: vec!["1.0.0".to_string()],
            exclude_patterns: vec!["/admin*".to_string()],
            ..RenderedCacheConfig::new(dir.path(), "2.0.0")
        },
        clock.clone(),
    )
    .expect("v2 cache");

    let (body, _) = body_of(
        v2.serve(Lookup::new("home").uri("/"), &RequestValidators::none())
            .expect("serve home"),
    );
    assert_eq!(body, b"<h1>v1</h1>");

    let admin = v2
        .serve(
            Lookup::new("admin").uri("/admin/settings"),
            &RequestValidators::none(),
        )
        .expect("serve admin");
    assert!(matches!(admin, ServeOutcome::NotFound));

    v2.write("home", "html", "<h1>v2</h1>", WriteOptions::default())
        .expect("write v2 home");
    let (body, _) = body_of(
        v2.serve(Lookup::new("home").uri("/"), &RequestValidators::none())
            .expect("serve home"),
    );
    assert_eq!(body, b"<h1>v2</h1>");

    assert_eq!(
        v2.versions().expect("versions"),
        vec!["1.0.0".to_string(), "2.0.0".to_string()]
    );
    assert!(v2.clear(Some("1.0.0")).expect("clear v1"));
    assert_eq!(v2.versions().expect("versions"), vec!["2.0.0".to_string()]);
}

#[test]
fn validators_from_a_full_response_yield_304() {
    let dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let cache = RenderedCache::with_clock(
        RenderedCacheConfig::new(dir.path(), "1.0.0"),
        clock.clone(),
    )
    .expect("cache");
    cache
        .write("feed", "json", r#"{"items":[]}"#, WriteOptions::default())
        .expect("write");

    let lookup = Lookup::new("feed").content_type("json");
    let (_, headers) = body_of(cache.serve(lookup, &RequestValidators::none()).expect("serve"));
    let etag = header(&headers, HEADER_ETAG).expect("etag").to_string();
    let last_modified = header(&headers, HEADER_LAST_MODIFIED)
        .expect("last modified")
        .to_string();

    clock.advance(Duration::from_secs(60));
    let by_etag = cache
        .serve(lookup, &RequestValidators::none().if_none_match(etag))
        .expect("serve by etag");
    assert_eq!(by_etag.status(), 304);

    let by_date = cache
        .serve(
            lookup,
            &RequestValidators::none().if_modified_since(last_modified.clone()),
        )
        .expect("serve by date");
    assert_eq!(by_date.status(), 304);

    let stale_etag = cache
        .serve(
            lookup,
            &RequestValidators::none().if_none_match("\"something-else\""),
        )
        .expect("serve by stale etag");
    assert_eq!(stale_etag.status(), 200);

    let stale_etag_recent_date = cache
        .serve(
            lookup,
            &RequestValidators::none()
                .if_none_match("\"something-else\"")
                .if_modified_since(last_modified),
        )
        .expect("serve by stale etag and date");
    assert_eq!(stale_etag_recent_date.status(), 304);

    clock.advance(Duration::from_secs(3_600));
    assert_eq!(cache.is_expired(lookup).expect("freshness"), Freshness::Expired);
    assert_eq!(
        cache
            .serve(lookup, &RequestValidators::none())
            .expect("serve expired")
            .status(),
        404
    );
}

#[test]
fn sidecar_index_keeps_every_concurrent_writer() {
    let dir = TempDir::new().expect("temp dir");
    let config = RenderedCacheConfig {
        layout: Layout::Sidecar,
        ..RenderedCacheConfig::new(dir.path(), "1.0.0")
    };
    let cache = Arc::new(RenderedCache::new(config).expect("cache"));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let cache = cache.clone();
            thread::spawn(move || {
                let key = format!("page-{worker}");
                cache
                    .write(&key, "html", format!("<p>{worker}</p>"), WriteOptions::default())
                    .expect("write");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    for worker in 0..8 {
        let key = format!("page-{worker}");
        let (body, _) = body_of(
            cache
                .serve(Lookup::new(&key), &RequestValidators::none())
                .expect("serve"),
        );
        assert_eq!(body, format!("<p>{worker}</p>").into_bytes());
    }
}
