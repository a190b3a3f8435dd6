//! Integration tests for CachedSession over the reqwest transport.
//!
//! Uses wiremock for HTTP mocking. Tests cover redirect aliasing and
//! conditional revalidation against a real HTTP server.

use std::sync::Arc;

use reqcache_client::{CacheConfig, CachedSession, ReqwestTransport, TransportConfig};
use reqcache_core::backends::memory;
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

fn create_session(config: &CacheConfig) -> CachedSession {
    let cache = memory::open_cache("integration", config).expect("failed to open cache");
    let transport = ReqwestTransport::new(TransportConfig::default()).expect("failed to build transport");
    CachedSession::new(cache, Arc::new(transport))
}

#[tokio::test]
async fn test_redirect_chain_is_cached_with_alias() {
    init_tracing();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/b"))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let session = create_session(&CacheConfig::default());
    let url_a = format!("{}/a", mock_server.uri());
    let url_b = format!("{}/b", mock_server.uri());

    let first = session.get(&url_a).await.expect("request failed");
    assert_eq!(first.status, 200);
    assert!(!first.from_cache);
    assert_eq!(first.history.len(), 1);
    assert_eq!(first.history[0].status, 302);

    let via_alias = session.get(&url_a).await.expect("request failed");
    assert!(via_alias.from_cache);
    assert_eq!(via_alias.text(), "landed");

    let direct = session.get(&url_b).await.expect("request failed");
    assert!(direct.from_cache);
}

#[tokio::test]
async fn test_expired_entry_is_revalidated_with_etag() {
    init_tracing();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/doc"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304).insert_header("cache-control", "max-age=30"))
        .with_priority(1)
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("document")
                .insert_header("etag", "\"v1\"")
                .insert_header("cache-control", "max-age=0"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = CacheConfig { cache_control: true, ..Default::default() };
    let session = create_session(&config);
    let url = format!("{}/doc", mock_server.uri());

    let first = session.get(&url).await.expect("request failed");
    assert!(!first.from_cache);

    let second = session.get(&url).await.expect("request failed");
    assert_eq!(second.status, 200);
    assert!(second.from_cache);
    assert!(second.revalidated);
    assert_eq!(second.text(), "document");
    assert!(!second.is_expired());
}
