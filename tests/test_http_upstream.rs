// Engine tests against a real HTTP origin

use http::{Method, Uri};
use object_proxy_cache::headers::{self, CONTENT_RANGE, RANGE};
use object_proxy_cache::{
    CacheConfig, CacheMetrics, ClientRequest, HttpUpstream, LookupStatus, MemoryStore, ObjectProxyCache, Upstream,
    UpstreamRequest,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn body() -> Vec<u8> {
    (0..100u8).collect()
}

fn engine_for(origin: &str, timeout: Duration) -> ObjectProxyCache {
    let mut config = CacheConfig::default();
    config.origin_url = origin.to_string();
    let upstream = HttpUpstream::new(origin, timeout).unwrap();
    ObjectProxyCache::new(
        Arc::new(config),
        Arc::new(MemoryStore::new()),
        Arc::new(upstream),
        CacheMetrics::new().unwrap(),
    )
}

fn get(uri: &'static str) -> ClientRequest {
    ClientRequest::new(Method::GET, Uri::from_static(uri))
}

#[tokio::test]
async fn test_upstream_streams_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/obj"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body()))
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let response = upstream
        .fetch(UpstreamRequest::new(Method::GET, "/obj", http::HeaderMap::new()))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_length(), 100);
    let (_, _, received) = response.into_parts().await.unwrap();
    assert_eq!(received.as_ref(), body().as_slice());
}

#[tokio::test]
async fn test_origin_fetched_once_for_repeated_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/obj"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=300")
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server.uri(), Duration::from_secs(5));
    let first = engine.fetch(get("/obj")).await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.body.as_ref(), body().as_slice());
    engine.flush().await;

    let second = engine.fetch(get("/obj")).await.unwrap();
    assert!(second.was_hit);
    assert_eq!(second.body.as_ref(), body().as_slice());
}

#[tokio::test]
async fn test_range_forwarded_to_origin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/obj"))
        .and(header("range", "bytes=0-9"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("cache-control", "max-age=300")
                .insert_header("content-type", "application/octet-stream")
                .insert_header("content-range", "bytes 0-9/100")
                .set_body_bytes(body()[..10].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server.uri(), Duration::from_secs(5));
    let first = engine.fetch(get("/obj").with_header(RANGE, "bytes=0-9")).await.unwrap();
    assert_eq!(first.status, 206);
    assert_eq!(first.body.as_ref(), &body()[..10]);
    assert_eq!(headers::get_str(&first.headers, CONTENT_RANGE), Some("bytes 0-9/100"));
    engine.flush().await;

    // a sub-range of what is cached never reaches the origin
    let second = engine.fetch(get("/obj").with_header(RANGE, "bytes=2-5")).await.unwrap();
    assert!(second.was_hit);
    assert_eq!(second.body.as_ref(), &body()[2..6]);
    assert_eq!(headers::get_str(&second.headers, CONTENT_RANGE), Some("bytes 2-5/100"));
}

#[tokio::test]
async fn test_origin_timeout_is_gateway_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let engine = engine_for(&server.uri(), Duration::from_millis(200));
    let response = engine.handle(get("/slow")).await;
    assert_eq!(response.status, 504);
    assert_eq!(response.lookup_status, LookupStatus::ProxyError);
}

#[tokio::test]
async fn test_unreachable_origin_is_bad_gateway() {
    let engine = engine_for("http://127.0.0.1:1", Duration::from_secs(2));
    let response = engine.handle(get("/obj")).await;
    assert_eq!(response.status, 502);
    assert_eq!(response.lookup_status, LookupStatus::ProxyError);
}

#[tokio::test]
async fn test_post_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(2)
        .mount(&server)
        .await;

    let engine = engine_for(&server.uri(), Duration::from_secs(5));
    for _ in 0..2 {
        let request = ClientRequest::new(Method::POST, Uri::from_static("/api")).with_body("name=a");
        let response = engine.fetch(request).await.unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body.as_ref(), b"created");
        assert!(!response.was_hit);
    }
}
