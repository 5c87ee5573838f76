// Collapsed forwarder behavior with concurrent producers and readers

use bytes::Bytes;
use futures::stream::StreamExt;
use http::HeaderMap;
use object_proxy_cache::{CacheError, CollapsedForwarder, ForwarderReader, ForwarderRegistry};
use std::sync::Arc;
use std::time::Duration;

fn slow_stream(blocks: Vec<&'static [u8]>, delay: Duration) -> futures::stream::BoxStream<'static, object_proxy_cache::Result<Bytes>> {
    futures::stream::iter(blocks)
        .then(move |b| async move {
            tokio::time::sleep(delay).await;
            Ok(Bytes::from_static(b))
        })
        .boxed()
}

/// Collect a reader's blocks, stopping at the first error
async fn read_all(reader: ForwarderReader) -> (Bytes, Option<CacheError>) {
    let mut stream = reader.into_stream();
    let mut body = Vec::new();
    while let Some(block) = stream.next().await {
        match block {
            Ok(b) => body.extend_from_slice(&b),
            Err(e) => return (Bytes::from(body), Some(e)),
        }
    }
    (Bytes::from(body), None)
}

#[tokio::test]
async fn test_many_readers_see_the_same_body() {
    let fwd = CollapsedForwarder::new(200, HeaderMap::new(), 12).unwrap();

    let mut readers = Vec::new();
    for _ in 0..5 {
        let reader = fwd.reader();
        readers.push(tokio::spawn(read_all(reader)));
    }

    let producer = {
        let fwd = fwd.clone();
        tokio::spawn(async move {
            fwd.forward(slow_stream(vec![&b"abcd"[..], &b"efgh"[..], &b"ijkl"[..]], Duration::from_millis(10)))
                .await
        })
    };

    // a reader attached mid-stream still starts from the first byte
    tokio::time::sleep(Duration::from_millis(15)).await;
    readers.push(tokio::spawn(read_all(fwd.reader())));

    producer.await.unwrap().unwrap();
    for reader in readers {
        let (body, error) = reader.await.unwrap();
        assert_eq!(body.as_ref(), b"abcdefghijkl");
        assert!(error.is_none());
    }
    assert!(fwd.is_closed());
    assert_eq!(fwd.written(), fwd.capacity());
    assert_eq!(fwd.body().unwrap().as_ref(), b"abcdefghijkl");
}

#[tokio::test]
async fn test_failed_producer_closes_stream() {
    let fwd = CollapsedForwarder::new(200, HeaderMap::new(), 8).unwrap();
    let reader = fwd.reader();

    let body = futures::stream::iter(vec![
        Ok(Bytes::from_static(b"abcd")),
        Err(CacheError::UpstreamError("connection reset".to_string())),
    ])
    .boxed();
    let result = fwd.forward(body).await;
    assert!(matches!(result, Err(CacheError::UpstreamError(_))));

    // readers get what was written and then the failure
    let (body, error) = read_all(reader).await;
    assert_eq!(body.as_ref(), b"abcd");
    assert!(matches!(error, Some(CacheError::UpstreamError(_))));
    assert!(fwd.is_closed());
    assert!(fwd.is_failed());
    assert!(fwd.written() < fwd.capacity());
}

#[tokio::test]
async fn test_origin_failure_mid_stream_reaches_every_reader() {
    let fwd = CollapsedForwarder::new(200, HeaderMap::new(), 12).unwrap();
    let early = fwd.reader();

    let body = futures::stream::iter(vec![
        Ok(Bytes::from_static(b"abcd")),
        Ok(Bytes::from_static(b"efgh")),
        Err(CacheError::UpstreamError("origin went away".to_string())),
    ])
    .then(|block| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        block
    })
    .boxed();
    let producer = {
        let fwd = fwd.clone();
        tokio::spawn(async move { fwd.forward(body).await })
    };
    assert!(producer.await.unwrap().is_err());

    for reader in [early, fwd.reader()] {
        let (body, error) = read_all(reader).await;
        assert_eq!(body.as_ref(), b"abcdefgh");
        assert!(error.is_some());
    }
    assert!(fwd.body().is_err());
}

#[tokio::test]
async fn test_body_shorter_than_declared_length_fails() {
    let fwd = CollapsedForwarder::new(200, HeaderMap::new(), 10).unwrap();
    let reader = fwd.reader();
    let body = futures::stream::iter(vec![Ok(Bytes::from_static(b"abcd"))]).boxed();

    assert!(fwd.forward(body).await.is_err());
    let (body, error) = read_all(reader).await;
    assert_eq!(body.as_ref(), b"abcd");
    assert!(error.is_some());
}

#[tokio::test]
async fn test_oversized_body_is_cut_at_capacity() {
    let fwd = CollapsedForwarder::new(200, HeaderMap::new(), 6).unwrap();
    let body = futures::stream::iter(vec![Ok(Bytes::from_static(b"abcd")), Ok(Bytes::from_static(b"efgh"))]).boxed();

    let result = fwd.forward(body).await;
    assert!(matches!(
        result,
        Err(CacheError::ShortWrite {
            written: 2,
            requested: 4
        })
    ));
    assert_eq!(fwd.body().unwrap().as_ref(), b"abcdef");
}

#[tokio::test]
async fn test_reader_stream_and_wait() {
    let fwd = CollapsedForwarder::new(200, HeaderMap::new(), 4).unwrap();
    let stream = fwd.reader().into_stream();

    let waiter = {
        let fwd = fwd.clone();
        tokio::spawn(async move { fwd.wait_complete().await })
    };
    fwd.forward(slow_stream(vec![&b"ab"[..], &b"cd"[..]], Duration::from_millis(5)))
        .await
        .unwrap();
    waiter.await.unwrap();

    let blocks: Vec<Bytes> = stream.map(|b| b.unwrap()).collect().await;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks.concat(), b"abcd");
}

#[test]
fn test_registry_tracks_inflight_keys() {
    let registry = Arc::new(ForwarderRegistry::new());
    let fwd = CollapsedForwarder::new(200, HeaderMap::new(), 1).unwrap();

    assert!(registry.get("a").is_none());
    assert!(registry.register("a", fwd.clone()));
    assert!(registry.register("b", fwd));
    assert_eq!(registry.len(), 2);

    registry.remove("a");
    assert!(registry.get("a").is_none());
    assert!(registry.get("b").is_some());
}
