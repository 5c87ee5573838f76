// Time-series documents written and read through the public cache API

use http::HeaderMap;
use object_proxy_cache::timeseries::PointSeries;
use object_proxy_cache::{
    query_cache, write_cache, CacheConfig, CacheOptions, CacheStore, Extent, HttpDocument, LookupStatus,
    MemoryStore, TimeRangeQuery, Timeseries, TimeseriesContext,
};
use std::sync::Arc;
use std::time::Duration;

fn context() -> TimeseriesContext {
    TimeseriesContext {
        query: TimeRangeQuery {
            extent: Extent::new(0, 2_900),
            step_ms: 100,
        },
        marshal: Some(PointSeries::marshaler()),
        unmarshal: Some(PointSeries::unmarshaler()),
    }
}

fn series_document() -> HttpDocument {
    let mut doc = HttpDocument::new(200, HeaderMap::new());
    doc.timeseries = Some(Box::new(PointSeries::new(
        100,
        (0..30).map(|i| (i * 100, i as f64)).collect(),
    )));
    doc
}

fn points_of(doc: &HttpDocument) -> Vec<(i64, f64)> {
    doc.timeseries
        .as_deref()
        .and_then(|ts| ts.as_any().downcast_ref::<PointSeries>())
        .map(|s| s.points.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_series_is_chunked_by_time_and_merged_on_read() {
    let mut config = CacheConfig::default();
    config.use_cache_chunking = true;
    config.timeseries_chunk_factor = 10;
    let opts = CacheOptions::from(&config);
    let memory = Arc::new(MemoryStore::with_options(None, false));
    let store: Arc<dyn CacheStore> = memory.clone();
    let ts = context();

    let mut doc = series_document();
    write_cache(&store, "series", &mut doc, Duration::from_secs(60), &opts, Some(&ts))
        .await
        .unwrap();
    // meta document plus one chunk per second of the query
    assert_eq!(memory.len(), 4);

    let lookup = query_cache(&store, "series", &Default::default(), &opts, Some(&ts)).await;
    assert!(lookup.error.is_none());
    assert_eq!(lookup.status, LookupStatus::Hit);
    let points = points_of(&lookup.document);
    assert_eq!(points.len(), 30);
    assert_eq!(points.first(), Some(&(0, 0.0)));
    assert_eq!(points.last(), Some(&(2_900, 29.0)));
}

#[tokio::test]
async fn test_unchunked_series_goes_through_the_marshaler() {
    let opts = CacheOptions::default();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::with_options(None, false));
    let ts = context();

    let mut doc = series_document();
    write_cache(&store, "series", &mut doc, Duration::from_secs(60), &opts, Some(&ts))
        .await
        .unwrap();

    let lookup = query_cache(&store, "series", &Default::default(), &opts, Some(&ts)).await;
    assert!(lookup.error.is_none());
    assert_eq!(points_of(&lookup.document).len(), 30);

    // without the unmarshaler the caller only gets the stored bytes back
    let raw = query_cache(&store, "series", &Default::default(), &opts, None).await;
    assert!(raw.document.timeseries.is_none());
    assert!(!raw.document.body.is_empty());
}
