//! The object proxy cache engine
//!
//! [`ObjectProxyCache`] answers client requests from the cache when it can
//! and from the origin when it must. Each request is looked up under a read
//! lock on its cache key, then moves through a small state machine: a hit is
//! served directly, a partial hit or range miss fetches only the missing
//! ranges, a stale entry is revalidated, and a key miss fetches the whole
//! object (through a collapsed forwarder when other clients may want it too).
//! Cache writes happen on background tasks that keep the key's write lock
//! until the write is done.

use crate::cache::{self, CacheLookup, CacheOptions};
use crate::config::{CacheConfig, PathConfig};
use crate::document::{document_from_response, HttpDocument};
use crate::error::{CacheError, Result};
use crate::forwarder::{CollapsedForwarder, ForwarderRegistry};
use crate::headers::{self, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use crate::key::{self, KeyRequest};
use crate::locks::{NamedLock, NamedLocker, UpgradeOutcome};
use crate::metrics::CacheMetrics;
use crate::multipart::{RangePart, RangeParts};
use crate::policy::CachingPolicy;
use crate::proxy_request::{
    Cacheability, ClientRequest, ProxyRequest, ProxyResponse, ResponseBody, RevalidationStatus,
};
use crate::ranges::{ByteRange, ByteRanges};
use crate::status::{self, LookupStatus};
use crate::storage::CacheStore;
use crate::upstream::{Upstream, UpstreamRequest, UpstreamResponse};
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Times a request may start over after losing a lock upgrade
const MAX_RERUNS: usize = 3;

/// Next state of a request moving through the engine
enum Step {
    Hit,
    PartialHit,
    RangeMiss,
    KeyMiss,
    Revalidate,
    /// Lost the lock upgrade; look the key up again
    Rerun,
    /// Nothing the cache can do; forward the request as is
    ProxyOnly,
    Respond(ProxyResponse),
}

/// Count of background tasks still writing to the cache
#[derive(Default)]
struct PendingWrites {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingWrites {
    fn begin(self: &Arc<Self>) -> PendingGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        PendingGuard(self.clone())
    }
}

struct PendingGuard(Arc<PendingWrites>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Outcome of [`ObjectProxyCache::fetch`]
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether cached content answered the request
    pub was_hit: bool,
}

/// HTTP object cache in front of a single origin
///
/// # Fields
/// * `config` - Shared engine configuration
/// * `store` - Where documents are cached
/// * `upstream` - The origin
/// * `locker` - Per-key read/write locks
/// * `forwarders` - Collapsed fetches in flight, by cache key
#[derive(Clone)]
pub struct ObjectProxyCache {
    config: Arc<CacheConfig>,
    store: Arc<dyn CacheStore>,
    upstream: Arc<dyn Upstream>,
    metrics: CacheMetrics,
    locker: NamedLocker,
    forwarders: Arc<ForwarderRegistry>,
    options: Arc<CacheOptions>,
    negative_cache: Arc<HashMap<u16, Duration>>,
    pending: Arc<PendingWrites>,
}

impl ObjectProxyCache {
    /// Create an engine
    ///
    /// # Arguments
    /// * `config` - Validated engine configuration
    /// * `store` - Cache storage backend
    /// * `upstream` - Origin client
    /// * `metrics` - Metrics to record into
    pub fn new(
        config: Arc<CacheConfig>,
        store: Arc<dyn CacheStore>,
        upstream: Arc<dyn Upstream>,
        metrics: CacheMetrics,
    ) -> Self {
        let options = Arc::new(CacheOptions::from(config.as_ref()));
        let negative_cache = Arc::new(config.negative_cache_durations());
        ObjectProxyCache {
            config,
            store,
            upstream,
            metrics,
            locker: NamedLocker::new(),
            forwarders: Arc::new(ForwarderRegistry::new()),
            options,
            negative_cache,
            pending: Arc::new(PendingWrites::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Number of collapsed fetches currently in flight
    pub fn inflight_forwarders(&self) -> usize {
        self.forwarders.len()
    }

    /// Cache key of a request, plus the body to send upstream if it was rewritten
    ///
    /// HEAD shares the GET key since it is fetched and stored as GET.
    pub fn cache_key(&self, request: &ClientRequest, path_config: Option<&PathConfig>) -> (String, Option<Bytes>) {
        let method = if request.method == Method::HEAD {
            Method::GET
        } else {
            request.method.clone()
        };
        let kr = KeyRequest {
            method: &method,
            path: request.uri.path(),
            query: request.uri.query(),
            headers: &request.headers,
            body: &request.body,
        };
        let (derived, body) = key::derive_cache_key(&kr, path_config, "");
        (format!("{}.opc.{}", self.config.cache_key_prefix, derived), body)
    }

    /// Handle one client request
    ///
    /// Never fails: origin and cache errors are turned into responses with
    /// a matching status and a `proxy-error` result.
    pub async fn handle(&self, request: ClientRequest) -> ProxyResponse {
        let started = Instant::now();
        let method = request.method.clone();
        let uri = request.uri.clone();

        let response = self.serve(request).await;

        self.metrics.record_lookup(response.lookup_status, started.elapsed());
        if let ResponseBody::Full(body) = &response.body {
            self.metrics.record_bytes(response.lookup_status.is_hit(), body.len());
        }
        info!(
            "Request served: method={}, uri={}, status={}, cache={}, elapsed_ms={}",
            method,
            uri,
            response.status,
            response.lookup_status,
            started.elapsed().as_millis()
        );
        response
    }

    /// Handle a request and buffer the response
    pub async fn fetch(&self, request: ClientRequest) -> Result<FetchResult> {
        let response = self.handle(request).await;
        let was_hit = response.lookup_status.is_hit();
        let (status, headers, body) = response.collect().await?;
        Ok(FetchResult {
            status,
            headers,
            body,
            was_hit,
        })
    }

    /// Remove the cached object a request refers to, chunks included
    pub async fn purge(&self, request: &ClientRequest) -> ProxyResponse {
        let path_config = self.config.path_config(request.path()).cloned();
        let (key, _) = self.cache_key(request, path_config.as_ref());

        let mut lock = None;
        if !self.config.no_lock {
            let mut l = self.locker.read(&key).await;
            let _ = l.upgrade().await;
            lock = Some(l);
        }

        let (code, lookup) = match cache::purge_cache(&self.store, &key, &self.options).await {
            Ok(()) => {
                info!("Purged cache key: key={}", key);
                (200, LookupStatus::Purge)
            }
            Err(e) => {
                warn!("Purge failed: key={}, error={}", key, e);
                (500, LookupStatus::Error)
            }
        };
        drop(lock);

        let mut h = HeaderMap::new();
        status::set_result_header(&mut h, lookup, "", &ByteRanges::default());
        ProxyResponse::full(code, h, Bytes::new(), lookup)
    }

    /// Wait until every background cache write has finished
    pub async fn flush(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn serve(&self, request: ClientRequest) -> ProxyResponse {
        let path_config = self.config.path_config(request.path()).cloned();
        let (key, rewritten) = self.cache_key(&request, path_config.as_ref());
        let mut pr = ProxyRequest::new(request, key, rewritten, &self.config, path_config.as_ref());

        if pr.client_policy.no_cache {
            debug!("Client requested no-cache, purging: key={}", pr.key);
            if let Err(e) = cache::purge_cache(&self.store, &pr.key, &self.options).await {
                warn!("Failed to purge key on client no-cache: key={}, error={}", pr.key, e);
            }
            return self.proxy_only(&pr).await;
        }
        if !pr.is_cacheable_method() {
            return self.proxy_only(&pr).await;
        }

        loop {
            if let Some(response) = self.join_inflight(&pr).await {
                return response;
            }
            if !self.config.no_lock && pr.lock.is_none() {
                pr.lock = Some(self.locker.read(&pr.key).await);
            }

            let lookup = cache::query_cache(&self.store, &pr.key, &pr.wanted_ranges, &self.options, None).await;
            let mut step = self.classify(&mut pr, lookup).await;
            loop {
                step = match step {
                    Step::Hit => self.handle_hit(&mut pr),
                    Step::PartialHit | Step::RangeMiss => self.handle_partial_hit(&mut pr).await,
                    Step::Revalidate => self.handle_revalidation(&mut pr).await,
                    Step::KeyMiss => self.handle_key_miss(&mut pr).await,
                    Step::ProxyOnly => {
                        pr.lock = None;
                        return self.proxy_only(&pr).await;
                    }
                    Step::Respond(response) => return response,
                    Step::Rerun => break,
                };
            }

            debug!("Rerunning request: key={}, attempt={}", pr.key, pr.rerun_count + 1);
            pr.reset_for_rerun();
        }
    }

    /// Turn a cache lookup into the first step of the state machine
    async fn classify(&self, pr: &mut ProxyRequest, lookup: CacheLookup) -> Step {
        pr.cache_status = lookup.status;

        if let Some(e) = lookup.error {
            if !e.is_not_found() {
                warn!("Discarding unreadable cache entry: key={}, error={}", pr.key, e);
                if let Err(e) = cache::purge_cache(&self.store, &pr.key, &self.options).await {
                    warn!("Failed to purge unreadable entry: key={}, error={}", pr.key, e);
                }
            }
            pr.cache_status = LookupStatus::KeyMiss;
            pr.document = None;
            pr.needed_ranges = pr.wanted_ranges.clone();
            return Step::KeyMiss;
        }

        pr.needed_ranges = lookup.delta;
        pr.document = Some(lookup.document);
        debug!("Cache lookup: key={}, status={}, needed={}", pr.key, pr.cache_status, pr.needed_ranges);

        match lookup.status {
            LookupStatus::Hit => Step::Hit,
            LookupStatus::PartialHit => Step::PartialHit,
            LookupStatus::RangeMiss => Step::RangeMiss,
            LookupStatus::KeyMiss => Step::KeyMiss,
            other => {
                debug!("No handler for lookup status, proxying: key={}, status={}", pr.key, other);
                Step::ProxyOnly
            }
        }
    }

    /// Check the cached document is still fresh
    ///
    /// Returns the step to take instead when it is not: revalidation when the
    /// document has validators, a key miss otherwise.
    fn confirm_freshness(pr: &mut ProxyRequest) -> Option<Step> {
        let doc = pr.document.as_mut()?;
        let fresh = doc.caching_policy.is_fresh_at(Utc::now());
        doc.caching_policy.is_fresh = fresh;
        if fresh {
            return None;
        }
        if doc.caching_policy.can_revalidate {
            debug!("Stale cache entry, revalidating: key={}", pr.key);
            return Some(Step::Revalidate);
        }

        debug!("Stale cache entry cannot be revalidated: key={}", pr.key);
        pr.document = None;
        pr.cache_status = LookupStatus::KeyMiss;
        pr.needed_ranges = pr.wanted_ranges.clone();
        Some(Step::KeyMiss)
    }

    /// Trade the read lock for the write lock
    ///
    /// Returns false when another request upgraded first and this one should
    /// start over holding a read lock again; after [`MAX_RERUNS`] it proceeds
    /// regardless.
    async fn upgrade_lock(&self, pr: &mut ProxyRequest) -> bool {
        let Some(lock) = pr.lock.as_mut() else {
            return true;
        };
        match lock.upgrade().await {
            UpgradeOutcome::UpgradedNotFirst if pr.rerun_count < MAX_RERUNS => {
                debug!("Lost lock upgrade to another request: key={}", pr.key);
                lock.downgrade_to_read().await;
                false
            }
            _ => true,
        }
    }

    fn handle_hit(&self, pr: &mut ProxyRequest) -> Step {
        if let Some(step) = Self::confirm_freshness(pr) {
            return step;
        }
        pr.lock = None;

        let Some(doc) = pr.document.as_ref() else {
            return Step::KeyMiss;
        };
        let status = if doc.caching_policy.is_negative_cache {
            LookupStatus::NegativeCacheHit
        } else {
            LookupStatus::Hit
        };
        pr.cache_status = status;
        Step::Respond(pr.respond_document(doc, status))
    }

    /// Fetch the ranges the cached document is missing and merge them in
    async fn handle_partial_hit(&self, pr: &mut ProxyRequest) -> Step {
        if pr.revalidation == RevalidationStatus::None {
            if let Some(step) = Self::confirm_freshness(pr) {
                return step;
            }
        }
        if !self.upgrade_lock(pr).await {
            return Step::Rerun;
        }

        let requests = pr.prepare_upstream_requests(self.config.dearticulate_upstream_ranges);
        let revalidation = pr.revalidation_request.take();
        debug!(
            "Fetching missing ranges: key={}, needed={}, requests={}, revalidating={}",
            pr.key,
            pr.needed_ranges,
            requests.len(),
            revalidation.is_some()
        );

        let fetches = futures::future::join_all(requests.into_iter().map(|r| self.fetch_buffered("range", r)));
        let revalidate = async {
            match revalidation {
                Some(r) => Some(self.fetch_buffered("revalidation", r).await),
                None => None,
            }
        };
        let (results, revalidated) = tokio::join!(fetches, revalidate);

        let mut responses = Vec::with_capacity(results.len() + 1);
        for result in results {
            match result {
                Ok(r) => responses.push(r),
                Err(e) => {
                    pr.lock = None;
                    return Step::Respond(self.proxy_error(&e));
                }
            }
        }
        if let Some(i) = responses.iter().position(|(code, _, _)| *code >= 400) {
            let (code, h, body) = responses.swap_remove(i);
            debug!("Origin error on range fetch, passing through: key={}, status={}", pr.key, code);
            pr.lock = None;
            return Step::Respond(pr.respond_raw(code, h, body, pr.cache_status));
        }

        let mut keep_cached = true;
        match revalidated {
            Some(Ok((304, _, _))) => {
                debug!("Cached ranges revalidated: key={}", pr.key);
                pr.revalidation = RevalidationStatus::Succeeded;
            }
            Some(Ok((code, h, body))) => {
                debug!("Cached ranges changed at origin: key={}, status={}", pr.key, code);
                pr.revalidation = RevalidationStatus::Failed;
                keep_cached = false;
                if code < 400 {
                    responses.push((code, h, body));
                }
            }
            Some(Err(_)) => {
                pr.revalidation = RevalidationStatus::Failed;
                keep_cached = false;
            }
            None => {}
        }

        let Some((first_code, first_headers)) = responses.first().map(|(c, h, _)| (*c, h.clone())) else {
            pr.document = None;
            return Step::KeyMiss;
        };
        let mut response_headers = first_headers;
        let mut policy = CachingPolicy::from_response(first_code, &self.negative_cache, &mut response_headers);
        let decision = pr.determine_cacheability(first_code, &mut policy, &mut response_headers);
        if pr.revalidation == RevalidationStatus::Failed {
            keep_cached = false;
        }

        let mut doc = match pr.document.take() {
            Some(d) if keep_cached => d,
            _ => {
                let mut d = HttpDocument::new(206, HeaderMap::new());
                d.range_parts_loaded = true;
                d
            }
        };

        if let Some(i) = responses.iter().position(|(code, _, _)| *code == 200) {
            let (code, h, body) = responses.swap_remove(i);
            debug!("Origin returned the full object: key={}", pr.key);
            doc = match document_from_response(code, h, body, policy) {
                Ok(d) => d,
                Err(e) => return Step::Respond(self.reject_origin_body(pr, "range", &e)),
            };
        } else {
            for (code, h, body) in responses {
                if code != 206 {
                    continue;
                }
                headers::merge(&mut doc.headers, &h);
                if let Err(e) = doc.parse_partial_content_body(&h, body) {
                    return Step::Respond(self.reject_origin_body(pr, "range", &e));
                }
            }
            doc.headers.remove(CONTENT_RANGE);
            doc.headers.remove(CONTENT_LENGTH);
            doc.caching_policy.merge(&policy);
        }
        pr.fetched_ranges = pr.needed_ranges.clone();

        if !doc.range_parts.is_empty() && doc.content_length > 0 {
            let whole = ByteRange::new(0, doc.content_length - 1);
            if doc.ranges.len() == 1 && doc.ranges[0] == whole {
                if let Err(e) = doc.fulfill_content_body() {
                    debug!("Could not fulfill document: key={}, error={}", pr.key, e);
                }
            }
        }

        if pr.wants_ranges && doc.is_partial() {
            let wants = pr.resolved_wants(doc.content_length);
            if !wants.calculate_delta(&doc.ranges, doc.content_length).is_empty() {
                warn!(
                    "Reconstructed document misses wanted ranges, refetching: key={}, wanted={}, have={}",
                    pr.key, pr.wanted_ranges, doc.ranges
                );
                pr.cache_status = LookupStatus::KeyMiss;
                pr.needed_ranges = pr.wanted_ranges.clone();
                pr.fetched_ranges = ByteRanges::default();
                return Step::KeyMiss;
            }
        }

        let response = pr.respond_document(&doc, pr.cache_status);
        self.apply_cacheability(pr, decision, doc).await;
        Step::Respond(response)
    }

    /// Ask the origin whether the stale document is still current
    async fn handle_revalidation(&self, pr: &mut ProxyRequest) -> Step {
        if !self.upgrade_lock(pr).await {
            return Step::Rerun;
        }
        pr.revalidation = RevalidationStatus::InProgress;

        match pr.cache_status {
            LookupStatus::RangeMiss => {
                // the range fetch's own validators decide, no extra round trip
                pr.revalidation = RevalidationStatus::Local;
                pr.local_validators = pr.document.as_ref().map(|d| d.caching_policy.clone());
                return Step::RangeMiss;
            }
            LookupStatus::PartialHit => {
                pr.revalidation_request = pr.prepare_revalidation_request();
                return Step::PartialHit;
            }
            _ => {}
        }

        let Some(request) = pr.prepare_revalidation_request() else {
            pr.document = None;
            pr.cache_status = LookupStatus::KeyMiss;
            return Step::KeyMiss;
        };

        match self.fetch_buffered("revalidation", request).await {
            Err(e) => {
                pr.lock = None;
                Step::Respond(self.proxy_error(&e))
            }
            Ok((304, mut h, _)) => {
                let Some(mut doc) = pr.document.take() else {
                    return Step::KeyMiss;
                };
                let refreshed = CachingPolicy::from_response(304, &self.negative_cache, &mut h);
                if refreshed.freshness_lifetime > 0 {
                    doc.caching_policy.merge(&refreshed);
                }
                for name in [CONTENT_LENGTH, CONTENT_TYPE, CONTENT_RANGE] {
                    h.remove(name);
                }
                headers::merge(&mut doc.headers, &h);
                doc.caching_policy.is_fresh = true;
                doc.caching_policy.local_date = Some(Utc::now());

                info!("Cache entry revalidated: key={}", pr.key);
                pr.revalidation = RevalidationStatus::Succeeded;
                pr.cache_status = LookupStatus::Revalidated;
                let response = pr.respond_document(&doc, LookupStatus::Revalidated);
                self.store_document(pr, doc);
                Step::Respond(response)
            }
            Ok((code, h, body)) => {
                debug!("Revalidation returned new content: key={}, status={}", pr.key, code);
                pr.revalidation = RevalidationStatus::Failed;
                pr.document = None;
                pr.cache_status = LookupStatus::KeyMiss;
                Step::Respond(self.finish_key_miss(pr, code, h, body).await)
            }
        }
    }

    /// Fetch the object from the origin
    async fn handle_key_miss(&self, pr: &mut ProxyRequest) -> Step {
        if !self.upgrade_lock(pr).await {
            return Step::Rerun;
        }
        pr.cache_status = LookupStatus::KeyMiss;
        pr.document = None;

        let request = pr.upstream_request_for(&pr.wanted_ranges);
        let response = match self.upstream.fetch(request).await {
            Ok(r) => r,
            Err(e) => {
                self.metrics.record_upstream_failure("full");
                warn!("Origin fetch failed: key={}, error={}", pr.key, e);
                pr.lock = None;
                return Step::Respond(self.proxy_error(&e));
            }
        };
        self.metrics.record_upstream("full", response.status);

        let collapsible = self.config.collapsed_forwarding && !pr.wants_ranges && response.status == 200;
        if collapsible {
            let content_length = response.content_length();
            if content_length >= 0 && content_length as u64 <= self.config.max_object_size_bytes {
                if let Some(fwd) = CollapsedForwarder::new(response.status, response.headers.clone(), content_length) {
                    return Step::Respond(self.forward_collapsed(pr, fwd, response));
                }
            }
            debug!(
                "Response not eligible for collapsed forwarding: key={}, content_length={}",
                pr.key, content_length
            );
        }

        match response.into_parts().await {
            Ok((code, h, body)) => Step::Respond(self.finish_key_miss(pr, code, h, body).await),
            Err(e) => {
                self.metrics.record_upstream_failure("full");
                warn!("Origin body read failed: key={}, error={}", pr.key, e);
                pr.lock = None;
                Step::Respond(self.proxy_error(&e))
            }
        }
    }

    /// Build, answer with and maybe store a document from a buffered origin response
    async fn finish_key_miss(&self, pr: &mut ProxyRequest, code: u16, mut h: HeaderMap, body: Bytes) -> ProxyResponse {
        let mut policy = CachingPolicy::from_response(code, &self.negative_cache, &mut h);
        let decision = pr.determine_cacheability(code, &mut policy, &mut h);
        let doc = match document_from_response(code, h, body, policy) {
            Ok(d) => d,
            Err(e) => return self.reject_origin_body(pr, "full", &e),
        };
        let response = pr.respond_document(&doc, pr.cache_status);
        self.apply_cacheability(pr, decision, doc).await;
        response
    }

    /// Stream the origin response through a collapsed forwarder
    ///
    /// The producer runs on its own task so the body keeps flowing into the
    /// forwarder (and later into the cache) whatever the clients do. Other
    /// requests for the key attach readers while it is registered.
    fn forward_collapsed(
        &self,
        pr: &mut ProxyRequest,
        fwd: Arc<CollapsedForwarder>,
        response: UpstreamResponse,
    ) -> ProxyResponse {
        let UpstreamResponse {
            status: code,
            headers: mut h,
            body,
        } = response;
        let mut policy = CachingPolicy::from_response(code, &self.negative_cache, &mut h);
        let decision = pr.determine_cacheability(code, &mut policy, &mut h);

        let registered = self.forwarders.register(&pr.key, fwd.clone());
        if !registered {
            debug!("Collapsed fetch already in flight, not registering: key={}", pr.key);
        }
        let content_length = fwd.capacity();
        let reader = fwd.reader();

        let engine = self.clone();
        let key = pr.key.clone();
        let lock = pr.lock.take();
        let factor = self.ttl_factor(pr);
        let doc_headers = h.clone();
        let pending = self.pending.begin();
        tokio::spawn(async move {
            let _pending = pending;
            let result = fwd.forward(body.into_stream()).await;
            let complete = result.is_ok() && fwd.written() == fwd.capacity();
            if let Err(e) = &result {
                warn!("Collapsed fetch failed: key={}, error={}", key, e);
            }

            match decision {
                Cacheability::Write if complete => match fwd.body() {
                    Ok(body) => match document_from_response(code, doc_headers, body, policy) {
                        Ok(doc) => engine.write_document(&key, doc, factor, lock).await,
                        Err(e) => warn!("Collapsed body not cacheable: key={}, error={}", key, e),
                    },
                    Err(e) => warn!("Collapsed body unavailable: key={}, error={}", key, e),
                },
                Cacheability::Remove => {
                    if let Err(e) = cache::purge_cache(&engine.store, &key, &engine.options).await {
                        warn!("Failed to remove uncacheable key: key={}, error={}", key, e);
                    }
                }
                _ => {}
            }
            if registered {
                engine.forwarders.remove(&key);
            }
        });

        if pr.client_policy.is_client_conditional {
            let conditional = pr.respond_raw(code, h.clone(), Bytes::new(), pr.cache_status);
            if conditional.status != code {
                return conditional;
            }
        }

        headers::set_str(&mut h, CONTENT_LENGTH, &content_length.to_string());
        status::set_result_header(&mut h, pr.cache_status, "", &ByteRanges::default());
        let body = if pr.client.method == Method::HEAD {
            ResponseBody::empty()
        } else {
            ResponseBody::Stream(reader.into_stream())
        };
        ProxyResponse {
            status: code,
            headers: h,
            body,
            lookup_status: pr.cache_status,
        }
    }

    /// Serve a request from an in-flight collapsed fetch, if one exists
    ///
    /// Range requests wait only for the bytes they ask for. A range the
    /// forwarder cannot serve falls back to the normal lookup.
    async fn join_inflight(&self, pr: &ProxyRequest) -> Option<ProxyResponse> {
        if !self.config.collapsed_forwarding {
            return None;
        }
        let fwd = self.forwarders.get(&pr.key)?;
        if pr.wants_ranges {
            return self.join_inflight_ranges(pr, &fwd).await;
        }
        debug!("Joining in-flight fetch: key={}", pr.key);

        let mut h = fwd.headers().clone();
        headers::set_str(&mut h, CONTENT_LENGTH, &fwd.capacity().to_string());
        status::set_result_header(&mut h, LookupStatus::ProxyHit, "", &ByteRanges::default());
        let body = if pr.client.method == Method::HEAD {
            ResponseBody::empty()
        } else {
            ResponseBody::Stream(fwd.reader().into_stream())
        };
        Some(ProxyResponse {
            status: fwd.status(),
            headers: h,
            body,
            lookup_status: LookupStatus::ProxyHit,
        })
    }

    async fn join_inflight_ranges(&self, pr: &ProxyRequest, fwd: &CollapsedForwarder) -> Option<ProxyResponse> {
        let full_length = fwd.capacity() as i64;
        if fwd.status() != 200 || full_length == 0 {
            return None;
        }
        let wanted = pr.wanted_ranges.resolve(full_length);
        if wanted.iter().any(|r| r.start < 0 || r.start > r.end || r.end >= full_length) {
            return None;
        }
        debug!("Joining in-flight fetch for ranges: key={}, ranges={}", pr.key, wanted);

        let mut parts = RangeParts::new();
        for range in wanted.iter() {
            match fwd.read_range(*range).await {
                Ok(content) => parts.insert(RangePart::new(*range, content)),
                Err(e) => {
                    debug!("In-flight fetch cannot serve range: key={}, range={}, error={}", pr.key, range, e);
                    return None;
                }
            }
        }

        let mut h = fwd.headers().clone();
        let content_type = headers::get_str(&h, CONTENT_TYPE).unwrap_or_default().to_string();
        let (part_headers, content) = parts.body(full_length, &content_type);
        headers::merge(&mut h, &part_headers);
        headers::set_str(&mut h, CONTENT_LENGTH, &content.len().to_string());
        status::set_result_header(&mut h, LookupStatus::ProxyHit, "", &ByteRanges::default());
        let body = if pr.client.method == Method::HEAD {
            Bytes::new()
        } else {
            content
        };
        Some(ProxyResponse::full(206, h, body, LookupStatus::ProxyHit))
    }

    /// Forward the request untouched
    async fn proxy_only(&self, pr: &ProxyRequest) -> ProxyResponse {
        match self.upstream.fetch(pr.proxy_request()).await {
            Ok(response) => {
                self.metrics.record_upstream("proxy", response.status);
                let mut h = response.headers;
                status::set_result_header(&mut h, LookupStatus::ProxyOnly, "", &ByteRanges::default());
                ProxyResponse {
                    status: response.status,
                    headers: h,
                    body: response.body.into(),
                    lookup_status: LookupStatus::ProxyOnly,
                }
            }
            Err(e) => {
                self.metrics.record_upstream_failure("proxy");
                warn!("Proxy request failed: key={}, error={}", pr.key, e);
                self.proxy_error(&e)
            }
        }
    }

    /// Answer with a gateway error for an origin body that cannot be used, caching nothing
    fn reject_origin_body(&self, pr: &mut ProxyRequest, kind: &str, e: &CacheError) -> ProxyResponse {
        warn!("Discarding unusable origin response: key={}, kind={}, error={}", pr.key, kind, e);
        self.metrics.record_upstream_failure(kind);
        pr.lock = None;
        self.proxy_error(e)
    }

    fn proxy_error(&self, e: &CacheError) -> ProxyResponse {
        let mut h = HeaderMap::new();
        status::set_result_header(&mut h, LookupStatus::ProxyError, "", &ByteRanges::default());
        ProxyResponse::full(e.to_http_status(), h, Bytes::new(), LookupStatus::ProxyError)
    }

    async fn fetch_buffered(&self, kind: &str, request: UpstreamRequest) -> Result<(u16, HeaderMap, Bytes)> {
        let result = async { self.upstream.fetch(request).await?.into_parts().await }.await;
        match &result {
            Ok((code, _, _)) => self.metrics.record_upstream(kind, *code),
            Err(e) => {
                self.metrics.record_upstream_failure(kind);
                warn!("Origin fetch failed: kind={}, error={}", kind, e);
            }
        }
        result
    }

    async fn apply_cacheability(&self, pr: &mut ProxyRequest, decision: Cacheability, doc: HttpDocument) {
        match decision {
            Cacheability::Write => self.store_document(pr, doc),
            Cacheability::Remove => {
                debug!("Response is not cacheable, removing key: key={}", pr.key);
                if let Err(e) = cache::purge_cache(&self.store, &pr.key, &self.options).await {
                    warn!("Failed to remove uncacheable key: key={}, error={}", pr.key, e);
                }
                pr.lock = None;
            }
            Cacheability::Skip => pr.lock = None,
        }
    }

    fn ttl_factor(&self, pr: &ProxyRequest) -> f64 {
        if pr.alternate_ttl_applied {
            1.0
        } else {
            self.config.revalidation_factor
        }
    }

    /// Write a document in the background; the key lock is held until the write ends
    fn store_document(&self, pr: &mut ProxyRequest, doc: HttpDocument) {
        let engine = self.clone();
        let key = pr.key.clone();
        let lock = pr.lock.take();
        let factor = self.ttl_factor(pr);
        let pending = self.pending.begin();
        tokio::spawn(async move {
            let _pending = pending;
            engine.write_document(&key, doc, factor, lock).await;
        });
    }

    async fn write_document(&self, key: &str, mut doc: HttpDocument, factor: f64, lock: Option<NamedLock>) {
        let max_ttl = self.config.max_ttl();
        let mut ttl = doc.caching_policy.ttl(factor, max_ttl);
        if ttl.is_zero() && doc.caching_policy.can_revalidate {
            // stale but revalidatable copies are still worth keeping
            ttl = max_ttl;
        }
        if ttl.is_zero() {
            debug!("Not caching document without lifetime: key={}", key);
            return;
        }
        let size = (doc.size() as u64).max(doc.held_length().max(0) as u64);
        if size > self.config.max_object_size_bytes {
            debug!(
                "Not caching oversized document: key={}, size={}, max={}",
                key, size, self.config.max_object_size_bytes
            );
            return;
        }

        match cache::write_cache(&self.store, key, &mut doc, ttl, &self.options, None).await {
            Ok(()) => {
                self.metrics.record_write(true);
                debug!("Cache write complete: key={}, ttl_secs={}", key, ttl.as_secs());
            }
            Err(e) => {
                self.metrics.record_write(false);
                error!("Cache write failed: key={}, error={}", key, e);
            }
        }
        drop(lock);
    }
}
