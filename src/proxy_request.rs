//! Per-request state of the object proxy cache
//!
//! A [`ProxyRequest`] carries everything one client request accumulates on
//! its way through the engine: the cache key, the ranges wanted from and
//! still needed from the origin, the held key lock, and the revalidation
//! state. It also builds the origin requests and renders the final response.

use crate::config::{CacheConfig, PathConfig};
use crate::document::HttpDocument;
use crate::error::Result;
use crate::headers::{
    self, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, EXPIRES, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, MULTIPART_BYTERANGES, RANGE, RESULT_HEADER,
};
use crate::locks::NamedLock;
use crate::policy::CachingPolicy;
use crate::ranges::{ByteRange, ByteRanges};
use crate::status::{self, LookupStatus};
use crate::upstream::{UpstreamBody, UpstreamRequest};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use http::{HeaderMap, Method, Uri};
use std::time::{Duration, Instant};
use tracing::debug;

/// A request as received from a client
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ClientRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        ClientRequest {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Builder-style header setter, mostly for tests and programmatic callers
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        headers::set_str(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn path_and_query(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }
}

/// Body of a response sent to the client
pub enum ResponseBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Full(Bytes::new())
    }

    pub async fn collect(self) -> Result<Bytes> {
        match self {
            ResponseBody::Full(b) => Ok(b),
            ResponseBody::Stream(mut stream) => {
                let mut out = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(out.freeze())
            }
        }
    }
}

impl From<UpstreamBody> for ResponseBody {
    fn from(body: UpstreamBody) -> Self {
        match body {
            UpstreamBody::Full(b) => ResponseBody::Full(b),
            UpstreamBody::Stream(s) => ResponseBody::Stream(s),
        }
    }
}

/// The engine's answer to a client request
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// How the request was served; also reported in the result header
    pub lookup_status: LookupStatus,
}

impl ProxyResponse {
    pub fn full(status: u16, headers: HeaderMap, body: Bytes, lookup_status: LookupStatus) -> Self {
        ProxyResponse {
            status,
            headers,
            body: ResponseBody::Full(body),
            lookup_status,
        }
    }

    /// The result header value, if set
    pub fn result_header(&self) -> Option<&str> {
        headers::get_str(&self.headers, RESULT_HEADER)
    }

    /// Buffer the whole response
    pub async fn collect(self) -> Result<(u16, HeaderMap, Bytes)> {
        let body = self.body.collect().await?;
        Ok((self.status, self.headers, body))
    }
}

/// Progress of revalidating a stale cached document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevalidationStatus {
    #[default]
    None,
    /// A conditional request is being prepared or is in flight
    InProgress,
    /// Validators of the range fetch response are compared locally
    Local,
    Succeeded,
    Failed,
}

/// What to do with a fetched document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    Write,
    Skip,
    /// Do not write, and drop whatever is cached under the key
    Remove,
}

/// State of one client request inside the engine
pub struct ProxyRequest {
    pub client: ClientRequest,
    /// Body sent upstream; a key hasher may have rewritten the client's
    pub upstream_body: Bytes,
    pub key: String,
    pub cache_status: LookupStatus,
    /// The cached document, once looked up
    pub document: Option<HttpDocument>,

    pub wants_ranges: bool,
    pub wanted_ranges: ByteRanges,
    /// Ranges the cache cannot serve and the origin must supply
    pub needed_ranges: ByteRanges,
    /// Ranges fetched from the origin while serving this request
    pub fetched_ranges: ByteRanges,

    /// Policy expressed by the client request, with its conditionals parsed
    pub client_policy: CachingPolicy,
    pub alternate_ttl: Option<Duration>,
    /// Set once the alternate TTL replaced the origin's policy
    pub alternate_ttl_applied: bool,

    pub lock: Option<NamedLock>,
    pub revalidation: RevalidationStatus,
    pub revalidation_request: Option<UpstreamRequest>,
    /// Validators of the stale document during a local revalidation
    pub local_validators: Option<CachingPolicy>,

    pub rerun_count: usize,
    pub started: Instant,
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("key", &self.key)
            .field("method", &self.client.method)
            .field("cache_status", &self.cache_status)
            .field("wanted_ranges", &self.wanted_ranges)
            .field("needed_ranges", &self.needed_ranges)
            .field("revalidation", &self.revalidation)
            .field("rerun_count", &self.rerun_count)
            .finish()
    }
}

impl ProxyRequest {
    /// Create the state for a client request whose cache key is already derived
    ///
    /// # Arguments
    /// * `client` - The client request
    /// * `key` - Cache key of the request
    /// * `upstream_body` - Body to send upstream in place of the client's, if rewritten
    /// * `config` - Engine configuration
    /// * `path_config` - Configuration of the matched path, if any
    pub fn new(
        client: ClientRequest,
        key: String,
        upstream_body: Option<Bytes>,
        config: &CacheConfig,
        path_config: Option<&PathConfig>,
    ) -> Self {
        let mut client_policy = CachingPolicy::from_request(&client.headers);
        client_policy.parse_client_conditionals();
        let upstream_body = upstream_body.unwrap_or_else(|| client.body.clone());

        let mut pr = ProxyRequest {
            client,
            upstream_body,
            key,
            cache_status: LookupStatus::KeyMiss,
            document: None,
            wants_ranges: false,
            wanted_ranges: ByteRanges::default(),
            needed_ranges: ByteRanges::default(),
            fetched_ranges: ByteRanges::default(),
            client_policy,
            alternate_ttl: path_config.and_then(PathConfig::alternate_cache_ttl),
            alternate_ttl_applied: false,
            lock: None,
            revalidation: RevalidationStatus::None,
            revalidation_request: None,
            local_validators: None,
            rerun_count: 0,
            started: Instant::now(),
        };
        pr.parse_request_ranges(config.multipart_ranges_disabled);
        pr
    }

    /// Reset the lookup state so the request can start over
    ///
    /// The key lock is kept; after a lost upgrade it is already back to a read lock.
    pub fn reset_for_rerun(&mut self) {
        self.document = None;
        self.cache_status = LookupStatus::KeyMiss;
        self.needed_ranges = self.wanted_ranges.clone();
        self.fetched_ranges = ByteRanges::default();
        self.revalidation = RevalidationStatus::None;
        self.revalidation_request = None;
        self.local_validators = None;
        self.alternate_ttl_applied = false;
        self.rerun_count += 1;
    }

    /// Read the client's `Range` header
    ///
    /// Several ranges are collapsed into a request for the whole object when
    /// multipart ranges are disabled.
    pub fn parse_request_ranges(&mut self, multipart_ranges_disabled: bool) {
        let parsed = headers::get_str(&self.client.headers, RANGE).and_then(ByteRanges::parse_range_header);
        match parsed {
            Some(ranges) if !ranges.is_empty() => {
                if multipart_ranges_disabled && ranges.len() > 1 {
                    debug!("Multipart ranges disabled, requesting whole object: key={}", self.key);
                    self.wants_ranges = false;
                    self.wanted_ranges = ByteRanges::default();
                } else {
                    self.wants_ranges = true;
                    self.wanted_ranges = ranges;
                }
            }
            _ => {
                self.wants_ranges = false;
                self.wanted_ranges = ByteRanges::default();
            }
        }
        self.needed_ranges = self.wanted_ranges.clone();
    }

    /// Whether the request may be answered from cache at all
    pub fn is_cacheable_method(&self) -> bool {
        matches!(self.client.method, Method::GET | Method::HEAD)
    }

    /// Method used for cacheable origin fetches; HEAD is fetched as GET so the body can be cached
    fn upstream_method(&self) -> Method {
        if self.client.method == Method::HEAD {
            Method::GET
        } else {
            self.client.method.clone()
        }
    }

    /// Client headers as forwarded to the origin for a cacheable fetch
    fn base_upstream_headers(&self) -> HeaderMap {
        let mut h = self.client.headers.clone();
        h.remove(RANGE);
        h.remove(RESULT_HEADER);
        // client conditionals are resolved by the cache, never by the origin
        headers::strip_conditionals(&mut h);
        h
    }

    /// The client request forwarded verbatim
    pub fn proxy_request(&self) -> UpstreamRequest {
        let mut req = UpstreamRequest::new(
            self.client.method.clone(),
            self.client.path_and_query(),
            self.client.headers.clone(),
        );
        req.headers.remove(RESULT_HEADER);
        req.body = self.upstream_body.clone();
        req
    }

    /// A request for the ranges in `ranges`, or for the whole object when empty
    pub fn upstream_request_for(&self, ranges: &ByteRanges) -> UpstreamRequest {
        let mut h = self.base_upstream_headers();
        if !ranges.is_empty() {
            headers::set_str(&mut h, RANGE, &ranges.to_request_header());
        }
        let mut req = UpstreamRequest::new(self.upstream_method(), self.client.path_and_query(), h);
        req.body = self.upstream_body.clone();
        req
    }

    /// Build the origin requests for the needed ranges
    ///
    /// With `dearticulate` each needed range gets its own request; otherwise
    /// one request asks for all of them. The cached document is marked stale
    /// since it is about to be extended.
    pub fn prepare_upstream_requests(&mut self, dearticulate: bool) -> Vec<UpstreamRequest> {
        if let Some(doc) = self.document.as_mut() {
            doc.caching_policy.is_fresh = false;
        }
        if self.needed_ranges.is_empty() {
            return vec![self.upstream_request_for(&ByteRanges::default())];
        }
        if dearticulate {
            self.needed_ranges
                .iter()
                .map(|r| self.upstream_request_for(&ByteRanges(vec![*r])))
                .collect()
        } else {
            vec![self.upstream_request_for(&self.needed_ranges)]
        }
    }

    /// Build the conditional request that revalidates the cached document
    ///
    /// For a partial hit only the cached part of the wanted ranges is asked
    /// for, so a changed object comes back as content worth merging.
    pub fn prepare_revalidation_request(&self) -> Option<UpstreamRequest> {
        let doc = self.document.as_ref()?;
        let cp = &doc.caching_policy;

        let mut h = self.base_upstream_headers();
        if !cp.etag.is_empty() {
            headers::set_str(&mut h, IF_NONE_MATCH, &cp.etag);
        }
        if let Some(lm) = cp.last_modified {
            headers::set_str(&mut h, IF_MODIFIED_SINCE, &headers::format_http_date(lm));
        }
        if !h.contains_key(IF_NONE_MATCH) && !h.contains_key(IF_MODIFIED_SINCE) {
            return None;
        }

        if self.cache_status == LookupStatus::PartialHit {
            let cached = self
                .wanted_ranges
                .resolve(doc.content_length)
                .calculate_delta(&self.needed_ranges, doc.content_length);
            let ranges = if cached.is_empty() {
                doc.ranges.iter().take(1).copied().collect()
            } else {
                cached
            };
            if !ranges.is_empty() {
                headers::set_str(&mut h, RANGE, &ranges.to_request_header());
            }
        }

        Some(UpstreamRequest::new(self.upstream_method(), self.client.path_and_query(), h))
    }

    /// Compare a fresh response's validators with the stale document's
    ///
    /// A match means the cached parts are still good. A mismatch drops the
    /// cached document and turns the request into a key miss.
    fn resolve_local_revalidation(&mut self, fresh: &CachingPolicy) {
        let Some(old) = self.local_validators.take() else {
            return;
        };
        let mut lp = fresh.clone();
        lp.reset_client_conditionals();
        lp.if_none_match_value = old.etag.clone();
        lp.if_modified_since = old.last_modified;
        lp.parse_client_conditionals();
        lp.resolve_client_conditionals(LookupStatus::PartialHit);

        if lp.is_client_conditional && lp.is_client_fresh {
            debug!("Local revalidation succeeded: key={}", self.key);
            self.revalidation = RevalidationStatus::Succeeded;
        } else {
            debug!("Local revalidation failed: key={}", self.key);
            self.revalidation = RevalidationStatus::Failed;
            self.cache_status = LookupStatus::KeyMiss;
            self.document = None;
        }
    }

    /// Decide whether an origin response is written to cache
    ///
    /// Rules apply in order: error statuses are only kept as negative-cache
    /// entries; a pending local revalidation is resolved; an alternate TTL
    /// replaces the origin's policy; uncacheable responses evict the key;
    /// anything not already fresh is written.
    pub fn determine_cacheability(
        &mut self,
        status: u16,
        policy: &mut CachingPolicy,
        response_headers: &mut HeaderMap,
    ) -> Cacheability {
        if status >= 400 {
            for name in [CACHE_CONTROL, EXPIRES, LAST_MODIFIED, ETAG, CONTENT_LENGTH] {
                response_headers.remove(name);
            }
            return if policy.is_negative_cache {
                Cacheability::Write
            } else {
                Cacheability::Skip
            };
        }

        if self.revalidation == RevalidationStatus::Local {
            self.resolve_local_revalidation(policy);
        }

        if let Some(ttl) = self.alternate_ttl {
            *policy = CachingPolicy {
                local_date: Some(Utc::now()),
                freshness_lifetime: ttl.as_secs() as i64,
                ..Default::default()
            };
            self.alternate_ttl_applied = true;
            return Cacheability::Write;
        }

        if policy.no_cache || (!policy.can_revalidate && policy.freshness_lifetime <= 0) {
            return Cacheability::Remove;
        }

        if !policy.is_fresh {
            return Cacheability::Write;
        }
        Cacheability::Skip
    }

    /// Client conditionals resolved against a document's validators
    fn resolved_conditionals(&self, doc_policy: &CachingPolicy, status: LookupStatus) -> CachingPolicy {
        let mut cp = self.client_policy.clone();
        cp.merge(doc_policy);
        cp.parse_client_conditionals();
        cp.resolve_client_conditionals(status);
        cp
    }

    /// Answer for a client whose conditionals are satisfied, if they are
    fn not_modified(&self, headers: &HeaderMap, cp: &CachingPolicy, status: LookupStatus) -> Option<ProxyResponse> {
        if !cp.is_client_fresh {
            return None;
        }
        let mut h = headers.clone();
        h.remove(CONTENT_LENGTH);
        h.remove(CONTENT_RANGE);
        let code = if !self.is_cacheable_method() && cp.has_if_none_match {
            412
        } else {
            304
        };
        status::set_result_header(&mut h, status, "", &self.fetched_ranges);
        Some(ProxyResponse::full(code, h, Bytes::new(), status))
    }

    /// Render the response to the client from a document
    ///
    /// Resolves client conditionals first (304, or 412 for `If-None-Match`
    /// on other methods). Wanted ranges are cut out of the document; ranges
    /// it cannot satisfy yield a 416. A partial document served without
    /// ranges is rendered from its parts.
    pub fn respond_document(&self, doc: &HttpDocument, status: LookupStatus) -> ProxyResponse {
        let mut h = doc.headers.clone();
        h.remove(RESULT_HEADER);

        let cp = self.resolved_conditionals(&doc.caching_policy, status);
        if let Some(resp) = self.not_modified(&h, &cp, status) {
            return resp;
        }

        let mut code = doc.status_code;
        let body;
        let is_content = code == 200 || code == 206;

        if is_content && self.wants_ranges {
            match doc.range_parts.extract_response_range(
                &self.wanted_ranges,
                doc.content_length,
                &doc.content_type,
                &doc.body,
            ) {
                Ok((part_headers, b)) => {
                    h.remove(CONTENT_TYPE);
                    headers::merge(&mut h, &part_headers);
                    code = 206;
                    body = b;
                }
                Err(e) => {
                    debug!("Unsatisfiable range: key={}, ranges={}, error={}", self.key, self.wanted_ranges, e);
                    let full_length = if doc.content_length >= 0 {
                        doc.content_length
                    } else {
                        doc.body.len() as i64
                    };
                    h.remove(CONTENT_TYPE);
                    headers::set_str(&mut h, CONTENT_RANGE, &format!("bytes */{}", full_length));
                    code = 416;
                    body = Bytes::new();
                }
            }
        } else if is_content && !doc.range_parts.is_empty() {
            let (part_headers, b) = doc.range_parts.body(doc.content_length, &doc.content_type);
            h.remove(CONTENT_TYPE);
            headers::merge(&mut h, &part_headers);
            code = 206;
            body = b;
        } else {
            h.remove(CONTENT_RANGE);
            if !doc.content_type.is_empty() && !doc.content_type.starts_with(MULTIPART_BYTERANGES) {
                headers::set_str(&mut h, CONTENT_TYPE, &doc.content_type);
            }
            body = doc.body.clone();
        }

        self.finish_response(code, h, body, status)
    }

    /// Render an origin response passed through without a document
    pub fn respond_raw(&self, code: u16, mut h: HeaderMap, body: Bytes, status: LookupStatus) -> ProxyResponse {
        if !self.client_policy.is_client_conditional || code >= 300 {
            return self.finish_response(code, h, body, status);
        }
        let mut lp = CachingPolicy::default();
        lp.etag = headers::get_str(&h, ETAG).unwrap_or_default().to_string();
        lp.last_modified = headers::get_str(&h, LAST_MODIFIED).and_then(headers::parse_http_date);
        let cp = self.resolved_conditionals(&lp, status);
        if let Some(resp) = self.not_modified(&h, &cp, status) {
            return resp;
        }
        h.remove(RESULT_HEADER);
        self.finish_response(code, h, body, status)
    }

    fn finish_response(&self, code: u16, mut h: HeaderMap, body: Bytes, status: LookupStatus) -> ProxyResponse {
        headers::set_str(&mut h, CONTENT_LENGTH, &body.len().to_string());
        status::set_result_header(&mut h, status, "", &self.fetched_ranges);
        let body = if self.client.method == Method::HEAD {
            Bytes::new()
        } else {
            body
        };
        ProxyResponse::full(code, h, body, status)
    }

    /// The wanted ranges resolved against a known length, or the whole object
    pub fn resolved_wants(&self, full_length: i64) -> ByteRanges {
        if self.wanted_ranges.is_empty() && full_length > 0 {
            return ByteRanges(vec![ByteRange::new(0, full_length - 1)]);
        }
        self.wanted_ranges.resolve(full_length)
    }
}
