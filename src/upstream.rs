//! Origin client
//!
//! The engine talks to the origin through the [`Upstream`] trait so tests
//! can substitute an in-process origin. [`HttpUpstream`] is the reqwest
//! implementation used by the server.

use crate::error::{CacheError, Result};
use crate::headers::{self, CONTENT_LENGTH};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::{HeaderMap, Method};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers that describe one connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A request to the origin
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path and query, e.g. `/video.mp4?v=2`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>, headers: HeaderMap) -> Self {
        UpstreamRequest {
            method,
            path_and_query: path_and_query.into(),
            headers,
            body: Bytes::new(),
        }
    }
}

/// Body of an origin response
pub enum UpstreamBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            UpstreamBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl UpstreamBody {
    /// Read the whole body into memory
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            UpstreamBody::Full(b) => Ok(b),
            UpstreamBody::Stream(mut stream) => {
                let mut out = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(out.freeze())
            }
        }
    }

    /// View the body as a stream of blocks
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        match self {
            UpstreamBody::Full(b) => futures::stream::once(async move { Ok(b) }).boxed(),
            UpstreamBody::Stream(s) => s,
        }
    }
}

/// An origin response
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn full(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Full(body),
        }
    }

    /// Declared `Content-Length`, -1 when absent or malformed
    pub fn content_length(&self) -> i64 {
        match &self.body {
            UpstreamBody::Full(b) if !self.headers.contains_key(CONTENT_LENGTH) => b.len() as i64,
            _ => headers::get_str(&self.headers, CONTENT_LENGTH)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .unwrap_or(-1),
        }
    }

    /// Buffer the whole response
    pub async fn into_parts(self) -> Result<(u16, HeaderMap, Bytes)> {
        let body = self.body.collect().await?;
        Ok((self.status, self.headers, body))
    }
}

/// Source of origin responses
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// Origin client over HTTP
pub struct HttpUpstream {
    client: Client,
    origin: String,
}

impl HttpUpstream {
    /// Create a client for `origin_url`, e.g. `http://127.0.0.1:8080`
    ///
    /// # Arguments
    /// * `origin_url` - Scheme and authority of the origin, optionally with a base path
    /// * `timeout` - Whole-request timeout
    pub fn new(origin_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(origin_url)
            .map_err(|e| CacheError::ConfigError(format!("invalid origin url {}: {}", origin_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CacheError::ConfigError(format!(
                "origin url must be http or https: {}",
                origin_url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CacheError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpUpstream {
            client,
            origin: origin_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.origin, path_and_query)
        } else {
            format!("{}/{}", self.origin, path_and_query)
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let url = self.url_for(&request.path_and_query);
        let mut forwarded = request.headers;
        for name in HOP_BY_HOP {
            forwarded.remove(*name);
        }
        debug!("Upstream request: method={}, url={}", request.method, url);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(forwarded);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!("Upstream request failed: url={}, error={}", url, e);
            CacheError::from(e)
        })?;

        let status = response.status().as_u16();
        let mut headers = response.headers().clone();
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }
        debug!("Upstream response: url={}, status={}", url, status);

        let body = if request.method == Method::HEAD {
            UpstreamBody::Full(Bytes::new())
        } else {
            UpstreamBody::Stream(response.bytes_stream().map_err(CacheError::from).boxed())
        };
        Ok(UpstreamResponse { status, headers, body })
    }
}
