//! HTTP front end
//!
//! Serves the engine over HTTP/1 with hyper. Every request is handed to
//! [`ObjectProxyCache`], except `GET /metrics`, which renders the Prometheus
//! registry, and the `PURGE` method, which evicts the addressed object.

use crate::engine::ObjectProxyCache;
use crate::error::CacheError;
use crate::proxy_request::{ClientRequest, ProxyResponse, ResponseBody};
use bytes::Bytes;
use futures::stream::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

type Body = UnsyncBoxBody<Bytes, CacheError>;

/// Path the metrics are served on
pub const METRICS_PATH: &str = "/metrics";

/// HTTP server in front of the engine
pub struct ProxyServer {
    engine: ObjectProxyCache,
    addr: SocketAddr,
}

impl ProxyServer {
    /// Create a server
    ///
    /// # Arguments
    /// * `engine` - The engine requests are handed to
    /// * `addr` - Address to listen on
    pub fn new(engine: ObjectProxyCache, addr: SocketAddr) -> Self {
        Self { engine, addr }
    }

    /// Accept connections until the process is terminated
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Object proxy cache listening on http://{}", self.addr);
        info!("Metrics available at http://{}{}", self.addr, METRICS_PATH);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Accepted connection: peer={}", peer);
            let io = TokioIo::new(stream);
            let engine = self.engine.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let engine = engine.clone();
                    async move { handle_request(req, engine).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

/// Route one HTTP request
async fn handle_request(req: Request<Incoming>, engine: ObjectProxyCache) -> Result<Response<Body>, hyper::Error> {
    if req.method() == Method::GET && req.uri().path() == METRICS_PATH {
        return Ok(metrics_response(&engine));
    }

    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let client = ClientRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    };

    let response = if client.method.as_str() == "PURGE" {
        engine.purge(&client).await
    } else {
        engine.handle(client).await
    };
    Ok(into_hyper(response))
}

fn full(body: Bytes) -> Body {
    Full::new(body).map_err(|never| match never {}).boxed_unsync()
}

/// Convert an engine response, streaming bodies stay streamed
fn into_hyper(response: ProxyResponse) -> Response<Body> {
    let body = match response.body {
        ResponseBody::Full(b) => full(b),
        ResponseBody::Stream(s) => StreamBody::new(s.map(|chunk| chunk.map(Frame::data))).boxed_unsync(),
    };
    let mut out = Response::new(body);
    *out.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    *out.headers_mut() = response.headers;
    out
}

fn metrics_response(engine: &ObjectProxyCache) -> Response<Body> {
    let mut out = Response::new(full(Bytes::from(engine.metrics().render())));
    if let Ok(value) = "text/plain; version=0.0.4; charset=utf-8".parse() {
        out.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::LookupStatus;
    use http::HeaderMap;

    #[tokio::test]
    async fn test_into_hyper_stream() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ])
        .boxed();
        let response = ProxyResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: ResponseBody::Stream(stream),
            lookup_status: LookupStatus::KeyMiss,
        };
        let out = into_hyper(response);
        assert_eq!(out.status(), StatusCode::OK);
        let body = out.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"abcd");
    }

    #[test]
    fn test_into_hyper_bad_status() {
        let response = ProxyResponse::full(1000, HeaderMap::new(), Bytes::new(), LookupStatus::ProxyError);
        assert_eq!(into_hyper(response).status(), StatusCode::BAD_GATEWAY);
    }
}
