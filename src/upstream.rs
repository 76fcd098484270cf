//! HTTP client used to forward requests to running apps

use crate::error::ProxyError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Pooled HTTP/1.1 client for app traffic
#[derive(Clone)]
pub struct Upstream {
    client: Client<HttpConnector, Incoming>,
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self { client }
    }

    /// Send `req` to the app listening on `addr`. The Host header is kept as
    /// the client sent it; hop-by-hop headers are removed both ways.
    pub async fn send(
        &self,
        req: Request<Incoming>,
        addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri: Uri = format!("http://{}{}", addr, path)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::Protocol(e.to_string()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        // Apps speak HTTP/1.1 even when the client used HTTP/2
        parts.version = Version::HTTP_11;
        remove_hop_by_hop(&mut parts.headers);

        debug!(%addr, method = %parts.method, uri = %parts.uri, "Forwarding request");
        let response = self.client.request(Request::from_parts(parts, body)).await?;

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Strip hop-by-hop headers, including any named in `Connection`
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Whether a header name is hop-by-hop
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}
