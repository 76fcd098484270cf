//! Front end: accepts HTTP and HTTPS connections, routes by Host and
//! proxies to the app, including upgraded connections.

use crate::app::App;
use crate::certs::{tls_acceptor, CertificateSource};
use crate::config::ServerConfig;
use crate::error::{app_error_response, json_error_response, AppError, ErrorCode, ProxyError};
use crate::pool::AppPool;
use crate::upstream::{is_hop_by_hop, Upstream};
use anyhow::Context as _;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;
/// Largest upgrade response head accepted from an app
const MAX_UPGRADE_HEAD: usize = 16 * 1024;
/// Largest body buffered from an app that declined an upgrade
const MAX_DECLINED_BODY: usize = 1024 * 1024;

/// Listener and routing settings for [`HttpServer`]
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: String,
    /// Port 0 picks an ephemeral port
    pub http_port: u16,
    /// None disables HTTPS
    pub https_port: Option<u16>,
    pub domains: Vec<String>,
    pub debug: bool,
}

impl ServerSettings {
    pub fn from_config(config: &ServerConfig, domains: Vec<String>) -> Self {
        Self {
            bind: config.bind.clone(),
            http_port: config.http_port,
            https_port: config.tls_enabled().then_some(config.https_port),
            domains,
            debug: config.debug,
        }
    }
}

/// Request routing state shared by every connection
struct Router {
    pool: Arc<AppPool>,
    upstream: Upstream,
    /// Longest first so the most specific domain wins
    domains: Vec<String>,
    debug: bool,
}

pub struct HttpServer {
    http: TcpListener,
    https: Option<(TcpListener, TlsAcceptor)>,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HttpServer {
    /// Bind the listeners and prepare certificate support
    pub async fn setup(
        settings: ServerSettings,
        pool: Arc<AppPool>,
        certs: Option<Arc<dyn CertificateSource>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let http_addr = format!("{}:{}", settings.bind, settings.http_port);
        let http = TcpListener::bind(&http_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", http_addr))?;

        let https = match (settings.https_port, certs) {
            (Some(port), Some(certs)) => {
                let https_addr = format!("{}:{}", settings.bind, port);
                let listener = TcpListener::bind(&https_addr)
                    .await
                    .with_context(|| format!("failed to bind HTTPS listener on {}", https_addr))?;
                Some((listener, tls_acceptor(certs)))
            }
            (Some(_), None) => anyhow::bail!("HTTPS requires a certificate source"),
            (None, _) => None,
        };

        let mut domains: Vec<String> = settings
            .domains
            .iter()
            .map(|d| d.trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        domains.sort_by_key(|d| std::cmp::Reverse(d.len()));
        domains.dedup();

        Ok(Self {
            http,
            https,
            router: Arc::new(Router {
                pool,
                upstream: Upstream::new(),
                domains,
                debug: settings.debug,
            }),
            shutdown_rx,
        })
    }

    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().and_then(|(listener, _)| listener.local_addr().ok())
    }

    /// Serve plain HTTP until shutdown
    pub async fn serve(&self) -> anyhow::Result<()> {
        self.accept_loop(&self.http, None).await
    }

    /// Serve HTTPS until shutdown. Returns at once when HTTPS is disabled.
    pub async fn serve_tls(&self) -> anyhow::Result<()> {
        match &self.https {
            Some((listener, acceptor)) => self.accept_loop(listener, Some(acceptor.clone())).await,
            None => {
                debug!("HTTPS disabled");
                Ok(())
            }
        }
    }

    async fn accept_loop(&self, listener: &TcpListener, tls: Option<TlsAcceptor>) -> anyhow::Result<()> {
        let protocol = if tls.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let router = Arc::clone(&self.router);
                    let tls = tls.clone();

                    tokio::spawn(async move {
                        if let Some(acceptor) = tls {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    if let Err(e) = handle_connection(tls_stream, addr, router, true).await {
                                        debug!(addr = %addr, error = %e, "TLS connection error");
                                    }
                                }
                                Err(e) => {
                                    debug!(addr = %addr, error = %e, "TLS handshake failed");
                                }
                            }
                        } else if let Err(e) = handle_connection(stream, addr, router, false).await {
                            debug!(addr = %addr, error = %e, "Connection error");
                        }
                    });
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(protocol, "Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, router: Arc<Router>, is_tls: bool) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some((host_header, hostname)) = request_host(&req) else {
        return Ok(json_error_response(ErrorCode::MissingHost, "Missing or invalid Host header"));
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let candidates = app_candidates(&hostname, &router.domains);
    if candidates.is_empty() {
        return Ok(json_error_response(
            ErrorCode::UnknownApp,
            format!("No app configured for host '{}'", hostname),
        ));
    }

    let app = match resolve_app(&router.pool, &candidates).await {
        Ok(app) => app,
        Err(err) => {
            if !matches!(err, AppError::UnknownApp(_)) {
                error!(hostname, error = %err, "Failed to start app");
            }
            return Ok(app_error_response(&err, router.debug));
        }
    };
    let Some(addr) = app.addr() else {
        // Stopped between resolution and now
        return Ok(json_error_response(ErrorCode::ConnectionFailed, "App is not running"));
    };

    // Overwrite rather than append: this proxy is the first hop
    let headers = req.headers_mut();
    if !headers.contains_key(HOST) {
        headers.insert(HOST, host_header.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_HOST, host_header);
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_tls { "https" } else { "http" }),
    );

    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(req, app, addr, request_id).await);
    }

    match router.upstream.send(req, addr).await {
        Ok(response) => {
            app.touch();
            Ok(response)
        }
        Err(e) => {
            error!(name = %app.name(), %addr, error = %e, "Failed to forward request");
            Ok(json_error_response(ErrorCode::ConnectionFailed, "Failed to connect to app"))
        }
    }
}

/// Try each candidate name in order, skipping ones the registry doesn't know
async fn resolve_app(pool: &AppPool, candidates: &[String]) -> Result<Arc<App>, AppError> {
    let mut last_unknown = None;
    for name in candidates {
        match pool.app(name).await {
            Ok(app) => return Ok(app),
            Err(AppError::UnknownApp(name)) => {
                last_unknown.get_or_insert(name);
            }
            Err(e) => return Err(e),
        }
    }
    Err(AppError::UnknownApp(last_unknown.unwrap_or_default()))
}

/// The Host header value and the validated, lowercased hostname without port
fn request_host(req: &Request<Incoming>) -> Option<(HeaderValue, String)> {
    let value = match req.headers().get(HOST) {
        Some(v) => v.clone(),
        // HTTP/2 carries the host in the :authority pseudo-header
        None => HeaderValue::from_str(req.uri().authority()?.as_str()).ok()?,
    };
    let hostname = parse_hostname(value.to_str().ok()?)?;
    Some((value, hostname))
}

fn parse_hostname(host: &str) -> Option<String> {
    let hostname = host.split(':').next()?.trim_end_matches('.');

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Alphanumeric, hyphen and dot only; keeps junk out of logs and names
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// App names to try for `hostname`, most specific first.
///
/// `www.blog.test` with domain `test` yields `["www.blog", "blog"]`. A host
/// that is exactly a domain, or under none of them, yields nothing.
pub fn app_candidates(hostname: &str, domains: &[String]) -> Vec<String> {
    for domain in domains {
        let Some(prefix) = hostname.strip_suffix(domain.as_str()).and_then(|p| p.strip_suffix('.')) else {
            continue;
        };
        if prefix.is_empty() {
            return Vec::new();
        }
        let labels: Vec<&str> = prefix.split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Vec::new();
        }
        return (0..labels.len()).map(|i| labels[i..].join(".")).collect();
    }
    Vec::new()
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the app, keeping the client's Host
fn build_upgrade_request(req: &Request<Incoming>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    let upgrade = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("websocket");
    request.push_str("Connection: Upgrade\r\n");
    request.push_str(&format!("Upgrade: {}\r\n\r\n", upgrade));

    request.into_bytes()
}

/// Status and headers of an HTTP/1.1 response head
fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

/// Read until the end of the response head. Returns the head and any
/// bytes the app sent after it.
async fn read_response_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Protocol("connection closed before response".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(ProxyError::Protocol("response head too large".to_string()));
        }
    }
}

async fn handle_upgrade(
    req: Request<Incoming>,
    app: Arc<App>,
    addr: SocketAddr,
    request_id: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let name = app.name().to_string();
    debug!(name = %name, request_id, "Handling upgrade request");

    let (mut backend, status, headers, leftover) = match open_upgrade(&req, addr).await {
        Ok(opened) => opened,
        Err(e) => {
            error!(name = %name, %addr, error = %e, "Upgrade to app failed");
            return json_error_response(ErrorCode::ConnectionFailed, "Failed to connect to app");
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(name = %name, %status, "App declined upgrade");
        let body = match read_declined_body(&mut backend, status, &headers, leftover).await {
            Ok(body) => body,
            Err(e) => {
                warn!(name = %name, error = %e, "Failed to read app response");
                return json_error_response(ErrorCode::ConnectionFailed, "Invalid response from app");
            }
        };
        app.touch();
        let mut response = Response::builder().status(status);
        for (header, value) in &headers {
            if is_hop_by_hop(header) || header.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let Ok(value) = HeaderValue::from_str(value) {
                response = response.header(header.as_str(), value);
            }
        }
        return response
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| json_error_response(ErrorCode::ConnectionFailed, "Invalid response from app"));
    }

    info!(name = %name, request_id, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (header, value) in &headers {
        if header.eq_ignore_ascii_case("content-length") || header.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response = response.header(header.as_str(), value);
        }
    }
    let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
        Ok(response) => response,
        Err(_) => return json_error_response(ErrorCode::ConnectionFailed, "Invalid response from app"),
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() {
                    if let Err(e) = client.write_all(&leftover).await {
                        debug!(name = %name, error = %e, "Client closed before pipe started");
                        app.touch();
                        return;
                    }
                }
                let client = ActivityStream::new(client, Arc::clone(&app));
                let backend = ActivityStream::new(backend, Arc::clone(&app));
                let (to_app, to_client) = pipe(client, backend).await;
                debug!(name = %name, request_id, to_app, to_client, "Upgraded connection closed");
            }
            Err(e) => {
                error!(name = %name, error = %e, "Failed to upgrade client connection");
            }
        }
        app.touch();
    });

    response
}

async fn open_upgrade(
    req: &Request<Incoming>,
    addr: SocketAddr,
) -> Result<(TcpStream, StatusCode, Vec<(String, String)>, Vec<u8>), ProxyError> {
    let mut backend = TcpStream::connect(addr).await?;
    backend.write_all(&build_upgrade_request(req)).await?;
    let (head, leftover) = read_response_head(&mut backend).await?;
    let (status, headers) =
        parse_response_head(&head).ok_or_else(|| ProxyError::Protocol("malformed status line".to_string()))?;
    Ok((backend, status, headers, leftover))
}

/// Body of a non-101 reply. `body` holds bytes that arrived with the head.
///
/// Chunked bodies are decoded, bodies without a length run to EOF, and
/// everything is capped at [`MAX_DECLINED_BODY`].
async fn read_declined_body<R: AsyncRead + Unpin>(
    backend: &mut R,
    status: StatusCode,
    headers: &[(String, String)],
    mut body: Vec<u8>,
) -> Result<Vec<u8>, ProxyError> {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(Vec::new());
    }

    let chunked = header("transfer-encoding")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
        .unwrap_or(false);
    if chunked {
        return read_chunked_body(backend, body).await;
    }

    if let Some(length) = header("content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| ProxyError::Protocol("invalid content-length".to_string()))?;
        if length > MAX_DECLINED_BODY {
            return Err(ProxyError::Protocol("response body too large".to_string()));
        }
        if body.len() < length {
            let mut rest = vec![0u8; length - body.len()];
            backend.read_exact(&mut rest).await?;
            body.extend_from_slice(&rest);
        }
        body.truncate(length);
        return Ok(body);
    }

    // Close-delimited
    let limit = (MAX_DECLINED_BODY + 1).saturating_sub(body.len()) as u64;
    (&mut *backend).take(limit).read_to_end(&mut body).await?;
    if body.len() > MAX_DECLINED_BODY {
        return Err(ProxyError::Protocol("response body too large".to_string()));
    }
    Ok(body)
}

/// Decode a chunked body, reading more from `backend` as needed
async fn read_chunked_body<R: AsyncRead + Unpin>(backend: &mut R, mut buf: Vec<u8>) -> Result<Vec<u8>, ProxyError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = read_line(backend, &mut buf, pos).await?;
        let line = std::str::from_utf8(&buf[pos..line_end])
            .map_err(|_| ProxyError::Protocol("invalid chunk size".to_string()))?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16)
            .map_err(|_| ProxyError::Protocol("invalid chunk size".to_string()))?;
        pos = line_end + 2;

        if size == 0 {
            // Trailers end with an empty line
            loop {
                let end = read_line(backend, &mut buf, pos).await?;
                let empty = end == pos;
                pos = end + 2;
                if empty {
                    return Ok(body);
                }
            }
        }

        if body.len() + size > MAX_DECLINED_BODY {
            return Err(ProxyError::Protocol("response body too large".to_string()));
        }
        while buf.len() < pos + size + 2 {
            read_more(backend, &mut buf).await?;
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ProxyError::Protocol("malformed chunk".to_string()));
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }
}

/// Index of the next CRLF at or after `from`
async fn read_line<R: AsyncRead + Unpin>(backend: &mut R, buf: &mut Vec<u8>, from: usize) -> Result<usize, ProxyError> {
    loop {
        if let Some(i) = buf[from..].windows(2).position(|w| w == b"\r\n") {
            return Ok(from + i);
        }
        if buf.len() - from > MAX_UPGRADE_HEAD {
            return Err(ProxyError::Protocol("chunk header too large".to_string()));
        }
        read_more(backend, buf).await?;
    }
}

async fn read_more<R: AsyncRead + Unpin>(backend: &mut R, buf: &mut Vec<u8>) -> Result<(), ProxyError> {
    let mut chunk = [0u8; 4096];
    let n = backend.read(&mut chunk).await?;
    if n == 0 {
        return Err(ProxyError::Protocol("connection closed mid-body".to_string()));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Stream wrapper that counts every read carrying data as app activity,
/// so a busy upgraded connection keeps its app from being reaped
struct ActivityStream<S> {
    inner: S,
    app: Arc<App>,
}

impl<S> ActivityStream<S> {
    fn new(inner: S, app: Arc<App>) -> Self {
        Self { inner, app }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.app.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Copy bytes both ways until either side closes, then drop both.
/// Returns bytes sent to the app and to the client.
async fn pipe<C, B>(client: C, backend: B) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut to_app = 0;
    let mut to_client = 0;

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut backend_write) => {
            to_app = result.unwrap_or(0);
            let _ = backend_write.shutdown().await;
        }
        result = tokio::io::copy(&mut backend_read, &mut client_write) => {
            to_client = result.unwrap_or(0);
            let _ = client_write.shutdown().await;
        }
    }

    (to_app, to_client)
}
