//! Integration tests for devgate
//!
//! Each test runs a real server on ephemeral ports with a temporary apps
//! directory. Apps are the `devgate-echo` binary; every start appends a
//! line to a spawn log so tests can count processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use devgate::app::AppState;
use devgate::certs::{CertStore, CertificateAuthority, CertificateSource};
use devgate::events::LogEvents;
use devgate::pool::{AppPool, PoolConfig};
use devgate::proxy::{HttpServer, ServerSettings};
use devgate::registry::DirRegistry;
use rustls::pki_types::{CertificateDer, ServerName};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

fn echo_command() -> String {
    shell_words::quote(env!("CARGO_BIN_EXE_devgate-echo")).into_owned()
}

struct Options {
    command: String,
    idle_timeout: Duration,
    debug: bool,
    tls: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            command: echo_command(),
            idle_timeout: Duration::from_secs(60),
            debug: false,
            tls: false,
        }
    }
}

struct Harness {
    dir: TempDir,
    pool: Arc<AppPool>,
    certs: Option<Arc<CertStore>>,
    http_port: u16,
    https_port: Option<u16>,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    async fn start(options: Options) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("apps");
        std::fs::create_dir_all(&apps).unwrap();

        let mut config = PoolConfig::default();
        config.idle_timeout = options.idle_timeout;
        config.reap_interval = Duration::from_millis(50);
        config.app.startup_timeout = Duration::from_secs(10);
        config.app.stop_grace_period = Duration::from_secs(2);
        config.app.ready_poll_interval = Duration::from_millis(10);

        let registry = Arc::new(DirRegistry::new(&apps, &options.command));
        let pool = AppPool::new(registry, Arc::new(LogEvents), config);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        pool.spawn_reaper(shutdown_rx.clone());

        let certs = options.tls.then(|| {
            let ca = CertificateAuthority::generate(Duration::from_secs(24 * 60 * 60)).unwrap();
            Arc::new(CertStore::new(Arc::new(ca), Duration::from_secs(60 * 60)))
        });

        let settings = ServerSettings {
            bind: "127.0.0.1".to_string(),
            http_port: 0,
            https_port: options.tls.then_some(0),
            domains: vec!["test".to_string()],
            debug: options.debug,
        };
        let source = certs.clone().map(|c| c as Arc<dyn CertificateSource>);
        let server = Arc::new(HttpServer::setup(settings, Arc::clone(&pool), source, shutdown_rx).await.unwrap());

        let http_port = server.http_addr().unwrap().port();
        let https_port = server.https_addr().map(|a| a.port());

        let http = Arc::clone(&server);
        tokio::spawn(async move { http.serve().await });
        let https = Arc::clone(&server);
        tokio::spawn(async move { https.serve_tls().await });

        Self {
            dir,
            pool,
            certs,
            http_port,
            https_port,
            shutdown_tx,
        }
    }

    /// Create a directory app that logs its starts
    fn add_app(&self, name: &str) {
        let app_dir = self.dir.path().join("apps").join(name);
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join(".devgate.env"),
            format!("DEVGATE_ECHO_SPAWN_LOG={}\n", self.spawn_log(name).display()),
        )
        .unwrap();
    }

    fn spawn_log(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{}.spawns", name))
    }

    fn spawn_count(&self, name: &str) -> usize {
        count_lines(&self.spawn_log(name))
    }

    async fn get(&self, host: &str, path: &str) -> String {
        http_get_with_host(self.http_port, path, host).await.unwrap()
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.pool.purge().await;
    }
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(port: u16, path: &str, host: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host);
    stream.write_all(request.as_bytes()).await?;

    Ok(read_all(&mut stream).await)
}

/// Read until EOF, tolerating abrupt TLS closes
async fn read_all<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.split("\r\n").skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

async fn wait_for_state(pool: &AppPool, name: &str, state: AppState, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if pool.get(name).map(|app| app.state()) == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_unknown_app_returns_404() {
    let harness = Harness::start(Options::default()).await;

    let response = harness.get("blog.test", "/").await;

    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    assert_eq!(header_value(&response, "x-devgate-error"), Some("UNKNOWN_APP"));
    assert!(response.contains("blog"));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_host_outside_domains_returns_404() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    for host in ["blog.example", "test", "localhost"] {
        let response = harness.get(host, "/").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{host}: {response}");
    }
    assert_eq!(harness.spawn_count("blog"), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_missing_host_returns_400() {
    let harness = Harness::start(Options::default()).await;

    let mut stream = TcpStream::connect(("127.0.0.1", harness.http_port)).await.unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let response = read_all(&mut stream).await;

    assert!(response.contains(" 400 "), "got: {response}");
    assert_eq!(header_value(&response, "x-devgate-error"), Some("MISSING_HOST"));
    harness.shutdown().await;
}

// ============================================================================
// Proxying
// ============================================================================

#[tokio::test]
async fn test_request_is_proxied_with_forwarding_headers() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    let response = harness.get("blog.test:9280", "/posts?page=2").await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("GET /posts?page=2\n"));
    assert!(response.contains("host: blog.test:9280\n"));
    assert!(response.contains("x-forwarded-for: 127.0.0.1\n"));
    assert!(response.contains("x-forwarded-proto: http\n"));
    assert!(response.contains("x-forwarded-host: blog.test:9280\n"));
    assert!(response.contains("x-request-id: "));
    assert_eq!(response.matches("\nhost: blog.test").count(), 1);
    assert_eq!(harness.spawn_count("blog"), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_running_app_is_reused() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    let first = harness.get("blog.test", "/").await;
    let second = harness.get("www.blog.test", "/").await;

    assert!(first.starts_with("HTTP/1.1 200"));
    assert!(second.starts_with("HTTP/1.1 200"));
    assert_eq!(header_value(&first, "x-echo-pid"), header_value(&second, "x-echo-pid"));
    assert_eq!(harness.spawn_count("blog"), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_first_requests_spawn_once() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("worker");
    let port = harness.http_port;

    let handles: Vec<_> = (0..50)
        .map(|_| tokio::spawn(async move { http_get_with_host(port, "/", "worker.test").await.unwrap() }))
        .collect();

    let mut pids = std::collections::HashSet::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        pids.insert(header_value(&response, "x-echo-pid").unwrap().to_string());
    }

    assert_eq!(pids.len(), 1);
    assert_eq!(harness.spawn_count("worker"), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_relays_bytes_both_ways() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    let mut stream = TcpStream::connect(("127.0.0.1", harness.http_port)).await.unwrap();
    stream
        .write_all(b"GET /socket HTTP/1.1\r\nHost: blog.test\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    // Read the 101 head plus the greeting the app sends right after it
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    let greeting_end = loop {
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut chunk))
            .await
            .expect("upgrade response")
            .unwrap();
        assert!(n > 0, "connection closed early");
        received.extend_from_slice(&chunk[..n]);
        if let Some(pos) = received.windows(6).position(|w| w == b"ready\n") {
            break pos + 6;
        }
    };
    let head = String::from_utf8_lossy(&received[..greeting_end]).to_string();
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: echo"));

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo")
        .unwrap();
    assert_eq!(&echoed, b"ping");

    drop(stream);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_declined_upgrade_is_plain_response() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    let mut stream = TcpStream::connect(("127.0.0.1", harness.http_port)).await.unwrap();
    stream
        .write_all(
            b"GET /plain HTTP/1.1\r\nHost: blog.test\r\nConnection: Upgrade, close\r\nUpgrade: h2c-like\r\n\r\n",
        )
        .await
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(10), read_all(&mut stream))
        .await
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("GET /plain\n"));
    harness.shutdown().await;
}

async fn declined_upgrade(harness: &Harness, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", harness.http_port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: blog.test\r\nConnection: Upgrade, close\r\nUpgrade: h2c-like\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), read_all(&mut stream))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_declined_upgrade_with_chunked_body() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    let response = declined_upgrade(&harness, "/chunked").await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    assert!(body.starts_with("GET /chunked\n"), "got: {response}");
    assert!(body.contains("upgrade: h2c-like\n"));
    // Chunk framing is decoded, not passed through
    assert!(!body.contains("\r\n0\r\n"));
    assert_eq!(header_value(&response, "transfer-encoding"), None);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_declined_upgrade_with_close_delimited_body() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    let response = declined_upgrade(&harness, "/unframed").await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    assert!(body.starts_with("GET /unframed\n"), "got: {response}");
    assert!(body.contains("host: blog.test\n"));
    harness.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_busy_upgraded_connection_keeps_app_alive() {
    let harness = Harness::start(Options {
        idle_timeout: Duration::from_millis(400),
        ..Options::default()
    })
    .await;
    harness.add_app("api");

    let mut stream = TcpStream::connect(("127.0.0.1", harness.http_port)).await.unwrap();
    stream
        .write_all(b"GET /socket HTTP/1.1\r\nHost: api.test\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    while !received.windows(6).any(|w| w == b"ready\n") {
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut chunk))
            .await
            .expect("upgrade response")
            .unwrap();
        assert!(n > 0, "connection closed early");
        received.extend_from_slice(&chunk[..n]);
    }

    // Traffic for well past the idle timeout
    for i in 0..15 {
        let ping = format!("ping{:02}", i);
        stream.write_all(ping.as_bytes()).await.unwrap();
        let mut echoed = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
            .await
            .expect("app reaped under a busy connection")
            .unwrap();
        assert_eq!(&echoed, ping.as_bytes());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(harness.pool.get("api").map(|app| app.state()), Some(AppState::Running));
    assert_eq!(harness.spawn_count("api"), 1);

    // Once the connection goes quiet the app is reaped as usual
    drop(stream);
    assert!(wait_for_state(&harness.pool, "api", AppState::Stopped, Duration::from_secs(5)).await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_idle_app_is_reaped_and_respawned() {
    let harness = Harness::start(Options {
        idle_timeout: Duration::from_millis(300),
        ..Options::default()
    })
    .await;
    harness.add_app("api");

    let first = harness.get("api.test", "/").await;
    assert!(first.starts_with("HTTP/1.1 200"));

    assert!(wait_for_state(&harness.pool, "api", AppState::Stopped, Duration::from_secs(5)).await);

    let second = harness.get("api.test", "/").await;
    assert!(second.starts_with("HTTP/1.1 200"), "got: {second}");
    assert_ne!(header_value(&first, "x-echo-pid"), header_value(&second, "x-echo-pid"));
    assert_eq!(harness.spawn_count("api"), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_activity_keeps_app_alive() {
    let harness = Harness::start(Options {
        idle_timeout: Duration::from_millis(400),
        ..Options::default()
    })
    .await;
    harness.add_app("api");

    for _ in 0..6 {
        let response = harness.get("api.test", "/").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    assert_eq!(harness.spawn_count("api"), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_exited_app_is_restarted() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");

    let first = harness.get("blog.test", "/exit").await;
    assert!(first.starts_with("HTTP/1.1 200"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = harness.get("blog.test", "/").await;
    assert!(second.starts_with("HTTP/1.1 200"), "got: {second}");
    assert_ne!(header_value(&first, "x-echo-pid"), header_value(&second, "x-echo-pid"));
    assert_eq!(harness.spawn_count("blog"), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_purge_stops_apps_and_is_idempotent() {
    let harness = Harness::start(Options::default()).await;
    harness.add_app("blog");
    harness.add_app("shop");

    assert!(harness.get("blog.test", "/").await.starts_with("HTTP/1.1 200"));
    assert!(harness.get("shop.test", "/").await.starts_with("HTTP/1.1 200"));
    let blog_addr = harness.pool.get("blog").unwrap().addr().unwrap();
    let blog = harness.pool.get("blog").unwrap();

    harness.pool.purge().await;
    assert!(harness.pool.is_empty());
    assert_eq!(blog.state(), AppState::Stopped);
    assert!(TcpStream::connect(blog_addr).await.is_err());

    harness.pool.purge().await;
    assert!(harness.pool.is_empty());

    assert!(harness.get("blog.test", "/").await.starts_with("HTTP/1.1 200"));
    assert_eq!(harness.spawn_count("blog"), 2);
    assert_eq!(harness.spawn_count("shop"), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_start_failure_output_only_in_debug() {
    let command = "sh -c 'echo \"boot failure: missing gem\" >&2; exit 1'".to_string();

    let quiet = Harness::start(Options {
        command: command.clone(),
        ..Options::default()
    })
    .await;
    quiet.add_app("broken");
    let response = quiet.get("broken.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {response}");
    assert_eq!(header_value(&response, "x-devgate-error"), Some("APP_START_FAILED"));
    assert!(!response.contains("missing gem"));
    quiet.shutdown().await;

    let verbose = Harness::start(Options {
        command,
        debug: true,
        ..Options::default()
    })
    .await;
    verbose.add_app("broken");
    let response = verbose.get("broken.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {response}");
    assert!(response.contains("missing gem"));
    assert_eq!(verbose.pool.get("broken").unwrap().state(), AppState::Failed);
    verbose.shutdown().await;
}

// ============================================================================
// HTTPS
// ============================================================================

async fn https_get(port: u16, host: &str, ca: &CertificateDer<'static>) -> String {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.clone()).unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let server_name = ServerName::try_from(host.to_string()).unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
    tls.write_all(request.as_bytes()).await.unwrap();
    read_all(&mut tls).await
}

#[tokio::test]
async fn test_https_issues_certificate_per_hostname() {
    let harness = Harness::start(Options {
        tls: true,
        ..Options::default()
    })
    .await;
    harness.add_app("blog");
    let certs = harness.certs.clone().unwrap();
    let ca = certs.ca().cert_der().clone();
    let port = harness.https_port.unwrap();

    let response = https_get(port, "blog.test", &ca).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("x-forwarded-proto: https\n"));
    assert_eq!(certs.issued_count(), 1);

    // Cached for the second handshake
    https_get(port, "blog.test", &ca).await;
    assert_eq!(certs.issued_count(), 1);

    // Certificates are issued even for hosts without an app
    let response = https_get(port, "nope.test", &ca).await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    assert_eq!(certs.issued_count(), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_handshakes_sign_once() {
    let harness = Harness::start(Options {
        tls: true,
        ..Options::default()
    })
    .await;
    harness.add_app("blog");
    let certs = harness.certs.clone().unwrap();
    let ca = certs.ca().cert_der().clone();
    let port = harness.https_port.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let ca = ca.clone();
            tokio::spawn(async move { https_get(port, "blog.test", &ca).await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().starts_with("HTTP/1.1 200"));
    }

    assert_eq!(certs.issued_count(), 1);
    assert_eq!(harness.spawn_count("blog"), 1);
    harness.shutdown().await;
}
