//! Minimal HTTP app for trying devgate out and for integration tests
//!
//! Environment variables:
//! - PORT: Port to listen on (required)
//! - STARTUP_DELAY_MS: Delay before binding (default: 0)
//! - DEVGATE_ECHO_SPAWN_LOG: File to append one line to per process start
//!
//! Every request is answered with its method, path and headers. `/exit`
//! answers and then exits. `/chunked` answers with a chunked body and
//! `/unframed` with a body that ends when the connection closes. Requests
//! with `Upgrade: echo` switch protocols, send `ready\n` and echo every
//! byte back.

use anyhow::Context;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")
        .context("PORT environment variable required")?
        .parse()
        .context("PORT must be a valid port number")?;

    let startup_delay: u64 = std::env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if let Ok(path) = std::env::var("DEVGATE_ECHO_SPAWN_LOG") {
        let mut log = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(log, "{}", std::process::id())?;
    }

    if startup_delay > 0 {
        eprintln!("echo: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    println!("echo: listening on port {}", port);

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(handle_connection(stream));
    }
}

async fn handle_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > 8192 {
            return;
        }
    };

    let Ok(head) = std::str::from_utf8(&buf[..head_end]) else {
        return;
    };
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split(' ');
    let method = request_line.next().unwrap_or("GET").to_string();
    let path = request_line.next().unwrap_or("/").to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let header = |name: &str| headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str());

    if header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("echo")) {
        let response = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\nready\n";
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        // Bytes that arrived with the request head belong to the new protocol
        let early = buf.split_off(head_end + 4);
        if !early.is_empty() && stream.write_all(&early).await.is_err() {
            return;
        }
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        return;
    }

    let mut body = format!("{} {}\n", method, path);
    for (name, value) in &headers {
        body.push_str(&format!("{}: {}\n", name, value));
    }

    let pid = std::process::id();
    let response = match path.as_str() {
        "/chunked" => {
            let mid = (0..=body.len() / 2).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
            let (first, second) = body.split_at(mid);
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nX-Echo-Pid: {}\r\nConnection: close\r\n\r\n{:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
                pid,
                first.len(),
                first,
                second.len(),
                second
            )
        }
        "/unframed" => format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Echo-Pid: {}\r\nConnection: close\r\n\r\n{}",
            pid, body
        ),
        _ => format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nX-Echo-Pid: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            pid,
            body
        ),
    };
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    if path == "/exit" {
        std::process::exit(0);
    }
}
