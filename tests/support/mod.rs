//! A minimal local HTTP/1.1 server that plays back a canned sequence of responses, used by
//! the end-to-end tests to exercise the retry/refresh pipeline without reaching the real
//! Spotify hosts. Nothing in the example corpus establishes an HTTP-mocking idiom, so this is
//! hand-rolled on top of `tokio::net` rather than adding an unreviewed dependency for it.
//!
//! Each test binary under `tests/` only exercises a subset of this module's helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay: Duration,
}

impl CannedResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Serves one canned response per accepted connection, in order; once exhausted, repeats the
/// last response for any further requests.
pub struct MockServer {
    addr: SocketAddr,
    request_count: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn start(responses: Vec<CannedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let responses = Arc::new(responses);

        let counter = request_count.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let responses = responses.clone();
                let counter = counter.clone();
                let index = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    serve_one(stream, &responses, index).await;
                });
            }
        });

        Self { addr, request_count }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }
}

async fn serve_one(mut stream: TcpStream, responses: &[CannedResponse], index: usize) {
    let mut buf = vec![0u8; 8192];
    if stream.read(&mut buf).await.is_err() {
        return;
    }

    let Some(canned) = (if responses.is_empty() {
        None
    } else {
        Some(responses[index.min(responses.len() - 1)].clone())
    }) else {
        return;
    };

    if !canned.delay.is_zero() {
        tokio::time::sleep(canned.delay).await;
    }

    let mut header_lines = String::new();
    for (name, value) in &canned.headers {
        header_lines.push_str(&format!("{name}: {value}\r\n"));
    }

    // Every connection here is single-use: tell the client not to pipeline a retry onto the
    // same socket, since `serve_one` only ever answers one request before returning.
    let response = format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: {}\r\n{}\r\n{}",
        canned.status,
        reason_phrase(canned.status),
        canned.body.len(),
        header_lines,
        canned.body,
    );

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        401 => "Unauthorized",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "",
    }
}
