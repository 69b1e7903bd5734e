#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use cachegate::cli::LogFormat;
use cachegate::proxy::{
    self, AppContext,
    controller::CacheController,
    forward::TcpTransport,
    layer::{InMemoryLayer, StorageCascade},
};
use cachegate::settings::Settings;

/// Canned response the mock origin serves: extra header lines plus a body.
#[derive(Clone)]
pub struct CannedResponse {
    pub status_line: String,
    pub headers: String,
    pub body: String,
}

impl CannedResponse {
    pub fn ok(headers: &str, body: &str) -> Self {
        Self {
            status_line: "HTTP/1.1 200 OK".to_string(),
            headers: headers.to_string(),
            body: body.to_string(),
        }
    }
}

/// Minimal HTTP origin that counts requests and records the last request
/// head it saw.
pub struct MockUpstream {
    listener: TcpListener,
    pub requests: Arc<AtomicUsize>,
    pub last_request: Arc<Mutex<String>>,
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
}

impl MockUpstream {
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self {
            listener,
            requests: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(Mutex::new(String::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn push(&self, response: CannedResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Move the listener into its accept task and keep shared handles for
    /// the test body.
    pub fn spawn(self) -> UpstreamHandle {
        let requests = self.requests.clone();
        let last_request = self.last_request.clone();
        let responses = self.responses.clone();
        let task = tokio::spawn(self.run());
        UpstreamHandle {
            requests,
            last_request,
            responses,
            task,
        }
    }

    async fn run(self) -> Result<()> {
        loop {
            let (mut socket, _) = self.listener.accept().await?;
            let requests = self.requests.clone();
            let last_request = self.last_request.clone();
            let responses = self.responses.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let mut data = Vec::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                    if let Some(head_end) = find(&data, b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&data[..head_end]).to_string();
                        let body_len = content_length_of(&head);
                        if data.len() >= head_end + 4 + body_len {
                            *last_request.lock().unwrap() = head;
                            break;
                        }
                    }
                }

                if data.is_empty() {
                    return;
                }

                requests.fetch_add(1, Ordering::SeqCst);

                let canned = responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| CannedResponse::ok("", "fallback"));
                let mut response = format!(
                    "{}\r\nContent-Length: {}\r\nConnection: close\r\n",
                    canned.status_line,
                    canned.body.len()
                );
                if !canned.headers.is_empty() {
                    response.push_str(&canned.headers);
                    if !canned.headers.ends_with("\r\n") {
                        response.push_str("\r\n");
                    }
                }
                response.push_str("\r\n");
                response.push_str(&canned.body);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            });
        }
    }
}

pub struct UpstreamHandle {
    pub requests: Arc<AtomicUsize>,
    pub last_request: Arc<Mutex<String>>,
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
    task: JoinHandle<Result<()>>,
}

impl UpstreamHandle {
    pub fn push(&self, response: CannedResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn last_request_head(&self) -> String {
        self.last_request.lock().unwrap().clone()
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length_of(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    task: JoinHandle<Result<()>>,
}

impl ProxyHarness {
    /// Boot a full proxy (listener, controller, in-memory cascade) wired at
    /// the given origin.
    pub async fn spawn(upstream_port: u16) -> Result<Self> {
        let settings = Arc::new(test_settings(upstream_port));

        let memory = Arc::new(InMemoryLayer::new(settings.memory_cache_size));
        let cascade = StorageCascade::new(vec![memory]);
        let transport = Arc::new(TcpTransport::new(
            settings.upstream_connect_timeout(),
            settings.upstream_timeout(),
            settings.max_header_size,
            settings.max_body_size,
        ));

        let mut controller = CacheController::new(cascade, transport)
            .with_cache_config(Arc::new(settings.cache_config()?));
        if let Some(forward) = settings.forward_config() {
            controller = controller.with_forward_config(Arc::new(forward));
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let app = AppContext::new(settings, Arc::new(controller));
        let task = tokio::spawn(proxy::serve(listener, app));

        Ok(Self { addr, task })
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

fn test_settings(upstream_port: u16) -> Settings {
    Settings {
        listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        forward_host: Some(format!("127.0.0.1:{upstream_port}")),
        forward_tls: false,
        log: LogFormat::Text,
        client_timeout: 10,
        upstream_connect_timeout: 5,
        upstream_timeout: 10,
        max_header_size: 32 * 1024,
        max_body_size: 16 * 1024 * 1024,
        memory_cache_size: 8 * 1024 * 1024,
        cacheable_methods: None,
        safe_methods: None,
        status_code_default_expiration: None,
        cacheable_file_extensions: None,
        cache_incomplete_responses: false,
        combine_partial_responses: false,
        serve_stale_on_error: true,
        http_warnings: true,
    }
}

/// Send one request on a fresh connection and read the whole response.
pub async fn roundtrip(addr: SocketAddr, request: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    read_http_response(&mut stream).await
}

pub async fn read_http_response(stream: &mut TcpStream) -> Result<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&data).to_string())
}

/// Read exactly one keep-alive response delimited by its Content-Length.
pub async fn read_http_response_with_length(stream: &mut TcpStream) -> Result<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        if let Some(head_end) = find(&data, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..head_end]).to_string();
            let body_len = content_length_of(&head);
            if data.len() >= head_end + 4 + body_len {
                data.truncate(head_end + 4 + body_len);
                return Ok(String::from_utf8_lossy(&data).to_string());
            }
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed before a full response arrived");
        }
        data.extend_from_slice(&buf[..n]);
    }
}
