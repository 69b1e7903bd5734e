use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use once_cell::sync::{Lazy, OnceCell};
use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::warn;

use super::codec;
use super::config::ForwardConfig;
use super::request::ClientRequest;
use super::response::{HttpResponse, content_length_value};

/// Hop-by-hop headers that must never travel past a single connection
/// (RFC 7230 §6.1), stripped in addition to anything named by `Connection`.
static HOP_BY_HOP_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ])
});

/// A request prepared for the origin connection: sanitized headers, rewritten
/// target, and the authority to dial.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub tls: bool,
    /// Host (and optional port) the transport connects to.
    pub authority: String,
    /// Value of the `Host` header sent upstream.
    pub host_header: String,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        source: std::io::Error,
    },
    #[error("TLS handshake with {authority} failed: {source}")]
    Tls {
        authority: String,
        source: std::io::Error,
    },
    #[error("origin did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("origin protocol error: {0}")]
    Protocol(String),
    #[error("origin I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The single operation the engine needs from an upstream round-tripper.
/// Connection pooling, HTTP/2, and dialing strategy are the implementation's
/// concern. A 5xx answer is a response, not an error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: &UpstreamRequest) -> Result<HttpResponse, TransportError>;
}

/// Forward a client request to the origin described by `forward` and return
/// the sanitized origin response.
pub async fn forward(
    transport: &dyn Transport,
    request: &ClientRequest,
    forward: &ForwardConfig,
) -> Result<HttpResponse, TransportError> {
    let upstream = build_upstream_request(request, forward);
    let mut response = transport.round_trip(&upstream).await?;
    sanitize_response(&mut response);
    Ok(response)
}

/// Apply the proxy rewrite rules: drop per-connection headers, record the
/// client address in `X-Forwarded-For`, and point the message at the
/// configured origin. The client's `Host` is preserved when it sent one.
pub fn build_upstream_request(request: &ClientRequest, forward: &ForwardConfig) -> UpstreamRequest {
    let mut headers = request.headers.clone();
    strip_hop_by_hop_headers(&mut headers);
    headers.remove(http::header::HOST);
    headers.remove(http::header::CONTENT_LENGTH);

    if let Some(peer) = request.peer {
        append_forwarded_for(&mut headers, peer);
    }

    let host_header = request
        .host_header()
        .map(str::to_string)
        .unwrap_or_else(|| forward.host.clone());

    UpstreamRequest {
        method: request.method.clone(),
        tls: forward.tls,
        authority: forward.host.clone(),
        host_header,
        target: request.origin_form_target(),
        headers,
        body: request.body.clone(),
    }
}

/// Remove everything named by `Connection` plus the canonical hop-by-hop
/// set. A `TE: trailers` sent by the client survives, since trailer consent
/// is meaningful end-to-end.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in connection_named {
        headers.remove(name.as_str());
    }

    let te_is_trailers = headers
        .get_all(http::header::TE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.trim().eq_ignore_ascii_case("trailers"));

    for name in HOP_BY_HOP_HEADERS.iter() {
        if *name == "te" && te_is_trailers {
            continue;
        }
        headers.remove(*name);
    }
}

/// Record the immediate peer in `X-Forwarded-For`, appending to whatever an
/// earlier proxy already recorded.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
    let existing: Vec<String> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();

    let combined = if existing.is_empty() {
        peer.to_string()
    } else {
        format!("{}, {}", existing.join(", "), peer)
    };
    if let Ok(value) = http::HeaderValue::from_str(&combined) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Strip per-connection response headers and rewrite framing to match the
/// materialized body.
pub fn sanitize_response(response: &mut HttpResponse) {
    strip_hop_by_hop_headers(&mut response.headers);
    if response.status.is_informational()
        || response.status == StatusCode::NO_CONTENT
        || response.status == StatusCode::NOT_MODIFIED
    {
        response.headers.remove(http::header::CONTENT_LENGTH);
    } else {
        response.headers.insert(
            http::header::CONTENT_LENGTH,
            content_length_value(response.body.len()),
        );
    }
}

/// One-connection-per-request HTTP/1.1 transport over TCP, with TLS when the
/// forward config demands it. The TLS client config is built on the first
/// HTTPS round trip, so plain-HTTP deployments never need trust anchors.
pub struct TcpTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
    max_header_size: usize,
    max_body_size: usize,
    tls_config: OnceCell<Arc<ClientConfig>>,
}

impl TcpTransport {
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        max_header_size: usize,
        max_body_size: usize,
    ) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            max_header_size,
            max_body_size,
            tls_config: OnceCell::new(),
        }
    }

    fn tls_connector(&self, authority: &str) -> Result<TlsConnector, TransportError> {
        let config = self
            .tls_config
            .get_or_try_init(build_tls_client_config)
            .map_err(|err| TransportError::Tls {
                authority: authority.to_string(),
                source: std::io::Error::other(err.to_string()),
            })?;
        Ok(TlsConnector::from(config.clone()))
    }

    async fn exchange<S>(
        &self,
        stream: &mut S,
        request: &UpstreamRequest,
    ) -> Result<HttpResponse, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&encode_upstream_request(request)).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(8 * 1024);
        codec::read_response(
            stream,
            &mut buffer,
            self.max_header_size,
            self.max_body_size,
            request.method == Method::HEAD,
        )
        .await
        .map_err(|err| TransportError::Protocol(err.to_string()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn round_trip(&self, request: &UpstreamRequest) -> Result<HttpResponse, TransportError> {
        let authority = authority_with_port(&request.authority, request.tls);

        let tcp = timeout(self.connect_timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| TransportError::TimedOut(self.connect_timeout))?
            .map_err(|source| TransportError::Connect {
                authority: authority.clone(),
                source,
            })?;

        let exchange = async {
            if request.tls {
                let connector = self.tls_connector(&authority)?;
                let server_name = ServerName::try_from(host_only(&request.authority).to_string())
                    .map_err(|_| {
                        TransportError::Tls {
                            authority: authority.clone(),
                            source: std::io::Error::other("invalid TLS server name"),
                        }
                    })?;
                let mut stream = connector.connect(server_name, tcp).await.map_err(|source| {
                    TransportError::Tls {
                        authority: authority.clone(),
                        source,
                    }
                })?;
                self.exchange(&mut stream, request).await
            } else {
                let mut stream = tcp;
                self.exchange(&mut stream, request).await
            }
        };

        timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| TransportError::TimedOut(self.request_timeout))?
    }
}

fn encode_upstream_request(request: &UpstreamRequest) -> Bytes {
    let mut buffer = BytesMut::with_capacity(256 + request.body.len());
    buffer.put_slice(request.method.as_str().as_bytes());
    buffer.put_u8(b' ');
    buffer.put_slice(request.target.as_bytes());
    buffer.put_slice(b" HTTP/1.1\r\nHost: ");
    buffer.put_slice(request.host_header.as_bytes());
    buffer.put_slice(b"\r\n");
    for (name, value) in request.headers.iter() {
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put_slice(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }
    if !request.body.is_empty() || method_usually_has_body(&request.method) {
        buffer.put_slice(b"Content-Length: ");
        buffer.put_slice(content_length_value(request.body.len()).as_bytes());
        buffer.put_slice(b"\r\n");
    }
    buffer.put_slice(b"Connection: close\r\n\r\n");
    buffer.put_slice(&request.body);
    buffer.freeze()
}

fn method_usually_has_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

fn authority_with_port(authority: &str, tls: bool) -> String {
    let default_port = if tls { 443 } else { 80 };
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal, possibly with a port.
        return match rest.rsplit_once("]:") {
            Some(_) => authority.to_string(),
            None => format!("{authority}:{default_port}"),
        };
    }
    match authority.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) => authority.to_string(),
        _ => format!("{authority}:{default_port}"),
    }
}

fn host_only(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(authority);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            ensure!(
                added > 0,
                "no trust anchors loaded from system locations; outbound TLS would always fail"
            );
        }
        Err(err) => {
            return Err(anyhow!("failed to load system trust anchors: {err}"));
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
