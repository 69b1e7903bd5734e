pub mod cache_control;
pub mod cacheability;
pub mod codec;
pub mod config;
pub mod controller;
pub mod forward;
pub mod key;
pub mod layer;
pub mod request;
pub mod response;
pub mod revalidation;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::BytesMut;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::logging::{self, AccessLogEvent};
use crate::settings::Settings;
use codec::RequestHead;
use controller::CacheController;
use request::ClientRequest;
use response::HttpResponse;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub controller: Arc<CacheController>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, controller: Arc<CacheController>) -> Self {
        Self {
            settings,
            controller,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    let listener = TcpListener::bind(app.settings.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", app.settings.listen))?;
    info!(address = %app.settings.listen, "cache proxy listening");
    serve(listener, app).await
}

/// Accept loop. Each connection runs in its own task; request handling
/// inside a connection is strictly sequential.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(app, stream, peer).await {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(app: AppContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    loop {
        let read = timeout(
            app.settings.client_timeout(),
            codec::read_request(
                &mut read_half,
                &mut buffer,
                app.settings.max_header_size,
                app.settings.max_body_size,
            ),
        )
        .await;

        let (head, body) = match read {
            // Idle past the client timeout or a clean close between requests.
            Err(_) | Ok(Ok(None)) => break,
            Ok(Ok(Some(parts))) => parts,
            Ok(Err(err)) => {
                debug!(peer = %peer, error = %err, "failed to parse client request");
                let response = HttpResponse::text(StatusCode::BAD_REQUEST, "malformed request");
                let _ = write_half
                    .write_all(&codec::encode_client_response(&response, false, false))
                    .await;
                break;
            }
        };

        if head.method == Method::CONNECT {
            let response =
                HttpResponse::text(StatusCode::METHOD_NOT_ALLOWED, "CONNECT is not supported");
            write_half
                .write_all(&codec::encode_client_response(&response, false, false))
                .await?;
            break;
        }

        let keep_alive = wants_keep_alive(&head);
        let head_only = head.method == Method::HEAD;
        let method = head.method.clone();
        let target = head.target.to_string();

        let request = ClientRequest {
            method: head.method,
            uri: head.target,
            headers: head.headers,
            body,
            tls: false,
            peer: Some(peer.ip()),
        };

        let started = Instant::now();

        // Run the handler against a watch on the client socket: when the
        // client disconnects mid-flight, dropping the handler future aborts
        // any in-flight origin I/O.
        let outcome = {
            let handler = app.controller.handle(&request);
            tokio::pin!(handler);
            tokio::select! {
                outcome = &mut handler => Some(outcome),
                _ = watch_disconnect(&mut read_half, &mut buffer) => None,
            }
        };
        let Some((response, disposition)) = outcome else {
            debug!(peer = %peer, "client disconnected while request was in flight");
            break;
        };

        let encoded = codec::encode_client_response(&response, keep_alive, head_only);
        write_half.write_all(&encoded).await?;
        write_half.flush().await?;

        logging::log_access(AccessLogEvent {
            peer,
            method: method.as_str(),
            target: &target,
            status: response.status,
            cache: disposition.as_str(),
            bytes_out: encoded.len() as u64,
            elapsed: started.elapsed(),
        });

        if !keep_alive {
            let _ = write_half.shutdown().await;
            break;
        }
    }
    Ok(())
}

/// Resolves when the peer closes its connection. Bytes that arrive in the
/// meantime (pipelined requests) are kept for the next parse.
async fn watch_disconnect(read_half: &mut OwnedReadHalf, pending: &mut BytesMut) {
    loop {
        match read_half.read_buf(pending).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn wants_keep_alive(head: &RequestHead) -> bool {
    let mut close = false;
    let mut keep_alive = false;
    for value in head.headers.get_all(http::header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                match token.trim().to_ascii_lowercase().as_str() {
                    "close" => close = true,
                    "keep-alive" => keep_alive = true,
                    _ => {}
                }
            }
        }
    }
    if close {
        return false;
    }
    match head.version {
        Version::HTTP_10 => keep_alive,
        _ => true,
    }
}
