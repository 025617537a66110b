//! Generation HTTP server
//!
//! A small HTTP/1.1 server, one request per connection. Generate responses
//! are written with chunked transfer encoding as the engine produces them.
//! A failed write or EOF from the client counts as a disconnect: the
//! response stream is dropped, which triggers the handle's abort callbacks.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::types::*;
use crate::session::{CoordinatorError, GenerateRequest, GenerationCoordinator};
use crate::types::ResourceId;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub struct GenerationServer {
    addr: String,
    coordinator: Arc<GenerationCoordinator>,
}

impl GenerationServer {
    pub fn new(addr: impl Into<String>, coordinator: Arc<GenerationCoordinator>) -> Self {
        Self {
            addr: addr.into(),
            coordinator,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;

        tracing::info!("Generation server listening on {}", self.addr);
        serve(listener, Arc::clone(&self.coordinator)).await
    }
}

/// Accept connections on an already-bound listener
pub async fn serve(listener: TcpListener, coordinator: Arc<GenerationCoordinator>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::debug!("Accepted connection from {}", addr);

        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, coordinator).await {
                tracing::debug!("Connection from {} ended with error: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, coordinator: Arc<GenerationCoordinator>) -> Result<()> {
    let request = match read_request(&mut stream).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) => {
            let body = ErrorBody::new("bad_request", e.to_string());
            return send_json(&mut stream, 400, &body, &[]).await;
        }
    };

    tracing::debug!("{} {}", request.method, request.path);

    match Route::resolve(&request.method, &request.path) {
        Route::Generate(id) => handle_generate(&mut stream, &coordinator, id, &request).await,
        Route::Stop(id) => {
            let stopped = coordinator.stop(&ResourceId::new(id));
            send_json(&mut stream, 202, &StopResponse { stopped }, &[]).await
        }
        Route::Status(id) => {
            let view = coordinator.status(&ResourceId::new(id));
            send_json(&mut stream, 200, &view, &[]).await
        }
        Route::Health => {
            let health = HealthResponse {
                status: "ok".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                active_streams: coordinator.registry().active_count(),
            };
            send_json(&mut stream, 200, &health, &[]).await
        }
        Route::MethodNotAllowed => {
            let body = ErrorBody::new("method_not_allowed", "Method not allowed");
            send_json(&mut stream, 405, &body, &[]).await
        }
        Route::NotFound => {
            let body = ErrorBody::new("not_found", format!("No route for {}", request.path));
            send_json(&mut stream, 404, &body, &[]).await
        }
    }
}

async fn handle_generate(
    stream: &mut TcpStream,
    coordinator: &GenerationCoordinator,
    resource_id: String,
    request: &HttpRequest,
) -> Result<()> {
    let body: GenerateBody = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(e) => {
            let body = ErrorBody::new("bad_request", format!("Invalid body: {}", e));
            return send_json(stream, 400, &body, &[]).await;
        }
    };

    let generate = GenerateRequest::new(resource_id, body.owner_id, body.message);
    let mut response = match coordinator.generate(generate).await {
        Ok(response) => response,
        Err(e) => return send_coordinator_error(stream, &e).await,
    };

    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Transfer-Encoding: chunked\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         X-Stream-Id: {}\r\n\r\n",
        response.stream_id()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    // Requests are fully read by now, so EOF on the read half means the
    // client hung up. Watching for it catches disconnects while the engine
    // is silent.
    let (mut reader, mut writer) = stream.split();
    let mut scratch = [0u8; 512];
    loop {
        tokio::select! {
            chunk = response.next() => match chunk {
                Some(chunk) if chunk.is_empty() => {}
                Some(chunk) => {
                    if let Err(e) = write_chunk(&mut writer, &chunk).await {
                        tracing::debug!(stream_id = %response.stream_id(), "client went away: {}", e);
                        return Ok(());
                    }
                }
                None => break,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => {
                    tracing::debug!(stream_id = %response.stream_id(), "client closed connection");
                    return Ok(());
                }
                Ok(_) => {}
            },
        }
    }

    writer.write_all(b"0\r\n\r\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
    writer.write_all(chunk).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn send_coordinator_error(stream: &mut TcpStream, error: &CoordinatorError) -> Result<()> {
    let mut body = ErrorBody::new(error.kind(), error.to_string());
    body.retryable = error.is_retryable();

    let extra: &[(&str, &str)] = if error.is_retryable() {
        &[("Retry-After", "1")]
    } else {
        &[]
    };
    send_json(stream, error.status_code(), &body, extra).await
}

async fn send_json<T: Serialize>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
    extra_headers: &[(&str, &str)],
) -> Result<()> {
    let payload = serde_json::to_string(body)?;

    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason_phrase(status),
        payload.len()
    );
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response.push_str(&payload);

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one request; `None` if the peer closed before sending anything
async fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("Request headers too large");
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("Connection closed mid-request");
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().context("Missing request line")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("Missing method")?.to_string();
    let path = parts.next().context("Missing path")?.to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.parse::<usize>())
        .transpose()
        .context("Invalid Content-Length")?
        .unwrap_or(0);

    if content_length > MAX_REQUEST_BYTES {
        anyhow::bail!("Request body too large");
    }

    let body_start = header_end + 4;
    let mut body = buffer[body_start.min(buffer.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("Connection closed mid-body");
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(HttpRequest { method, path, body }))
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}
