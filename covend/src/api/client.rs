//! Minimal client for the daemon's unix-socket API.
//!
//! The CLI only needs simple request/response queries, so this speaks
//! HTTP/1.0 over the socket directly: one request, read to EOF, parse the
//! JSON body. Streams (`/events`) are out of scope for this client.

use std::path::PathBuf;

use eyre::{Context, Result, eyre};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// A parsed API response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Client for one workspace's daemon socket
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Whether the daemon socket exists (not necessarily live)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Perform a GET against the daemon
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request("GET", path, None).await
    }

    /// Perform a POST with an optional JSON body
    pub async fn post(&self, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.request("POST", path, body).await
    }

    async fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        debug!(method, path, socket = %self.socket_path.display(), "DaemonClient request");
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .context("Failed to connect to daemon socket")?;

        // HTTP/1.0 keeps the exchange trivially framed: the server closes
        // the connection after the response, so the body runs to EOF
        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let mut request = format!("{method} {path} HTTP/1.0\r\nHost: covend\r\n");
        if !payload.is_empty() {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", payload.len()));
        }
        request.push_str("\r\n");
        request.push_str(&payload);

        stream
            .write_all(request.as_bytes())
            .await
            .context("Failed to write request")?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .context("Failed to read response")?;
        let text = String::from_utf8_lossy(&raw);

        let (head, body_text) = text
            .split_once("\r\n\r\n")
            .ok_or_else(|| eyre!("malformed response from daemon"))?;
        let status = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| eyre!("malformed status line from daemon"))?;

        let body = if body_text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(body_text.trim()).unwrap_or(Value::Null)
        };

        Ok(ApiResponse { status, body })
    }
}
