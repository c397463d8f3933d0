//! TCP guest channel with token handshake
//!
//! The guest image runs a small exec service on a fixed port. The host
//! connects to the guest address, authenticates with a shared token, sends one
//! JSON request line and reads one JSON response line.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{ChannelError, ExecOutput, GuestChannel, GuestConnector};

/// Default port of the in-guest exec service
pub const DEFAULT_CHANNEL_PORT: u16 = 2222;

/// Time allowed for TCP connect + AUTH/OK exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single file write
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Exec { command: &'a str, timeout_ms: u64 },
    WriteFile { path: &'a str, content: &'a str },
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    output: Option<ExecOutput>,
}

/// Channel to one guest over TCP
#[derive(Debug, Clone)]
pub struct TcpGuestChannel {
    addr: SocketAddr,
    auth_token: String,
}

impl TcpGuestChannel {
    pub fn new(addr: SocketAddr, auth_token: impl Into<String>) -> Self {
        Self {
            addr,
            auth_token: auth_token.into(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connect and authenticate, returning a stream ready for one request
    async fn handshake(&self) -> Result<BufReader<TcpStream>, ChannelError> {
        let attempt = async {
            let mut stream = TcpStream::connect(self.addr).await.map_err(|e| {
                ChannelError::Connection(format!("failed to connect to {}: {}", self.addr, e))
            })?;

            let auth = format!("AUTH {}\n", self.auth_token);
            stream
                .write_all(auth.as_bytes())
                .await
                .map_err(|e| ChannelError::Handshake(format!("failed to send AUTH: {}", e)))?;

            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|e| ChannelError::Handshake(format!("failed to read response: {}", e)))?;

            match line.trim() {
                "OK" => Ok(reader),
                "" => Err(ChannelError::Handshake(
                    "connection closed before handshake completed".to_string(),
                )),
                other => Err(ChannelError::Handshake(format!(
                    "unexpected handshake response: '{}' (expected 'OK')",
                    other
                ))),
            }
        };

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Handshake(
                "timeout waiting for handshake response".to_string(),
            )),
        }
    }

    async fn request(&self, request: &Request<'_>, timeout: Duration) -> Result<Response, ChannelError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| ChannelError::Protocol(format!("failed to encode request: {}", e)))?;
        line.push('\n');

        let exchange = async {
            let mut stream = self.handshake().await?;
            stream
                .get_mut()
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ChannelError::Connection(format!("failed to send request: {}", e)))?;

            let mut reply = String::new();
            let n = stream
                .read_line(&mut reply)
                .await
                .map_err(|e| ChannelError::Connection(format!("failed to read reply: {}", e)))?;
            if n == 0 {
                return Err(ChannelError::Connection(
                    "connection dropped before reply".to_string(),
                ));
            }

            serde_json::from_str::<Response>(reply.trim())
                .map_err(|e| ChannelError::Protocol(format!("malformed reply: {}", e)))
        };

        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;

        match response.error {
            Some(message) => Err(ChannelError::Remote(message)),
            None => Ok(response),
        }
    }
}

#[async_trait]
impl GuestChannel for TcpGuestChannel {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ChannelError> {
        let request = Request::Exec {
            command,
            timeout_ms: timeout.as_millis() as u64,
        };
        let response = self.request(&request, timeout).await?;
        response
            .output
            .ok_or_else(|| ChannelError::Protocol("exec reply without exit_code".to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ChannelError> {
        let request = Request::WriteFile { path, content };
        self.request(&request, WRITE_TIMEOUT).await.map(|_| ())
    }

    async fn wait_until_reachable(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ChannelError> {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.handshake().await {
                Ok(_) => {
                    tracing::debug!(addr = %self.addr, attempts, "guest channel reachable");
                    return Ok(());
                }
                Err(e) => {
                    if start.elapsed() >= timeout {
                        return Err(ChannelError::Unreachable {
                            addr: self.addr.to_string(),
                            waited: start.elapsed(),
                            last_error: e.to_string(),
                        });
                    }
                    if attempts == 1 {
                        tracing::debug!(addr = %self.addr, error = %e, "guest not reachable yet");
                    }
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Builds [`TcpGuestChannel`]s for guest addresses
#[derive(Debug, Clone)]
pub struct TcpGuestConnector {
    port: u16,
    auth_token: String,
}

impl TcpGuestConnector {
    pub fn new(port: u16, auth_token: impl Into<String>) -> Self {
        Self {
            port,
            auth_token: auth_token.into(),
        }
    }
}

impl GuestConnector for TcpGuestConnector {
    fn connect(&self, addr: IpAddr) -> Arc<dyn GuestChannel> {
        Arc::new(TcpGuestChannel::new(
            SocketAddr::new(addr, self.port),
            self.auth_token.clone(),
        ))
    }
}
