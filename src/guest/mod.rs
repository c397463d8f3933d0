//! Guest channel - the only path into a running VM
//!
//! The executor never touches the guest filesystem or processes directly.
//! Everything goes through a [`GuestChannel`]: run a command, write a file,
//! or wait for the guest to come up.
//!
//! # Wire Protocol
//!
//! ```text
//! host                                   guest (port 2222)
//!  │ ── TCP connect ─────────────────────► │
//!  │ ── "AUTH <token>\n" ────────────────► │
//!  │ ◄─ "OK\n" ─────────────────────────── │
//!  │ ── {"op":"exec",...}\n ─────────────► │
//!  │ ◄─ {"exit_code":0,...}\n ──────────── │
//!  │ ── close ───────────────────────────► │
//! ```
//!
//! One connection per operation: a dropped connection only fails the
//! operation in flight.

pub mod channel;
pub mod shell;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

pub use channel::{TcpGuestChannel, TcpGuestConnector};

/// Result of a command executed inside the guest
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport-level failures talking to the guest
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication handshake failed: {0}")]
    Handshake(String),
    #[error("guest operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("guest {addr} not reachable after {waited:?} (last error: {last_error})")]
    Unreachable {
        addr: String,
        waited: Duration,
        last_error: String,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("guest rejected request: {0}")]
    Remote(String),
}

/// Command/file-transfer channel into one guest
#[async_trait]
pub trait GuestChannel: Send + Sync {
    /// Run `command` through the guest shell
    ///
    /// A non-zero exit code is returned in [`ExecOutput`], not as an error.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ChannelError>;

    /// Write `content` to `path` inside the guest, creating parent directories
    async fn write_file(&self, path: &str, content: &str) -> Result<(), ChannelError>;

    /// Poll until the guest accepts an authenticated connection
    async fn wait_until_reachable(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ChannelError>;
}

/// Produces a channel for a guest address
pub trait GuestConnector: Send + Sync {
    fn connect(&self, addr: IpAddr) -> Arc<dyn GuestChannel>;
}
