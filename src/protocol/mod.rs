//! Runner Job Protocol - how the runner talks to the control plane
//!
//! ```text
//!  runner                                   control plane
//!    │── POST /api/runners/poll {group} ───────►│  long-poll (≈30s)
//!    │◄──────────── 200 {job} | 204 ────────────│
//!    │── POST /api/runners/jobs/{id}/claim ────►│  exactly one winner
//!    │◄──── 200 ExecutionContext | 409/404/403 ─│
//!    │            ... run ...                   │
//!    │── POST /api/webhooks/agent/telemetry ───►│  best effort
//!    │── POST /api/webhooks/agent/complete ────►│  retried, idempotent
//! ```
//!
//! The executor and runner only see the [`ControlPlane`] trait, so tests can
//! drive them without HTTP.

pub mod client;
pub mod types;

use async_trait::async_trait;

pub use client::{ApiClient, ApiConfig};
pub use types::{
    CliAgentType, ExecutionContext, Job, ResumeSession, StorageEntry, StorageManifest,
};

use crate::executor::RunOutcome;

/// Error type for control-plane calls
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("run {0} was already claimed")]
    Conflict(String),
    #[error("run {0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unexpected HTTP {status} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("request to control plane failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid control plane response: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Worth retrying for idempotent calls
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Transport(_) => true,
            ProtocolError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Control-plane operations the runner depends on
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Long-poll for the next job of `group`; `None` when the wait expired
    async fn poll(&self, group: &str) -> Result<Option<Job>, ProtocolError>;

    /// Take exclusive ownership of a job
    async fn claim(&self, run_id: &str) -> Result<ExecutionContext, ProtocolError>;

    /// Report the terminal outcome; safe to repeat
    async fn complete(&self, run_id: &str, outcome: &RunOutcome) -> Result<(), ProtocolError>;

    /// Ship captured network log entries
    async fn upload_network_logs(
        &self,
        run_id: &str,
        entries: &[serde_json::Value],
    ) -> Result<(), ProtocolError>;
}
