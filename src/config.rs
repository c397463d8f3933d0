//! Runner configuration
//!
//! Loaded from a TOML file; every section and field has a default, so a
//! minimal file only names the control plane and the guest channel token:
//!
//! ```toml
//! [api]
//! url = "https://app.example.com"
//! token = "rnr_..."
//!
//! [channel]
//! auth_token = "..."
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::executor::ExecutorConfig;
use crate::guest::channel::DEFAULT_CHANNEL_PORT;
use crate::network::ProxyConfig;
use crate::protocol::ApiConfig;
use crate::runner::RunnerSettings;
use crate::vm::VmManagerConfig;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Guest channel settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Port the in-guest agent listens on
    pub port: u16,
    /// Shared secret for the `AUTH` handshake
    pub auth_token: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CHANNEL_PORT,
            auth_token: String::new(),
        }
    }
}

/// Logging, tracing and metrics
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP collector; span export is off when unset
    pub otlp_endpoint: Option<String>,
    /// JSON log lines instead of text
    pub json_logs: bool,
    /// Serve `GET /metrics` here when set
    pub metrics_addr: Option<SocketAddr>,
}

/// Top-level runner configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub api: ApiConfig,
    pub runner: RunnerSettings,
    pub vm: VmManagerConfig,
    pub proxy: ProxyConfig,
    pub channel: ChannelConfig,
    pub executor: ExecutorConfig,
    pub telemetry: TelemetryConfig,
}

impl RunnerConfig {
    /// Read and parse `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Fill values that default to other settings, then validate
    ///
    /// Call after CLI overrides have been applied.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.executor.api_url.is_empty() {
            self.executor.api_url = self.api.url.clone();
        }
        self.validate()?;
        Ok(self)
    }

    /// Report every missing or inconsistent required value
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.api.url.is_empty() {
            problems.push("api.url is required".to_string());
        } else if !(self.api.url.starts_with("http://") || self.api.url.starts_with("https://")) {
            problems.push(format!("api.url must be an http(s) URL, got {:?}", self.api.url));
        }
        if self.api.token.is_empty() {
            problems.push("api.token is required".to_string());
        }
        if self.api.group.is_empty() {
            problems.push("api.group must not be empty".to_string());
        }
        if self.channel.auth_token.is_empty() {
            problems.push("channel.auth_token is required".to_string());
        }
        if self.vm.max_slots == 0 {
            problems.push("vm.max_slots must be at least 1".to_string());
        }
        if self.runner.max_concurrent_runs == Some(0) {
            problems.push("runner.max_concurrent_runs must be at least 1 when set".to_string());
        }
        if self.executor.max_run_secs == 0 || self.executor.poll_interval_secs == 0 {
            problems.push("executor.max_run_secs and executor.poll_interval_secs must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Host paths the runner needs before it can boot VMs
    pub fn required_host_files(&self) -> Vec<PathBuf> {
        let mut files = vec![
            self.vm.firecracker_bin.clone(),
            self.vm.kernel_path.clone(),
            self.vm.rootfs_path.clone(),
            self.proxy.binary.clone(),
        ];
        files.extend(self.proxy.required_files());
        files
    }
}
