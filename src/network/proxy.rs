//! Shared intercepting proxy (mitmdump in transparent mode)
//!
//! One proxy process serves every VM on the host. It is started once before
//! the runner polls for work and stopped after the last run has drained.
//!
//! ```text
//!  guest :80/:443 ──REDIRECT──► mitmdump :listen_port ──► internet
//!                                   │
//!                                   ├── addon reads registry.json (per-VM policy)
//!                                   └── addon writes <log_dir>/<run_id>.jsonl
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::process::{Child, Command};

/// CA key + certificate bundle mitmproxy loads from its confdir
pub const CA_BUNDLE_FILE: &str = "mitmproxy-ca.pem";

/// Public half of the CA, installed in guests for deep inspection
pub const CA_CERT_FILE: &str = "mitmproxy-ca-cert.pem";

/// Error type for proxy management
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing proxy file {}", .0.display())]
    MissingFile(PathBuf),
    #[error("failed to spawn proxy {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy exited during startup ({status}); see {}", log.display())]
    ExitedEarly { status: String, log: PathBuf },
    #[error("proxy is not running")]
    NotRunning,
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the proxy process
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Path to the mitmdump binary
    pub binary: PathBuf,
    /// Transparent listen port; redirect rules target it
    pub listen_port: u16,
    /// mitmproxy confdir holding the CA material
    pub ca_dir: PathBuf,
    /// Add-on script enforcing per-VM policy
    pub addon_script: PathBuf,
    /// Registry snapshot consumed by the add-on
    pub registry_path: PathBuf,
    /// Per-run network logs and the proxy's own output
    pub log_dir: PathBuf,
    /// Alive after this long means ready
    pub ready_grace_ms: u64,
    /// Wait after SIGTERM before SIGKILL
    pub stop_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/bin/mitmdump"),
            listen_port: 8080,
            ca_dir: PathBuf::from("/var/lib/sandbox-runner/proxy/ca"),
            addon_script: PathBuf::from("/var/lib/sandbox-runner/proxy/addon.py"),
            registry_path: PathBuf::from("/var/lib/sandbox-runner/proxy/registry.json"),
            log_dir: PathBuf::from("/var/lib/sandbox-runner/proxy/logs"),
            ready_grace_ms: 1500,
            stop_timeout_secs: 10,
        }
    }
}

impl ProxyConfig {
    pub fn ca_certificate_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILE)
    }

    /// Per-run capture written by the add-on
    pub fn network_log_path(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Files that must exist before the proxy can start
    pub fn required_files(&self) -> Vec<PathBuf> {
        vec![
            self.ca_dir.join(CA_BUNDLE_FILE),
            self.ca_certificate_path(),
            self.addon_script.clone(),
        ]
    }

    /// First missing prerequisite, if any
    pub fn validate(&self) -> Result<(), ProxyError> {
        for path in self.required_files() {
            if !path.is_file() {
                return Err(ProxyError::MissingFile(path));
            }
        }
        Ok(())
    }

    fn args(&self) -> Vec<String> {
        vec![
            "--mode".to_string(),
            "transparent".to_string(),
            "--listen-port".to_string(),
            self.listen_port.to_string(),
            "--showhost".to_string(),
            "--set".to_string(),
            format!("confdir={}", self.ca_dir.display()),
            "-s".to_string(),
            self.addon_script.display().to_string(),
            "--set".to_string(),
            format!("registry_path={}", self.registry_path.display()),
            "--set".to_string(),
            format!("log_dir={}", self.log_dir.display()),
        ]
    }
}

/// Owns the proxy process
pub struct ProxyManager {
    config: ProxyConfig,
    process: Option<Child>,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            process: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn listen_port(&self) -> u16 {
        self.config.listen_port
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn network_log_path(&self, run_id: &str) -> PathBuf {
        self.config.network_log_path(run_id)
    }

    fn proxy_log(&self) -> PathBuf {
        self.config.log_dir.join("proxy.log")
    }

    /// PEM certificate guests trust in deep inspection mode
    pub async fn ca_certificate(&self) -> Result<String, ProxyError> {
        read_ca_certificate(&self.config).await
    }

    /// Start the proxy and wait out the readiness grace period
    ///
    /// # Errors
    /// Missing CA material or add-on script, spawn failure, or the process
    /// exiting before the grace period ends.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if self.process.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        tokio::fs::create_dir_all(&self.config.log_dir).await?;

        let log_path = self.proxy_log();
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        let mut child = Command::new(&self.config.binary)
            .args(self.config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProxyError::Spawn {
                binary: self.config.binary.clone(),
                source,
            })?;

        tokio::time::sleep(Duration::from_millis(self.config.ready_grace_ms)).await;

        if let Some(status) = child.try_wait()? {
            return Err(ProxyError::ExitedEarly {
                status: status.to_string(),
                log: log_path,
            });
        }

        tracing::info!(
            pid = child.id(),
            port = self.config.listen_port,
            "intercepting proxy ready"
        );
        self.process = Some(child);
        Ok(())
    }

    /// SIGTERM, then SIGKILL after the stop timeout
    pub async fn stop(&mut self) -> Result<(), ProxyError> {
        let mut child = match self.process.take() {
            Some(child) => child,
            None => return Err(ProxyError::NotRunning),
        };

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM to proxy failed");
            }
        }

        let timeout = Duration::from_secs(self.config.stop_timeout_secs);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::info!(%status, "intercepting proxy stopped");
            }
            Err(_) => {
                tracing::warn!(?timeout, "proxy ignored SIGTERM, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Read the guest-facing CA certificate
pub async fn read_ca_certificate(config: &ProxyConfig) -> Result<String, ProxyError> {
    let path = config.ca_certificate_path();
    tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ProxyError::MissingFile(path),
        _ => ProxyError::Io(e),
    })
}

/// Read a run's capture as individual JSON lines
///
/// A missing file means the run made no proxied requests.
pub async fn read_network_log(path: &Path) -> Result<Vec<String>, ProxyError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ProxyError::Io(e)),
    }
}
