//! VM Registry - guest address → run identity + network policy
//!
//! Constructed once at runner startup and shared by handle with the executor
//! and the policy controller. The intercepting proxy runs out of process, so
//! every mutation also rewrites a JSON snapshot the proxy add-on reads:
//!
//! ```json
//! {
//!   "vms": {
//!     "172.16.0.2": { "runId": "...", "sandboxToken": "...", "policy": {...}, "secrets": [...] }
//!   }
//! }
//! ```
//!
//! The snapshot is written to a temp file and renamed over the old one, so the
//! add-on never observes a half-written file. An address without an entry is
//! denied.

use std::collections::HashMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::Mutex;

use super::policy::{Decision, NetworkPolicy};

/// One registered run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub run_id: String,
    /// Run-scoped credential the proxy attaches to control-plane traffic
    pub sandbox_token: String,
    pub policy: NetworkPolicy,
    /// Values to scrub when `policy.redact_secrets` is set
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

impl RegistryEntry {
    pub fn new(
        run_id: impl Into<String>,
        sandbox_token: impl Into<String>,
        policy: NetworkPolicy,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            sandbox_token: sandbox_token.into(),
            policy,
            secrets: Vec::new(),
        }
    }

    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = if self.policy.redact_secrets {
            secrets
        } else {
            Vec::new()
        };
        self
    }
}

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("guest address {addr} already registered to run {run_id}")]
    AddressInUse { addr: IpAddr, run_id: String },
    #[error("failed to write registry snapshot {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode registry snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Snapshot<'a> {
    vms: HashMap<String, &'a RegistryEntry>,
}

/// Snapshot writes attempted when unregistering
const UNREGISTER_PERSIST_ATTEMPTS: u32 = 2;

/// Address → policy table shared across runs on this host
#[derive(Debug)]
pub struct VmRegistry {
    entries: Mutex<HashMap<IpAddr, RegistryEntry>>,
    snapshot_path: Option<PathBuf>,
}

impl VmRegistry {
    /// Registry mirrored to `snapshot_path` for the proxy add-on
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot_path: Some(snapshot_path.into()),
        }
    }

    /// Registry without a snapshot file
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Write an empty snapshot so the add-on starts from a known state
    pub async fn reset(&self) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries)
    }

    /// Register `addr` for a run
    ///
    /// Re-registering the same run replaces its entry; a different run on a
    /// live address is rejected. Nothing is kept in memory if the snapshot
    /// cannot be written.
    pub async fn register(&self, addr: IpAddr, entry: RegistryEntry) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&addr) {
            if existing.run_id != entry.run_id {
                return Err(RegistryError::AddressInUse {
                    addr,
                    run_id: existing.run_id.clone(),
                });
            }
        }

        let run_id = entry.run_id.clone();
        let previous = entries.insert(addr, entry);
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(prev) => entries.insert(addr, prev),
                None => entries.remove(&addr),
            };
            return Err(e);
        }

        tracing::debug!(guest_addr = %addr, run_id = %run_id, "registered VM in registry");
        Ok(())
    }

    /// Remove `addr`; returns the removed entry
    ///
    /// The in-memory entry is gone even when the snapshot write fails. The
    /// write is retried before giving up, and a final failure is logged at
    /// error level: until the next successful write the add-on still applies
    /// the old policy to whatever VM next gets this address.
    pub async fn unregister(&self, addr: IpAddr) -> Result<Option<RegistryEntry>, RegistryError> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(&addr);
        if removed.is_none() {
            return Ok(None);
        }

        let mut attempt = 1;
        loop {
            match self.persist(&entries) {
                Ok(()) => break,
                Err(e) if attempt < UNREGISTER_PERSIST_ATTEMPTS => {
                    tracing::warn!(guest_addr = %addr, attempt, error = %e, "registry snapshot write failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        guest_addr = %addr,
                        error = %e,
                        "registry snapshot still lists an unregistered VM"
                    );
                    return Err(e);
                }
            }
        }
        tracing::debug!(guest_addr = %addr, "unregistered VM from registry");
        Ok(removed)
    }

    pub async fn lookup(&self, addr: IpAddr) -> Option<RegistryEntry> {
        self.entries.lock().await.get(&addr).cloned()
    }

    /// Per-connection verdict for traffic from `addr` to `host`
    ///
    /// The proxy add-on makes the same decision from the snapshot file: the
    /// entry for the source address is evaluated against the hostname, and a
    /// source with no entry is denied.
    pub async fn decide(&self, addr: IpAddr, host: &str) -> Decision {
        match self.entries.lock().await.get(&addr) {
            Some(entry) => entry.policy.evaluate(host),
            None => Decision::Deny {
                reason: format!("no policy registered for {}", addr),
            },
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    fn persist(&self, entries: &HashMap<IpAddr, RegistryEntry>) -> Result<(), RegistryError> {
        let path = match &self.snapshot_path {
            Some(path) => path,
            None => return Ok(()),
        };

        let snapshot = Snapshot {
            vms: entries.iter().map(|(addr, e)| (addr.to_string(), e)).collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        write_atomic(path, &json).map_err(|source| RegistryError::Persist {
            path: path.clone(),
            source,
        })
    }
}

/// Write via temp file + rename; the file holds credentials, so 0600
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}
