//! Firecracker VM management module
//!
//! This module provides abstractions for managing sandbox VMs including:
//! - VM configuration (machine sizing, boot source, drives, network)
//! - Firecracker API client
//! - VM lifecycle management (allocate, boot, kill)
//! - Host capacity admission

pub mod capacity;
pub mod config;
pub mod firecracker;
pub mod handle;
pub mod lifecycle;
pub mod manager;
pub mod network;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

pub use capacity::{CapacityGate, CapacityPermit};
pub use config::*;
pub use firecracker::FirecrackerClient;
pub use handle::{FirecrackerVm, VmStatus};
pub use lifecycle::*;
pub use manager::{derive_vm_id, VmIdLease, VmManager, VmManagerConfig};

/// Error type for VM lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("failed to spawn firecracker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("firecracker API socket {} not ready after {:?}", .0.display(), .1)]
    ApiSocketTimeout(PathBuf, Duration),
    #[error("firecracker API error on {endpoint}: {status} - {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("firecracker API request failed: {0}")]
    Transport(String),
    #[error("VM {vm_id} not running after {waited:?} (last state: {last_state})")]
    BootTimeout {
        vm_id: String,
        waited: Duration,
        last_state: String,
    },
    #[error("firecracker exited during boot: {0}")]
    Exited(String),
    #[error("host network setup failed: {0}")]
    Network(String),
    #[error("no free network slot (all {0} in use)")]
    NoNetworkSlot(u32),
    #[error("cannot derive a VM id from run id {0:?}")]
    InvalidRunId(String),
    #[error("VM id {0} is already held by a live VM")]
    IdInUse(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One sandbox VM owned by exactly one run
#[async_trait]
pub trait VirtualMachine: Send {
    /// Short identifier derived from the run id
    fn id(&self) -> &str;

    /// Boot the VM and block until its guest address is usable
    ///
    /// On failure every partially created resource is released and no
    /// address is exposed.
    async fn start(&mut self) -> Result<(), VmError>;

    /// Guest address, known only after a successful `start`
    fn guest_address(&self) -> Option<IpAddr>;

    /// Force-terminate the VM and release its resources
    ///
    /// Safe to call after a failed `start` and safe to call twice.
    async fn kill(&mut self) -> Result<(), VmError>;
}

/// Allocates VM instances for runs
pub trait VmFactory: Send + Sync {
    fn create(&self, run_id: &str) -> Result<Box<dyn VirtualMachine>, VmError>;
}
