//! VM Handle - represents a single Firecracker VM with all its resources
//!
//! Each FirecrackerVm tracks one VM throughout its lifecycle:
//! Created -> Booting -> Running -> Stopping -> Stopped
//!
//! Everything the VM owns on the host lives under its private work dir
//! (`<work_root>/<vm_id>/`) plus one TAP device and one network slot.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::time::{Duration, Instant};

use super::manager::{VmIdLease, VmManagerConfig};
use super::network::{self, NetworkSlot, SlotPool};
use super::{spawn_firecracker, to_absolute_path, wait_for_api_socket};
use super::{FirecrackerClient, VirtualMachine, VmError};
use crate::host::CommandRunner;
use crate::metrics::{VMS_RUNNING, VM_BOOT_DURATION};

/// Time allowed for the firecracker process to exit after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Status of a VM
#[derive(Debug, Clone, PartialEq)]
pub enum VmStatus {
    /// Allocated, nothing started on the host yet
    Created,
    /// Host resources being created, guest booting
    Booting,
    /// Firecracker reports the instance running
    Running,
    /// Being torn down
    Stopping,
    /// Torn down, all host resources released
    Stopped,
    /// Boot failed with an error
    Failed(String),
}

/// Represents a single VM instance with all its resources
pub struct FirecrackerVm {
    /// Unique identifier for this VM (prefix of the run id)
    vm_id: String,
    /// Keeps `vm_id` reserved until the VM is dropped
    _lease: VmIdLease,
    /// Private directory: API socket, rootfs copy, console log
    work_dir: PathBuf,
    config: Arc<VmManagerConfig>,
    slots: Arc<SlotPool>,
    commands: Arc<dyn CommandRunner>,
    /// Firecracker process handle
    process: Option<Child>,
    /// Network slot, held from boot until teardown
    slot: Option<NetworkSlot>,
    guest_addr: Option<IpAddr>,
    status: VmStatus,
    created_at: Instant,
}

impl FirecrackerVm {
    /// Create a new, not yet started, VM
    pub fn new(
        lease: VmIdLease,
        config: Arc<VmManagerConfig>,
        slots: Arc<SlotPool>,
        commands: Arc<dyn CommandRunner>,
    ) -> Self {
        let vm_id = lease.id().to_string();
        let work_dir = config.work_root.join(&vm_id);
        Self {
            vm_id,
            _lease: lease,
            work_dir,
            config,
            slots,
            commands,
            process: None,
            slot: None,
            guest_addr: None,
            status: VmStatus::Created,
            created_at: Instant::now(),
        }
    }

    pub fn status(&self) -> &VmStatus {
        &self.status
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path to the Firecracker API socket
    pub fn api_socket(&self) -> PathBuf {
        self.work_dir.join("firecracker.sock")
    }

    /// Serial console and VMM output
    pub fn console_log(&self) -> PathBuf {
        self.work_dir.join("console.log")
    }

    /// Get time since VM was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Firecracker PID while the process is alive
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    async fn boot(&mut self) -> Result<IpAddr, VmError> {
        let index = self.slots.allocate()?;
        let slot = NetworkSlot::new(self.config.subnet_base, index);
        self.slot = Some(slot.clone());

        // Leftovers from a crashed attempt with the same id
        if self.work_dir.exists() {
            tracing::warn!(vm_id = %self.vm_id, dir = %self.work_dir.display(), "removing stale VM work dir");
            tokio::fs::remove_dir_all(&self.work_dir).await?;
        }
        tokio::fs::create_dir_all(&self.work_dir).await?;

        network::setup_tap(self.commands.as_ref(), &slot).await?;

        let rootfs = self.work_dir.join("rootfs.ext4");
        tokio::fs::copy(&self.config.rootfs_path, &rootfs).await?;

        let api_socket = self.api_socket();
        let child = spawn_firecracker(&self.config.firecracker_bin, &api_socket, &self.console_log())?;
        self.process = Some(child);

        let timeout = self.config.startup_timeout();
        let deadline = Instant::now() + timeout;
        wait_for_api_socket(&api_socket, timeout).await?;

        let client = FirecrackerClient::new(api_socket.to_string_lossy());
        client.machine_config(&self.config.resources).await?;
        let boot_args = format!("{} {}", self.config.boot_args, slot.kernel_ip_arg());
        client
            .boot_source(to_absolute_path(&self.config.kernel_path)?, boot_args)
            .await?;
        client
            .add_drive("rootfs", to_absolute_path(&rootfs)?, true, false)
            .await?;
        client
            .add_network_interface("eth0", slot.tap_name.clone(), slot.guest_mac())
            .await?;
        client.start().await?;

        self.wait_running(&client, deadline, timeout).await?;

        Ok(IpAddr::V4(slot.guest_ip))
    }

    /// Poll the API until the instance is Running or the process dies
    async fn wait_running(
        &mut self,
        client: &FirecrackerClient,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), VmError> {
        loop {
            if let Some(child) = self.process.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(VmError::Exited(status.to_string()));
                }
            }

            let last_state = match client.instance_info().await {
                Ok(info) if info.state == "Running" => return Ok(()),
                Ok(info) => info.state,
                Err(e) => e.to_string(),
            };

            if Instant::now() >= deadline {
                return Err(VmError::BootTimeout {
                    vm_id: self.vm_id.clone(),
                    waited: timeout,
                    last_state,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Release everything the VM holds, attempting every step
    async fn teardown(&mut self) -> Result<(), VmError> {
        let mut first_error: Option<VmError> = None;
        self.guest_addr = None;

        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(vm_id = %self.vm_id, error = %e, "firecracker already exited");
            }
            match tokio::time::timeout(KILL_WAIT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(vm_id = %self.vm_id, %status, "firecracker exited");
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(VmError::Io(e));
                }
                Err(_) => {
                    first_error.get_or_insert(VmError::Exited(format!(
                        "process did not exit within {:?} of SIGKILL",
                        KILL_WAIT
                    )));
                }
            }
        }

        if let Some(slot) = self.slot.take() {
            match network::teardown_tap(self.commands.as_ref(), &slot.tap_name).await {
                Ok(()) => self.slots.release(slot.index),
                Err(e) => {
                    // Keep the slot reserved: another VM on the same subnet
                    // would collide with the leftover TAP
                    tracing::warn!(vm_id = %self.vm_id, tap = %slot.tap_name, error = %e, "failed to remove TAP device");
                    first_error.get_or_insert(e);
                }
            }
        }

        if self.work_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
                tracing::warn!(vm_id = %self.vm_id, error = %e, "failed to remove VM work dir");
                first_error.get_or_insert(VmError::Io(e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VirtualMachine for FirecrackerVm {
    fn id(&self) -> &str {
        &self.vm_id
    }

    async fn start(&mut self) -> Result<(), VmError> {
        if self.status == VmStatus::Running {
            return Ok(());
        }

        self.status = VmStatus::Booting;
        let start_time = Instant::now();
        tracing::info!(vm_id = %self.vm_id, "booting VM");

        match self.boot().await {
            Ok(addr) => {
                self.guest_addr = Some(addr);
                self.status = VmStatus::Running;
                VMS_RUNNING.inc();
                let boot_duration = start_time.elapsed();
                VM_BOOT_DURATION.observe(boot_duration.as_secs_f64());
                tracing::info!(
                    vm_id = %self.vm_id,
                    guest_addr = %addr,
                    boot_ms = boot_duration.as_millis() as u64,
                    "VM running"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(vm_id = %self.vm_id, error = %e, "VM boot failed, releasing resources");
                if let Err(cleanup) = self.teardown().await {
                    tracing::warn!(vm_id = %self.vm_id, error = %cleanup, "cleanup after failed boot incomplete");
                }
                self.status = VmStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn guest_address(&self) -> Option<IpAddr> {
        self.guest_addr
    }

    async fn kill(&mut self) -> Result<(), VmError> {
        let was_running = self.status == VmStatus::Running;
        self.status = VmStatus::Stopping;

        let result = self.teardown().await;
        if was_running {
            VMS_RUNNING.dec();
        }
        self.status = VmStatus::Stopped;

        tracing::info!(vm_id = %self.vm_id, age_secs = self.age().as_secs(), "VM destroyed");
        result
    }
}

impl std::fmt::Debug for FirecrackerVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirecrackerVm")
            .field("vm_id", &self.vm_id)
            .field("work_dir", &self.work_dir)
            .field("slot", &self.slot)
            .field("guest_addr", &self.guest_addr)
            .field("status", &self.status)
            .field("age", &self.age())
            .finish()
    }
}
