//! VM Manager - creates VM instances for runs
//!
//! The VmManager is responsible for:
//! - Deriving a collision-free VM id from the run id
//! - Sharing the network slot pool across concurrent VMs
//! - Handing each run a [`FirecrackerVm`] bound to the host configuration

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;

use super::handle::FirecrackerVm;
use super::network::SlotPool;
use super::{VirtualMachine, VmError, VmFactory, VmResources};
use crate::host::CommandRunner;

/// Length of the run-id prefix used as VM id
const VM_ID_LEN: usize = 12;

/// Characters added to the prefix each time it collides with a live VM
const VM_ID_STEP: usize = 4;

/// Shortest run-id prefix accepted
const MIN_VM_ID_LEN: usize = 8;

/// Configuration for the VmManager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmManagerConfig {
    /// Path to the firecracker binary
    pub firecracker_bin: PathBuf,
    /// Path to the kernel image
    pub kernel_path: PathBuf,
    /// Path to the base root filesystem (copied per VM)
    pub rootfs_path: PathBuf,
    /// Parent of every per-VM work dir
    pub work_root: PathBuf,
    /// Kernel command line; the `ip=` argument is appended per VM
    pub boot_args: String,
    /// vCPU and memory for each VM
    pub resources: VmResources,
    /// Seconds allowed from spawn to Running
    pub startup_timeout_secs: u64,
    /// First address of the /30 slot range
    pub subnet_base: Ipv4Addr,
    /// Number of /30 slots (upper bound on concurrent VMs)
    pub max_slots: u32,
}

impl VmManagerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/sandbox-runner/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/sandbox-runner/rootfs.ext4"),
            work_root: PathBuf::from("/var/lib/sandbox-runner/vms"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda rw".to_string(),
            resources: VmResources::medium(),
            startup_timeout_secs: 30,
            subnet_base: Ipv4Addr::new(172, 16, 0, 0),
            max_slots: 256,
        }
    }
}

/// Derive the preferred VM id from a run id
///
/// Takes the first 12 alphanumeric characters, lower-cased, so a run keeps
/// the same work dir name across runner restarts. UUIDv7 run ids minted in
/// the same millisecond share this prefix; [`VmManager`] lengthens it while
/// another live VM holds it.
pub fn derive_vm_id(run_id: &str) -> Result<String, VmError> {
    let id = run_id_chars(run_id);
    if id.len() < MIN_VM_ID_LEN {
        return Err(VmError::InvalidRunId(run_id.to_string()));
    }
    Ok(id[..id.len().min(VM_ID_LEN)].to_string())
}

fn run_id_chars(run_id: &str) -> String {
    run_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// VM id -> normalized run id of the VM holding it
type LiveIds = Arc<Mutex<HashMap<String, String>>>;

/// Exclusive claim on a VM id, released when dropped
#[derive(Debug)]
pub struct VmIdLease {
    id: String,
    live: LiveIds,
}

impl VmIdLease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for VmIdLease {
    fn drop(&mut self) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.remove(&self.id);
    }
}

/// Creates Firecracker VMs for runs
pub struct VmManager {
    config: Arc<VmManagerConfig>,
    slots: Arc<SlotPool>,
    commands: Arc<dyn CommandRunner>,
    /// Ids held by VMs that have not been dropped yet
    live_ids: LiveIds,
}

impl VmManager {
    pub fn new(config: VmManagerConfig, commands: Arc<dyn CommandRunner>) -> Self {
        let slots = Arc::new(SlotPool::new(config.max_slots));
        Self {
            config: Arc::new(config),
            slots,
            commands,
            live_ids: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reserve the shortest free run-id prefix of at least 12 characters
    ///
    /// Fails with [`VmError::IdInUse`] when the same run already has a live
    /// VM, or when every prefix of the run id is held by other runs.
    pub fn reserve_id(&self, run_id: &str) -> Result<VmIdLease, VmError> {
        let full = run_id_chars(run_id);
        if full.len() < MIN_VM_ID_LEN {
            return Err(VmError::InvalidRunId(run_id.to_string()));
        }

        let mut live = self.live_ids.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((held, _)) = live.iter().find(|(_, owner)| **owner == full) {
            return Err(VmError::IdInUse(held.to_string()));
        }

        let mut len = full.len().min(VM_ID_LEN);
        loop {
            let candidate = &full[..len];
            if !live.contains_key(candidate) {
                live.insert(candidate.to_string(), full.clone());
                return Ok(VmIdLease {
                    id: candidate.to_string(),
                    live: self.live_ids.clone(),
                });
            }
            if len == full.len() {
                return Err(VmError::IdInUse(candidate.to_string()));
            }
            len = (len + VM_ID_STEP).min(full.len());
        }
    }

    /// Number of VM ids currently held
    pub fn live_vms(&self) -> usize {
        self.live_ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of network slots currently held by VMs
    pub fn slots_in_use(&self) -> usize {
        self.slots.in_use()
    }

    pub fn config(&self) -> &VmManagerConfig {
        &self.config
    }
}

impl VmFactory for VmManager {
    fn create(&self, run_id: &str) -> Result<Box<dyn VirtualMachine>, VmError> {
        let lease = self.reserve_id(run_id)?;
        tracing::debug!(run_id, vm_id = %lease.id(), "allocating VM");
        Ok(Box::new(FirecrackerVm::new(
            lease,
            self.config.clone(),
            self.slots.clone(),
            self.commands.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CommandError, CommandOutput};
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl CommandRunner for AlwaysOk {
        async fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutput, CommandError> {
            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn test_derive_vm_id_from_uuid() {
        let id = derive_vm_id("0193A1B2-C3D4-7E5F-8A9B-0C1D2E3F4A5B").unwrap();
        assert_eq!(id, "0193a1b2c3d4");
    }

    #[test]
    fn test_derive_vm_id_rejects_short_ids() {
        assert!(matches!(derive_vm_id("ab-12"), Err(VmError::InvalidRunId(_))));
    }

    fn manager_in(dir: &std::path::Path) -> VmManager {
        let rootfs = dir.join("rootfs.ext4");
        std::fs::write(&rootfs, b"fs").unwrap();
        let config = VmManagerConfig {
            firecracker_bin: PathBuf::from("/nonexistent/firecracker"),
            rootfs_path: rootfs,
            work_root: dir.join("vms"),
            max_slots: 4,
            ..VmManagerConfig::default()
        };
        VmManager::new(config, Arc::new(AlwaysOk))
    }

    #[test]
    fn test_same_millisecond_runs_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        // UUIDv7 ids minted in the same millisecond share 12 leading chars
        let a = manager.create("01a1426f-192f-70bb-8120-eeb182bb4005").unwrap();
        let b = manager.create("01a1426f-192f-70bb-8120-eeb23bb1363e").unwrap();
        assert_eq!(a.id(), "01a1426f192f");
        assert_eq!(b.id(), "01a1426f192f70bb");
        assert_eq!(manager.live_vms(), 2);

        // Once the first VM is gone its short id is free again
        drop(a);
        let c = manager.create("01a1426f-192f-70bb-8120-eeb3aa000001").unwrap();
        assert_eq!(c.id(), "01a1426f192f");
        assert_ne!(c.id(), b.id());
    }

    #[test]
    fn test_same_run_id_twice_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let run_id = "0193a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b";
        let _first = manager.create(run_id).unwrap();
        let second = manager.create(run_id);
        assert!(matches!(second, Err(VmError::IdInUse(ref id)) if id == "0193a1b2c3d4"));
        assert_eq!(manager.live_vms(), 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = VmManagerConfig::default();
        assert_eq!(config.resources, VmResources::medium());
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_slots, 256);
    }

    #[tokio::test]
    async fn test_failed_boot_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs.ext4");
        std::fs::write(&rootfs, b"fs").unwrap();

        let config = VmManagerConfig {
            firecracker_bin: PathBuf::from("/nonexistent/firecracker"),
            rootfs_path: rootfs,
            work_root: dir.path().join("vms"),
            max_slots: 4,
            ..VmManagerConfig::default()
        };
        let manager = VmManager::new(config, Arc::new(AlwaysOk));

        let mut vm = manager.create("7f3c9a2e-1111-2222-3333-444455556666").unwrap();
        assert_eq!(vm.id(), "7f3c9a2e1111");

        let err = vm.start().await.unwrap_err();
        assert!(matches!(err, VmError::Spawn(_)), "{err}");
        assert!(vm.guest_address().is_none());
        assert_eq!(manager.slots_in_use(), 0);
        assert!(!dir.path().join("vms").join("7f3c9a2e1111").exists());

        // kill after a failed start is a no-op, and so is a second kill
        vm.kill().await.unwrap();
        vm.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_work_dir_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs.ext4");
        std::fs::write(&rootfs, b"fs").unwrap();
        let stale = dir.path().join("vms").join("aaaabbbbcccc");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("leftover"), b"x").unwrap();

        let config = VmManagerConfig {
            firecracker_bin: PathBuf::from("/nonexistent/firecracker"),
            rootfs_path: rootfs,
            work_root: dir.path().join("vms"),
            ..VmManagerConfig::default()
        };
        let manager = VmManager::new(config, Arc::new(AlwaysOk));
        let mut vm = manager.create("aaaabbbbccccdddd").unwrap();

        assert!(vm.start().await.is_err());
        assert!(!stale.join("leftover").exists());
    }
}
