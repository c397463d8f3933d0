//! Firecracker VM configuration structures
//!
//! These structs represent the JSON payloads used in Firecracker API requests,
//! plus the resource sizing presets applied to every sandbox VM.

use serde::{Deserialize, Serialize};

/// Boot source configuration for the VM kernel
#[derive(Serialize, Debug, Clone)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

/// Block device (drive) configuration
#[derive(Serialize, Debug, Clone)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// vCPU and memory sizing
#[derive(Serialize, Debug, Clone)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
}

/// Guest network interface backed by a host TAP device
#[derive(Serialize, Debug, Clone)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

/// VM action (e.g., "InstanceStart")
#[derive(Serialize, Debug, Clone)]
pub struct Action {
    pub action_type: String,
}

/// Response of `GET /` describing the instance
#[derive(Deserialize, Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    /// "Not started", "Running" or "Paused"
    pub state: String,
}

/// Resources reserved for one sandbox VM
///
/// Presets mirror common sandbox sizes; `custom` covers everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
}

impl VmResources {
    /// 1 vCPU, 2GB RAM
    pub fn small() -> Self {
        Self {
            vcpu_count: 1,
            mem_size_mib: 2 * 1024,
        }
    }

    /// 2 vCPUs, 4GB RAM
    pub fn medium() -> Self {
        Self {
            vcpu_count: 2,
            mem_size_mib: 4 * 1024,
        }
    }

    /// 4 vCPUs, 8GB RAM
    pub fn large() -> Self {
        Self {
            vcpu_count: 4,
            mem_size_mib: 8 * 1024,
        }
    }

    pub fn custom(vcpu_count: u8, memory_gb: f64) -> Self {
        Self {
            vcpu_count,
            mem_size_mib: (memory_gb * 1024.0) as u32,
        }
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            vcpu_count: self.vcpu_count,
            mem_size_mib: self.mem_size_mib,
        }
    }
}

impl Default for VmResources {
    fn default() -> Self {
        Self::medium()
    }
}
