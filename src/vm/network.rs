//! Per-VM host networking
//!
//! Each VM gets one TAP device and a /30 carved out of the configured base
//! subnet:
//!
//! ```text
//! slot n  →  base + 4n      network
//!            base + 4n + 1  host side of the TAP (guest gateway)
//!            base + 4n + 2  guest eth0
//!            base + 4n + 3  broadcast
//! ```
//!
//! The guest learns its address from the kernel `ip=` boot argument, so the
//! address is known on the host before the guest is up.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::host::{args, CommandRunner};

use super::VmError;

/// Network resources of one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSlot {
    pub index: u32,
    pub tap_name: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
}

impl NetworkSlot {
    pub fn new(base: Ipv4Addr, index: u32) -> Self {
        let net = u32::from(base) + index * 4;
        Self {
            index,
            tap_name: tap_name(index),
            host_ip: Ipv4Addr::from(net + 1),
            guest_ip: Ipv4Addr::from(net + 2),
        }
    }

    /// Locally administered MAC derived from the slot index
    pub fn guest_mac(&self) -> String {
        let [_, b, c, d] = self.index.to_be_bytes();
        format!("06:00:ac:{:02x}:{:02x}:{:02x}", b, c, d)
    }

    /// Kernel `ip=` argument: client::gateway:netmask::device:autoconf
    pub fn kernel_ip_arg(&self) -> String {
        format!(
            "ip={}::{}:255.255.255.252::eth0:off",
            self.guest_ip, self.host_ip
        )
    }
}

/// TAP device name for a slot (fits in IFNAMSIZ for any u32 index)
///
/// Slot indices are unique among live VMs, so TAP names are too.
pub fn tap_name(index: u32) -> String {
    format!("fctap{}", index)
}

/// Thread-safe allocator of network slot indices
#[derive(Debug)]
pub struct SlotPool {
    max_slots: u32,
    in_use: Mutex<BTreeSet<u32>>,
}

impl SlotPool {
    pub fn new(max_slots: u32) -> Self {
        Self {
            max_slots,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserve the lowest free slot index
    pub fn allocate(&self) -> Result<u32, VmError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let index = (0..self.max_slots)
            .find(|i| !in_use.contains(i))
            .ok_or(VmError::NoNetworkSlot(self.max_slots))?;
        in_use.insert(index);
        Ok(index)
    }

    pub fn release(&self, index: u32) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.remove(&index);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Create and bring up the TAP device for `slot`
///
/// A stale device with the same name (left behind by a crashed runner) is
/// removed first.
pub async fn setup_tap(commands: &dyn CommandRunner, slot: &NetworkSlot) -> Result<(), VmError> {
    // Absent device is the normal case
    let _ = commands
        .run("ip", &args(["link", "del", slot.tap_name.as_str()]))
        .await;

    let host_cidr = format!("{}/30", slot.host_ip);
    let steps = [
        args(["tuntap", "add", "dev", slot.tap_name.as_str(), "mode", "tap"]),
        args(["addr", "add", host_cidr.as_str(), "dev", slot.tap_name.as_str()]),
        args(["link", "set", "dev", slot.tap_name.as_str(), "up"]),
    ];

    for step in steps.iter() {
        commands
            .run_checked("ip", step)
            .await
            .map_err(|e| VmError::Network(e.to_string()))?;
    }
    Ok(())
}

/// Remove the TAP device; a missing device counts as removed
pub async fn teardown_tap(commands: &dyn CommandRunner, tap_name: &str) -> Result<(), VmError> {
    let exists = commands
        .run("ip", &args(["link", "show", "dev", tap_name]))
        .await
        .map_err(|e| VmError::Network(e.to_string()))?;
    if !exists.success() {
        return Ok(());
    }

    commands
        .run_checked("ip", &args(["link", "del", tap_name]))
        .await
        .map_err(|e| VmError::Network(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_addresses() {
        let base: Ipv4Addr = "172.16.0.0".parse().unwrap();
        let slot0 = NetworkSlot::new(base, 0);
        assert_eq!(slot0.host_ip, "172.16.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(slot0.guest_ip, "172.16.0.2".parse::<Ipv4Addr>().unwrap());

        let slot70 = NetworkSlot::new(base, 70);
        assert_eq!(slot70.host_ip, "172.16.1.25".parse::<Ipv4Addr>().unwrap());
        assert_eq!(slot70.guest_ip, "172.16.1.26".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_kernel_ip_arg_and_mac() {
        let slot = NetworkSlot::new("10.200.0.0".parse().unwrap(), 1);
        assert_eq!(
            slot.kernel_ip_arg(),
            "ip=10.200.0.6::10.200.0.5:255.255.255.252::eth0:off"
        );
        assert_eq!(slot.guest_mac(), "06:00:ac:00:00:01");
    }

    #[test]
    fn test_tap_name_fits_ifnamsiz() {
        assert_eq!(tap_name(7), "fctap7");
        assert!(tap_name(u32::MAX).len() <= 15);
        assert_ne!(tap_name(1), tap_name(10));
    }

    #[test]
    fn test_slot_pool_reuses_released() {
        let pool = SlotPool::new(2);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        assert!(matches!(pool.allocate(), Err(VmError::NoNetworkSlot(2))));

        pool.release(a);
        assert_eq!(pool.allocate().unwrap(), a);
        assert_eq!(pool.in_use(), 2);
    }
}
