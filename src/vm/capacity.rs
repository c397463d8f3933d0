//! Host capacity admission
//!
//! Bounds how many runs (and therefore VMs) this host executes at once. The
//! runner takes a permit before claiming a job and holds it until the run's
//! cleanup has finished, so a claimed job always has room to boot.
//!
//! ```text
//!   poll ──► acquire() ──► claim ──► execute ──► cleanup ──► permit dropped
//!               │
//!               └── blocks while `limit` runs are in flight
//! ```

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A held slot of host capacity; released on drop
#[derive(Debug)]
pub struct CapacityPermit {
    _permit: OwnedSemaphorePermit,
}

/// Admission control for concurrent runs
#[derive(Debug, Clone)]
pub struct CapacityGate {
    semaphore: Arc<Semaphore>,
    limit: Option<usize>,
}

impl CapacityGate {
    /// `None` means no limit beyond what the host itself enforces
    pub fn new(limit: Option<usize>) -> Self {
        let permits = limit.unwrap_or(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            limit,
        }
    }

    /// Wait until a run may start
    pub async fn acquire(&self) -> CapacityPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("capacity semaphore is never closed");
        CapacityPermit { _permit: permit }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<CapacityPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| CapacityPermit { _permit: permit })
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Runs currently admitted
    pub fn in_use(&self) -> usize {
        match self.limit {
            Some(limit) => limit - self.semaphore.available_permits(),
            None => Semaphore::MAX_PERMITS - self.semaphore.available_permits(),
        }
    }
}
