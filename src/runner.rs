//! Runner loop - poll, admit, claim, execute
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────┐
//!  │ acquire capacity ─► poll ─► claim ─► spawn executor task │
//!  │        ▲             │        │                          │
//!  │        │          error:    409: skip                    │
//!  │        │          backoff                                │
//!  └────────┴──────────────────────────────────────────────────┘
//!  shutdown: stop polling, wait for every in-flight run
//! ```
//!
//! The capacity permit travels with the run and is released after its
//! cleanup, so a host never holds more VMs than it admitted.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::executor::{JobExecutor, RunOutcome};
use crate::metrics::CLAIM_CONFLICTS;
use crate::protocol::{ControlPlane, ProtocolError};
use crate::vm::CapacityGate;

/// Loop settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Concurrent runs on this host; unlimited when unset
    pub max_concurrent_runs: Option<usize>,
    /// First pause after a failed poll, doubled per consecutive failure
    pub poll_error_backoff_ms: u64,
    pub max_poll_error_backoff_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: None,
            poll_error_backoff_ms: 1_000,
            max_poll_error_backoff_ms: 60_000,
        }
    }
}

/// Counters for one `run` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub claimed: usize,
    pub conflicts: usize,
    pub poll_errors: usize,
    pub finished: usize,
}

/// Pulls jobs from the control plane and hands them to the executor
pub struct Runner {
    control_plane: Arc<dyn ControlPlane>,
    executor: Arc<JobExecutor>,
    capacity: CapacityGate,
    group: String,
    settings: RunnerSettings,
}

impl Runner {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        executor: Arc<JobExecutor>,
        group: impl Into<String>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            control_plane,
            executor,
            capacity: CapacityGate::new(settings.max_concurrent_runs),
            group: group.into(),
            settings,
        }
    }

    pub fn capacity(&self) -> &CapacityGate {
        &self.capacity
    }

    /// Run until `shutdown` turns true, then drain in-flight runs
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RunnerStats {
        let mut stats = RunnerStats::default();
        let mut tasks: JoinSet<RunOutcome> = JoinSet::new();
        let base_backoff = Duration::from_millis(self.settings.poll_error_backoff_ms);
        let max_backoff = Duration::from_millis(self.settings.max_poll_error_backoff_ms);
        let mut backoff = base_backoff;

        tracing::info!(group = %self.group, limit = ?self.capacity.limit(), "runner started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                reap(joined, &mut stats);
            }
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.capacity.acquire() => permit,
                _ = shutdown.changed() => break,
            };

            let polled = tokio::select! {
                polled = self.control_plane.poll(&self.group) => polled,
                _ = shutdown.changed() => break,
            };

            let job = match polled {
                Ok(Some(job)) => {
                    backoff = base_backoff;
                    job
                }
                Ok(None) => {
                    backoff = base_backoff;
                    continue;
                }
                Err(e) => {
                    stats.poll_errors += 1;
                    tracing::warn!(error = %e, ?backoff, "poll failed");
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(max_backoff);
                    continue;
                }
            };

            match self.control_plane.claim(&job.run_id).await {
                Ok(ctx) => {
                    stats.claimed += 1;
                    tracing::info!(run_id = %ctx.run_id, agent_version_id = %job.agent_version_id, "job claimed");
                    let executor = Arc::clone(&self.executor);
                    tasks.spawn(async move {
                        let _permit = permit;
                        executor.execute(ctx).await
                    });
                }
                Err(ProtocolError::Conflict(run_id)) => {
                    stats.conflicts += 1;
                    CLAIM_CONFLICTS.inc();
                    tracing::info!(run_id = %run_id, "job claimed by another runner, skipping");
                }
                Err(e) => {
                    tracing::warn!(run_id = %job.run_id, error = %e, "claim failed");
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "runner stopping, draining in-flight runs");
        while let Some(joined) = tasks.join_next().await {
            reap(joined, &mut stats);
        }
        tracing::info!(?stats, "runner stopped");
        stats
    }
}

fn reap(joined: Result<RunOutcome, tokio::task::JoinError>, stats: &mut RunnerStats) {
    match joined {
        Ok(_) => stats.finished += 1,
        Err(e) => tracing::error!(error = %e, "run task failed"),
    }
}
