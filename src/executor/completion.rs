//! Completion detection for a launched agent
//!
//! The guest has no supervisor, so the runner polls. Each poll yields one
//! [`Observation`]; [`evaluate`] maps it to a [`Verdict`] using a fixed
//! priority order:
//!
//! | # | condition                               | verdict     |
//! |---|-----------------------------------------|-------------|
//! | 1 | sentinel exit-code file present         | Completed   |
//! | 2 | agent process dead                      | Crashed     |
//! | 3 | guest unreachable for N polls in a row  | Unreachable |
//! | 4 | elapsed ≥ hard ceiling                  | TimedOut    |
//! | - | otherwise                               | Pending     |

use std::time::Duration;

use tokio::time::Instant;

use super::error::RunError;
use super::setup;
use crate::guest::GuestChannel;

/// Poll cadence and limits
#[derive(Debug, Clone)]
pub struct CompletionLimits {
    pub poll_interval: Duration,
    /// Hard ceiling on the agent's run time
    pub max_run_time: Duration,
    /// Consecutive failed polls before the guest counts as gone
    pub max_unreachable_polls: u32,
    /// Timeout of each guest command issued while polling
    pub command_timeout: Duration,
    /// Lines of the main log attached to crash diagnostics
    pub log_tail_lines: usize,
}

/// What one poll saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Sentinel present with this exit code
    Exited(i32),
    Alive,
    Dead,
    /// The channel call itself failed
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Completed(i32),
    Crashed,
    Unreachable,
    TimedOut,
    Pending,
}

/// The decision table
pub fn evaluate(
    observation: &Observation,
    unreachable_streak: u32,
    elapsed: Duration,
    limits: &CompletionLimits,
) -> Verdict {
    match observation {
        Observation::Exited(code) => return Verdict::Completed(*code),
        Observation::Dead => return Verdict::Crashed,
        Observation::Unreachable(_) if unreachable_streak >= limits.max_unreachable_polls => {
            return Verdict::Unreachable
        }
        _ => {}
    }
    if elapsed >= limits.max_run_time {
        return Verdict::TimedOut;
    }
    Verdict::Pending
}

/// Parse the status probe's stdout
pub fn parse_status(stdout: &str) -> Observation {
    let line = stdout.trim();
    if let Some(code) = line.strip_prefix("exit:") {
        return Observation::Exited(parse_exit_code(code));
    }
    match line {
        "alive" => Observation::Alive,
        "dead" => Observation::Dead,
        other => Observation::Unreachable(format!("unexpected status output {:?}", other)),
    }
}

/// A sentinel that is not a number still means the agent finished
fn parse_exit_code(raw: &str) -> i32 {
    match raw.trim().parse() {
        Ok(code) => code,
        Err(_) => {
            tracing::warn!(raw, "unparseable exit code in sentinel, treating as failure");
            1
        }
    }
}

async fn observe(channel: &dyn GuestChannel, limits: &CompletionLimits) -> Observation {
    match channel
        .exec(&setup::status_probe_command(), limits.command_timeout)
        .await
    {
        Ok(output) if output.success() => parse_status(&output.stdout),
        Ok(output) => Observation::Unreachable(format!(
            "status probe exited {}: {}",
            output.exit_code,
            output.stderr.trim()
        )),
        Err(e) => Observation::Unreachable(e.to_string()),
    }
}

/// Poll until the agent finishes; returns its exit code
///
/// `started` is when the agent was launched; the hard ceiling counts from it.
pub async fn wait_for_completion(
    channel: &dyn GuestChannel,
    limits: &CompletionLimits,
    started: Instant,
) -> Result<i32, RunError> {
    let mut streak = 0u32;
    loop {
        let observation = observe(channel, limits).await;
        match &observation {
            Observation::Unreachable(reason) => {
                streak += 1;
                tracing::debug!(streak, reason = %reason, "guest status poll failed");
            }
            _ => streak = 0,
        }

        match evaluate(&observation, streak, started.elapsed(), limits) {
            Verdict::Completed(code) => return Ok(code),
            Verdict::Crashed => return diagnose_crash(channel, limits).await,
            Verdict::Unreachable => {
                let last = match observation {
                    Observation::Unreachable(reason) => reason,
                    _ => String::new(),
                };
                return Err(RunError::Crash {
                    oom: false,
                    detail: format!("guest unreachable for {} consecutive polls: {}", streak, last),
                });
            }
            Verdict::TimedOut => return Err(RunError::Timeout(limits.max_run_time)),
            Verdict::Pending => tokio::time::sleep(limits.poll_interval).await,
        }
    }
}

/// Process gone without a sentinel
///
/// The sentinel is read once more: the agent may have exited between the
/// file check and the liveness check.
async fn diagnose_crash(channel: &dyn GuestChannel, limits: &CompletionLimits) -> Result<i32, RunError> {
    if let Ok(output) = channel
        .exec(&setup::sentinel_read_command(), limits.command_timeout)
        .await
    {
        if output.success() && !output.stdout.trim().is_empty() {
            return Ok(parse_exit_code(&output.stdout));
        }
    }

    let oom_lines = match channel
        .exec(setup::oom_probe_command(), limits.command_timeout)
        .await
    {
        Ok(output) => output.stdout.trim().to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "could not read guest kernel log");
            String::new()
        }
    };
    let oom = !oom_lines.is_empty();

    let mut detail = if oom {
        oom_lines
    } else {
        "process exited unexpectedly".to_string()
    };
    if let Ok(output) = channel
        .exec(&setup::log_tail_command(limits.log_tail_lines), limits.command_timeout)
        .await
    {
        let tail = output.stdout.trim();
        if !tail.is_empty() {
            detail.push_str("\n--- agent log tail ---\n");
            detail.push_str(tail);
        }
    }

    Err(RunError::Crash { oom, detail })
}
