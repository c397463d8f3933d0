//! Run failure taxonomy and the outcome reported to the control plane

use std::time::Duration;

use crate::guest::ChannelError;
use crate::vm::VmError;

/// Exit code reported for every runner-side failure
pub const RUNNER_FAILURE_EXIT_CODE: i32 = 1;

/// Why a run did not produce an agent exit code
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("VM failed to start: {0}")]
    VmStart(#[source] VmError),
    #[error("guest never became reachable: {0}")]
    ChannelUnreachable(#[source] ChannelError),
    #[error("guest command failed during {step}: {detail}")]
    GuestCommand { step: &'static str, detail: String },
    #[error("connectivity preflight failed: {0}")]
    ConnectivityPreflight(String),
    #[error("agent process {} without writing an exit code: {detail}", crash_verb(.oom))]
    Crash { oom: bool, detail: String },
    #[error("run exceeded the {}s limit without finishing", .0.as_secs())]
    Timeout(Duration),
    #[error("network policy setup failed: {0}")]
    NetworkPolicySetup(String),
}

fn crash_verb(oom: &bool) -> &'static str {
    if *oom {
        "was killed by the OOM killer"
    } else {
        "died"
    }
}

impl RunError {
    /// Failure class name included in the reported diagnostic
    pub fn class(&self) -> &'static str {
        match self {
            RunError::VmStart(_) => "VMStartError",
            RunError::ChannelUnreachable(_) => "ChannelUnreachableError",
            RunError::GuestCommand { .. } => "GuestCommandError",
            RunError::ConnectivityPreflight(_) => "ConnectivityPreflightError",
            RunError::Crash { .. } => "CrashError",
            RunError::Timeout(_) => "TimeoutError",
            RunError::NetworkPolicySetup(_) => "NetworkPolicySetupError",
        }
    }

    /// `outcome` label for the runs counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            RunError::Crash { .. } => "crash",
            RunError::Timeout(_) => "timeout",
            _ => "error",
        }
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            exit_code: RUNNER_FAILURE_EXIT_CODE,
            error: Some(error.into()),
        }
    }

    /// The agent wrote its exit code
    pub fn completed(exit_code: i32) -> Self {
        if exit_code == 0 {
            return Self::success();
        }
        Self {
            exit_code,
            error: Some(format!("agent exited with code {}", exit_code)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<&RunError> for RunOutcome {
    fn from(err: &RunError) -> Self {
        RunOutcome::failure(format!("{}: {}", err.class(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_names_failure_class() {
        let outcome = RunOutcome::from(&RunError::Crash {
            oom: true,
            detail: "Killed process 812 (node)".into(),
        });
        assert_eq!(outcome.exit_code, 1);
        let text = outcome.error.unwrap();
        assert!(text.starts_with("CrashError: "));
        assert!(text.contains("OOM killer"));

        let timeout = RunOutcome::from(&RunError::Timeout(Duration::from_secs(7200)));
        assert_eq!(
            timeout.error.as_deref(),
            Some("TimeoutError: run exceeded the 7200s limit without finishing")
        );
    }

    #[test]
    fn test_completed_passes_exit_code_through() {
        assert!(RunOutcome::completed(0).is_success());
        let failed = RunOutcome::completed(3);
        assert_eq!(failed.exit_code, 3);
        assert_eq!(failed.error.as_deref(), Some("agent exited with code 3"));
    }

    #[test]
    fn test_metric_labels() {
        assert_eq!(RunError::Timeout(Duration::from_secs(1)).metric_label(), "timeout");
        assert_eq!(RunError::ConnectivityPreflight("x".into()).metric_label(), "error");
    }
}
