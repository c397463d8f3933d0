//! Job execution inside a sandbox VM
//!
//! - `job` - the orchestrating state machine and its cleanup
//! - `completion` - crash / timeout / exit decision table
//! - `preflight` - guest → control plane connectivity probe
//! - `setup` - guest file layout and setup commands
//! - `error` - run failure taxonomy and the reported outcome

pub mod completion;
pub mod error;
pub mod job;
pub mod preflight;
pub mod setup;

pub use completion::{evaluate, CompletionLimits, Observation, Verdict};
pub use error::{RunError, RunOutcome, RUNNER_FAILURE_EXIT_CODE};
pub use job::{rule_label, ExecutorConfig, JobExecutor};
pub use preflight::{run_preflight, PreflightResult};
