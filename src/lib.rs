//! sandbox-runner - runs AI coding-agent sessions inside Firecracker microVMs
//!
//! The runner claims jobs from a control plane, boots one VM per run, polices
//! the VM's egress through a shared intercepting proxy, detects how the agent
//! finished, tears everything down, and reports exactly one outcome.
//!
//! # Modules
//!
//! - `vm` - Firecracker VM lifecycle, network slots, host capacity
//! - `guest` - authenticated command/file channel into a guest
//! - `network` - per-run policy, VM registry, redirect rules, proxy process
//! - `executor` - per-run state machine with mandatory cleanup
//! - `protocol` - control-plane poll / claim / complete client
//! - `runner` - poll loop with admission control and graceful drain
//! - `metrics` - Prometheus metrics and the `/metrics` endpoint
//! - `tracing` - tracing-subscriber and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use sandbox_runner::{JobExecutor, Runner, RunnerConfig};
//!
//! let config = RunnerConfig::load(path)?.finalize()?;
//! let runner = Runner::new(control_plane, executor, &config.api.group, config.runner.clone());
//! runner.run(shutdown_rx).await;
//! ```

pub mod config;
pub mod executor;
pub mod guest;
pub mod host;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod runner;
pub mod tracing;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, RunnerConfig};
pub use executor::{JobExecutor, RunError, RunOutcome};
pub use network::{NetworkPolicy, NetworkPolicyController, ProxyManager, VmRegistry};
pub use protocol::{ApiClient, ControlPlane, ExecutionContext, Job};
pub use runner::Runner;
pub use vm::{VmManager, VmManagerConfig};
