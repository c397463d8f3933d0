//! Network policy enforcement for VM egress
//!
//! - `policy` - per-run allow/deny rules and their evaluation
//! - `registry` - guest address → run identity + policy, mirrored for the proxy
//! - `rules` - iptables redirection into the proxy
//! - `proxy` - the shared intercepting proxy process

pub mod policy;
pub mod proxy;
pub mod registry;
pub mod rules;

pub use policy::{redact_json, redact_secrets, Action, Decision, NetworkPolicy, PolicyRule};
pub use proxy::{read_network_log, ProxyConfig, ProxyError, ProxyManager};
pub use registry::{RegistryEntry, RegistryError, VmRegistry};
pub use rules::{NetworkPolicyController, RuleError};
