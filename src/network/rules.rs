//! Host packet redirection for per-VM egress
//!
//! For every VM under a network policy, TCP traffic to ports 80 and 443 is
//! redirected into the shared transparent proxy:
//!
//! ```text
//! iptables -w -t nat -A PREROUTING -s <guest> -p tcp --dport 443 \
//!          -m comment --comment <label> -j REDIRECT --to-ports <proxy_port>
//! ```
//!
//! Rules are keyed by guest address, so removal works after the VM is gone.
//! Install and remove are serialized across runs.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::host::{format_command, CommandError, CommandRunner};

/// Destination ports redirected into the proxy
pub const REDIRECTED_PORTS: [u16; 2] = [80, 443];

/// Error type for rule management
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: CommandError,
    },
    #[error("`{command}` failed (status {status}): {stderr}")]
    Rejected {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("failed to remove {failed} redirect rule(s) for {addr}: {last_error}")]
    Incomplete {
        addr: IpAddr,
        failed: usize,
        last_error: String,
    },
}

/// Rule body shared by the -C / -A / -D forms
pub fn redirect_rule(addr: IpAddr, dport: u16, proxy_port: u16, label: &str) -> Vec<String> {
    vec![
        "-s".to_string(),
        addr.to_string(),
        "-p".to_string(),
        "tcp".to_string(),
        "--dport".to_string(),
        dport.to_string(),
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        label.to_string(),
        "-j".to_string(),
        "REDIRECT".to_string(),
        "--to-ports".to_string(),
        proxy_port.to_string(),
    ]
}

/// Installs and removes per-VM redirect rules
pub struct NetworkPolicyController {
    commands: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
}

impl NetworkPolicyController {
    pub fn new(commands: Arc<dyn CommandRunner>) -> Self {
        Self {
            commands,
            lock: Mutex::new(()),
        }
    }

    fn program(addr: IpAddr) -> &'static str {
        match addr {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    fn full_args(op: &str, rule: &[String]) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            "nat".to_string(),
            op.to_string(),
            "PREROUTING".to_string(),
        ];
        args.extend_from_slice(rule);
        args
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<crate::host::CommandOutput, RuleError> {
        self.commands
            .run(program, args)
            .await
            .map_err(|source| RuleError::Command {
                program: program.to_string(),
                source,
            })
    }

    /// Whether the exact rule is present (`-C` exits 0)
    async fn rule_exists(&self, program: &str, rule: &[String]) -> Result<bool, RuleError> {
        let out = self.run(program, &Self::full_args("-C", rule)).await?;
        Ok(out.success())
    }

    /// Redirect the guest's egress into the proxy
    ///
    /// Rules already present are left alone. If any rule fails, the ones
    /// added by this call are removed again.
    pub async fn install_rules(
        &self,
        addr: IpAddr,
        proxy_port: u16,
        label: &str,
    ) -> Result<(), RuleError> {
        let _guard = self.lock.lock().await;
        let program = Self::program(addr);
        let mut added: Vec<Vec<String>> = Vec::new();

        for dport in REDIRECTED_PORTS {
            let rule = redirect_rule(addr, dport, proxy_port, label);
            let result = async {
                if self.rule_exists(program, &rule).await? {
                    return Ok(false);
                }
                let args = Self::full_args("-A", &rule);
                let out = self.run(program, &args).await?;
                if !out.success() {
                    return Err(RuleError::Rejected {
                        command: format_command(program, &args),
                        status: out.status,
                        stderr: out.stderr.trim().to_string(),
                    });
                }
                Ok(true)
            }
            .await;

            match result {
                Ok(true) => added.push(rule),
                Ok(false) => {}
                Err(e) => {
                    for rule in added.iter().rev() {
                        if let Err(undo) = self.run(program, &Self::full_args("-D", rule)).await {
                            tracing::warn!(guest_addr = %addr, error = %undo, "rollback of redirect rule failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(guest_addr = %addr, proxy_port, label, "installed egress redirect rules");
        Ok(())
    }

    /// Exact inverse of [`install_rules`](Self::install_rules)
    ///
    /// Deletes every copy of each rule; rules that are already gone count as
    /// removed. Attempts every port before reporting failure.
    pub async fn remove_rules(
        &self,
        addr: IpAddr,
        proxy_port: u16,
        label: &str,
    ) -> Result<(), RuleError> {
        let _guard = self.lock.lock().await;
        let program = Self::program(addr);
        let mut failed = 0;
        let mut last_error = String::new();

        for dport in REDIRECTED_PORTS {
            let rule = redirect_rule(addr, dport, proxy_port, label);
            let result: Result<(), RuleError> = async {
                while self.rule_exists(program, &rule).await? {
                    let args = Self::full_args("-D", &rule);
                    let out = self.run(program, &args).await?;
                    if !out.success() {
                        return Err(RuleError::Rejected {
                            command: format_command(program, &args),
                            status: out.status,
                            stderr: out.stderr.trim().to_string(),
                        });
                    }
                }
                Ok(())
            }
            .await;

            if let Err(e) = result {
                failed += 1;
                last_error = e.to_string();
            }
        }

        if failed > 0 {
            return Err(RuleError::Incomplete {
                addr,
                failed,
                last_error,
            });
        }

        tracing::info!(guest_addr = %addr, "removed egress redirect rules");
        Ok(())
    }
}
