//! Host command execution
//!
//! Every host-side mutation the runner performs (TAP devices, iptables rules)
//! goes through [`CommandRunner`], so the same code paths can be driven by a
//! recording fake in tests.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Captured result of a finished host command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status (-1 if the process was killed by a signal)
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Error type for host command execution
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
}

/// Runs programs on the host
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion, capturing its output.
    ///
    /// A non-zero exit status is NOT an error here; callers decide.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;

    /// Run and turn a non-zero exit status into [`CommandError::Failed`]
    async fn run_checked(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, CommandError> {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                command: format_command(program, args),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// [`CommandRunner`] backed by real child processes
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        tracing::trace!(command = %format_command(program, args), "running host command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render a command line for logs and error messages
pub fn format_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Build an owned argument vector from string slices
pub fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
