//! Job Executor - drives one claimed job through a VM
//!
//! ```text
//! Start → VM Booted → Channel Reachable → [Policy Installed] → DNS Configured
//!       → Guest Setup Uploaded → [Storage Restored] → [Session Restored]
//!       → Environment Written → [Preflight Passed] → Agent Launched
//!       → Completion Detected → Cleanup → Terminal
//!
//! any failure ───────────────────────────────────────────────► Cleanup
//! preflight failure ──► report completion now ───────────────► Cleanup
//! ```
//!
//! Cleanup runs in its own task so that dropping the caller cannot cancel
//! it. Every cleanup step runs even if an earlier one failed.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::Instrument;

use super::completion::{self, CompletionLimits};
use super::error::{RunError, RunOutcome};
use super::preflight;
use super::setup;
use crate::guest::{ExecOutput, GuestChannel, GuestConnector};
use crate::metrics::{ACTIVE_RUNS, CLEANUP_FAILURES, PREFLIGHT_FAILURES, RUNS_TOTAL, RUN_DURATION};
use crate::network::{
    read_network_log, redact_json, NetworkPolicy, NetworkPolicyController, ProxyConfig,
    RegistryEntry, VmRegistry,
};
use crate::protocol::{ControlPlane, ExecutionContext, StorageManifest};
use crate::vm::{VirtualMachine, VmError, VmFactory};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Executor tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Control plane URL as seen from inside the guest; defaults to `api.url`
    pub api_url: String,
    /// Guest-side agent runtime; receives `--cli <flavor>`
    pub agent_command: String,
    pub dns_servers: Vec<IpAddr>,
    pub reachable_timeout_secs: u64,
    pub reachable_poll_ms: u64,
    /// Timeout of ordinary guest commands
    pub command_timeout_secs: u64,
    /// Timeout of each storage archive restore
    pub storage_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Hard ceiling on agent run time
    pub max_run_secs: u64,
    pub max_unreachable_polls: u32,
    pub preflight: bool,
    pub preflight_timeout_secs: u64,
    /// Host directory whose files are copied to the guest lib dir
    pub guest_scripts_dir: Option<PathBuf>,
    pub log_tail_lines: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            agent_command: "/usr/local/bin/sandbox-agent".to_string(),
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ],
            reachable_timeout_secs: 60,
            reachable_poll_ms: 500,
            command_timeout_secs: 30,
            storage_timeout_secs: 600,
            poll_interval_secs: 5,
            max_run_secs: 2 * 60 * 60,
            max_unreachable_polls: 6,
            preflight: true,
            preflight_timeout_secs: 15,
            guest_scripts_dir: None,
            log_tail_lines: 40,
        }
    }
}

impl ExecutorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn completion_limits(&self) -> CompletionLimits {
        CompletionLimits {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_run_time: Duration::from_secs(self.max_run_secs),
            max_unreachable_polls: self.max_unreachable_polls.max(1),
            command_timeout: self.command_timeout(),
            log_tail_lines: self.log_tail_lines,
        }
    }
}

/// Host state a run has acquired, released by cleanup
struct RunState {
    vm: Box<dyn VirtualMachine>,
    registered: Option<IpAddr>,
    /// Set before installation starts; removal is safe on absent rules
    rules_addr: Option<IpAddr>,
    reported: bool,
}

struct CleanupPlan {
    run_id: String,
    vm: Box<dyn VirtualMachine>,
    registered: Option<IpAddr>,
    rules_addr: Option<IpAddr>,
    policy: Option<NetworkPolicy>,
    secrets: Vec<String>,
}

/// Label attached to a VM's redirect rules
pub fn rule_label(vm_id: &str) -> String {
    format!("sandbox-runner:{}", vm_id)
}

/// Runs jobs; one `execute` call per claimed job
pub struct JobExecutor {
    vms: Arc<dyn VmFactory>,
    guests: Arc<dyn GuestConnector>,
    control_plane: Arc<dyn ControlPlane>,
    registry: Arc<VmRegistry>,
    rules: Arc<NetworkPolicyController>,
    proxy: ProxyConfig,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        vms: Arc<dyn VmFactory>,
        guests: Arc<dyn GuestConnector>,
        control_plane: Arc<dyn ControlPlane>,
        registry: Arc<VmRegistry>,
        rules: Arc<NetworkPolicyController>,
        proxy: ProxyConfig,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            vms,
            guests,
            control_plane,
            registry,
            rules,
            proxy,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `ctx` to completion, clean up, and report exactly once
    pub async fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RunOutcome {
        let span = tracing::info_span!("run", run_id = %ctx.run_id);
        self.execute_inner(ctx).instrument(span).await
    }

    async fn execute_inner(self: Arc<Self>, ctx: ExecutionContext) -> RunOutcome {
        let started = Instant::now();
        ACTIVE_RUNS.inc();
        tracing::info!(cli = ctx.cli_agent_type.as_str(), "run started");

        let (result, reported) = match self.vms.create(&ctx.run_id) {
            Ok(vm) => self.run_with_cleanup(&ctx, vm).await,
            Err(e) => (Err(RunError::VmStart(e)), false),
        };

        let outcome = match &result {
            Ok(code) => RunOutcome::completed(*code),
            Err(e) => RunOutcome::from(e),
        };
        if !reported {
            self.report(&ctx.run_id, &outcome).await;
        }

        let label = match &result {
            Ok(_) => "completed",
            Err(e) => e.metric_label(),
        };
        RUNS_TOTAL.with_label_values(&[label]).inc();
        RUN_DURATION.observe(started.elapsed().as_secs_f64());
        ACTIVE_RUNS.dec();

        match &result {
            Ok(code) => tracing::info!(exit_code = code, "run finished"),
            Err(e) => tracing::warn!(class = e.class(), error = %e, "run failed"),
        }
        outcome
    }

    async fn run_with_cleanup(
        self: &Arc<Self>,
        ctx: &ExecutionContext,
        vm: Box<dyn VirtualMachine>,
    ) -> (Result<i32, RunError>, bool) {
        let mut state = RunState {
            vm,
            registered: None,
            rules_addr: None,
            reported: false,
        };

        let result = self.run_steps(ctx, &mut state).await;

        let plan = CleanupPlan {
            run_id: ctx.run_id.clone(),
            vm: state.vm,
            registered: state.registered,
            rules_addr: state.rules_addr,
            policy: ctx.active_policy().cloned(),
            secrets: ctx.secret_values(),
        };
        let this = Arc::clone(self);
        let cleanup = tokio::spawn(
            async move { this.cleanup(plan).await }.instrument(tracing::Span::current()),
        );
        if let Err(e) = cleanup.await {
            tracing::error!(error = %e, "cleanup task panicked");
        }

        (result, state.reported)
    }

    async fn run_steps(&self, ctx: &ExecutionContext, state: &mut RunState) -> Result<i32, RunError> {
        let timeout = self.config.command_timeout();

        // VM Booted
        state.vm.start().await.map_err(RunError::VmStart)?;
        let addr = state.vm.guest_address().ok_or_else(|| {
            RunError::VmStart(VmError::Network("VM running without a guest address".to_string()))
        })?;
        let vm_id = state.vm.id().to_string();
        tracing::info!(vm_id = %vm_id, guest_addr = %addr, "VM booted");

        let policy = ctx.active_policy();
        if let Some(policy) = policy {
            let entry = RegistryEntry::new(&ctx.run_id, &ctx.sandbox_token, policy.clone())
                .with_secrets(ctx.secret_values());
            self.registry
                .register(addr, entry)
                .await
                .map_err(|e| RunError::NetworkPolicySetup(e.to_string()))?;
            state.registered = Some(addr);
        }

        // Channel Reachable
        let channel = self.guests.connect(addr);
        channel
            .wait_until_reachable(
                Duration::from_secs(self.config.reachable_timeout_secs),
                Duration::from_millis(self.config.reachable_poll_ms),
            )
            .await
            .map_err(RunError::ChannelUnreachable)?;

        // Policy Installed
        if let Some(policy) = policy {
            state.rules_addr = Some(addr);
            self.rules
                .install_rules(addr, self.proxy.listen_port, &rule_label(&vm_id))
                .await
                .map_err(|e| RunError::NetworkPolicySetup(e.to_string()))?;
            if policy.deep_inspection {
                self.install_ca(channel.as_ref()).await?;
            }
        }

        // DNS Configured
        write_guest_file(
            channel.as_ref(),
            "dns",
            "/etc/resolv.conf",
            &setup::resolv_conf(&self.config.dns_servers),
        )
        .await?;

        // Guest Setup Uploaded
        self.upload_guest_setup(channel.as_ref(), ctx).await?;

        // Storage Restored
        if let Some(manifest) = &ctx.storage_manifest {
            self.restore_storage(channel.as_ref(), manifest).await?;
        }

        // Session Restored
        if let Some(session) = &ctx.resume_session {
            let path = setup::session_transcript_path(&session.mount_path, &session.session_id);
            write_guest_file(channel.as_ref(), "session_restore", &path, &session.transcript).await?;
            tracing::debug!(session_id = %session.session_id, "resume session restored");
        }

        // Environment Written
        let deep_inspection = policy.map(|p| p.deep_inspection).unwrap_or(false);
        let env = setup::env_file(ctx, &self.config.api_url, deep_inspection);
        write_guest_file(channel.as_ref(), "environment", setup::ENV_FILE_PATH, &env).await?;

        // Preflight Passed
        if self.config.preflight && !self.config.api_url.is_empty() {
            let result = preflight::run_preflight(
                channel.as_ref(),
                &self.config.api_url,
                Duration::from_secs(self.config.preflight_timeout_secs),
            )
            .await
            .map_err(|e| RunError::GuestCommand {
                step: "preflight",
                detail: e.to_string(),
            })?;

            if !result.ok {
                let reason = result.curl_exit_code.map(preflight::reason_label).unwrap_or("other");
                PREFLIGHT_FAILURES.with_label_values(&[reason]).inc();
                let err = RunError::ConnectivityPreflight(result.diagnosis.unwrap_or_default());
                // Early exit: the agent could never report its own result
                self.report(&ctx.run_id, &RunOutcome::from(&err)).await;
                state.reported = true;
                return Err(err);
            }
        }

        // Agent Launched
        let output = exec_checked(channel.as_ref(), "launch", &setup::launch_command(), timeout).await?;
        let launched = Instant::now();
        tracing::info!(pid = %output.stdout.trim(), "agent launched");

        // Completion Detected
        completion::wait_for_completion(channel.as_ref(), &self.config.completion_limits(), launched)
            .await
    }

    async fn install_ca(&self, channel: &dyn GuestChannel) -> Result<(), RunError> {
        let pem = crate::network::proxy::read_ca_certificate(&self.proxy)
            .await
            .map_err(|e| RunError::NetworkPolicySetup(e.to_string()))?;
        channel
            .write_file(setup::GUEST_CA_PATH, &pem)
            .await
            .map_err(|e| RunError::NetworkPolicySetup(format!("writing proxy CA: {}", e)))?;
        let output = channel
            .exec(setup::ca_install_command(), self.config.command_timeout())
            .await
            .map_err(|e| RunError::NetworkPolicySetup(format!("installing proxy CA: {}", e)))?;
        if !output.success() {
            return Err(RunError::NetworkPolicySetup(format!(
                "update-ca-certificates exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        tracing::debug!("proxy CA installed in guest");
        Ok(())
    }

    async fn upload_guest_setup(&self, channel: &dyn GuestChannel, ctx: &ExecutionContext) -> Result<(), RunError> {
        let script = setup::run_script(ctx, &self.config.agent_command);
        write_guest_file(channel, "guest_setup", setup::RUN_SCRIPT_PATH, &script).await?;

        if let Some(dir) = &self.config.guest_scripts_dir {
            let files = read_guest_scripts(dir).await.map_err(|e| RunError::GuestCommand {
                step: "guest_setup",
                detail: format!("reading {}: {}", dir.display(), e),
            })?;
            for (name, content) in files {
                let path = format!("{}/{}", setup::GUEST_LIB_DIR, name);
                write_guest_file(channel, "guest_setup", &path, &content).await?;
            }
        }

        let chmod = format!(
            "chmod 755 {} && {{ [ ! -d {lib} ] || chmod -R 755 {lib}; }}",
            setup::RUN_SCRIPT_PATH,
            lib = setup::GUEST_LIB_DIR
        );
        exec_checked(channel, "guest_setup", &chmod, self.config.command_timeout()).await?;
        Ok(())
    }

    async fn restore_storage(&self, channel: &dyn GuestChannel, manifest: &StorageManifest) -> Result<(), RunError> {
        let timeout = Duration::from_secs(self.config.storage_timeout_secs);
        let restores = manifest.entries.iter().enumerate().map(|(index, entry)| {
            let command = setup::storage_restore_command(index, entry);
            async move { exec_checked(channel, "storage_restore", &command, timeout).await }
        });
        try_join_all(restores).await?;
        tracing::debug!(entries = manifest.entries.len(), "storage restored");
        Ok(())
    }

    async fn report(&self, run_id: &str, outcome: &RunOutcome) {
        if let Err(e) = self.control_plane.complete(run_id, outcome).await {
            tracing::error!(run_id, error = %e, "failed to report run completion");
        }
    }

    async fn cleanup(&self, mut plan: CleanupPlan) {
        if let Some(addr) = plan.rules_addr {
            let label = rule_label(plan.vm.id());
            if let Err(e) = self.rules.remove_rules(addr, self.proxy.listen_port, &label).await {
                cleanup_failed("remove_rules", &e);
            }
        }

        if let Some(addr) = plan.registered {
            if let Err(e) = self.registry.unregister(addr).await {
                cleanup_failed("unregister", &e);
            }
        }

        if let Some(policy) = &plan.policy {
            if let Err(e) = self
                .upload_network_logs(&plan.run_id, policy, &plan.secrets)
                .await
            {
                cleanup_failed("network_logs", &*e);
            }
        }

        if let Err(e) = plan.vm.kill().await {
            cleanup_failed("kill_vm", &e);
        }
        tracing::debug!("cleanup finished");
    }

    async fn upload_network_logs(
        &self,
        run_id: &str,
        policy: &NetworkPolicy,
        secrets: &[String],
    ) -> Result<(), BoxError> {
        let path = self.proxy.network_log_path(run_id);
        let lines = read_network_log(&path).await?;
        if lines.is_empty() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(lines.len());
        for line in &lines {
            let mut entry: serde_json::Value = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(run_id, error = %e, "skipping malformed network log line");
                    continue;
                }
            };
            if policy.redact_secrets {
                redact_json(&mut entry, secrets);
            }
            entries.push(entry);
        }

        self.control_plane
            .upload_network_logs(run_id, &entries)
            .await?;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), error = %e, "could not remove uploaded network log");
        }
        Ok(())
    }
}

fn cleanup_failed(step: &'static str, error: &(dyn std::error::Error + 'static)) {
    CLEANUP_FAILURES.with_label_values(&[step]).inc();
    tracing::warn!(step, error = %error, "cleanup step failed");
}

async fn exec_checked(
    channel: &dyn GuestChannel,
    step: &'static str,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, RunError> {
    let output = channel
        .exec(command, timeout)
        .await
        .map_err(|e| RunError::GuestCommand {
            step,
            detail: e.to_string(),
        })?;
    if !output.success() {
        return Err(RunError::GuestCommand {
            step,
            detail: format!("exit {}: {}", output.exit_code, output.stderr.trim()),
        });
    }
    Ok(output)
}

async fn write_guest_file(
    channel: &dyn GuestChannel,
    step: &'static str,
    path: &str,
    content: &str,
) -> Result<(), RunError> {
    channel
        .write_file(path, content)
        .await
        .map_err(|e| RunError::GuestCommand {
            step,
            detail: format!("writing {}: {}", path, e),
        })
}

/// Regular files directly under `dir`, sorted by name
async fn read_guest_scripts(dir: &std::path::Path) -> std::io::Result<Vec<(String, String)>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let content = tokio::fs::read_to_string(entry.path()).await?;
        files.push((name, content));
    }
    files.sort();
    Ok(files)
}
