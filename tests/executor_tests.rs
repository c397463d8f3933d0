//! Integration tests for the job executor and the runner loop
//!
//! Everything below the executor is faked: VMs, the guest channel, the host
//! firewall and the control plane. Each fake keeps a ledger so tests can
//! assert what was acquired and what was released.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use sandbox_runner::executor::setup::GUEST_CA_PATH;
use sandbox_runner::executor::{ExecutorConfig, JobExecutor, RunOutcome};
use sandbox_runner::guest::{ChannelError, ExecOutput, GuestChannel, GuestConnector};
use sandbox_runner::host::{CommandError, CommandOutput, CommandRunner};
use sandbox_runner::network::proxy::CA_CERT_FILE;
use sandbox_runner::network::{NetworkPolicy, NetworkPolicyController, ProxyConfig, VmRegistry};
use sandbox_runner::protocol::{
    CliAgentType, ControlPlane, ExecutionContext, Job, ProtocolError, ResumeSession, StorageEntry,
    StorageManifest,
};
use sandbox_runner::runner::{Runner, RunnerSettings};
use sandbox_runner::vm::{VirtualMachine, VmError, VmFactory};

const GUEST_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 2));

// ============================================================================
// Fake VMs
// ============================================================================

#[derive(Default)]
struct VmLedger {
    created: AtomicUsize,
    kills: AtomicUsize,
}

struct FakeVm {
    id: String,
    fail_start: bool,
    started: bool,
    ledger: Arc<VmLedger>,
}

#[async_trait]
impl VirtualMachine for FakeVm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> Result<(), VmError> {
        if self.fail_start {
            return Err(VmError::Exited("kernel panic".to_string()));
        }
        self.started = true;
        Ok(())
    }

    fn guest_address(&self) -> Option<IpAddr> {
        self.started.then_some(GUEST_ADDR)
    }

    async fn kill(&mut self) -> Result<(), VmError> {
        self.ledger.kills.fetch_add(1, Ordering::SeqCst);
        self.started = false;
        Ok(())
    }
}

struct FakeVms {
    fail_start: bool,
    ledger: Arc<VmLedger>,
}

impl VmFactory for FakeVms {
    fn create(&self, run_id: &str) -> Result<Box<dyn VirtualMachine>, VmError> {
        self.ledger.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeVm {
            id: run_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(12).collect(),
            fail_start: self.fail_start,
            started: false,
            ledger: self.ledger.clone(),
        }))
    }
}

// ============================================================================
// Fake guest
// ============================================================================

/// Scripted guest behavior
#[derive(Default)]
struct GuestScript {
    unreachable: bool,
    /// Writes to paths starting with this fail
    fail_write: Option<&'static str>,
    /// Commands containing this exit 1
    fail_exec: Option<&'static str>,
    /// curl exit code of the preflight probe
    preflight_exit: i32,
    /// Status probe outputs in order; `alive` once drained.
    /// `unreachable` makes the call itself fail.
    statuses: VecDeque<&'static str>,
    /// Kernel log lines returned by the OOM probe
    oom_lines: &'static str,
}

struct FakeGuest {
    script: Mutex<GuestScript>,
    /// `exec:<command>` / `write:<path>` in call order
    calls: Mutex<Vec<String>>,
}

impl FakeGuest {
    fn new(script: GuestScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn position(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(exit_code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl GuestChannel for FakeGuest {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, ChannelError> {
        self.calls.lock().unwrap().push(format!("exec:{}", command));
        let mut script = self.script.lock().unwrap();

        if let Some(needle) = script.fail_exec {
            if command.contains(needle) {
                return Ok(failed(1, "scripted failure"));
            }
        }
        if command.starts_with("curl -sS -o /dev/null") {
            return Ok(match script.preflight_exit {
                0 => ok(""),
                code => failed(code, "curl: (7) Failed to connect"),
            });
        }
        if command.starts_with("nohup") {
            return Ok(ok("4242\n"));
        }
        if command.contains("kill -0") {
            return match script.statuses.pop_front().unwrap_or("alive") {
                "unreachable" => Err(ChannelError::Connection("connection reset".to_string())),
                status => Ok(ok(&format!("{}\n", status))),
            };
        }
        if command.starts_with("dmesg") {
            return Ok(ok(script.oom_lines));
        }
        if command.starts_with("tail -n") {
            return Ok(ok("agent: starting\nagent: working"));
        }
        // sentinel re-read, chmod, storage restore, CA install
        Ok(ok(""))
    }

    async fn write_file(&self, path: &str, _content: &str) -> Result<(), ChannelError> {
        self.calls.lock().unwrap().push(format!("write:{}", path));
        match self.script.lock().unwrap().fail_write {
            Some(prefix) if path.starts_with(prefix) => {
                Err(ChannelError::Remote(format!("cannot write {}", path)))
            }
            _ => Ok(()),
        }
    }

    async fn wait_until_reachable(&self, timeout: Duration, _poll: Duration) -> Result<(), ChannelError> {
        if self.script.lock().unwrap().unreachable {
            return Err(ChannelError::Unreachable {
                addr: GUEST_ADDR.to_string(),
                waited: timeout,
                last_error: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

struct FakeConnector(Arc<FakeGuest>);

impl GuestConnector for FakeConnector {
    fn connect(&self, addr: IpAddr) -> Arc<dyn GuestChannel> {
        assert_eq!(addr, GUEST_ADDR);
        self.0.clone()
    }
}

// ============================================================================
// Fake firewall
// ============================================================================

#[derive(Default)]
struct FakeIptables {
    rules: Mutex<HashSet<Vec<String>>>,
    reject_append: bool,
}

impl FakeIptables {
    fn installed(&self) -> usize {
        self.rules.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandRunner for FakeIptables {
    async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        // -w -t nat <op> PREROUTING <rule...>
        let op = args[3].as_str();
        let body = args[5..].to_vec();
        let mut rules = self.rules.lock().unwrap();
        let status = match op {
            "-C" => i32::from(!rules.contains(&body)),
            "-A" if self.reject_append => 2,
            "-A" => {
                rules.insert(body);
                0
            }
            "-D" => i32::from(!rules.remove(&body)),
            other => panic!("unexpected iptables op {}", other),
        };
        Ok(CommandOutput {
            status,
            stdout: String::new(),
            stderr: if status == 2 { "iptables: No chain/target/match".into() } else { String::new() },
        })
    }
}

// ============================================================================
// Fake control plane
// ============================================================================

#[derive(Default)]
struct FakeControlPlane {
    jobs: Mutex<VecDeque<Job>>,
    polls: AtomicUsize,
    conflict_on_claim: bool,
    completions: Mutex<Vec<(String, RunOutcome)>>,
    uploads: Mutex<Vec<(String, Vec<serde_json::Value>)>>,
}

impl FakeControlPlane {
    fn completions(&self) -> Vec<(String, RunOutcome)> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn poll(&self, _group: &str) -> Result<Option<Job>, ProtocolError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let job = self.jobs.lock().unwrap().pop_front();
        if job.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(job)
    }

    async fn claim(&self, run_id: &str) -> Result<ExecutionContext, ProtocolError> {
        if self.conflict_on_claim {
            return Err(ProtocolError::Conflict(run_id.to_string()));
        }
        Ok(context(run_id))
    }

    async fn complete(&self, run_id: &str, outcome: &RunOutcome) -> Result<(), ProtocolError> {
        self.completions
            .lock()
            .unwrap()
            .push((run_id.to_string(), outcome.clone()));
        Ok(())
    }

    async fn upload_network_logs(
        &self,
        run_id: &str,
        entries: &[serde_json::Value],
    ) -> Result<(), ProtocolError> {
        self.uploads
            .lock()
            .unwrap()
            .push((run_id.to_string(), entries.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn context(run_id: &str) -> ExecutionContext {
    ExecutionContext {
        run_id: run_id.to_string(),
        prompt: "add a test".to_string(),
        sandbox_token: "sbx-token".to_string(),
        working_dir: "/home/user/workspace".to_string(),
        storage_manifest: None,
        resume_session: None,
        secrets: Default::default(),
        vars: Default::default(),
        cli_agent_type: CliAgentType::ClaudeCode,
        network_policy: None,
    }
}

fn policy_context(run_id: &str) -> ExecutionContext {
    ExecutionContext {
        network_policy: Some(NetworkPolicy::monitor()),
        ..context(run_id)
    }
}

fn deep_inspection_context(run_id: &str) -> ExecutionContext {
    ExecutionContext {
        network_policy: Some(NetworkPolicy {
            enabled: true,
            deep_inspection: true,
            ..NetworkPolicy::default()
        }),
        ..context(run_id)
    }
}

fn storage_context(run_id: &str) -> ExecutionContext {
    ExecutionContext {
        storage_manifest: Some(StorageManifest {
            entries: vec![StorageEntry {
                mount_path: "/home/user/workspace".into(),
                archive_url: Some("https://storage.example/ws.tar.gz".into()),
            }],
        }),
        ..context(run_id)
    }
}

fn session_context(run_id: &str) -> ExecutionContext {
    ExecutionContext {
        resume_session: Some(ResumeSession {
            session_id: "sess-1".into(),
            transcript: "{}\n".into(),
            mount_path: "/home/user/.claude/projects".into(),
        }),
        ..context(run_id)
    }
}

struct Harness {
    executor: Arc<JobExecutor>,
    vms: Arc<VmLedger>,
    guest: Arc<FakeGuest>,
    iptables: Arc<FakeIptables>,
    registry: Arc<VmRegistry>,
    control_plane: Arc<FakeControlPlane>,
    proxy: ProxyConfig,
    _logs: tempfile::TempDir,
}

struct HarnessOptions {
    fail_start: bool,
    reject_rules: bool,
    /// Put the proxy CA certificate in the CA dir
    ca_cert: bool,
    /// Registry snapshot path whose parent is a regular file
    unwritable_registry: bool,
    guest: GuestScript,
    config: ExecutorConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            fail_start: false,
            reject_rules: false,
            ca_cert: true,
            unwritable_registry: false,
            guest: GuestScript::default(),
            config: ExecutorConfig {
                api_url: "https://app.example.com".to_string(),
                poll_interval_secs: 1,
                max_run_secs: 60,
                max_unreachable_polls: 3,
                ..ExecutorConfig::default()
            },
        }
    }
}

fn harness(options: HarnessOptions) -> Harness {
    let logs = tempfile::tempdir().unwrap();
    let ca_dir = logs.path().join("ca");
    std::fs::create_dir(&ca_dir).unwrap();
    if options.ca_cert {
        std::fs::write(ca_dir.join(CA_CERT_FILE), "-----BEGIN CERTIFICATE-----\n").unwrap();
    }
    let proxy = ProxyConfig {
        log_dir: logs.path().to_path_buf(),
        ca_dir,
        ..ProxyConfig::default()
    };
    let vms = Arc::new(VmLedger::default());
    let guest = FakeGuest::new(options.guest);
    let iptables = Arc::new(FakeIptables {
        reject_append: options.reject_rules,
        ..FakeIptables::default()
    });
    let registry = if options.unwritable_registry {
        let blocker = logs.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        Arc::new(VmRegistry::new(blocker.join("registry.json")))
    } else {
        Arc::new(VmRegistry::in_memory())
    };
    let control_plane = Arc::new(FakeControlPlane::default());

    let executor = Arc::new(JobExecutor::new(
        Arc::new(FakeVms {
            fail_start: options.fail_start,
            ledger: vms.clone(),
        }),
        Arc::new(FakeConnector(guest.clone())),
        control_plane.clone(),
        registry.clone(),
        Arc::new(NetworkPolicyController::new(iptables.clone())),
        proxy.clone(),
        options.config,
    ));

    Harness {
        executor,
        vms,
        guest,
        iptables,
        registry,
        control_plane,
        proxy,
        _logs: logs,
    }
}

impl Harness {
    async fn run(&self, ctx: ExecutionContext) -> RunOutcome {
        self.executor.clone().execute(ctx).await
    }

    /// One kill, one completion, nothing left behind on the host
    async fn assert_released(&self) {
        assert_eq!(self.vms.kills.load(Ordering::SeqCst), 1, "VM must be killed exactly once");
        assert_eq!(self.control_plane.completions().len(), 1, "exactly one completion");
        assert_eq!(self.iptables.installed(), 0, "redirect rules leaked");
        assert!(self.registry.is_empty().await, "registry entry leaked");
    }
}

fn run_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_successful_run_reports_exit_code() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["alive", "exit:0"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });
    let id = run_id();

    let outcome = h.run(context(&id)).await;

    assert_eq!(outcome, RunOutcome::success());
    h.assert_released().await;
    assert_eq!(h.control_plane.completions()[0], (id, RunOutcome::success()));

    // Setup happens in order before the agent starts
    let dns = h.guest.position("write:/etc/resolv.conf").unwrap();
    let script = h.guest.position("write:/tmp/sandbox-runner/run-agent.sh").unwrap();
    let env = h.guest.position("write:/tmp/sandbox-runner/env").unwrap();
    let preflight = h.guest.position("exec:curl").unwrap();
    let launch = h.guest.position("exec:nohup").unwrap();
    assert!(dns < script && script < env && env < preflight && preflight < launch);
}

#[tokio::test]
async fn test_agent_exit_code_passes_through() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["exit:3"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });

    let outcome = h.run(context(&run_id())).await;

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(outcome.error.as_deref(), Some("agent exited with code 3"));
    h.assert_released().await;
}

#[tokio::test]
async fn test_policy_run_installs_then_removes_everything() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["exit:0"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });
    let id = run_id();

    // Proxy add-on output for this run
    std::fs::write(
        h.proxy.network_log_path(&id),
        "{\"host\":\"api.github.com\",\"action\":\"allow\"}\nnot json\n",
    )
    .unwrap();

    let outcome = h.run(policy_context(&id)).await;

    assert!(outcome.is_success());
    h.assert_released().await;

    let uploads = h.control_plane.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, id);
    assert_eq!(uploads[0].1, vec![serde_json::json!({"host": "api.github.com", "action": "allow"})]);
    assert!(!h.proxy.network_log_path(&id).exists());
}

#[tokio::test]
async fn test_disabled_policy_is_not_enforced() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["exit:0"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });
    let ctx = ExecutionContext {
        network_policy: Some(NetworkPolicy::default()),
        ..context(&run_id())
    };

    assert!(h.run(ctx).await.is_success());
    h.assert_released().await;
    assert!(h.control_plane.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_storage_and_session_restored_before_launch() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["exit:0"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });
    let id = run_id();
    let ctx = ExecutionContext {
        resume_session: session_context(&id).resume_session,
        ..storage_context(&id)
    };

    assert!(h.run(ctx).await.is_success());

    let restore = h.guest.position("https://storage.example/ws.tar.gz").unwrap();
    let session = h.guest.position("write:/home/user/.claude/projects/sess-1.jsonl").unwrap();
    let launch = h.guest.position("exec:nohup").unwrap();
    assert!(restore < launch && session < launch);
}

#[tokio::test]
async fn test_deep_inspection_installs_ca_before_agent_setup() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["exit:0"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });

    let id = run_id();
    let ctx = ExecutionContext {
        storage_manifest: storage_context(&id).storage_manifest,
        ..deep_inspection_context(&id)
    };

    assert!(h.run(ctx).await.is_success());
    h.assert_released().await;

    // Every HTTPS call from the guest comes after the CA is trusted
    let ca_write = h.guest.position(&format!("write:{}", GUEST_CA_PATH)).unwrap();
    let ca_install = h.guest.position("exec:update-ca-certificates").unwrap();
    let storage = h.guest.position("https://storage.example/ws.tar.gz").unwrap();
    let preflight = h.guest.position("exec:curl -sS").unwrap();
    assert!(ca_write < ca_install && ca_install < storage && storage < preflight);
}

#[tokio::test]
async fn test_network_log_secrets_redacted_inside_json_strings() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["exit:0"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });
    let id = run_id();
    let mut ctx = ExecutionContext {
        network_policy: Some(NetworkPolicy {
            enabled: true,
            redact_secrets: true,
            ..NetworkPolicy::default()
        }),
        ..context(&id)
    };
    ctx.secrets.insert("DB_PASSWORD".into(), r#"pa"ss\word"#.into());

    // The add-on writes JSON, so quotes and backslashes arrive escaped
    std::fs::write(
        h.proxy.network_log_path(&id),
        concat!(r#"{"auth":"Bearer pa\"ss\\word","host":"db.example.com"}"#, "\n"),
    )
    .unwrap();

    assert!(h.run(ctx).await.is_success());

    let uploads = h.control_plane.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(
        uploads[0].1,
        vec![serde_json::json!({"auth": "Bearer ***", "host": "db.example.com"})]
    );
}

// ============================================================================
// Failure at every step
// ============================================================================

async fn assert_fails_with(options: HarnessOptions, ctx_fn: fn(&str) -> ExecutionContext, class: &str) {
    let h = harness(options);
    let outcome = h.run(ctx_fn(&run_id())).await;

    assert_eq!(outcome.exit_code, 1);
    let error = outcome.error.unwrap();
    assert!(error.starts_with(class), "expected {} in {:?}", class, error);
    h.assert_released().await;
    assert!(h.guest.position("exec:nohup").is_none(), "agent must not launch");
}

#[tokio::test]
async fn test_vm_start_failure() {
    assert_fails_with(
        HarnessOptions {
            fail_start: true,
            ..HarnessOptions::default()
        },
        policy_context,
        "VMStartError",
    )
    .await;
}

#[tokio::test]
async fn test_unreachable_guest() {
    assert_fails_with(
        HarnessOptions {
            guest: GuestScript {
                unreachable: true,
                ..GuestScript::default()
            },
            ..HarnessOptions::default()
        },
        policy_context,
        "ChannelUnreachableError",
    )
    .await;
}

#[tokio::test]
async fn test_rule_install_failure() {
    assert_fails_with(
        HarnessOptions {
            reject_rules: true,
            ..HarnessOptions::default()
        },
        policy_context,
        "NetworkPolicySetupError",
    )
    .await;
}

#[tokio::test]
async fn test_registry_write_failure() {
    assert_fails_with(
        HarnessOptions {
            unwritable_registry: true,
            ..HarnessOptions::default()
        },
        policy_context,
        "NetworkPolicySetupError",
    )
    .await;
}

#[tokio::test]
async fn test_missing_proxy_ca() {
    assert_fails_with(
        HarnessOptions {
            ca_cert: false,
            ..HarnessOptions::default()
        },
        deep_inspection_context,
        "NetworkPolicySetupError",
    )
    .await;
}

#[tokio::test]
async fn test_ca_install_failure() {
    assert_fails_with(
        HarnessOptions {
            guest: GuestScript {
                fail_exec: Some("update-ca-certificates"),
                ..GuestScript::default()
            },
            ..HarnessOptions::default()
        },
        deep_inspection_context,
        "NetworkPolicySetupError",
    )
    .await;
}

#[tokio::test]
async fn test_storage_restore_failure() {
    assert_fails_with(
        HarnessOptions {
            guest: GuestScript {
                fail_exec: Some("tar -xzf"),
                ..GuestScript::default()
            },
            ..HarnessOptions::default()
        },
        storage_context,
        "GuestCommandError",
    )
    .await;
}

#[tokio::test]
async fn test_session_restore_failure() {
    assert_fails_with(
        HarnessOptions {
            guest: GuestScript {
                fail_write: Some("/home/user/.claude/projects/"),
                ..GuestScript::default()
            },
            ..HarnessOptions::default()
        },
        session_context,
        "GuestCommandError",
    )
    .await;
}

#[tokio::test]
async fn test_dns_write_failure() {
    assert_fails_with(
        HarnessOptions {
            guest: GuestScript {
                fail_write: Some("/etc/resolv.conf"),
                ..GuestScript::default()
            },
            ..HarnessOptions::default()
        },
        policy_context,
        "GuestCommandError",
    )
    .await;
}

#[tokio::test]
async fn test_guest_setup_failure() {
    assert_fails_with(
        HarnessOptions {
            guest: GuestScript {
                fail_exec: Some("chmod 755"),
                ..GuestScript::default()
            },
            ..HarnessOptions::default()
        },
        policy_context,
        "GuestCommandError",
    )
    .await;
}

#[tokio::test]
async fn test_environment_write_failure() {
    assert_fails_with(
        HarnessOptions {
            guest: GuestScript {
                fail_write: Some("/tmp/sandbox-runner/env"),
                ..GuestScript::default()
            },
            ..HarnessOptions::default()
        },
        context,
        "GuestCommandError",
    )
    .await;
}

#[tokio::test]
async fn test_launch_failure() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            fail_exec: Some("nohup"),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });

    let outcome = h.run(policy_context(&run_id())).await;

    let error = outcome.error.unwrap();
    assert!(error.starts_with("GuestCommandError"), "{}", error);
    assert!(error.contains("launch"));
    h.assert_released().await;
}

// ============================================================================
// Preflight
// ============================================================================

#[tokio::test]
async fn test_preflight_failure_reports_once_and_never_launches() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            preflight_exit: 7,
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });

    let outcome = h.run(policy_context(&run_id())).await;

    let error = outcome.error.unwrap();
    assert!(error.starts_with("ConnectivityPreflightError"), "{}", error);
    assert!(error.contains("connection refused"));
    assert!(error.contains("curl exit 7"));
    h.assert_released().await;
    assert!(h.guest.position("exec:nohup").is_none());
}

#[tokio::test]
async fn test_preflight_skipped_when_disabled() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            preflight_exit: 7,
            statuses: VecDeque::from(["exit:0"]),
            ..GuestScript::default()
        },
        config: ExecutorConfig {
            api_url: "https://app.example.com".to_string(),
            preflight: false,
            ..ExecutorConfig::default()
        },
        ..HarnessOptions::default()
    });

    assert!(h.run(context(&run_id())).await.is_success());
    assert!(h.guest.position("exec:curl -sS").is_none());
}

// ============================================================================
// Completion detection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dead_agent_is_a_crash() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["alive", "alive", "dead"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });
    let started = tokio::time::Instant::now();

    let outcome = h.run(context(&run_id())).await;

    // Polls at 0s, 1s and 2s; the crash is reported on the third
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "reported late: {:?}", elapsed);
    let error = outcome.error.unwrap();
    assert!(error.starts_with("CrashError"), "{}", error);
    assert!(error.contains("agent: working"), "log tail attached: {}", error);
    h.assert_released().await;
}

#[tokio::test(start_paused = true)]
async fn test_oom_kill_is_named() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["dead"]),
            oom_lines: "Out of memory: Killed process 4242 (node)",
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });

    let error = h.run(context(&run_id())).await.error.unwrap();
    assert!(error.contains("OOM killer"), "{}", error);
    assert!(error.contains("Killed process 4242"));
}

#[tokio::test(start_paused = true)]
async fn test_live_agent_times_out_at_ceiling() {
    // Statuses never drain to an exit: the agent stays alive
    let h = harness(HarnessOptions::default());
    let started = tokio::time::Instant::now();

    let outcome = h.run(context(&run_id())).await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60), "gave up early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(61), "{:?}", elapsed);
    let error = outcome.error.unwrap();
    assert!(error.starts_with("TimeoutError"), "{}", error);
    h.assert_released().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_streak_is_a_crash_not_timeout() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["alive", "unreachable", "unreachable", "unreachable"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });

    let error = h.run(context(&run_id())).await.error.unwrap();
    assert!(error.starts_with("CrashError"), "{}", error);
    assert!(error.contains("3 consecutive polls"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_unreachable_recovers() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["unreachable", "unreachable", "alive", "exit:0"]),
            ..GuestScript::default()
        },
        ..HarnessOptions::default()
    });

    assert!(h.run(context(&run_id())).await.is_success());
}

// ============================================================================
// Runner loop
// ============================================================================

fn job(run_id: &str) -> Job {
    serde_json::from_value(serde_json::json!({
        "runId": run_id,
        "prompt": "add a test",
        "agentVersionId": "v1",
    }))
    .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_runner_skips_conflicting_claims() {
    let h = harness(HarnessOptions::default());
    let control_plane = Arc::new(FakeControlPlane {
        jobs: Mutex::new(VecDeque::from([job(&run_id())])),
        conflict_on_claim: true,
        ..FakeControlPlane::default()
    });
    let runner = Runner::new(control_plane.clone(), h.executor.clone(), "default", RunnerSettings::default());
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { runner.run(rx).await });
    wait_for(|| control_plane.polls.load(Ordering::SeqCst) >= 3).await;
    tx.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.claimed, 0);
    assert_eq!(h.vms.created.load(Ordering::SeqCst), 0, "no VM for a lost claim");
    assert!(control_plane.completions().is_empty());
}

#[tokio::test]
async fn test_runner_drains_in_flight_runs_on_shutdown() {
    let h = harness(HarnessOptions {
        guest: GuestScript {
            statuses: VecDeque::from(["alive", "exit:0"]),
            ..GuestScript::default()
        },
        config: ExecutorConfig {
            api_url: "https://app.example.com".to_string(),
            poll_interval_secs: 1,
            ..ExecutorConfig::default()
        },
        ..HarnessOptions::default()
    });
    let id = run_id();
    h.control_plane.jobs.lock().unwrap().push_back(job(&id));
    let runner = Runner::new(
        h.control_plane.clone(),
        h.executor.clone(),
        "default",
        RunnerSettings {
            max_concurrent_runs: Some(1),
            ..RunnerSettings::default()
        },
    );
    let (tx, rx) = watch::channel(false);

    let vms = h.vms.clone();
    let handle = tokio::spawn(async move { runner.run(rx).await });
    wait_for(|| vms.created.load(Ordering::SeqCst) == 1).await;
    // The run is mid-flight; shutdown must wait for it
    tx.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.finished, 1);
    h.assert_released().await;
    assert_eq!(h.control_plane.completions()[0], (id, RunOutcome::success()));
}
