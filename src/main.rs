//! sandbox-runner binary
//!
//! `start` runs the poll loop until SIGINT/SIGTERM; `check` validates the
//! configuration and host prerequisites without touching anything.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use sandbox_runner::guest::TcpGuestConnector;
use sandbox_runner::host::{CommandRunner, SystemCommandRunner};
use sandbox_runner::tracing::{init_tracing, shutdown_tracing};
use sandbox_runner::{
    metrics, ApiClient, JobExecutor, NetworkPolicyController, ProxyManager, Runner, RunnerConfig,
    VmManager, VmRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner", version, about = "Runs agent sessions in Firecracker microVMs")]
struct Cli {
    /// Path to the runner configuration file
    #[arg(short, long, env = "SANDBOX_RUNNER_CONFIG", default_value = "/etc/sandbox-runner/runner.toml")]
    config: PathBuf,

    /// Control plane URL (overrides api.url)
    #[arg(long, env = "SANDBOX_RUNNER_API_URL")]
    api_url: Option<String>,

    /// Runner token (overrides api.token)
    #[arg(long, env = "SANDBOX_RUNNER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Job group (overrides api.group)
    #[arg(long, env = "SANDBOX_RUNNER_GROUP")]
    group: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll for jobs and run them until interrupted
    Start,
    /// Validate configuration and host prerequisites
    Check,
}

fn load_config(cli: &Cli) -> Result<RunnerConfig> {
    let mut config = RunnerConfig::load(&cli.config)?;
    if let Some(url) = &cli.api_url {
        config.api.url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.api.token = token.clone();
    }
    if let Some(group) = &cli.group {
        config.api.group = group.clone();
    }
    Ok(config.finalize()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Start => start(config).await,
        Command::Check => check(config).await,
    }
}

async fn start(config: RunnerConfig) -> Result<()> {
    init_tracing(
        "sandbox-runner",
        config.telemetry.otlp_endpoint.as_deref(),
        config.telemetry.json_logs,
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_server = match config.telemetry.metrics_addr {
        Some(addr) => Some(
            metrics::spawn_server(addr, shutdown_rx.clone())
                .await
                .with_context(|| format!("binding metrics endpoint {}", addr))?,
        ),
        None => None,
    };

    let commands: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);

    let registry = Arc::new(VmRegistry::new(config.proxy.registry_path.clone()));
    registry.reset().await.context("initializing VM registry snapshot")?;

    let mut proxy = ProxyManager::new(config.proxy.clone());
    proxy.start().await.context("starting intercepting proxy")?;

    let control_plane = Arc::new(ApiClient::new(config.api.clone())?);
    let executor = Arc::new(JobExecutor::new(
        Arc::new(VmManager::new(config.vm.clone(), commands.clone())),
        Arc::new(TcpGuestConnector::new(config.channel.port, config.channel.auth_token.clone())),
        control_plane.clone(),
        registry.clone(),
        Arc::new(NetworkPolicyController::new(commands)),
        config.proxy.clone(),
        config.executor.clone(),
    ));
    let runner = Runner::new(control_plane, executor, config.api.group.clone(), config.runner.clone());

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let stats = runner.run(shutdown_rx).await;
    tracing::info!(claimed = stats.claimed, finished = stats.finished, "runner exited");

    if let Err(e) = proxy.stop().await {
        tracing::warn!(error = %e, "failed to stop proxy cleanly");
    }
    if let Some(server) = metrics_server {
        let _ = server.await;
    }
    shutdown_tracing();
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, only handling Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn check(config: RunnerConfig) -> Result<()> {
    println!("[INFO] configuration OK (group {})", config.api.group);

    let mut missing = 0;
    for path in config.required_host_files() {
        if path.is_file() {
            println!("[INFO] found {}", path.display());
        } else {
            println!("[WARN] missing {}", path.display());
            missing += 1;
        }
    }

    let commands = SystemCommandRunner;
    for (program, arg) in [("iptables", "--version"), ("ip", "-V")] {
        match commands.run(program, &[arg.to_string()]).await {
            Ok(out) if out.success() => println!("[INFO] {} available", program),
            _ => {
                println!("[WARN] {} not usable", program);
                missing += 1;
            }
        }
    }

    if missing > 0 {
        bail!("{} prerequisite(s) missing", missing);
    }
    println!("[INFO] host ready");
    Ok(())
}
