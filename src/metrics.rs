//! Prometheus metrics for the runner
//!
//! Metrics live in the default registry and are exposed as text on
//! `GET /metrics` when `telemetry.metrics_addr` is set.
//!
//! ```text
//! sandbox_runner_runs_total{outcome}            completed | crash | timeout | error
//! sandbox_runner_run_duration_seconds           claim → cleanup finished
//! sandbox_runner_vm_boot_duration_seconds       spawn → Running
//! sandbox_runner_vms_running                    gauge
//! sandbox_runner_active_runs                    gauge
//! sandbox_runner_cleanup_failures_total{step}
//! sandbox_runner_preflight_failures_total{reason}
//! sandbox_runner_claim_conflicts_total
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Run Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished runs by outcome class.
    ///
    /// Labels:
    /// - outcome: "completed", "crash", "timeout" or "error"
    pub static ref RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sandbox_runner_runs_total",
        "Runs finished by this runner, by outcome",
        &["outcome"]
    ).expect("failed to register RUNS_TOTAL metric");

    /// Wall time of a run including boot and cleanup.
    pub static ref RUN_DURATION: Histogram = register_histogram!(
        "sandbox_runner_run_duration_seconds",
        "Run duration from claim to end of cleanup",
        vec![10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
    ).expect("failed to register RUN_DURATION metric");

    /// Runs currently executing on this host.
    pub static ref ACTIVE_RUNS: IntGauge = register_int_gauge!(
        "sandbox_runner_active_runs",
        "Runs currently executing"
    ).expect("failed to register ACTIVE_RUNS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // VM Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Time from spawning Firecracker to the instance reporting Running.
    pub static ref VM_BOOT_DURATION: Histogram = register_histogram!(
        "sandbox_runner_vm_boot_duration_seconds",
        "Time to boot a VM",
        vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).expect("failed to register VM_BOOT_DURATION metric");

    /// VMs booted and not yet killed.
    pub static ref VMS_RUNNING: IntGauge = register_int_gauge!(
        "sandbox_runner_vms_running",
        "VMs currently running"
    ).expect("failed to register VMS_RUNNING metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Failure Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Cleanup steps that failed; the run outcome is unaffected.
    ///
    /// Labels:
    /// - step: "remove_rules", "unregister", "network_logs" or "kill_vm"
    pub static ref CLEANUP_FAILURES: IntCounterVec = register_int_counter_vec!(
        "sandbox_runner_cleanup_failures_total",
        "Failed cleanup steps, by step",
        &["step"]
    ).expect("failed to register CLEANUP_FAILURES metric");

    /// Connectivity preflight failures.
    ///
    /// Labels:
    /// - reason: short curl failure class (e.g. "dns", "refused", "tls")
    pub static ref PREFLIGHT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "sandbox_runner_preflight_failures_total",
        "Connectivity preflight failures, by reason",
        &["reason"]
    ).expect("failed to register PREFLIGHT_FAILURES metric");

    /// Claims lost to another runner.
    pub static ref CLAIM_CONFLICTS: IntCounter = register_int_counter!(
        "sandbox_runner_claim_conflicts_total",
        "Claims rejected because another runner won"
    ).expect("failed to register CLAIM_CONFLICTS metric");
}

/// Render every registered metric in the text exposition format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .header("content-type", TextEncoder::new().format_type())
            .body(Full::new(Bytes::from(render()))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Serve `GET /metrics` on `listener` until `shutdown` flips to true
pub async fn serve(listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "metrics endpoint listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(handle))
                        .await
                    {
                        tracing::debug!(%peer, error = %e, "metrics connection error");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Bind `addr` and serve metrics in the background
pub async fn spawn_server(
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    Ok(tokio::spawn(async move {
        if let Err(e) = serve(listener, shutdown).await {
            tracing::warn!(error = %e, "metrics endpoint stopped");
        }
    }))
}
