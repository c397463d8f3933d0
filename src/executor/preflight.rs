//! Connectivity preflight: can the guest reach the control plane?
//!
//! Runs one `curl` from inside the guest after network policy, DNS and the
//! environment are in place. Any HTTP response counts as reachable; only
//! transport failures fail the probe.

use std::time::Duration;

use crate::guest::shell::quote;
use crate::guest::{ChannelError, GuestChannel};

/// Outcome of the probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightResult {
    pub ok: bool,
    /// curl exit code when the probe failed
    pub curl_exit_code: Option<i32>,
    pub diagnosis: Option<String>,
}

impl PreflightResult {
    fn passed() -> Self {
        Self {
            ok: true,
            curl_exit_code: None,
            diagnosis: None,
        }
    }
}

/// Human-readable meaning of a curl exit code
pub fn describe_curl_exit(code: i32) -> String {
    let text = match code {
        6 => "could not resolve host (DNS failure)",
        7 => "connection refused",
        22 => "HTTP error response",
        28 => "connection timed out",
        35 => "TLS handshake failed",
        52 => "empty reply from server",
        56 => "connection reset",
        60 => "TLS certificate verification failed",
        _ => return format!("curl exited with code {}", code),
    };
    text.to_string()
}

/// Short `reason` label for the preflight failure counter
pub fn reason_label(code: i32) -> &'static str {
    match code {
        6 => "dns",
        7 => "refused",
        28 => "timeout",
        35 | 60 => "tls",
        22 | 52 | 56 => "http",
        _ => "other",
    }
}

fn probe_command(url: &str, timeout: Duration) -> String {
    format!(
        "curl -sS -o /dev/null --max-time {} {}",
        timeout.as_secs().max(1),
        quote(url)
    )
}

/// Probe `url` from inside the guest
///
/// # Errors
/// Only channel failures; a failed probe is an `Ok` result with `ok: false`.
pub async fn run_preflight(
    channel: &dyn GuestChannel,
    url: &str,
    timeout: Duration,
) -> Result<PreflightResult, ChannelError> {
    let output = channel
        .exec(&probe_command(url, timeout), timeout + Duration::from_secs(5))
        .await?;

    if output.success() {
        tracing::debug!(url, "connectivity preflight passed");
        return Ok(PreflightResult::passed());
    }

    let code = output.exit_code;
    let mut diagnosis = format!(
        "control plane {} unreachable from guest: {} (curl exit {})",
        url,
        describe_curl_exit(code),
        code
    );
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        diagnosis.push_str(": ");
        diagnosis.push_str(stderr);
    }

    Ok(PreflightResult {
        ok: false,
        curl_exit_code: Some(code),
        diagnosis: Some(diagnosis),
    })
}
