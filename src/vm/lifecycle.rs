//! VM lifecycle management
//!
//! Functions for spawning Firecracker processes and waiting for API readiness.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant};

use super::VmError;

/// Spawn a Firecracker process with the given API socket path
///
/// Both stdout and stderr (serial console + VMM log) go to `console_log`.
/// The child is killed if its handle is dropped without an explicit kill.
///
/// # Arguments
/// * `firecracker_bin` - Path to the firecracker binary
/// * `api_socket` - Path to the Unix socket for Firecracker's API
/// * `console_log` - File receiving the process output
pub fn spawn_firecracker(
    firecracker_bin: &Path,
    api_socket: &Path,
    console_log: &Path,
) -> Result<Child, VmError> {
    let log = std::fs::File::create(console_log)?;
    let log_err = log.try_clone()?;

    let child = Command::new(firecracker_bin)
        .arg("--api-sock")
        .arg(api_socket)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true)
        .spawn()
        .map_err(VmError::Spawn)?;

    Ok(child)
}

/// Wait for the Firecracker API socket to become available
///
/// # Arguments
/// * `socket_path` - Path to the API socket
/// * `timeout` - Maximum time to wait
///
/// # Returns
/// Ok(()) if socket is ready, Err if timeout expires
pub async fn wait_for_api_socket(socket_path: &Path, timeout: Duration) -> Result<(), VmError> {
    let start_time = Instant::now();
    let poll_interval = Duration::from_millis(50);

    loop {
        if socket_path.exists() {
            return Ok(());
        }

        if start_time.elapsed() > timeout {
            return Err(VmError::ApiSocketTimeout(socket_path.to_path_buf(), timeout));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Helper to convert relative paths to absolute paths
///
/// This is needed because the Firecracker API resolves paths relative to its
/// own working directory.
pub fn to_absolute_path(path: &Path) -> Result<String, VmError> {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(abs_path.to_string_lossy().into_owned())
}
