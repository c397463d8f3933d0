//! Firecracker API client
//!
//! Provides a high-level client for interacting with Firecracker's HTTP API
//! over Unix domain sockets.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;

use super::config::*;
use super::VmError;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Client for communicating with Firecracker's control API
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: String,
}

impl FirecrackerClient {
    /// Create a new Firecracker API client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the Firecracker API Unix socket
    pub fn new(socket_path: impl Into<String>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    /// Send a request and return the response body on success
    async fn send(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: Option<String>,
    ) -> Result<Bytes, VmError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();

        let mut builder = hyper::Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| VmError::Transport(e.to_string()))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| VmError::Transport(format!("{} {}", endpoint, e)))?;
        let status = res.status();
        let body_bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| VmError::Transport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(VmError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            });
        }

        Ok(body_bytes)
    }

    async fn put<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<(), VmError> {
        let json = serde_json::to_string(body).map_err(|e| VmError::Transport(e.to_string()))?;
        self.send(hyper::Method::PUT, endpoint, Some(json)).await?;
        Ok(())
    }

    /// Configure vCPU count and memory size
    pub async fn machine_config(&self, resources: &VmResources) -> Result<(), VmError> {
        self.put("/machine-config", &resources.machine_config()).await
    }

    /// Configure the boot source (kernel and boot arguments)
    pub async fn boot_source(
        &self,
        kernel_image_path: impl Into<String>,
        boot_args: impl Into<String>,
    ) -> Result<(), VmError> {
        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_image_path.into(),
                boot_args: boot_args.into(),
            },
        )
        .await
    }

    /// Add a block device (drive) to the VM
    pub async fn add_drive(
        &self,
        drive_id: impl Into<String>,
        path_on_host: impl Into<String>,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<(), VmError> {
        let drive_id_str = drive_id.into();
        let endpoint = format!("/drives/{}", drive_id_str);

        self.put(
            &endpoint,
            &Drive {
                drive_id: drive_id_str,
                path_on_host: path_on_host.into(),
                is_root_device,
                is_read_only,
            },
        )
        .await
    }

    /// Attach a guest NIC backed by the given TAP device
    pub async fn add_network_interface(
        &self,
        iface_id: impl Into<String>,
        host_dev_name: impl Into<String>,
        guest_mac: impl Into<String>,
    ) -> Result<(), VmError> {
        let iface_id = iface_id.into();
        let endpoint = format!("/network-interfaces/{}", iface_id);

        self.put(
            &endpoint,
            &NetworkInterface {
                iface_id,
                host_dev_name: host_dev_name.into(),
                guest_mac: guest_mac.into(),
            },
        )
        .await
    }

    /// Start the VM instance
    pub async fn start(&self) -> Result<(), VmError> {
        self.put(
            "/actions",
            &Action {
                action_type: "InstanceStart".to_string(),
            },
        )
        .await
    }

    /// Describe the instance (used to observe the Running state)
    pub async fn instance_info(&self) -> Result<InstanceInfo, VmError> {
        let body = self.send(hyper::Method::GET, "/", None).await?;
        serde_json::from_slice(&body).map_err(|e| VmError::Transport(format!("bad instance info: {}", e)))
    }
}
