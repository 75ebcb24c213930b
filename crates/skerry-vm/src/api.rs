//! Firecracker API socket client.
//!
//! The launcher only starts the Firecracker process; everything else (boot
//! source, drives, machine resources, network interface, start) is sent as
//! `PUT` requests on the API socket before the guest boots.

use crate::config::{DriveConfig, LaunchConfig, NetworkConfig};
use crate::error::{Result, VmError};
use firepilot_models::models::MachineConfiguration;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;
use serde_json::json;
use std::path::Path;

/// Send a `PUT` request with a JSON body to the Firecracker API socket.
pub async fn put<T: Serialize + ?Sized>(socket_path: &Path, endpoint: &str, body: &T) -> Result<()> {
    let body = serde_json::to_string(body)
        .map_err(|e| VmError::Config(format!("failed to serialize {endpoint} body: {e}")))?;
    tracing::trace!(endpoint, body = %body, "Firecracker API request");

    let uri: hyper::Uri = Uri::new(socket_path, endpoint).into();

    let request = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .map_err(|e| VmError::Config(format!("failed to build {endpoint} request: {e}")))?;

    let client = Client::unix();
    let response = client.request(request).await.map_err(|e| {
        tracing::error!(endpoint, error = %e, "Firecracker API request failed");
        VmError::Api(format!("{endpoint} request failed: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        let body_str = String::from_utf8_lossy(&body_bytes);
        tracing::error!(endpoint, status = %status, body = %body_str, "Firecracker API rejected request");
        return Err(VmError::Api(format!(
            "{} failed with status {}: {}",
            endpoint, status, body_str
        )));
    }

    Ok(())
}

fn boot_source_body(config: &LaunchConfig) -> serde_json::Value {
    json!({
        "kernel_image_path": config.kernel_path.to_string_lossy(),
        "boot_args": config.boot_args,
    })
}

fn drive_body(drive: &DriveConfig) -> serde_json::Value {
    json!({
        "drive_id": drive.drive_id,
        "path_on_host": drive.path_on_host.to_string_lossy(),
        "is_root_device": drive.is_root_device,
        "is_read_only": drive.is_read_only,
    })
}

fn network_body(net: &NetworkConfig) -> serde_json::Value {
    let mut body = json!({
        "iface_id": net.iface_id,
        "host_dev_name": net.host_dev_name,
    });
    if let Some(mac) = &net.guest_mac {
        body["guest_mac"] = json!(mac);
    }
    body
}

/// Configure boot source, drives, machine resources and networking.
///
/// **Must be called BEFORE [`start_instance`].**
pub async fn configure(socket_path: &Path, config: &LaunchConfig) -> Result<()> {
    let start = std::time::Instant::now();

    put(socket_path, "/boot-source", &boot_source_body(config)).await?;

    for drive in std::iter::once(&config.root_drive).chain(&config.extra_drives) {
        put(
            socket_path,
            &format!("/drives/{}", drive.drive_id),
            &drive_body(drive),
        )
        .await?;
    }

    let machine = MachineConfiguration::new(config.memory_mib as i32, config.vcpu_count as i32);
    put(socket_path, "/machine-config", &machine).await?;

    if let Some(net) = &config.network {
        put(
            socket_path,
            &format!("/network-interfaces/{}", net.iface_id),
            &network_body(net),
        )
        .await?;
    }

    tracing::debug!(
        vm_id = %config.vm_id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Firecracker configured"
    );
    Ok(())
}

/// Boot the configured guest.
pub async fn start_instance(socket_path: &Path) -> Result<()> {
    put(socket_path, "/actions", &json!({ "action_type": "InstanceStart" })).await
}
