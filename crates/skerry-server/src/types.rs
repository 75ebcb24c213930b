//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};
use skerry_core::{PurgeReport, SandboxInfo, SandboxSummary};
use std::collections::HashMap;

// ============================================================================
// Sandbox Lifecycle
// ============================================================================

/// Body of `POST /sandboxes`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSandboxRequest {
    /// Sandbox id (default: generated `sbx-<8 hex>`).
    #[serde(default)]
    pub sandbox_id: Option<String>,

    /// Template to derive the rootfs from.
    pub template_id: String,

    /// Share the base image and clone only the writable delta.
    #[serde(default)]
    pub overlay: bool,

    /// vCPU count (default: server setting).
    #[serde(default)]
    pub vcpu_count: Option<u8>,

    /// Memory in MiB (default: server setting).
    #[serde(default)]
    pub memory_mib: Option<u32>,

    /// Free-form labels carried with the sandbox.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Create deadline (default: server setting).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Response of `GET /sandboxes`.
#[derive(Debug, Serialize)]
pub struct ListSandboxesResponse {
    pub sandboxes: Vec<SandboxSummary>,
}

/// Response of `DELETE /sandboxes/{id}`.
#[derive(Debug, Serialize)]
pub struct DeleteSandboxResponse {
    pub sandbox_id: String,
    /// Teardown steps that failed; the sandbox is unregistered regardless.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
}

// ============================================================================
// Orphans
// ============================================================================

/// Response of `GET /orphans`.
#[derive(Debug, Serialize)]
pub struct ListOrphansResponse {
    pub orphans: Vec<SandboxInfo>,
}

/// Body of `POST /orphans/purge`.
#[derive(Debug, Default, Deserialize)]
pub struct PurgeOrphansRequest {
    /// Ids to purge; empty purges every discovered orphan.
    #[serde(default)]
    pub sandbox_ids: Vec<String>,
}

/// Response of `POST /orphans/purge`.
#[derive(Debug, Serialize)]
pub struct PurgeOrphansResponse {
    pub results: Vec<PurgeReport>,
}

// ============================================================================
// Errors
// ============================================================================

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error class.
    pub kind: String,
    pub message: String,
}

/// A fresh `sbx-<8 hex>` id.
pub fn generate_sandbox_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("sbx-{}", &uuid[..8])
}
