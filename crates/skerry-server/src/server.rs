//! SkerryServer - owns the sandbox service and maps requests onto it.

use crate::config::{ConfigError, ServerConfig};
use crate::types::{generate_sandbox_id, CreateSandboxRequest};

use skerry_core::{
    IpRoute2, ProcFs, PurgeReport, ResourceLimits, Result, Sandbox, SandboxService, SandboxSpec,
};
use skerry_vm::Firecracker;
use std::sync::Arc;
use std::time::Duration;

/// The daemon: configuration plus the one sandbox service of this host.
#[derive(Clone)]
pub struct SkerryServer {
    service: Arc<SandboxService>,
    config: ServerConfig,
}

impl SkerryServer {
    /// Create a server driving the real host (`ip`, `/proc`, Firecracker).
    pub fn new(config: ServerConfig) -> std::result::Result<Self, ConfigError> {
        let service = SandboxService::from_config(
            config.host_config()?,
            Arc::new(IpRoute2),
            Arc::new(Firecracker::default()),
            Arc::new(ProcFs::default()),
        )?;
        Ok(Self::with_service(config, Arc::new(service)))
    }

    /// Wrap an already built service.
    pub fn with_service(config: ServerConfig, service: Arc<SandboxService>) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &Arc<SandboxService> {
        &self.service
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Fence the slots of hypervisors left by a previous run, and purge them
    /// when configured to.
    pub async fn recover_orphans(&self) -> Result<Vec<PurgeReport>> {
        let orphans = self.service.adopt_orphan_slots().await?;
        if orphans.is_empty() {
            tracing::info!("No orphaned sandboxes found");
            return Ok(Vec::new());
        }
        tracing::warn!(count = orphans.len(), "Orphaned sandboxes found");

        if !self.config.purge_orphans {
            return Ok(Vec::new());
        }
        let reports = self.service.purge_orphans(&[]).await?;
        let purged = reports.iter().filter(|r| r.purged).count();
        tracing::info!(purged, failed = reports.len() - purged, "Orphans purged");
        Ok(reports)
    }

    /// Turn an API request into a spec and create the sandbox.
    pub async fn create(&self, req: CreateSandboxRequest) -> Result<Arc<Sandbox>> {
        let defaults = self.service.host().config().default_limits;
        let mut builder = SandboxSpec::builder()
            .sandbox_id(req.sandbox_id.unwrap_or_else(generate_sandbox_id))
            .template_id(req.template_id)
            .overlay(req.overlay);

        if req.vcpu_count.is_some() || req.memory_mib.is_some() {
            builder = builder.limits(ResourceLimits {
                vcpu_count: req.vcpu_count.unwrap_or(defaults.vcpu_count),
                memory_mib: req.memory_mib.unwrap_or(defaults.memory_mib),
            });
        }
        if let Some(secs) = req.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        for (key, value) in req.metadata {
            builder = builder.metadata(key, value);
        }

        self.service.create(builder.build()?).await
    }

    /// Tear down every sandbox.
    pub async fn shutdown(&self) -> Result<()> {
        self.service.shutdown().await
    }
}
