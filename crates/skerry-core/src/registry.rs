//! Registry of live sandboxes.

use crate::best_effort::BestEffort;
use crate::error::Result;
use crate::host::HostResources;
use crate::sandbox::Sandbox;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Authoritative table of live sandboxes, keyed by sandbox id.
///
/// # Thread Safety
///
/// One lock guards the whole table and is held only for map edits and
/// snapshots, never across process, network or filesystem work. Callers
/// get `Arc<Sandbox>` handles and act on them outside the lock.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sandbox`. Returns `true` if the id was already present, in
    /// which case the existing entry is kept and `sandbox` is not stored.
    pub async fn insert(&self, sandbox: Arc<Sandbox>) -> bool {
        let mut sandboxes = self.sandboxes.lock().await;
        let id = sandbox.id().to_string();
        if sandboxes.contains_key(&id) {
            tracing::warn!(sandbox_id = %id, "Sandbox already registered");
            return true;
        }
        sandboxes.insert(id.clone(), sandbox);
        tracing::info!(sandbox_id = %id, "Sandbox registered");
        false
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.lock().await.get(id).cloned()
    }

    /// Remove and return the entry for `id`.
    pub async fn remove(&self, id: &str) -> Option<Arc<Sandbox>> {
        let removed = self.sandboxes.lock().await.remove(id);
        if removed.is_some() {
            tracing::info!(sandbox_id = %id, "Sandbox unregistered");
        }
        removed
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sandboxes.lock().await.contains_key(id)
    }

    /// Whether a registered sandbox owns network slot `slot`.
    pub async fn holds_slot(&self, slot: u32) -> bool {
        self.sandboxes
            .lock()
            .await
            .values()
            .any(|s| s.network().slot() == slot)
    }

    /// Snapshot of every registered sandbox.
    pub async fn list(&self) -> Vec<Arc<Sandbox>> {
        self.sandboxes.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sandboxes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sandboxes.lock().await.is_empty()
    }

    /// Stop every sandbox, then wait for and clean up all of them
    /// concurrently, then release the host-global DNS table and slot pool.
    ///
    /// Each sandbox is unregistered only after its cleanup was attempted.
    pub async fn shutdown_all(&self, host: &HostResources, stop_timeout: Duration) -> Result<()> {
        let snapshot = self.list().await;
        tracing::info!(count = snapshot.len(), "Shutting down all sandboxes");
        let mut steps = BestEffort::new("shutdown", "all");

        for sandbox in &snapshot {
            steps.record("stop", sandbox.stop().await);
        }

        let results = join_all(snapshot.iter().map(|sandbox| async move {
            let mut one = BestEffort::new("shutdown sandbox", sandbox.id());
            one.record("wait", sandbox.wait(stop_timeout).await);
            one.record("cleanup", sandbox.cleanup().await);
            one.finish()
        }))
        .await;

        for (sandbox, result) in snapshot.iter().zip(results) {
            steps.record("wait and cleanup", result);
            self.remove(sandbox.id()).await;
        }

        steps.record("release DNS records", host.dns().cleanup().await);
        host.slots().reset();

        steps.finish()
    }
}
