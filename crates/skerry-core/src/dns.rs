//! Host-global sandbox name records.

use crate::error::{CoreError, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Maps sandbox ids to their host-cloned address.
///
/// When a hosts file is configured every change rewrites it (atomically,
/// via rename) so a host resolver such as dnsmasq can serve the records as
/// `<sandbox_id>` and `<sandbox_id>.<domain>`.
#[derive(Debug)]
pub struct DnsRegistry {
    records: Mutex<HashMap<String, Ipv4Addr>>,
    hosts_file: Option<PathBuf>,
    domain: String,
}

impl DnsRegistry {
    pub fn new(hosts_file: Option<PathBuf>, domain: impl Into<String>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            hosts_file,
            domain: domain.into(),
        }
    }

    /// In-memory only.
    pub fn in_memory() -> Self {
        Self::new(None, "sandbox.internal")
    }

    /// Add or replace the record for `sandbox_id`.
    pub async fn add(&self, sandbox_id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert(sandbox_id.to_string(), ip);
        self.persist(&records).await?;
        tracing::debug!(sandbox_id, %ip, "DNS record added");
        Ok(())
    }

    /// Remove the record for `sandbox_id`. Returns whether it existed.
    pub async fn remove(&self, sandbox_id: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        if records.remove(sandbox_id).is_none() {
            return Ok(false);
        }
        self.persist(&records).await?;
        tracing::debug!(sandbox_id, "DNS record removed");
        Ok(true)
    }

    pub async fn lookup(&self, sandbox_id: &str) -> Option<Ipv4Addr> {
        self.records.lock().await.get(sandbox_id).copied()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Drop every record and remove the hosts file.
    pub async fn cleanup(&self) -> Result<()> {
        let mut records = self.records.lock().await;
        let count = records.len();
        records.clear();
        if let Some(path) = &self.hosts_file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::path("remove", path, e)),
            }
        }
        tracing::info!(count, "DNS records released");
        Ok(())
    }

    fn render(&self, records: &HashMap<String, Ipv4Addr>) -> String {
        let mut entries: Vec<_> = records.iter().collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(id, ip)| format!("{ip}\t{id} {id}.{}\n", self.domain))
            .collect()
    }

    async fn persist(&self, records: &HashMap<String, Ipv4Addr>) -> Result<()> {
        let Some(path) = &self.hosts_file else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, self.render(records))
            .await
            .map_err(|e| CoreError::path("write", &tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| CoreError::path("rename", path, e))
    }
}
