//! Persists source/sync status onto the RootSync/RepoSync status subresource.

use std::sync::Arc;

use async_trait::async_trait;
use driftless_core::status::{SourceStatus, SyncStatus};
use driftless_core::{Gvk, SyncRef};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

use crate::client::{ClusterClient, ClusterError};

#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_source(&self, status: &SourceStatus) -> Result<(), ClusterError>;
    async fn write_sync(&self, status: &SyncStatus) -> Result<(), ClusterError>;
}

pub fn sync_gvk(sync: &SyncRef) -> Gvk { Gvk::new("configsync.gke.io", "v1beta1", sync.sync_kind()) }

/// Writes through a [`ClusterClient`], skipping patches that would not change anything.
pub struct KubeStatusWriter {
    client: Arc<dyn ClusterClient>,
    sync: SyncRef,
}

impl KubeStatusWriter {
    pub fn new(client: Arc<dyn ClusterClient>, sync: SyncRef) -> Self { Self { client, sync } }

    async fn current(&self, field: &str) -> Result<Option<Json>, ClusterError> {
        let gvk = sync_gvk(&self.sync);
        let obj = self
            .client
            .get(&gvk, Some(self.sync.namespace()), &self.sync.name)
            .await?
            .ok_or_else(|| ClusterError::NotFound(self.sync.to_string()))?;
        Ok(obj.data.get("status").and_then(|s| s.get(field)).cloned())
    }

    async fn patch(&self, field: &str, value: Json) -> Result<(), ClusterError> {
        let gvk = sync_gvk(&self.sync);
        let mut body = serde_json::Map::new();
        body.insert(field.to_string(), value);
        let body = Json::Object(body);
        self.client.patch_status(&gvk, Some(self.sync.namespace()), &self.sync.name, &body).await?;
        counter!("status_writes_total", 1u64, "field" => field.to_string());
        Ok(())
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_source(&self, status: &SourceStatus) -> Result<(), ClusterError> {
        let cur: Option<SourceStatus> = self.current("source").await?.and_then(|v| serde_json::from_value(v).ok());
        if cur.as_ref() == Some(status) {
            debug!(sync = %self.sync, "source status unchanged; skipping write");
            return Ok(());
        }
        let value = serde_json::to_value(status).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        self.patch("source", value).await
    }

    async fn write_sync(&self, status: &SyncStatus) -> Result<(), ClusterError> {
        let cur: Option<SyncStatus> = self.current("sync").await?.and_then(|v| serde_json::from_value(v).ok());
        if cur.map(|c| c.same_content(status)).unwrap_or(false) {
            debug!(sync = %self.sync, "sync status unchanged; skipping write");
            return Ok(());
        }
        let value = serde_json::to_value(status).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        self.patch("sync", value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemCluster, MemOp};
    use driftless_core::status::ErrorSummary;

    fn seeded() -> (Arc<MemCluster>, SyncRef) {
        let mem = Arc::new(MemCluster::new());
        let sync = SyncRef::root("root-sync");
        mem.insert(serde_json::json!({
            "apiVersion": "configsync.gke.io/v1beta1",
            "kind": "RootSync",
            "metadata": { "name": "root-sync", "namespace": "config-management-system" }
        }))
        .unwrap();
        (mem, sync)
    }

    #[tokio::test]
    async fn skips_redundant_writes() {
        let (mem, sync) = seeded();
        let w = KubeStatusWriter::new(mem.clone(), sync);
        let st = SyncStatus { commit: "abc".into(), errors: vec![], last_update: Some("t1".into()) };
        w.write_sync(&st).await.unwrap();
        let again = SyncStatus { last_update: Some("t2".into()), ..st.clone() };
        w.write_sync(&again).await.unwrap();
        assert_eq!(mem.calls(MemOp::PatchStatus), 1);

        let failed = SyncStatus {
            errors: vec![ErrorSummary { code: "DL2009".into(), error_message: "x".into() }],
            ..st
        };
        w.write_sync(&failed).await.unwrap();
        assert_eq!(mem.calls(MemOp::PatchStatus), 2);
    }

    #[tokio::test]
    async fn source_status_lands_on_object() {
        let (mem, sync) = seeded();
        let w = KubeStatusWriter::new(mem.clone(), sync.clone());
        w.write_source(&SourceStatus { commit: "abc".into(), errors: vec![] }).await.unwrap();
        w.write_source(&SourceStatus { commit: "abc".into(), errors: vec![] }).await.unwrap();
        assert_eq!(mem.calls(MemOp::PatchStatus), 1);
        let id = driftless_core::ObjectIdentity::new("configsync.gke.io", "RootSync", Some(sync.namespace()), "root-sync");
        assert_eq!(mem.object(&id).unwrap()["status"]["source"]["commit"], "abc");
    }

    #[tokio::test]
    async fn missing_sync_object_is_an_error() {
        let mem = Arc::new(MemCluster::new());
        let w = KubeStatusWriter::new(mem, SyncRef::namespaced("a", "repo-sync"));
        assert!(w.write_source(&SourceStatus::default()).await.is_err());
    }
}
