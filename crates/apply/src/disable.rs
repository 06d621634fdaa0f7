//! Releasing objects from management: drop them from the inventory and strip
//! every label/annotation the reconciler put on them, leaving the rest intact.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use driftless_core::{metadata, DesiredObject, Gvk, MultiError, ObjectIdentity, SyncError};
use driftless_kubehub::{ApplyParams, ClusterClient, ClusterError, InventoryRef, InventoryStore};
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{debug, info};

/// Kinds whose metadata is stripped with a full update instead of an apply patch.
pub fn default_update_kinds() -> Vec<(String, String)> {
    vec![("apiregistration.k8s.io".to_string(), "APIService".to_string())]
}

pub struct DisableHandler {
    client: Arc<dyn ClusterClient>,
    store: InventoryStore,
    inv: InventoryRef,
    field_manager: String,
    update_kinds: BTreeSet<(String, String)>,
}

impl DisableHandler {
    pub fn new(client: Arc<dyn ClusterClient>, store: InventoryStore, inv: InventoryRef, field_manager: &str) -> Self {
        Self {
            client,
            store,
            inv,
            field_manager: field_manager.to_string(),
            update_kinds: default_update_kinds().into_iter().collect(),
        }
    }

    pub fn with_update_kinds(mut self, kinds: impl IntoIterator<Item = (String, String)>) -> Self {
        self.update_kinds = kinds.into_iter().collect();
        self
    }

    pub fn inventory(&self) -> &InventoryRef { &self.inv }

    fn uses_update(&self, gvk: &Gvk) -> bool { self.update_kinds.contains(&(gvk.group.clone(), gvk.kind.clone())) }

    /// Returns how many objects were released. Any inventory failure aborts
    /// before a single object is touched.
    pub async fn disable(&self, objects: &[DesiredObject]) -> (usize, MultiError) {
        if objects.is_empty() {
            return (0, MultiError::new());
        }
        let ids: BTreeSet<ObjectIdentity> = objects.iter().map(|o| o.identity()).collect();
        let current = match self.store.load(&self.inv).await {
            Ok(c) => c,
            Err(e) => {
                let err = SyncError::InventoryLoad { inventory: self.inv.id.clone(), message: e.to_string() };
                return (0, err.into());
            }
        };
        let remaining: BTreeSet<ObjectIdentity> = current.difference(&ids).cloned().collect();
        if remaining != current {
            if let Err(e) = self.store.replace(&self.inv, &remaining).await {
                return (0, SyncError::inventory_write(&self.inv.id, &e.to_string()).into());
            }
        }

        let mut errs = MultiError::new();
        let mut released = 0usize;
        for obj in objects {
            let id = obj.identity();
            match self.strip(obj.gvk(), &id).await {
                Ok(_) => released += 1,
                Err(e) => errs.push(SyncError::Disable { id, message: e.to_string() }),
            }
        }
        counter!("disabled_objects", released as u64);
        info!(inventory = %self.inv.id, released, failed = errs.len(), "management disabled");
        (released, errs)
    }

    /// Remove reconciler-owned metadata from one live object. `Ok(false)` when
    /// the object is gone or carries nothing to remove.
    pub async fn strip(&self, gvk: &Gvk, id: &ObjectIdentity) -> Result<bool, ClusterError> {
        let Some(live) = self.client.get(gvk, id.namespace.as_deref(), &id.name).await? else {
            return Ok(false);
        };
        let labels = live.metadata.labels.clone().unwrap_or_default();
        let annotations = live.metadata.annotations.clone().unwrap_or_default();
        if !metadata::has_owned_metadata(&labels, &annotations) {
            return Ok(false);
        }
        let (labels, annotations) = metadata::strip_owned(&labels, &annotations);
        // Prune events only know group/kind; the live object knows its version.
        let gvk = live
            .types
            .as_ref()
            .map(|t| Gvk::from_api_version(&t.api_version, &t.kind))
            .unwrap_or_else(|| gvk.clone());

        if self.uses_update(&gvk) {
            let mut next = live;
            next.metadata.labels = Some(labels);
            next.metadata.annotations = Some(annotations);
            self.client.update(&gvk, &next).await?;
        } else {
            let patch = minimal_patch(&gvk, id, labels, annotations)?;
            let params = ApplyParams { field_manager: self.field_manager.clone(), force: true };
            self.client.apply(&gvk, &patch, &params).await?;
        }
        debug!(%id, "owned metadata stripped");
        Ok(true)
    }
}

/// An apply body carrying nothing but identity and the remaining metadata,
/// with no managed-fields entries.
fn minimal_patch(
    gvk: &Gvk,
    id: &ObjectIdentity,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
) -> Result<DynamicObject, ClusterError> {
    let mut meta = serde_json::json!({ "name": id.name, "labels": labels, "annotations": annotations });
    if let Some(ns) = &id.namespace {
        meta["namespace"] = serde_json::Value::String(ns.clone());
    }
    let body = serde_json::json!({ "apiVersion": gvk.api_version(), "kind": gvk.kind, "metadata": meta });
    let mut obj: DynamicObject = serde_json::from_value(body).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    obj.metadata.managed_fields = None;
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftless_core::SyncRef;
    use driftless_kubehub::{MemCluster, MemOp};

    fn handler(mem: &Arc<MemCluster>) -> (DisableHandler, InventoryStore, InventoryRef) {
        let sync = SyncRef::root("root-sync");
        let inv = InventoryRef::for_sync(&sync);
        let store = InventoryStore::new(mem.clone(), &sync.field_manager());
        (DisableHandler::new(mem.clone(), store.clone(), inv.clone(), &sync.field_manager()), store, inv)
    }

    fn managed(kind_api: (&str, &str), name: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": kind_api.0,
            "kind": kind_api.1,
            "metadata": {
                "name": name,
                "namespace": "a",
                "labels": { (metadata::MANAGED_BY_LABEL): metadata::MANAGED_BY_VALUE, "team": "x" },
                "annotations": {
                    (metadata::MANAGER_ANNOTATION): ":root_root-sync",
                    (metadata::OWNING_INVENTORY_ANNOTATION): "config-management-system_root-sync",
                    "keep.example.com/note": "hi"
                }
            },
            "data": { "k": "v" }
        })
    }

    fn disabled(mut v: serde_json::Value) -> DesiredObject {
        v["metadata"]["annotations"] = serde_json::json!({ (metadata::MANAGEMENT_ANNOTATION): metadata::MANAGEMENT_DISABLED });
        DesiredObject::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn releases_object_and_keeps_foreign_metadata() {
        let mem = Arc::new(MemCluster::new());
        let (h, store, inv) = handler(&mem);
        let id = mem.insert(managed(("v1", "ConfigMap"), "x")).unwrap();
        store.replace(&inv, &[id.clone()].into_iter().collect()).await.unwrap();

        let (n, errs) = h.disable(&[disabled(managed(("v1", "ConfigMap"), "x"))]).await;
        assert_eq!(n, 1);
        assert!(errs.is_empty());
        assert!(store.load(&inv).await.unwrap().is_empty());
        let live = mem.object(&id).unwrap();
        assert_eq!(live["data"]["k"], "v");
        assert_eq!(live["metadata"]["labels"], serde_json::json!({ "team": "x" }));
        assert_eq!(live["metadata"]["annotations"], serde_json::json!({ "keep.example.com/note": "hi" }));
    }

    #[tokio::test]
    async fn inventory_failure_aborts_before_touching_objects() {
        let mem = Arc::new(MemCluster::new());
        let (h, _store, _inv) = handler(&mem);
        mem.insert(managed(("v1", "ConfigMap"), "x")).unwrap();
        mem.fail(MemOp::Get, "ResourceGroup", "forbidden");
        let (n, errs) = h.disable(&[disabled(managed(("v1", "ConfigMap"), "x"))]).await;
        assert_eq!(n, 0);
        assert_eq!(errs.len(), 1);
        assert_eq!(mem.calls(MemOp::Apply), 0);
        assert_eq!(mem.calls(MemOp::Update), 0);
    }

    #[tokio::test]
    async fn missing_object_counts_as_released() {
        let mem = Arc::new(MemCluster::new());
        let (h, _store, _inv) = handler(&mem);
        let (n, errs) = h.disable(&[disabled(managed(("v1", "ConfigMap"), "gone"))]).await;
        assert_eq!(n, 1);
        assert!(errs.is_empty());
    }

    #[tokio::test]
    async fn update_kinds_use_full_update() {
        let mem = Arc::new(MemCluster::new());
        let (h, _store, _inv) = handler(&mem);
        let svc = ("apiregistration.k8s.io/v1", "APIService");
        let id = mem.insert(managed(svc, "v1.metrics")).unwrap();
        let (n, errs) = h.disable(&[disabled(managed(svc, "v1.metrics"))]).await;
        assert_eq!((n, errs.len()), (1, 0));
        assert_eq!(mem.calls_for(MemOp::Update, &id), 1);
        assert_eq!(mem.calls_for(MemOp::Apply, &id), 0);
        assert_eq!(mem.object(&id).unwrap()["metadata"]["labels"], serde_json::json!({ "team": "x" }));
    }

    #[tokio::test]
    async fn per_object_failure_is_reported() {
        let mem = Arc::new(MemCluster::new());
        let (h, _store, _inv) = handler(&mem);
        mem.insert(managed(("v1", "ConfigMap"), "x")).unwrap();
        mem.insert(managed(("v1", "Secret"), "s")).unwrap();
        mem.fail(MemOp::Apply, "Secret", "denied by webhook");
        let (n, errs) = h
            .disable(&[disabled(managed(("v1", "ConfigMap"), "x")), disabled(managed(("v1", "Secret"), "s"))])
            .await;
        assert_eq!(n, 1);
        assert_eq!(errs.len(), 1);
        assert!(errs.iter().all(|e| e.code() == "DL2012"));
    }
}
