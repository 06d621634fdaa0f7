//! Per-scope inventory: the set of object identities a RootSync/RepoSync owns,
//! stored as a `ResourceGroup` object next to the sync object.

use std::collections::BTreeSet;
use std::sync::Arc;

use driftless_core::{metadata, Gvk, ObjectIdentity, SyncRef};
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{ApplyParams, ClusterClient, ClusterError};

pub fn resource_group_gvk() -> Gvk { Gvk::new("kpt.dev", "v1alpha1", "ResourceGroup") }

/// Handle naming one inventory object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryRef {
    pub namespace: String,
    pub name: String,
    /// `<namespace>_<sync name>`; stamped on owned objects as the owning-inventory annotation.
    pub id: String,
}

impl InventoryRef {
    pub fn for_sync(sync: &SyncRef) -> Self {
        Self { namespace: sync.namespace().to_string(), name: sync.name.clone(), id: sync.inventory_id() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ResourceGroupSpec {
    #[serde(default)]
    resources: Vec<ObjectIdentity>,
}

/// Load/Replace/Get over the inventory object.
#[derive(Clone)]
pub struct InventoryStore {
    client: Arc<dyn ClusterClient>,
    field_manager: String,
}

impl InventoryStore {
    pub fn new(client: Arc<dyn ClusterClient>, field_manager: &str) -> Self {
        Self { client, field_manager: field_manager.to_string() }
    }

    pub async fn get(&self, inv: &InventoryRef) -> Result<Option<DynamicObject>, ClusterError> {
        self.client.get(&resource_group_gvk(), Some(&inv.namespace), &inv.name).await
    }

    /// Current identity set; a missing inventory object is an empty inventory.
    pub async fn load(&self, inv: &InventoryRef) -> Result<BTreeSet<ObjectIdentity>, ClusterError> {
        let Some(obj) = self.get(inv).await? else {
            debug!(inventory = %inv.id, "no inventory object yet");
            return Ok(BTreeSet::new());
        };
        let spec: ResourceGroupSpec = match obj.data.get("spec") {
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| ClusterError::Invalid(format!("inventory spec: {}", e)))?,
            None => ResourceGroupSpec::default(),
        };
        Ok(spec.resources.into_iter().collect())
    }

    /// Overwrite the inventory with the full new set.
    pub async fn replace(&self, inv: &InventoryRef, ids: &BTreeSet<ObjectIdentity>) -> Result<(), ClusterError> {
        let started = std::time::Instant::now();
        let gvk = resource_group_gvk();
        let body = serde_json::json!({
            "apiVersion": gvk.api_version(),
            "kind": gvk.kind,
            "metadata": {
                "name": inv.name,
                "namespace": inv.namespace,
                "labels": { (metadata::INVENTORY_ID_LABEL): inv.id },
            },
            "spec": ResourceGroupSpec { resources: ids.iter().cloned().collect() },
        });
        let obj: DynamicObject = serde_json::from_value(body).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        let params = ApplyParams { field_manager: self.field_manager.clone(), force: true };
        self.client.apply(&gvk, &obj, &params).await?;
        histogram!("inventory_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("inventory_writes_total", 1u64);
        debug!(inventory = %inv.id, count = ids.len(), "inventory replaced");
        Ok(())
    }
}
