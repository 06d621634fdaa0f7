//! driftless kubehub: kube client wiring, resource lookup, inventories, status and watches.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use driftless_core::{Delta, DeltaKind, Gvk};
use tokio::sync::mpsc;

pub mod client;
pub mod inventory;
pub mod mem;
pub mod status;

pub use client::{ApplyParams, ClusterClient, ClusterError, KubeCluster};
pub use inventory::{InventoryRef, InventoryStore};
pub use mem::{MemCluster, MemOp};
pub use status::{KubeStatusWriter, StatusWriter};

/// Client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Look up the served resource for a GVK; `None` when the cluster doesn't serve it.
/// An empty version matches the group's preferred version.
pub async fn find_api_resource(client: Client, gvk: &Gvk) -> Result<Option<(ApiResource, bool)>> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && (gvk.version.is_empty() || ar.version == gvk.version) && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(Some((ar.clone(), namespaced)));
            }
        }
    }
    Ok(None)
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn delta_from(gvk: &Gvk, obj: &DynamicObject, kind: DeltaKind) -> Result<Delta> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(Delta { gvk: gvk.clone(), kind, raw })
}

/// List+watch one GVK and forward every observation as a [`Delta`].
///
/// Returns when the receiver goes away or the watch stream fails.
pub async fn start_watcher(client: Client, gvk: &Gvk, namespace: Option<&str>, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let (ar, namespaced) = find_api_resource(client.clone(), gvk)
        .await?
        .ok_or_else(|| anyhow::anyhow!("GVK not served: {}", gvk))?;

    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %gvk, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let deltas = match ev {
            Event::Applied(o) => vec![delta_from(gvk, &o, DeltaKind::Applied)?],
            Event::Deleted(o) => vec![delta_from(gvk, &o, DeltaKind::Deleted)?],
            Event::Restarted(list) => {
                debug!(gvk = %gvk, count = list.len(), "watch restart");
                list.iter().map(|o| delta_from(gvk, o, DeltaKind::Applied)).collect::<Result<Vec<_>>>()?
            }
        };
        for d in deltas {
            if delta_tx.send(d).await.is_err() {
                debug!(gvk = %gvk, "delta receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(gvk = %gvk, "watcher stream ended");
    Ok(())
}
