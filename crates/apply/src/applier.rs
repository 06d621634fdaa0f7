//! The driver: one serialized apply cycle over the declared set.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use driftless_core::{partition, DesiredObject, Gvk, MultiError, SyncError, SyncRef};
use driftless_kubehub::{ClusterClient, InventoryRef, InventoryStore};
use kube::core::DynamicObject;
use metrics::{counter, gauge, histogram};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classify::{EventClassifier, SyncStats};
use crate::disable::DisableHandler;
use crate::engine::SsaEngine;
use crate::event::{ApplyEngine, ApplyOptions};

#[derive(Default)]
struct Cached {
    desired: Vec<DesiredObject>,
    stats: SyncStats,
}

pub struct Applier {
    sync: SyncRef,
    inv: InventoryRef,
    engine: Arc<dyn ApplyEngine>,
    disabler: DisableHandler,
    options: ApplyOptions,
    /// Held for a whole cycle; Apply and Refresh never interleave.
    cached: Mutex<Cached>,
}

impl Applier {
    /// Applier wired to the server-side apply engine.
    pub fn new(sync: SyncRef, client: Arc<dyn ClusterClient>) -> Self {
        let store = InventoryStore::new(client.clone(), &sync.field_manager());
        let engine = Arc::new(SsaEngine::new(client.clone(), store.clone()));
        Self::with_engine(sync, client, engine)
    }

    pub fn with_engine(sync: SyncRef, client: Arc<dyn ClusterClient>, engine: Arc<dyn ApplyEngine>) -> Self {
        let inv = InventoryRef::for_sync(&sync);
        let store = InventoryStore::new(client.clone(), &sync.field_manager());
        let disabler = DisableHandler::new(client, store, inv.clone(), &sync.field_manager());
        let options = ApplyOptions::server_side(&sync.field_manager());
        Self { sync, inv, engine, disabler, options, cached: Mutex::new(Cached::default()) }
    }

    pub fn with_update_kinds(mut self, kinds: impl IntoIterator<Item = (String, String)>) -> Self {
        self.disabler = self.disabler.with_update_kinds(kinds);
        self
    }

    pub fn sync(&self) -> &SyncRef { &self.sync }

    /// Counts from the most recent cycle.
    pub async fn last_stats(&self) -> SyncStats { self.cached.lock().await.stats }

    /// Apply the declared set and remember it for later refreshes. Returns the
    /// GVKs that were handled successfully enough to be watched, plus every error.
    pub async fn apply(&self, desired: &[DesiredObject]) -> (BTreeSet<Gvk>, MultiError) {
        let mut cached = self.cached.lock().await;
        let (gvks, errs, stats) = self.cycle(desired).await;
        cached.desired = desired.to_vec();
        cached.stats = stats;
        (gvks, errs)
    }

    /// Re-run the last declared set.
    pub async fn refresh(&self) -> MultiError {
        let mut cached = self.cached.lock().await;
        let desired = cached.desired.clone();
        let (_, errs, stats) = self.cycle(&desired).await;
        cached.stats = stats;
        errs
    }

    /// Refresh every `period` until `stop` resolves.
    pub async fn run(&self, period: Duration, stop: impl Future<Output = ()>) {
        tokio::pin!(stop);
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!(sync = %self.sync, "applier stopped");
                    return;
                }
                _ = tick.tick() => {
                    let errs = self.refresh().await;
                    if !errs.is_empty() {
                        warn!(sync = %self.sync, errors = errs.len(), "periodic refresh reported errors");
                    }
                }
            }
        }
    }

    async fn cycle(&self, desired: &[DesiredObject]) -> (BTreeSet<Gvk>, MultiError, SyncStats) {
        let started = std::time::Instant::now();
        counter!("apply_cycles_total", 1u64);
        let mut errs = MultiError::new();
        let (enabled, disabled) = partition(desired);

        let (released, disable_errs) = self.disabler.disable(&disabled).await;
        errs.extend(disable_errs);

        let mut objects = Vec::with_capacity(enabled.len());
        for obj in &enabled {
            match serde_json::from_value::<DynamicObject>(obj.raw().clone()) {
                Ok(o) => objects.push(o),
                Err(e) => errs.push(SyncError::Conversion { id: obj.identity(), message: e.to_string() }),
            }
        }
        if objects.len() != enabled.len() {
            warn!(sync = %self.sync, "conversion failed; skipping apply");
            counter!("apply_cycles_aborted", 1u64);
            let stats = SyncStats { disabled: released as u64, ..SyncStats::default() };
            return (BTreeSet::new(), errs, stats);
        }

        // A disabled object stays in the inventory when its release failed; it
        // must not look like a deletion to the engine.
        let options = self.options.clone().retaining(disabled.iter().map(|o| o.identity()));
        let mut rx = self.engine.run(&self.inv, objects, &options);
        let mut classifier = EventClassifier::new(&self.sync.manager(), &self.disabler);
        while let Some(ev) = rx.recv().await {
            classifier.handle(ev).await;
        }
        let out = classifier.finish();
        errs.extend(out.errors);

        let gvks: BTreeSet<Gvk> = desired
            .iter()
            .filter(|o| {
                let id = o.identity();
                !out.unknown.contains(&id) && !out.conflicts.contains(&id)
            })
            .map(|o| o.gvk().clone())
            .collect();

        let stats = SyncStats { disabled: released as u64, ..out.stats };
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("apply_cycle_ms", ms);
        gauge!("declared_objects", desired.len() as f64);
        if errs.is_empty() {
            info!(sync = %self.sync, %stats, ms, "apply cycle complete");
        } else {
            warn!(sync = %self.sync, %stats, errors = errs.len(), ms, "apply cycle finished with errors");
        }
        debug!(sync = %self.sync, gvks = gvks.len(), "watchable kinds");
        (gvks, errs, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftless_core::{metadata, ObjectIdentity};
    use driftless_kubehub::{MemCluster, MemOp};
    use serde_json::json;

    fn desired(v: serde_json::Value) -> DesiredObject { DesiredObject::from_value(v).unwrap() }

    fn role(ns: &str, name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": { "name": name, "namespace": ns },
            "rules": []
        })
    }

    fn inventory(mem: &Arc<MemCluster>, sync: &SyncRef) -> BTreeSet<ObjectIdentity> {
        let id = ObjectIdentity::new("kpt.dev", "ResourceGroup", Some(sync.namespace()), &sync.name);
        let raw = mem.object(&id).unwrap_or(json!({}));
        raw["spec"]["resources"]
            .as_array()
            .map(|a| a.iter().map(|v| serde_json::from_value(v.clone()).unwrap()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn clean_apply_reports_all_gvks() {
        let mem = Arc::new(MemCluster::new());
        let sync = SyncRef::root("root-sync");
        let applier = Applier::new(sync.clone(), mem.clone());
        let set = vec![
            desired(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "a" } })),
            desired(role("a", "r")),
        ];
        let (gvks, errs) = applier.apply(&set).await;
        assert!(errs.is_empty(), "{}", errs);
        assert_eq!(gvks, [Gvk::new("", "v1", "Namespace"), Gvk::new("rbac.authorization.k8s.io", "v1", "Role")].into_iter().collect());
        assert_eq!(inventory(&mem, &sync).len(), 2);
        assert_eq!(applier.last_stats().await.apply.created, 2);

        let inv_id = ObjectIdentity::new("kpt.dev", "ResourceGroup", Some(sync.namespace()), &sync.name);
        let inv_version = mem.object(&inv_id).unwrap()["metadata"]["resourceVersion"].clone();
        let inv_writes = mem.calls_for(MemOp::Apply, &inv_id);

        let (_, errs) = applier.apply(&set).await;
        assert!(errs.is_empty());
        let stats = applier.last_stats().await;
        assert_eq!(stats.apply.unchanged, 2);
        assert_eq!(stats.apply.total(), 2);
        assert_eq!(stats.prune.total(), 0);
        assert_eq!(mem.calls_for(MemOp::Apply, &inv_id), inv_writes);
        assert_eq!(mem.object(&inv_id).unwrap()["metadata"]["resourceVersion"], inv_version);
    }

    #[tokio::test]
    async fn unknown_type_is_excluded_but_siblings_apply() {
        let mem = Arc::new(MemCluster::new());
        mem.unregister("anvil.example.com", "Anvil");
        let applier = Applier::new(SyncRef::root("root-sync"), mem.clone());
        let set = vec![
            desired(role("a", "r")),
            desired(json!({ "apiVersion": "anvil.example.com/v1", "kind": "Anvil", "metadata": { "name": "heavy", "namespace": "a" } })),
        ];
        let (gvks, errs) = applier.apply(&set).await;
        assert_eq!(errs.len(), 1);
        assert_eq!(errs.iter().next().unwrap().code(), "DL1021");
        assert_eq!(gvks, [Gvk::new("rbac.authorization.k8s.io", "v1", "Role")].into_iter().collect());
        assert!(mem.contains(&ObjectIdentity::new("rbac.authorization.k8s.io", "Role", Some("a"), "r")));

        // Once the CRD is served the same set goes through cleanly.
        mem.register("anvil.example.com", "Anvil");
        let (gvks, errs) = applier.apply(&set).await;
        assert!(errs.is_empty(), "{}", errs);
        assert!(gvks.contains(&Gvk::new("anvil.example.com", "v1", "Anvil")));
        assert_eq!(applier.last_stats().await.apply.created, 1);
    }

    #[tokio::test]
    async fn disabled_object_is_released_not_pruned() {
        let mem = Arc::new(MemCluster::new());
        let sync = SyncRef::root("root-sync");
        let applier = Applier::new(sync.clone(), mem.clone());
        let (_, errs) = applier.apply(&[desired(role("a", "r"))]).await;
        assert!(errs.is_empty());
        let id = ObjectIdentity::new("rbac.authorization.k8s.io", "Role", Some("a"), "r");
        let mut released = role("a", "r");
        released["metadata"]["annotations"] = json!({ (metadata::MANAGEMENT_ANNOTATION): metadata::MANAGEMENT_DISABLED });

        let (gvks, errs) = applier.apply(&[desired(released)]).await;
        assert!(errs.is_empty(), "{}", errs);
        assert_eq!(gvks, [Gvk::new("rbac.authorization.k8s.io", "v1", "Role")].into_iter().collect());
        assert!(mem.contains(&id));
        assert_eq!(mem.calls_for(MemOp::Delete, &id), 0);
        assert!(inventory(&mem, &sync).is_empty());
        let live = mem.object(&id).unwrap();
        assert!(live["metadata"]["annotations"].get(metadata::OWNING_INVENTORY_ANNOTATION).is_none());
        assert_eq!(applier.last_stats().await.disabled, 1);
    }

    #[tokio::test]
    async fn failed_release_never_deletes_the_disabled_object() {
        let mem = Arc::new(MemCluster::new());
        let sync = SyncRef::root("root-sync");
        let applier = Applier::new(sync.clone(), mem.clone());
        let (_, errs) = applier.apply(&[desired(role("a", "r"))]).await;
        assert!(errs.is_empty());
        let id = ObjectIdentity::new("rbac.authorization.k8s.io", "Role", Some("a"), "r");
        mem.fail(MemOp::Apply, "ResourceGroup", "etcdserver: request is too large");
        let mut released = role("a", "r");
        released["metadata"]["annotations"] = json!({ (metadata::MANAGEMENT_ANNOTATION): metadata::MANAGEMENT_DISABLED });

        let (_, errs) = applier.apply(&[desired(released)]).await;
        assert!(errs.iter().any(|e| e.code() == "DL2017"), "{}", errs);
        assert!(mem.contains(&id));
        assert_eq!(mem.calls_for(MemOp::Delete, &id), 0);
        assert!(inventory(&mem, &sync).contains(&id));
    }

    #[tokio::test]
    async fn conflict_is_excluded_from_gvks() {
        let mem = Arc::new(MemCluster::new());
        let mut theirs = role("a", "r");
        theirs["metadata"]["annotations"] = json!({
            (metadata::OWNING_INVENTORY_ANNOTATION): "a_repo-sync",
            (metadata::MANAGER_ANNOTATION): "a_repo-sync"
        });
        mem.insert(theirs).unwrap();
        let applier = Applier::new(SyncRef::root("root-sync"), mem.clone());
        let (gvks, errs) = applier.apply(&[desired(role("a", "r"))]).await;
        assert!(gvks.is_empty());
        assert_eq!(errs.management_conflicts().count(), 1);
    }

    #[tokio::test]
    async fn conversion_failure_aborts_the_cycle() {
        let mem = Arc::new(MemCluster::new());
        let applier = Applier::new(SyncRef::root("root-sync"), mem.clone());
        let bad = desired(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x", "labels": "oops" } }));
        let (gvks, errs) = applier.apply(&[desired(role("a", "r")), bad]).await;
        assert!(gvks.is_empty());
        assert_eq!(errs.iter().map(|e| e.code()).collect::<Vec<_>>(), vec!["DL2015"]);
        assert_eq!(mem.calls(MemOp::Apply), 0);
    }

    #[tokio::test]
    async fn refresh_replays_last_set() {
        let mem = Arc::new(MemCluster::new());
        let applier = Applier::new(SyncRef::root("root-sync"), mem.clone());
        assert!(applier.refresh().await.is_empty());
        applier.apply(&[desired(role("a", "r"))]).await;
        let id = ObjectIdentity::new("rbac.authorization.k8s.io", "Role", Some("a"), "r");
        // Drift: someone deletes it out of band.
        mem.delete(&Gvk::new("rbac.authorization.k8s.io", "v1", "Role"), Some("a"), "r").await.unwrap();
        assert!(!mem.contains(&id));
        assert!(applier.refresh().await.is_empty());
        assert!(mem.contains(&id));
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let mem = Arc::new(MemCluster::new());
        let applier = Applier::new(SyncRef::root("root-sync"), mem);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tx.send(()).unwrap();
        let stop = async move { let _ = rx.await; };
        tokio::time::timeout(Duration::from_secs(5), applier.run(Duration::from_millis(10), stop)).await.unwrap();
    }
}
