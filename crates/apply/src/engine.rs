//! Server-side apply engine: applies declared objects, prunes what dropped out
//! of the inventory, and streams one event per object.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use driftless_core::{metadata, Gvk, ObjectIdentity};
use driftless_kubehub::{ApplyParams, ClusterClient, ClusterError, InventoryRef, InventoryStore};
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{ApplyEngine, ApplyOptions, EngineError, Event, Operation, ResourceEvent};

fn event_queue_cap() -> usize {
    std::env::var("DRIFTLESS_EVENT_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1024)
}

/// Field-level change counts between two object snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

/// Drop server-populated fields so two snapshots compare on declared content.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (V::Array(aa), V::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// CRDs and Namespaces go first so their dependents can land in the same run.
fn apply_rank(gvk: &Gvk) -> u8 {
    if gvk.is_crd() { 0 } else if gvk.is_namespace() { 1 } else { 2 }
}

fn gvk_of(obj: &DynamicObject) -> Option<Gvk> {
    obj.types.as_ref().map(|t| Gvk::from_api_version(&t.api_version, &t.kind))
}

fn owning_inventory(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.annotations.as_ref()?.get(metadata::OWNING_INVENTORY_ANNOTATION).map(String::as_str)
}

fn to_engine_error(e: ClusterError) -> EngineError {
    match e {
        ClusterError::UnknownKind(gvk) => EngineError::UnknownType(format!("no resource type {} is served", gvk)),
        other => EngineError::Other(other.to_string()),
    }
}

/// [`ApplyEngine`] issuing server-side apply patches through a [`ClusterClient`].
pub struct SsaEngine {
    client: Arc<dyn ClusterClient>,
    inventory: InventoryStore,
    queue_cap: usize,
}

impl SsaEngine {
    pub fn new(client: Arc<dyn ClusterClient>, inventory: InventoryStore) -> Self {
        Self { client, inventory, queue_cap: event_queue_cap() }
    }
}

impl ApplyEngine for SsaEngine {
    fn run(&self, inventory: &InventoryRef, objects: Vec<DynamicObject>, options: &ApplyOptions) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.queue_cap.max(1));
        let run = EngineRun {
            client: self.client.clone(),
            store: self.inventory.clone(),
            inv: inventory.clone(),
            options: options.clone(),
            tx,
        };
        tokio::spawn(run.execute(objects));
        rx
    }
}

struct EngineRun {
    client: Arc<dyn ClusterClient>,
    store: InventoryStore,
    inv: InventoryRef,
    options: ApplyOptions,
    tx: mpsc::Sender<Event>,
}

impl EngineRun {
    /// False once the receiver is gone; the run stops early in that case.
    async fn emit(&self, ev: Event) -> bool { self.tx.send(ev).await.is_ok() }

    async fn execute(self, mut objects: Vec<DynamicObject>) {
        let started = std::time::Instant::now();
        if !self.options.server_side {
            self.emit(Event::Error { message: "client-side apply is not supported".into() }).await;
            return;
        }
        let prior = match self.store.load(&self.inv).await {
            Ok(ids) => ids,
            Err(e) => {
                self.emit(Event::Error { message: format!("failed to load inventory {}: {}", self.inv.id, e) }).await;
                return;
            }
        };
        objects.sort_by_key(|o| gvk_of(o).map(|g| apply_rank(&g)).unwrap_or(2));

        let mut declared = BTreeSet::new();
        let mut keep = BTreeSet::new();
        for obj in objects {
            let Some(gvk) = gvk_of(&obj) else {
                self.emit(Event::Error { message: "object without apiVersion/kind handed to engine".into() }).await;
                return;
            };
            let Some(name) = obj.metadata.name.clone() else {
                self.emit(Event::Error { message: format!("{} object without metadata.name handed to engine", gvk) }).await;
                return;
            };
            let id = ObjectIdentity::from_gvk(&gvk, obj.metadata.namespace.as_deref(), &name);
            declared.insert(id.clone());
            let ev = self.apply_one(gvk, id.clone(), obj).await;
            match &ev.error {
                None => { keep.insert(id); }
                Some(EngineError::InventoryOverlap(_)) => {}
                // A failed apply doesn't release an object we already own.
                Some(_) => if prior.contains(&id) { keep.insert(id); },
            }
            if !self.emit(Event::Apply(ev)).await { return; }
        }

        // Retained members stay in the inventory untouched.
        keep.extend(prior.intersection(&self.options.retain).filter(|id| !declared.contains(*id)).cloned());
        for id in prior.difference(&declared).filter(|id| !self.options.retain.contains(*id)) {
            let ev = self.prune_one(id).await;
            if ev.error.is_some() {
                keep.insert(id.clone());
            }
            if !self.emit(Event::Prune(ev)).await { return; }
        }

        if keep != prior {
            if let Err(e) = self.store.replace(&self.inv, &keep).await {
                self.emit(Event::Error { message: format!("failed to write inventory {}: {}", self.inv.id, e) }).await;
                return;
            }
        }
        histogram!("engine_run_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    async fn apply_one(&self, gvk: Gvk, id: ObjectIdentity, mut obj: DynamicObject) -> ResourceEvent {
        let ns = obj.metadata.namespace.clone();
        let live = match self.client.get(&gvk, ns.as_deref(), &id.name).await {
            Ok(live) => live,
            Err(e) => {
                counter!("apply_err", 1u64);
                return ResourceEvent::failed(id, gvk, to_engine_error(e), None);
            }
        };
        if let Some(owner) = live.as_ref().and_then(owning_inventory) {
            if owner != self.inv.id {
                let msg = format!("{} is owned by inventory {}", id, owner);
                counter!("apply_err", 1u64, "reason" => "inventory_overlap");
                return ResourceEvent::failed(id, gvk, EngineError::InventoryOverlap(msg), live);
            }
        }

        obj.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(metadata::OWNING_INVENTORY_ANNOTATION.to_string(), self.inv.id.clone());
        let params = ApplyParams { field_manager: self.options.field_manager.clone(), force: self.options.force_conflicts };
        match self.client.apply(&gvk, &obj, &params).await {
            Ok(applied) => {
                let op = match &live {
                    None => Operation::Created,
                    Some(l) if l.metadata.resource_version == applied.metadata.resource_version => Operation::Unchanged,
                    Some(l) => {
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            let before = serde_json::to_value(l).map(strip_noisy).unwrap_or(Json::Null);
                            let after = serde_json::to_value(&applied).map(strip_noisy).unwrap_or(Json::Null);
                            let d = diff_summary(&after, &before);
                            debug!(%id, adds = d.adds, updates = d.updates, removes = d.removes, "configured");
                        }
                        Operation::Configured
                    }
                };
                counter!("apply_ok", 1u64, "op" => op.as_str());
                ResourceEvent::ok(id, gvk, op, Some(applied))
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(%id, error = %e, "apply failed");
                ResourceEvent::failed(id, gvk, to_engine_error(e), live)
            }
        }
    }

    async fn prune_one(&self, id: &ObjectIdentity) -> ResourceEvent {
        let gvk = id.group_kind();
        let live = match self.client.get(&gvk, id.namespace.as_deref(), &id.name).await {
            Ok(Some(live)) => live,
            // Gone already, or its type was removed with it.
            Ok(None) | Err(ClusterError::UnknownKind(_)) => {
                return ResourceEvent::ok(id.clone(), gvk, Operation::Pruned, None);
            }
            Err(e) => return ResourceEvent::failed(id.clone(), gvk, to_engine_error(e), None),
        };

        let detached = live
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(metadata::LIFECYCLE_DELETION_ANNOTATION))
            .map(|v| v == metadata::LIFECYCLE_DETACH)
            .unwrap_or(false);
        let protected = gvk.is_namespace() && metadata::is_protected_namespace(&id.name);
        let foreign = owning_inventory(&live).map(|o| o != self.inv.id).unwrap_or(false);
        if detached || protected || foreign {
            debug!(%id, detached, protected, foreign, "prune skipped");
            counter!("prune_skipped", 1u64);
            return ResourceEvent::ok(id.clone(), gvk, Operation::Skipped, Some(live));
        }

        match self.client.delete(&gvk, id.namespace.as_deref(), &id.name).await {
            Ok(()) => {
                counter!("prune_ok", 1u64);
                ResourceEvent::ok(id.clone(), gvk, Operation::Pruned, Some(live))
            }
            Err(e) => {
                counter!("prune_err", 1u64);
                ResourceEvent::failed(id.clone(), gvk, to_engine_error(e), Some(live))
            }
        }
    }
}
