//! In-memory [`ClusterClient`] for tests and offline runs.
//!
//! Server-side apply is approximated: top-level fields in the applied object
//! replace the stored ones, and labels/annotations are taken wholesale from
//! the applied object, as if the applier owned every key it ever set. The
//! resourceVersion only moves when stored content changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use driftless_core::{Gvk, ObjectIdentity};
use kube::core::DynamicObject;
use serde_json::Value as Json;

use crate::client::{object_name, ApplyParams, ClusterClient, ClusterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Get,
    Apply,
    Update,
    Delete,
    PatchStatus,
}

struct Fault {
    op: MemOp,
    kind: String,
    message: String,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<ObjectIdentity, Json>,
    unregistered: BTreeSet<(String, String)>,
    faults: Vec<Fault>,
    calls: Vec<(MemOp, ObjectIdentity)>,
    next_rv: u64,
}

impl MemState {
    fn check(&mut self, op: MemOp, gvk: &Gvk, id: &ObjectIdentity) -> Result<(), ClusterError> {
        self.calls.push((op, id.clone()));
        if self.unregistered.contains(&(gvk.group.clone(), gvk.kind.clone())) {
            return Err(ClusterError::UnknownKind(gvk.clone()));
        }
        if let Some(f) = self.faults.iter().find(|f| f.op == op && f.kind == gvk.kind) {
            return Err(ClusterError::Api { code: 500, message: f.message.clone() });
        }
        Ok(())
    }

    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    /// Store `v` unless it equals what is already there; returns the stored value.
    fn store(&mut self, id: ObjectIdentity, mut v: Json) -> Json {
        if let Some(cur) = self.objects.get(&id) {
            if without_version(cur) == without_version(&v) {
                return cur.clone();
            }
        }
        let rv = self.bump();
        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        self.objects.insert(id, v.clone());
        v
    }
}

fn without_version(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("resourceVersion");
        meta.remove("managedFields");
    }
    v
}

fn to_dynamic(v: &Json) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(v.clone()).map_err(|e| ClusterError::Invalid(e.to_string()))
}

fn to_json(obj: &DynamicObject) -> Result<Json, ClusterError> {
    let mut v = serde_json::to_value(obj).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        for field in ["labels", "annotations"] {
            if meta.get(field).and_then(|m| m.as_object()).map(|m| m.is_empty()).unwrap_or(false) {
                meta.remove(field);
            }
        }
    }
    Ok(v)
}

fn identity_of(gvk: &Gvk, obj: &DynamicObject) -> Result<ObjectIdentity, ClusterError> {
    Ok(ObjectIdentity::from_gvk(gvk, obj.metadata.namespace.as_deref(), object_name(obj)?))
}

/// RFC 7386 merge patch.
fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() {
                *target = Json::Object(serde_json::Map::new());
            }
            if let Some(t) = target.as_object_mut() {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

pub struct MemCluster {
    state: Mutex<MemState>,
}

impl Default for MemCluster {
    fn default() -> Self { Self::new() }
}

impl MemCluster {
    pub fn new() -> Self { Self { state: Mutex::new(MemState::default()) } }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Make every call for `group/kind` fail as if no CRD were installed.
    pub fn unregister(&self, group: &str, kind: &str) {
        self.lock().unregistered.insert((group.to_string(), kind.to_string()));
    }

    pub fn register(&self, group: &str, kind: &str) {
        self.lock().unregistered.remove(&(group.to_string(), kind.to_string()));
    }

    /// Seed a live object directly, bypassing faults and call accounting.
    pub fn insert(&self, raw: Json) -> Result<ObjectIdentity, ClusterError> {
        let obj = to_dynamic(&raw)?;
        let types = obj.types.clone().ok_or_else(|| ClusterError::Invalid("object missing apiVersion/kind".into()))?;
        let gvk = Gvk::from_api_version(&types.api_version, &types.kind);
        let id = identity_of(&gvk, &obj)?;
        self.lock().store(id.clone(), to_json(&obj)?);
        Ok(id)
    }

    pub fn object(&self, id: &ObjectIdentity) -> Option<Json> { self.lock().objects.get(id).cloned() }

    pub fn contains(&self, id: &ObjectIdentity) -> bool { self.lock().objects.contains_key(id) }

    /// Fail every `op` on objects of `kind` with an API error carrying `message`.
    pub fn fail(&self, op: MemOp, kind: &str, message: &str) {
        self.lock().faults.push(Fault { op, kind: kind.to_string(), message: message.to_string() });
    }

    pub fn clear_faults(&self) { self.lock().faults.clear(); }

    pub fn calls(&self, op: MemOp) -> usize { self.lock().calls.iter().filter(|(o, _)| *o == op).count() }

    pub fn calls_for(&self, op: MemOp, id: &ObjectIdentity) -> usize {
        self.lock().calls.iter().filter(|(o, i)| *o == op && i == id).count()
    }
}

#[async_trait]
impl ClusterClient for MemCluster {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        let id = ObjectIdentity::from_gvk(gvk, namespace, name);
        let mut st = self.lock();
        st.check(MemOp::Get, gvk, &id)?;
        st.objects.get(&id).map(to_dynamic).transpose()
    }

    async fn apply(&self, gvk: &Gvk, obj: &DynamicObject, _params: &ApplyParams) -> Result<DynamicObject, ClusterError> {
        let id = identity_of(gvk, obj)?;
        let incoming = to_json(obj)?;
        let mut st = self.lock();
        st.check(MemOp::Apply, gvk, &id)?;
        let next = match st.objects.get(&id) {
            None => incoming,
            Some(cur) => {
                let mut merged = cur.clone();
                if let (Some(m), Some(inc)) = (merged.as_object_mut(), incoming.as_object()) {
                    for (k, v) in inc.iter().filter(|(k, _)| k.as_str() != "metadata" && k.as_str() != "status") {
                        m.insert(k.clone(), v.clone());
                    }
                    let inc_meta = inc.get("metadata").cloned().unwrap_or(Json::Null);
                    if let Some(meta) = m.get_mut("metadata").and_then(|v| v.as_object_mut()) {
                        for field in ["labels", "annotations"] {
                            match inc_meta.get(field) {
                                Some(v) => meta.insert(field.to_string(), v.clone()),
                                None => meta.remove(field),
                            };
                        }
                    }
                }
                merged
            }
        };
        let stored = st.store(id, next);
        to_dynamic(&stored)
    }

    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = identity_of(gvk, obj)?;
        let incoming = to_json(obj)?;
        let mut st = self.lock();
        st.check(MemOp::Update, gvk, &id)?;
        if !st.objects.contains_key(&id) {
            return Err(ClusterError::NotFound(id.to_string()));
        }
        let stored = st.store(id, incoming);
        to_dynamic(&stored)
    }

    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        let id = ObjectIdentity::from_gvk(gvk, namespace, name);
        let mut st = self.lock();
        st.check(MemOp::Delete, gvk, &id)?;
        st.objects.remove(&id);
        Ok(())
    }

    async fn patch_status(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, status: &Json) -> Result<(), ClusterError> {
        let id = ObjectIdentity::from_gvk(gvk, namespace, name);
        let mut st = self.lock();
        st.check(MemOp::PatchStatus, gvk, &id)?;
        let mut next = st.objects.get(&id).cloned().ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        if let Some(obj) = next.as_object_mut() {
            merge_patch(obj.entry("status").or_insert(Json::Null), status);
        }
        st.store(id, next);
        Ok(())
    }
}
