//! driftless core types: object identities, management metadata, scopes and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod errors;
pub mod metadata;
pub mod status;

pub use errors::{ErrorClass, ErrorTaxonomy, MultiError, SyncError, TaxonomyEntry};

/// Group/Version/Kind of a Kubernetes resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Build from an `apiVersion` string (`v1` or `group/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Key in the `v1/Kind` or `group/v1/Kind` form.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    /// Parse a key produced by [`Gvk::key`].
    pub fn parse_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new(group, version, kind)),
            _ => None,
        }
    }

    pub fn is_namespace(&self) -> bool { self.group.is_empty() && self.kind == "Namespace" }

    pub fn is_crd(&self) -> bool { self.group == "apiextensions.k8s.io" && self.kind == "CustomResourceDefinition" }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

/// (group, kind, namespace, name): the key used by inventories and caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(group: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    pub fn from_gvk(gvk: &Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self::new(&gvk.group, &gvk.kind, namespace, name)
    }

    /// Group/kind with an empty version, which cluster clients resolve to the preferred served version.
    pub fn group_kind(&self) -> Gvk { Gvk::new(&self.group, "", &self.kind) }

    /// Value of the resource-id annotation: `group_kind_namespace_name`, lowercased kind.
    pub fn resource_id(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}_{}_{}_{}", self.group, self.kind.to_lowercase(), ns, self.name),
            None => format!("{}_{}_{}", self.group, self.kind.to_lowercase(), self.name),
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = if self.group.is_empty() { self.kind.clone() } else { format!("{}/{}", self.group, self.kind) };
        match &self.namespace {
            Some(ns) => write!(f, "{}, {}/{}", gk, ns, self.name),
            None => write!(f, "{}, {}", gk, self.name),
        }
    }
}

/// Whether the reconciler actively manages an object or releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Management {
    Enabled,
    Disabled,
}

/// A declared object produced by parsing, with its identity resolved up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredObject {
    gvk: Gvk,
    namespace: Option<String>,
    name: String,
    raw: Json,
}

impl DesiredObject {
    /// Resolve apiVersion/kind/metadata.name/metadata.namespace from a raw manifest.
    pub fn from_value(raw: Json) -> Result<Self, String> {
        if !raw.is_object() {
            return Err("manifest is not an object".to_string());
        }
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str()).ok_or("missing apiVersion")?;
        let kind = raw.get("kind").and_then(|v| v.as_str()).ok_or("missing kind")?;
        let meta = raw.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or("missing metadata.name")?
            .to_string();
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Ok(Self { gvk: Gvk::from_api_version(api_version, kind), namespace, name, raw })
    }

    pub fn gvk(&self) -> &Gvk { &self.gvk }
    pub fn name(&self) -> &str { &self.name }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn raw(&self) -> &Json { &self.raw }
    pub fn into_raw(self) -> Json { self.raw }

    pub fn identity(&self) -> ObjectIdentity {
        ObjectIdentity::from_gvk(&self.gvk, self.namespace.as_deref(), &self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> { self.meta_str("annotations", key) }
    pub fn label(&self, key: &str) -> Option<&str> { self.meta_str("labels", key) }

    pub fn annotations(&self) -> BTreeMap<String, String> { self.meta_map("annotations") }
    pub fn labels(&self) -> BTreeMap<String, String> { self.meta_map("labels") }

    pub fn set_annotation(&mut self, key: &str, value: &str) { self.set_meta_str("annotations", key, value) }
    pub fn set_label(&mut self, key: &str, value: &str) { self.set_meta_str("labels", key, value) }

    pub fn set_namespace(&mut self, ns: &str) {
        self.namespace = Some(ns.to_string());
        if let Some(meta) = self.metadata_mut() {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
    }

    pub fn management(&self) -> Management {
        match self.annotation(metadata::MANAGEMENT_ANNOTATION) {
            Some(metadata::MANAGEMENT_DISABLED) => Management::Disabled,
            _ => Management::Enabled,
        }
    }

    fn meta_str(&self, field: &str, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get(field)?.get(key)?.as_str()
    }

    fn meta_map(&self, field: &str) -> BTreeMap<String, String> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_object())
            .map(|o| o.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    fn metadata_mut(&mut self) -> Option<&mut serde_json::Map<String, Json>> {
        let obj = self.raw.as_object_mut()?;
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        meta.as_object_mut()
    }

    fn set_meta_str(&mut self, field: &str, key: &str, value: &str) {
        if let Some(meta) = self.metadata_mut() {
            let entry = meta.entry(field).or_insert_with(|| Json::Object(serde_json::Map::new()));
            if !entry.is_object() {
                *entry = Json::Object(serde_json::Map::new());
            }
            if let Some(map) = entry.as_object_mut() {
                map.insert(key.to_string(), Json::String(value.to_string()));
            }
        }
    }
}

/// Split desired objects into `(enabled, disabled)`, keeping relative order.
pub fn partition(objects: &[DesiredObject]) -> (Vec<DesiredObject>, Vec<DesiredObject>) {
    objects.iter().cloned().partition(|o| o.management() == Management::Enabled)
}

/// Authority boundary of one reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Root,
    Namespace(String),
}

/// Namespace holding RootSync objects and root inventories.
pub const CONTROL_NAMESPACE: &str = "config-management-system";

/// The RootSync/RepoSync a reconciler serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncRef {
    pub scope: Scope,
    pub name: String,
}

impl SyncRef {
    pub fn root(name: &str) -> Self { Self { scope: Scope::Root, name: name.to_string() } }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { scope: Scope::Namespace(namespace.to_string()), name: name.to_string() }
    }

    pub fn sync_kind(&self) -> &'static str {
        match self.scope {
            Scope::Root => "RootSync",
            Scope::Namespace(_) => "RepoSync",
        }
    }

    /// Namespace of the RootSync/RepoSync object and its inventory.
    pub fn namespace(&self) -> &str {
        match &self.scope {
            Scope::Root => CONTROL_NAMESPACE,
            Scope::Namespace(ns) => ns,
        }
    }

    /// Value written into the manager annotation of every declared object.
    pub fn manager(&self) -> String {
        match &self.scope {
            Scope::Root => format!(":root_{}", self.name),
            Scope::Namespace(ns) => format!("{}_{}", ns, self.name),
        }
    }

    pub fn inventory_id(&self) -> String { format!("{}_{}", self.namespace(), self.name) }

    pub fn reconciler_name(&self) -> String {
        match &self.scope {
            Scope::Root => format!("root-reconciler-{}", self.name),
            Scope::Namespace(ns) => format!("ns-reconciler-{}-{}", ns, self.name),
        }
    }

    /// Server-side apply field manager; unique per reconciler.
    pub fn field_manager(&self) -> String { format!("driftless/{}", self.reconciler_name()) }
}

impl fmt::Display for SyncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.sync_kind(), self.namespace(), self.name)
    }
}

/// One consistent read of the source repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    pub commit: String,
    /// Directory holding the manifests for `commit`.
    pub policy_dir: PathBuf,
    /// Manifest files under `policy_dir`, sorted.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A watch observation for one live object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub gvk: Gvk,
    pub kind: DeltaKind,
    pub raw: Json,
}

impl Delta {
    pub fn identity(&self) -> Option<ObjectIdentity> {
        let meta = self.raw.get("metadata")?;
        let name = meta.get("name")?.as_str()?;
        let ns = meta.get("namespace").and_then(|v| v.as_str());
        Some(ObjectIdentity::from_gvk(&self.gvk, ns, name))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }
}

pub mod prelude {
    pub use super::{partition, Delta, DeltaKind, DesiredObject, Gvk, Management, ObjectIdentity, Scope, SourceState, SyncRef};
    pub use super::errors::{ErrorClass, MultiError, SyncError};
}
