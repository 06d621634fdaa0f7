//! Manifest parser: YAML/JSON files into annotated [`DesiredObject`]s.

use std::collections::BTreeSet;
use std::path::Path;

use driftless_core::{metadata, DesiredObject, Management, MultiError, Scope, SourceState, SyncError, SyncRef};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::Parser;

fn max_yaml_bytes() -> usize {
    std::env::var("DRIFTLESS_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("DRIFTLESS_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Kinds a namespace-scoped reconciler may never declare.
const CLUSTER_ONLY_KINDS: [&str; 5] = ["Namespace", "ClusterRole", "ClusterRoleBinding", "CustomResourceDefinition", "APIService"];

pub struct ManifestParser {
    sync: SyncRef,
    max_bytes: usize,
    max_nodes: usize,
}

impl ManifestParser {
    pub fn new(sync: SyncRef) -> Self { Self { sync, max_bytes: max_yaml_bytes(), max_nodes: max_yaml_nodes() } }

    pub fn with_limits(mut self, max_bytes: usize, max_nodes: usize) -> Self {
        self.max_bytes = max_bytes;
        self.max_nodes = max_nodes;
        self
    }

    /// Split one file into documents, expanding `kind: List`.
    fn documents(&self, path: &Path, text: &str) -> Result<Vec<Json>, String> {
        if text.len() > self.max_bytes {
            return Err(format!("file too large: {} bytes (max {})", text.len(), self.max_bytes));
        }
        let mut docs = Vec::new();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            docs.push(serde_json::from_str::<Json>(text).map_err(|e| e.to_string())?);
        } else {
            for doc in serde_yaml::Deserializer::from_str(text) {
                docs.push(Json::deserialize(doc).map_err(|e| e.to_string())?);
            }
        }
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            if doc.is_null() || doc.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                continue;
            }
            if json_node_budget_exceeded(&doc, self.max_nodes) {
                return Err(format!("document too complex (>{} nodes)", self.max_nodes));
            }
            match (doc.get("kind").and_then(|k| k.as_str()), doc.get("items").and_then(|i| i.as_array())) {
                (Some("List"), Some(items)) => out.extend(items.iter().cloned()),
                _ => out.push(doc),
            }
        }
        Ok(out)
    }

    /// Scope rules; may default the namespace of a namespaced declaration.
    fn check_scope(&self, obj: &mut DesiredObject) -> Result<(), String> {
        let Scope::Namespace(ns) = &self.sync.scope else { return Ok(()) };
        if CLUSTER_ONLY_KINDS.contains(&obj.gvk().kind.as_str()) {
            return Err(format!("{} may not be declared in a namespace repository", obj.gvk().kind));
        }
        match obj.namespace() {
            None => obj.set_namespace(ns),
            Some(declared) if declared != ns => {
                return Err(format!("namespace {:?} is outside the repository's namespace {:?}", declared, ns));
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn annotate(&self, obj: &mut DesiredObject, source_path: &str, commit: &str) {
        if obj.management() == Management::Disabled {
            return;
        }
        let id = obj.identity();
        let version = obj.gvk().version.clone();
        obj.set_annotation(metadata::MANAGER_ANNOTATION, &self.sync.manager());
        obj.set_annotation(metadata::SOURCE_PATH_ANNOTATION, source_path);
        obj.set_annotation(metadata::TOKEN_ANNOTATION, commit);
        obj.set_annotation(metadata::RESOURCE_ID_ANNOTATION, &id.resource_id());
        obj.set_annotation(metadata::OWNING_INVENTORY_ANNOTATION, &self.sync.inventory_id());
        obj.set_label(metadata::MANAGED_BY_LABEL, metadata::MANAGED_BY_VALUE);
        obj.set_label(metadata::DECLARED_VERSION_LABEL, &version);
    }
}

impl Parser for ManifestParser {
    fn parse(&self, source: &SourceState) -> (Vec<DesiredObject>, MultiError) {
        let mut objects = Vec::new();
        let mut errs = MultiError::new();
        let mut seen = BTreeSet::new();
        for file in &source.files {
            let rel = file.strip_prefix(&source.policy_dir).unwrap_or(file).to_string_lossy().to_string();
            let docs = std::fs::read_to_string(file)
                .map_err(|e| e.to_string())
                .and_then(|text| self.documents(file, &text));
            let docs = match docs {
                Ok(d) => d,
                Err(message) => {
                    errs.push(SyncError::Parse { path: rel, message });
                    continue;
                }
            };
            for raw in docs {
                let mut obj = match DesiredObject::from_value(raw) {
                    Ok(o) => o,
                    Err(message) => {
                        errs.push(SyncError::Validation { path: rel.clone(), message });
                        continue;
                    }
                };
                if let Err(message) = self.check_scope(&mut obj) {
                    errs.push(SyncError::Validation { path: rel.clone(), message: format!("{}: {}", obj.identity(), message) });
                    continue;
                }
                if !seen.insert(obj.identity()) {
                    errs.push(SyncError::Validation { path: rel.clone(), message: format!("{} is declared more than once", obj.identity()) });
                    continue;
                }
                self.annotate(&mut obj, &rel, &source.commit);
                objects.push(obj);
            }
        }
        debug!(commit = %source.commit, objects = objects.len(), errors = errs.len(), "parsed");
        (objects, errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_source(tag: &str, files: &[(&str, &str)]) -> SourceState {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("driftless-parse-{}-{}", tag, nanos));
        std::fs::create_dir_all(&dir).unwrap();
        let mut paths: Vec<PathBuf> = vec![];
        for (name, body) in files {
            let p = dir.join(name);
            std::fs::write(&p, body).unwrap();
            paths.push(p);
        }
        SourceState { commit: "c0ffee".into(), policy_dir: dir, files: paths }
    }

    const NS_AND_ROLE: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n---\napiVersion: rbac.authorization.k8s.io/v1\nkind: Role\nmetadata:\n  name: r\n  namespace: a\nrules: []\n";

    #[test]
    fn parses_multi_doc_and_annotates() {
        let src = write_source("multi", &[("a.yaml", NS_AND_ROLE)]);
        let (objs, errs) = ManifestParser::new(SyncRef::root("root-sync")).parse(&src);
        assert!(errs.is_empty(), "{}", errs);
        assert_eq!(objs.len(), 2);
        let role = &objs[1];
        assert_eq!(role.annotation(metadata::MANAGER_ANNOTATION), Some(":root_root-sync"));
        assert_eq!(role.annotation(metadata::SOURCE_PATH_ANNOTATION), Some("a.yaml"));
        assert_eq!(role.annotation(metadata::TOKEN_ANNOTATION), Some("c0ffee"));
        assert_eq!(role.annotation(metadata::RESOURCE_ID_ANNOTATION), Some("rbac.authorization.k8s.io_role_a_r"));
        assert_eq!(role.label(metadata::MANAGED_BY_LABEL), Some(metadata::MANAGED_BY_VALUE));
        assert_eq!(role.label(metadata::DECLARED_VERSION_LABEL), Some("v1"));
    }

    #[test]
    fn friendly_errors_and_partial_results() {
        let src = write_source("errs", &[
            ("bad.yaml", "kind: Foo\nmetadata:\n  name: x\n"),
            ("broken.yaml", "apiVersion: v1\nkind: [\n"),
            ("ok.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: a\n"),
        ]);
        let (objs, errs) = ManifestParser::new(SyncRef::root("root-sync")).parse(&src);
        assert_eq!(objs.len(), 1);
        let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
        assert!(msgs.iter().any(|m| m.contains("missing apiVersion")), "{:?}", msgs);
        assert!(errs.iter().any(|e| e.code() == "DL1006"));
    }

    #[test]
    fn namespace_scope_defaults_and_rejects() {
        let src = write_source("scope", &[(
            "all.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: y\n  namespace: other\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: b\n",
        )]);
        let (objs, errs) = ManifestParser::new(SyncRef::namespaced("b", "repo-sync")).parse(&src);
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].namespace(), Some("b"));
        assert_eq!(objs[0].annotation(metadata::MANAGER_ANNOTATION), Some("b_repo-sync"));
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn duplicates_lists_and_disabled_objects() {
        let list = r#"{"apiVersion":"v1","kind":"List","items":[
            {"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"x","namespace":"a"}},
            {"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"x","namespace":"a"}}]}"#;
        let disabled = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: off\n  namespace: a\n  annotations:\n    configmanagement.gke.io/managed: disabled\n";
        let src = write_source("dups", &[("list.json", list), ("off.yaml", disabled)]);
        let (objs, errs) = ManifestParser::new(SyncRef::root("root-sync")).parse(&src);
        assert_eq!(objs.len(), 2);
        assert_eq!(errs.len(), 1);
        assert!(errs.iter().next().unwrap().to_string().contains("more than once"));
        let off = objs.iter().find(|o| o.name() == "off").unwrap();
        assert_eq!(off.management(), Management::Disabled);
        assert!(off.annotation(metadata::MANAGER_ANNOTATION).is_none());
    }

    #[test]
    fn byte_and_node_budgets() {
        let src = write_source("budget", &[("a.yaml", NS_AND_ROLE)]);
        let (objs, errs) = ManifestParser::new(SyncRef::root("root-sync")).with_limits(16, 100_000).parse(&src);
        assert!(objs.is_empty());
        assert!(errs.iter().next().unwrap().to_string().contains("too large"));
        let (objs, errs) = ManifestParser::new(SyncRef::root("root-sync")).with_limits(1_000_000, 4).parse(&src);
        assert!(objs.is_empty());
        assert!(errs.iter().next().unwrap().to_string().contains("too complex"));
    }
}
