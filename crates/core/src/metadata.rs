//! Labels and annotations the reconciler writes onto declared objects.

use std::collections::BTreeMap;

pub const MANAGEMENT_ANNOTATION: &str = "configmanagement.gke.io/managed";
pub const MANAGEMENT_ENABLED: &str = "enabled";
pub const MANAGEMENT_DISABLED: &str = "disabled";

pub const MANAGER_ANNOTATION: &str = "configsync.gke.io/manager";
pub const RESOURCE_ID_ANNOTATION: &str = "configsync.gke.io/resource-id";
pub const SOURCE_PATH_ANNOTATION: &str = "configmanagement.gke.io/source-path";
pub const TOKEN_ANNOTATION: &str = "configmanagement.gke.io/token";
pub const OWNING_INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";

/// Objects carrying `deletion: detach` are left on the cluster when pruned.
pub const LIFECYCLE_DELETION_ANNOTATION: &str = "client.lifecycle.config.k8s.io/deletion";
pub const LIFECYCLE_DETACH: &str = "detach";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "configmanagement.gke.io";
pub const DECLARED_VERSION_LABEL: &str = "configsync.gke.io/declared-version";
pub const INVENTORY_ID_LABEL: &str = "cli-utils.sigs.k8s.io/inventory-id";

/// Namespaces the reconciler never deletes; pruning them leaves the object behind.
pub const PROTECTED_NAMESPACES: [&str; 5] = ["default", "kube-system", "kube-public", "kube-node-lease", "gatekeeper-system"];

pub fn is_protected_namespace(name: &str) -> bool { PROTECTED_NAMESPACES.contains(&name) }

const OWNED_ANNOTATION_PREFIXES: [&str; 2] = ["configmanagement.gke.io/", "configsync.gke.io/"];

pub fn is_owned_annotation(key: &str) -> bool {
    key == OWNING_INVENTORY_ANNOTATION || OWNED_ANNOTATION_PREFIXES.iter().any(|p| key.starts_with(p))
}

pub fn is_owned_label(key: &str, value: &str) -> bool {
    (key == MANAGED_BY_LABEL && value == MANAGED_BY_VALUE) || key == DECLARED_VERSION_LABEL
}

pub fn has_owned_metadata(labels: &BTreeMap<String, String>, annotations: &BTreeMap<String, String>) -> bool {
    labels.iter().any(|(k, v)| is_owned_label(k, v)) || annotations.keys().any(|k| is_owned_annotation(k))
}

/// Return `(labels, annotations)` with every reconciler-owned key removed.
pub fn strip_owned(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let labels = labels.iter().filter(|(k, v)| !is_owned_label(k, v)).map(|(k, v)| (k.clone(), v.clone())).collect();
    let annotations = annotations.iter().filter(|(k, _)| !is_owned_annotation(k)).map(|(k, v)| (k.clone(), v.clone())).collect();
    (labels, annotations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn strips_only_owned_keys() {
        let labels = map(&[(MANAGED_BY_LABEL, MANAGED_BY_VALUE), (DECLARED_VERSION_LABEL, "v1"), ("team", "a")]);
        let annos = map(&[
            (MANAGEMENT_ANNOTATION, MANAGEMENT_DISABLED),
            (MANAGER_ANNOTATION, ":root_root-sync"),
            (OWNING_INVENTORY_ANNOTATION, "config-management-system_root-sync"),
            ("example.com/keep", "yes"),
        ]);
        assert!(has_owned_metadata(&labels, &annos));
        let (l, a) = strip_owned(&labels, &annos);
        assert_eq!(l, map(&[("team", "a")]));
        assert_eq!(a, map(&[("example.com/keep", "yes")]));
        assert!(!has_owned_metadata(&l, &a));
    }

    #[test]
    fn foreign_managed_by_label_is_kept() {
        let labels = map(&[(MANAGED_BY_LABEL, "helm")]);
        assert!(!has_owned_metadata(&labels, &BTreeMap::new()));
    }
}
