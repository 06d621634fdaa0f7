//! Typed reconcile errors, their aggregate, and the code/class taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Gvk, ObjectIdentity};

/// How an error should be treated by the retry machinery and by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Expected to clear on its own; retried on the fast schedule.
    Transient,
    /// Two scopes declare the same object.
    ManagementConflict,
    /// Aborts the stage it happened in.
    Structural,
    /// One object failed; siblings were still processed.
    PerObject,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::ManagementConflict => "management-conflict",
            ErrorClass::Structural => "structural",
            ErrorClass::PerObject => "per-object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("failed to read source: {message}")]
    Source { message: String },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid object in {path}: {message}")]
    Validation { path: String, message: String },
    #[error("failed to convert {id} for apply: {message}")]
    Conversion { id: ObjectIdentity, message: String },
    #[error("failed to load inventory {inventory}: {message}")]
    InventoryLoad { inventory: String, message: String },
    #[error("failed to write inventory {inventory}: {message}")]
    InventoryWrite { inventory: String, message: String },
    #[error("{id}: resource type is not registered on the cluster: {message}")]
    UnknownKind { id: ObjectIdentity, message: String },
    #[error("{id} is declared by {requesting} but is managed by {current}; remove the declaration from one of them")]
    ManagementConflict { id: ObjectIdentity, current: String, requesting: String },
    #[error("failed to apply {id}: {message}")]
    Apply { id: ObjectIdentity, message: String },
    #[error("failed to prune {id}: {message}")]
    Prune { id: ObjectIdentity, message: String },
    #[error("failed to disable management of {id}: {message}")]
    Disable { id: ObjectIdentity, message: String },
    #[error("apply engine error: {message}")]
    Engine { message: String },
    #[error("failed to update status: {message}")]
    Status { message: String },
    #[error("failed to update watch for {gvk}: {message}")]
    Watch { gvk: Gvk, message: String },
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Source { .. } => "DL2004",
            SyncError::Parse { .. } => "DL1006",
            SyncError::Validation { .. } => "DL1007",
            SyncError::Conversion { .. } => "DL2015",
            SyncError::InventoryLoad { .. } => "DL2016",
            SyncError::InventoryWrite { .. } => "DL2017",
            SyncError::UnknownKind { .. } => "DL1021",
            SyncError::ManagementConflict { .. } => "DL1060",
            SyncError::Apply { .. } => "DL2009",
            SyncError::Prune { .. } => "DL2011",
            SyncError::Disable { .. } => "DL2012",
            SyncError::Engine { .. } => "DL2013",
            SyncError::Status { .. } => "DL2014",
            SyncError::Watch { .. } => "DL2018",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::ManagementConflict { .. } => ErrorClass::ManagementConflict,
            SyncError::Parse { .. }
            | SyncError::Validation { .. }
            | SyncError::Conversion { .. }
            | SyncError::InventoryLoad { .. } => ErrorClass::Structural,
            SyncError::Source { .. }
            | SyncError::UnknownKind { .. }
            | SyncError::Engine { .. }
            | SyncError::Status { .. }
            | SyncError::Watch { .. } => ErrorClass::Transient,
            SyncError::InventoryWrite { message, .. }
            | SyncError::Apply { message, .. }
            | SyncError::Prune { message, .. }
            | SyncError::Disable { message, .. } => {
                if is_transient_message(message) { ErrorClass::Transient } else { ErrorClass::PerObject }
            }
        }
    }

    /// Inventory write error, with a hint appended for oversized payloads.
    pub fn inventory_write(inventory: &str, message: &str) -> Self {
        let message = if is_request_too_large(message) {
            format!("{}; the inventory has outgrown the object size limit, split the source into more RootSyncs/RepoSyncs", message)
        } else {
            message.to_string()
        };
        SyncError::InventoryWrite { inventory: inventory.to_string(), message }
    }
}

const TOO_LARGE_SIGNATURES: [&str; 4] = [
    "etcdserver: request is too large",
    "Request entity too large",
    "trying to send message larger than max",
    "must have at most 1048576 bytes",
];

/// Heuristic match of API server errors caused by oversized payloads.
pub fn is_request_too_large(message: &str) -> bool {
    TOO_LARGE_SIGNATURES.iter().any(|s| message.contains(s))
}

const TRANSIENT_SIGNATURES: [&str; 5] = [
    "the server is currently unable to handle the request",
    "too many requests",
    "connection refused",
    "i/o timeout",
    "the object has been modified",
];

fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    is_request_too_large(message) || TRANSIENT_SIGNATURES.iter().any(|s| lower.contains(s))
}

/// Ordered collection of errors from one cycle.
///
/// Equality is structural and order-insensitive, so two cycles that hit the
/// same failures in a different order compare equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiError {
    errors: Vec<SyncError>,
}

impl MultiError {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, e: SyncError) { self.errors.push(e); }

    pub fn extend(&mut self, other: MultiError) { self.errors.extend(other.errors); }

    pub fn is_empty(&self) -> bool { self.errors.is_empty() }
    pub fn len(&self) -> usize { self.errors.len() }
    pub fn iter(&self) -> std::slice::Iter<'_, SyncError> { self.errors.iter() }
    pub fn into_vec(self) -> Vec<SyncError> { self.errors }

    pub fn has_class(&self, class: ErrorClass) -> bool { self.errors.iter().any(|e| e.class() == class) }

    pub fn management_conflicts(&self) -> impl Iterator<Item = &SyncError> {
        self.errors.iter().filter(|e| matches!(e, SyncError::ManagementConflict { .. }))
    }

    /// `Ok(())` when empty.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    fn sorted(&self) -> Vec<&SyncError> {
        let mut v: Vec<&SyncError> = self.errors.iter().collect();
        v.sort();
        v
    }
}

impl PartialEq for MultiError {
    fn eq(&self, other: &Self) -> bool {
        self.errors.len() == other.errors.len() && self.sorted() == other.sorted()
    }
}

impl Eq for MultiError {}

impl From<SyncError> for MultiError {
    fn from(e: SyncError) -> Self { Self { errors: vec![e] } }
}

impl FromIterator<SyncError> for MultiError {
    fn from_iter<I: IntoIterator<Item = SyncError>>(iter: I) -> Self { Self { errors: iter.into_iter().collect() } }
}

impl IntoIterator for MultiError {
    type Item = SyncError;
    type IntoIter = std::vec::IntoIter<SyncError>;
    fn into_iter(self) -> Self::IntoIter { self.errors.into_iter() }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no errors"),
            [one] => write!(f, "{}: {}", one.code(), one),
            many => {
                write!(f, "{} errors:", many.len())?;
                for e in many {
                    write!(f, " [{}] {};", e.code(), e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

/// One documented error code.
#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyEntry {
    pub code: &'static str,
    pub class: ErrorClass,
    pub summary: &'static str,
}

/// Table of every error code the reconciler can report.
///
/// Built once and handed to whoever needs to describe errors; nothing at
/// runtime depends on it.
#[derive(Debug, Clone)]
pub struct ErrorTaxonomy {
    entries: Vec<TaxonomyEntry>,
}

impl ErrorTaxonomy {
    pub fn new(entries: Vec<TaxonomyEntry>) -> Self { Self { entries } }

    pub fn standard() -> Self {
        let e = |code, class, summary| TaxonomyEntry { code, class, summary };
        Self::new(vec![
            e("DL1006", ErrorClass::Structural, "a manifest file could not be parsed"),
            e("DL1007", ErrorClass::Structural, "a declared object failed validation"),
            e("DL1021", ErrorClass::Transient, "the object's kind is not registered yet (CRD pending)"),
            e("DL1060", ErrorClass::ManagementConflict, "the object is already managed by another RootSync/RepoSync"),
            e("DL2004", ErrorClass::Transient, "the source repository could not be read consistently"),
            e("DL2009", ErrorClass::PerObject, "applying one object failed"),
            e("DL2011", ErrorClass::PerObject, "pruning one object failed"),
            e("DL2012", ErrorClass::PerObject, "releasing one disabled object failed"),
            e("DL2013", ErrorClass::Transient, "the apply engine reported a failure"),
            e("DL2014", ErrorClass::Transient, "the RootSync/RepoSync status could not be written"),
            e("DL2015", ErrorClass::Structural, "an object could not be converted for apply"),
            e("DL2016", ErrorClass::Structural, "the inventory could not be loaded"),
            e("DL2017", ErrorClass::PerObject, "the inventory could not be written"),
            e("DL2018", ErrorClass::Transient, "a drift watch could not be started"),
        ])
    }

    pub fn entries(&self) -> &[TaxonomyEntry] { &self.entries }

    pub fn lookup(&self, code: &str) -> Option<&TaxonomyEntry> { self.entries.iter().find(|e| e.code == code) }

    pub fn describe(&self, err: &SyncError) -> Option<&TaxonomyEntry> { self.lookup(err.code()) }
}

impl Default for ErrorTaxonomy {
    fn default() -> Self { Self::standard() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ObjectIdentity { ObjectIdentity::new("rbac.authorization.k8s.io", "Role", Some("a"), name) }

    #[test]
    fn multi_error_equality_ignores_order() {
        let a: MultiError = vec![
            SyncError::Apply { id: id("x"), message: "boom".into() },
            SyncError::Prune { id: id("y"), message: "nope".into() },
        ]
        .into_iter()
        .collect();
        let b: MultiError = vec![
            SyncError::Prune { id: id("y"), message: "nope".into() },
            SyncError::Apply { id: id("x"), message: "boom".into() },
        ]
        .into_iter()
        .collect();
        assert_eq!(a, b);
        let c: MultiError = SyncError::Apply { id: id("x"), message: "boom".into() }.into();
        assert_ne!(a, c);
        assert_eq!(MultiError::new(), MultiError::default());
    }

    #[test]
    fn request_too_large_is_detected_and_hinted() {
        let e = SyncError::inventory_write("ns_repo", "etcdserver: request is too large");
        assert!(e.to_string().contains("outgrown"));
        assert_eq!(e.class(), ErrorClass::Transient);
        let plain = SyncError::inventory_write("ns_repo", "forbidden");
        assert_eq!(plain.class(), ErrorClass::PerObject);
    }

    #[test]
    fn conflict_message_names_both_managers() {
        let e = SyncError::ManagementConflict { id: id("y"), current: "ns-b_repo-sync".into(), requesting: ":root_root-sync".into() };
        let s = e.to_string();
        assert!(s.contains("ns-b_repo-sync") && s.contains(":root_root-sync"), "s={}", s);
        assert_eq!(e.class(), ErrorClass::ManagementConflict);
    }

    #[test]
    fn every_code_is_documented() {
        let t = ErrorTaxonomy::standard();
        let samples = vec![
            SyncError::Source { message: String::new() },
            SyncError::Parse { path: String::new(), message: String::new() },
            SyncError::Validation { path: String::new(), message: String::new() },
            SyncError::Conversion { id: id("a"), message: String::new() },
            SyncError::InventoryLoad { inventory: String::new(), message: String::new() },
            SyncError::InventoryWrite { inventory: String::new(), message: String::new() },
            SyncError::UnknownKind { id: id("a"), message: String::new() },
            SyncError::ManagementConflict { id: id("a"), current: String::new(), requesting: String::new() },
            SyncError::Apply { id: id("a"), message: String::new() },
            SyncError::Prune { id: id("a"), message: String::new() },
            SyncError::Disable { id: id("a"), message: String::new() },
            SyncError::Engine { message: String::new() },
            SyncError::Status { message: String::new() },
            SyncError::Watch { gvk: Gvk::new("", "v1", "ConfigMap"), message: String::new() },
        ];
        for s in samples {
            assert!(t.describe(&s).is_some(), "undocumented code {}", s.code());
        }
    }
}
