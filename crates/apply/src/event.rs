//! Event stream contract between the driver and an apply engine.

use std::collections::BTreeSet;
use std::fmt;

use driftless_core::{Gvk, ObjectIdentity};
use driftless_kubehub::InventoryRef;
use kube::core::DynamicObject;
use tokio::sync::mpsc;

/// Outcome of one apply or prune step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Configured,
    Unchanged,
    Pruned,
    /// The engine deliberately left the object alone.
    Skipped,
    Failed,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Created => "created",
            Operation::Configured => "configured",
            Operation::Unchanged => "unchanged",
            Operation::Pruned => "pruned",
            Operation::Skipped => "skipped",
            Operation::Failed => "failed",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The object's type is not served by the cluster.
    UnknownType(String),
    /// The live object belongs to another inventory.
    InventoryOverlap(String),
    Other(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UnknownType(m) | EngineError::InventoryOverlap(m) | EngineError::Other(m) => f.write_str(m),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub id: ObjectIdentity,
    /// Version may be empty for prune events, which only know group and kind.
    pub gvk: Gvk,
    pub operation: Operation,
    /// Live object as seen by the engine, when it has one.
    pub object: Option<DynamicObject>,
    pub error: Option<EngineError>,
}

impl ResourceEvent {
    pub fn ok(id: ObjectIdentity, gvk: Gvk, operation: Operation, object: Option<DynamicObject>) -> Self {
        Self { id, gvk, operation, object, error: None }
    }

    pub fn failed(id: ObjectIdentity, gvk: Gvk, error: EngineError, object: Option<DynamicObject>) -> Self {
        Self { id, gvk, operation: Operation::Failed, object, error: Some(error) }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.object.as_ref()?.metadata.annotations.as_ref()?.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Run-level failure; the engine stops after sending it.
    Error { message: String },
    Wait { id: ObjectIdentity, message: String },
    Apply(ResourceEvent),
    Prune(ResourceEvent),
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub server_side: bool,
    pub force_conflicts: bool,
    pub field_manager: String,
    /// Inventory members that must survive this run even though they are not
    /// in the object list, e.g. disabled objects whose release is still pending.
    pub retain: BTreeSet<ObjectIdentity>,
}

impl ApplyOptions {
    pub fn server_side(field_manager: &str) -> Self {
        Self { server_side: true, force_conflicts: true, field_manager: field_manager.to_string(), retain: BTreeSet::new() }
    }

    pub fn retaining(mut self, ids: impl IntoIterator<Item = ObjectIdentity>) -> Self {
        self.retain = ids.into_iter().collect();
        self
    }
}

/// Applies a set of objects against an inventory and reports progress as events.
/// The stream ends when the returned receiver yields `None`.
pub trait ApplyEngine: Send + Sync {
    fn run(&self, inventory: &InventoryRef, objects: Vec<DynamicObject>, options: &ApplyOptions) -> mpsc::Receiver<Event>;
}
