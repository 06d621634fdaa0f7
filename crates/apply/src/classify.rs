//! Turns the engine's event stream into typed errors and per-operation counts.

use std::collections::BTreeSet;
use std::fmt;

use driftless_core::{metadata, MultiError, ObjectIdentity, SyncError};
use metrics::counter;
use tracing::{debug, warn};

use crate::disable::DisableHandler;
use crate::event::{EngineError, Event, Operation, ResourceEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub created: u64,
    pub configured: u64,
    pub unchanged: u64,
    pub pruned: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl OpStats {
    fn record(&mut self, op: Operation) {
        match op {
            Operation::Created => self.created += 1,
            Operation::Configured => self.configured += 1,
            Operation::Unchanged => self.unchanged += 1,
            Operation::Pruned => self.pruned += 1,
            Operation::Skipped => self.skipped += 1,
            Operation::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.created + self.configured + self.unchanged + self.pruned + self.skipped + self.failed
    }
}

/// Counts for one driver cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub apply: OpStats,
    pub prune: OpStats,
    pub errors: u64,
    pub waits: u64,
    pub disabled: u64,
}

impl SyncStats {
    pub fn is_empty(&self) -> bool { *self == SyncStats::default() }
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.apply;
        write!(
            f,
            "apply: {} created, {} configured, {} unchanged, {} failed; prune: {} pruned, {} skipped, {} failed; disabled: {}",
            a.created, a.configured, a.unchanged, a.failed, self.prune.pruned, self.prune.skipped, self.prune.failed, self.disabled
        )
    }
}

#[derive(Debug, Default)]
pub struct Classified {
    pub stats: SyncStats,
    pub errors: MultiError,
    /// Objects whose type the cluster does not serve.
    pub unknown: BTreeSet<ObjectIdentity>,
    /// Objects another scope manages.
    pub conflicts: BTreeSet<ObjectIdentity>,
}

pub struct EventClassifier<'a> {
    manager: String,
    disabler: &'a DisableHandler,
    out: Classified,
}

impl<'a> EventClassifier<'a> {
    pub fn new(manager: &str, disabler: &'a DisableHandler) -> Self {
        Self { manager: manager.to_string(), disabler, out: Classified::default() }
    }

    pub async fn handle(&mut self, ev: Event) {
        match ev {
            Event::Error { message } => {
                warn!(%message, "apply engine error");
                self.out.stats.errors += 1;
                self.out.errors.push(SyncError::Engine { message });
            }
            Event::Wait { id, message } => {
                debug!(%id, %message, "waiting");
                self.out.stats.waits += 1;
            }
            Event::Apply(r) => self.on_apply(r),
            Event::Prune(r) => self.on_prune(r).await,
        }
    }

    fn on_apply(&mut self, r: ResourceEvent) {
        self.out.stats.apply.record(r.operation);
        let Some(err) = r.error.clone() else { return };
        match err {
            EngineError::UnknownType(message) => {
                self.out.unknown.insert(r.id.clone());
                self.out.errors.push(SyncError::UnknownKind { id: r.id, message });
            }
            EngineError::InventoryOverlap(message) => {
                let current = r
                    .annotation(metadata::MANAGER_ANNOTATION)
                    .or_else(|| r.annotation(metadata::OWNING_INVENTORY_ANNOTATION))
                    .unwrap_or("unknown")
                    .to_string();
                warn!(id = %r.id, %current, requesting = %self.manager, %message, "management conflict");
                counter!("management_conflicts_total", 1u64);
                self.out.conflicts.insert(r.id.clone());
                self.out.errors.push(SyncError::ManagementConflict { id: r.id, current, requesting: self.manager.clone() });
            }
            EngineError::Other(message) => self.out.errors.push(SyncError::Apply { id: r.id, message }),
        }
    }

    async fn on_prune(&mut self, r: ResourceEvent) {
        self.out.stats.prune.record(r.operation);
        if let Some(err) = &r.error {
            self.out.errors.push(SyncError::Prune { id: r.id.clone(), message: err.to_string() });
            return;
        }
        if r.operation != Operation::Skipped {
            return;
        }
        let protected = r.gvk.is_namespace() && metadata::is_protected_namespace(&r.id.name);
        let foreign = r
            .annotation(metadata::OWNING_INVENTORY_ANNOTATION)
            .map(|o| o != self.disabler.inventory().id)
            .unwrap_or(false);
        if !protected || foreign {
            return;
        }
        // A protected namespace outlives its declaration, so it must stop looking managed.
        if let Err(e) = self.disabler.strip(&r.gvk, &r.id).await {
            self.out.errors.push(SyncError::Disable { id: r.id, message: e.to_string() });
        }
    }

    pub fn finish(self) -> Classified { self.out }
}
