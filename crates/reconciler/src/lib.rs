//! driftless reconciler: the per-scope control loop tying source, apply,
//! remediation and status together.

#![forbid(unsafe_code)]

pub mod reconciler;
pub mod remediator;

pub use reconciler::{Parts, Reconciler, ReconcilerOptions, Trigger};
pub use remediator::{ConflictDetector, NoopRemediator, Remediator, WatchRemediator};
