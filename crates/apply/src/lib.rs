//! driftless apply: server-side apply of a declared set against a per-scope
//! inventory, with pruning, management release and event classification.

#![forbid(unsafe_code)]

pub mod applier;
pub mod classify;
pub mod disable;
pub mod engine;
pub mod event;

pub use applier::Applier;
pub use classify::{Classified, EventClassifier, OpStats, SyncStats};
pub use disable::{default_update_kinds, DisableHandler};
pub use engine::{diff_summary, strip_noisy, DiffSummary, SsaEngine};
pub use event::{ApplyEngine, ApplyOptions, EngineError, Event, Operation, ResourceEvent};
