//! driftless store: per-commit reconcile cache, checkpoint/invalidate state,
//! retry backoff and the watch-delta coalescer.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod cache;
pub mod coalesce;
pub mod state;

pub use backoff::retry_delay;
pub use cache::ReconcileCache;
pub use coalesce::Coalescer;
pub use state::{Phase, ReconcilerState, StateHandle, StateSnapshot};
