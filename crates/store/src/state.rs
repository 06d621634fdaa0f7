//! Checkpoint/invalidate state machine over the reconcile cache, plus a
//! lock-free snapshot of the outcome for readers outside the control loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use driftless_core::status::{summarize, ErrorSummary, SourceStatus, SyncStatus};
use driftless_core::{MultiError, SourceState};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backoff::retry_delay;
use crate::cache::ReconcileCache;

/// Stage of the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Reading,
    Parsing,
    Updating,
    Checkpointed,
    Invalidated,
}

/// What readers see after each checkpoint/invalidate.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub epoch: u64,
    pub phase: Phase,
    pub commit: String,
    pub last_applied: Option<PathBuf>,
    pub same_error_count: u32,
    pub errors: Vec<ErrorSummary>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self { epoch: 0, phase: Phase::Idle, commit: String::new(), last_applied: None, same_error_count: 0, errors: vec![] }
    }
}

/// Read side of [`ReconcilerState`].
#[derive(Clone)]
pub struct StateHandle {
    snap: Arc<ArcSwap<StateSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StateHandle {
    pub fn current(&self) -> Arc<StateSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

pub struct ReconcilerState {
    pub cache: ReconcileCache,
    phase: Phase,
    last_applied: Option<PathBuf>,
    /// Last statuses successfully written.
    pub source_status: Option<SourceStatus>,
    pub sync_status: Option<SyncStatus>,
    snap: Arc<ArcSwap<StateSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    epoch: u64,
}

impl Default for ReconcilerState {
    fn default() -> Self { Self::new() }
}

impl ReconcilerState {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            cache: ReconcileCache::default(),
            phase: Phase::Idle,
            last_applied: None,
            source_status: None,
            sync_status: None,
            snap: Arc::new(ArcSwap::from_pointee(StateSnapshot::default())),
            epoch_tx,
            epoch: 0,
        }
    }

    pub fn handle(&self) -> StateHandle {
        StateHandle { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_tx.subscribe() }
    }

    pub fn phase(&self) -> Phase { self.phase }
    pub fn enter(&mut self, phase: Phase) { self.phase = phase; }

    pub fn last_applied(&self) -> Option<&Path> { self.last_applied.as_deref() }

    /// Install a fresh source read. A new commit resets the whole cache;
    /// the same commit only refreshes the file list.
    pub fn observe_source(&mut self, source: SourceState) -> bool {
        let changed = self.cache.source.commit != source.commit || self.cache.source.policy_dir != source.policy_dir;
        if changed {
            debug!(old = %self.cache.source.commit, new = %source.commit, "new commit; resetting cache");
            self.cache.reset_all();
        }
        self.cache.source = source;
        changed
    }

    /// Clear the cache except for the source read.
    pub fn reset_partial(&mut self) { self.cache.reset_partial(); }

    /// Record a fully successful cycle for the cached policy dir.
    pub fn checkpoint(&mut self) {
        self.phase = Phase::Checkpointed;
        let applied = self.cache.source.policy_dir.clone();
        if self.last_applied.as_ref() == Some(&applied) {
            return;
        }
        info!(commit = %self.cache.source.commit, dir = %applied.display(), "checkpointed");
        self.last_applied = Some(applied);
        self.cache.need_to_retry = false;
        self.cache.same_error_count = 0;
        self.cache.next_retry = None;
        self.cache.errs = MultiError::new();
        gauge!("last_sync_timestamp_seconds", chrono::Utc::now().timestamp() as f64);
        self.publish();
    }

    /// Record a failed cycle and schedule the retry.
    pub fn invalidate(&mut self, errs: MultiError) { self.invalidate_at(errs, Instant::now()) }

    pub fn invalidate_at(&mut self, errs: MultiError, now: Instant) {
        self.phase = Phase::Invalidated;
        self.last_applied = None;
        self.cache.need_to_retry = true;
        if !self.cache.errs.is_empty() && self.cache.errs == errs {
            self.cache.same_error_count = self.cache.same_error_count.saturating_add(1);
        } else {
            self.cache.same_error_count = 1;
        }
        self.cache.errs = errs;
        let delay = retry_delay(self.cache.same_error_count);
        self.cache.next_retry = Some(now + delay);
        counter!("cycles_invalidated_total", 1u64);
        gauge!("retry_delay_seconds", delay.as_secs_f64());
        debug!(count = self.cache.same_error_count, delay_ms = delay.as_millis() as u64, "invalidated");
        self.publish();
    }

    fn publish(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
        self.snap.store(Arc::new(StateSnapshot {
            epoch: self.epoch,
            phase: self.phase,
            commit: self.cache.source.commit.clone(),
            last_applied: self.last_applied.clone(),
            same_error_count: self.cache.same_error_count,
            errors: summarize(&self.cache.errs),
        }));
        let _ = self.epoch_tx.send(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftless_core::SyncError;
    use std::time::Duration;

    fn source(commit: &str) -> SourceState {
        SourceState { commit: commit.into(), policy_dir: PathBuf::from(format!("/repo/{}", commit)), files: vec![] }
    }

    fn errs(msgs: &[&str]) -> MultiError {
        msgs.iter().map(|m| SyncError::Source { message: m.to_string() }).collect()
    }

    #[test]
    fn checkpoint_sets_last_applied_and_clears_retry() {
        let mut st = ReconcilerState::new();
        st.observe_source(source("a"));
        st.invalidate(errs(&["x"]));
        assert!(st.last_applied().is_none());
        assert!(st.cache.need_to_retry);
        st.checkpoint();
        assert_eq!(st.last_applied(), Some(Path::new("/repo/a")));
        assert!(!st.cache.need_to_retry);
        assert_eq!(st.cache.same_error_count, 0);
        assert!(st.cache.errs.is_empty());
        assert_eq!(st.phase(), Phase::Checkpointed);
    }

    #[test]
    fn identical_errors_count_up_in_any_order() {
        let mut st = ReconcilerState::new();
        let now = Instant::now();
        st.invalidate_at(errs(&["a", "b"]), now);
        st.invalidate_at(errs(&["b", "a"]), now);
        assert_eq!(st.cache.same_error_count, 2);
        for _ in 0..5 {
            st.invalidate_at(errs(&["a", "b"]), now);
        }
        assert_eq!(st.cache.same_error_count, 7);
        assert_eq!(st.cache.next_retry, Some(now + Duration::from_secs(4)));
        st.invalidate_at(errs(&["c"]), now);
        assert_eq!(st.cache.same_error_count, 1);
        assert_eq!(st.cache.next_retry, Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn new_commit_resets_cache_and_backoff() {
        let mut st = ReconcilerState::new();
        assert!(st.observe_source(source("a")));
        st.invalidate(errs(&["x"]));
        assert!(!st.observe_source(source("a")));
        assert!(st.cache.need_to_retry);
        assert!(st.observe_source(source("b")));
        assert!(!st.cache.need_to_retry);
        assert_eq!(st.cache.same_error_count, 0);
    }

    #[tokio::test]
    async fn handle_sees_published_snapshots() {
        let mut st = ReconcilerState::new();
        let h = st.handle();
        let mut rx = h.subscribe_epoch();
        st.observe_source(source("a"));
        st.invalidate(errs(&["boom"]));
        rx.changed().await.unwrap();
        let snap = h.current();
        assert_eq!(snap.phase, Phase::Invalidated);
        assert_eq!(snap.errors.len(), 1);
        st.checkpoint();
        let snap = h.current();
        assert_eq!(snap.phase, Phase::Checkpointed);
        assert_eq!(snap.commit, "a");
        assert!(snap.errors.is_empty());
    }
}
