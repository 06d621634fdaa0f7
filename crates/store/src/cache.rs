//! Per-commit memoization of parse/apply progress and retry bookkeeping.

use std::collections::BTreeSet;

use driftless_core::{DesiredObject, Gvk, MultiError, SourceState};
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct ReconcileCache {
    pub source: SourceState,
    /// Parser output for `source`; `None` until a parse succeeds.
    pub parsed: Option<Vec<DesiredObject>>,
    /// GVKs the last successful update covered; `None` until one succeeds.
    pub applied: Option<BTreeSet<Gvk>>,
    pub need_to_retry: bool,
    pub same_error_count: u32,
    pub next_retry: Option<Instant>,
    pub errs: MultiError,
}

impl ReconcileCache {
    /// New commit: nothing carries over.
    pub fn reset_all(&mut self) { *self = Self::default(); }

    /// Forced resync or management conflict: back to empty except the source
    /// read, so the next run re-parses the same commit from scratch.
    pub fn reset_partial(&mut self) {
        let source = std::mem::take(&mut self.source);
        *self = Self { source, ..Self::default() };
    }

    pub fn is_parsed(&self) -> bool { self.parsed.is_some() }

    /// True when a failed cycle is waiting and its backoff has elapsed.
    pub fn ready_to_retry(&self, now: Instant) -> bool {
        self.need_to_retry && self.next_retry.map(|t| t <= now).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn loaded() -> ReconcileCache {
        ReconcileCache {
            source: SourceState { commit: "abc".into(), policy_dir: PathBuf::from("/repo/abc"), files: vec![] },
            parsed: Some(vec![]),
            applied: Some(BTreeSet::new()),
            need_to_retry: true,
            same_error_count: 3,
            next_retry: Some(Instant::now()),
            errs: MultiError::new(),
        }
    }

    #[test]
    fn partial_reset_keeps_only_source() {
        let mut c = loaded();
        c.errs.push(driftless_core::SyncError::Source { message: "x".into() });
        c.reset_partial();
        assert_eq!(c.source.commit, "abc");
        assert_eq!(c.source.policy_dir, PathBuf::from("/repo/abc"));
        assert!(c.parsed.is_none() && c.applied.is_none());
        assert_eq!(c.same_error_count, 0);
        assert!(!c.need_to_retry);
        assert!(c.next_retry.is_none());
        assert!(c.errs.is_empty());
    }

    #[test]
    fn full_reset_clears_everything() {
        let mut c = loaded();
        c.reset_all();
        assert!(c.source.commit.is_empty());
        assert_eq!(c.same_error_count, 0);
        assert!(!c.need_to_retry);
    }

    #[test]
    fn retry_waits_for_deadline() {
        let now = Instant::now();
        let mut c = ReconcileCache { need_to_retry: true, next_retry: Some(now + Duration::from_secs(2)), ..Default::default() };
        assert!(!c.ready_to_retry(now));
        assert!(c.ready_to_retry(now + Duration::from_secs(2)));
        c.need_to_retry = false;
        assert!(!c.ready_to_retry(now + Duration::from_secs(5)));
    }
}
