//! The control loop: timers decide when to run, a run reads, parses, applies,
//! reports status and then checkpoints or invalidates.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use driftless_apply::Applier;
use driftless_core::status::{summarize, SourceStatus, SyncStatus};
use driftless_core::{ErrorClass, ErrorTaxonomy, MultiError, SyncError, SyncRef};
use driftless_kubehub::StatusWriter;
use driftless_source::{Parser, SourceReader};
use driftless_store::{Phase, ReconcilerState, StateHandle};
use metrics::{counter, histogram};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::remediator::Remediator;

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// How often to look for a new commit.
    pub poll_period: Duration,
    /// How often to re-run everything regardless of the source.
    pub resync_period: Duration,
    /// How often to check for a due retry or a watch that needs attention.
    pub retry_period: Duration,
    /// How often to re-assert the last computed status.
    pub status_period: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(15),
            resync_period: Duration::from_secs(3600),
            retry_period: Duration::from_secs(1),
            status_period: Duration::from_secs(60),
        }
    }
}

/// Why a run started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Resync,
    Poll,
    ManagementConflict,
    Retry,
    WatchUpdate,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Resync => "resync",
            Trigger::Poll => "poll",
            Trigger::ManagementConflict => "management-conflict",
            Trigger::Retry => "retry",
            Trigger::WatchUpdate => "watch-update",
        }
    }
}

/// Collaborators one reconciler needs.
pub struct Parts {
    pub reader: Arc<dyn SourceReader>,
    pub parser: Arc<dyn Parser>,
    pub applier: Arc<Applier>,
    pub remediator: Arc<dyn Remediator>,
    pub status: Arc<dyn StatusWriter>,
}

pub struct Reconciler {
    sync: SyncRef,
    opts: ReconcilerOptions,
    parts: Parts,
    taxonomy: ErrorTaxonomy,
    state: ReconcilerState,
    /// Latest sync status computed, written or not.
    pending_sync: Option<SyncStatus>,
}

impl Reconciler {
    pub fn new(sync: SyncRef, opts: ReconcilerOptions, parts: Parts, taxonomy: ErrorTaxonomy) -> Self {
        Self { sync, opts, parts, taxonomy, state: ReconcilerState::new(), pending_sync: None }
    }

    pub fn handle(&self) -> StateHandle { self.state.handle() }
    pub fn state(&self) -> &ReconcilerState { &self.state }

    /// Run until `shutdown` resolves. A run in progress always finishes first.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut poll = tokio::time::interval(self.opts.poll_period);
        let mut resync = tokio::time::interval(self.opts.resync_period);
        let mut retry = tokio::time::interval(self.opts.retry_period);
        let mut status = tokio::time::interval(self.opts.status_period);
        for t in [&mut poll, &mut resync, &mut retry, &mut status] {
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // Only poll fires right away; the others start one period in.
        resync.reset();
        retry.reset();
        status.reset();
        info!(sync = %self.sync, "reconciler started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = resync.tick() => self.run_cycle(Trigger::Resync).await,
                _ = poll.tick() => self.run_cycle(Trigger::Poll).await,
                _ = retry.tick() => {
                    if let Some(t) = self.due_trigger(Instant::now()) {
                        self.run_cycle(t).await;
                    }
                }
                _ = status.tick() => self.heartbeat().await,
            }
        }
        info!(sync = %self.sync, "reconciler stopped");
    }

    /// Conflict beats a failed-cycle retry, which beats a watch refresh.
    pub fn due_trigger(&self, now: Instant) -> Option<Trigger> {
        if self.parts.remediator.management_conflict() {
            Some(Trigger::ManagementConflict)
        } else if self.state.cache.ready_to_retry(now) {
            Some(Trigger::Retry)
        } else if self.parts.remediator.needs_update() {
            Some(Trigger::WatchUpdate)
        } else {
            None
        }
    }

    pub async fn run_cycle(&mut self, trigger: Trigger) {
        let started = std::time::Instant::now();
        if matches!(trigger, Trigger::Resync | Trigger::ManagementConflict) {
            self.state.reset_partial();
        }

        self.state.enter(Phase::Reading);
        let source = match self.parts.reader.read() {
            Ok(s) => s,
            Err(e) => {
                let err = SyncError::Source { message: format!("{:#}", e) };
                let mut errs = MultiError::from(err);
                let commit = self.state.cache.source.commit.clone();
                if let Err(e) = self.write_source(SourceStatus { commit, errors: summarize(&errs) }).await {
                    errs.push(e);
                }
                self.fail(trigger, errs);
                return;
            }
        };
        let new_commit = self.state.observe_source(source);
        if trigger == Trigger::Poll && !new_commit && (self.state.last_applied().is_some() || self.state.cache.need_to_retry) {
            debug!(sync = %self.sync, commit = %self.state.cache.source.commit, "nothing new to sync");
            return;
        }
        counter!("reconcile_cycles_total", 1u64, "trigger" => trigger.as_str());
        let commit = self.state.cache.source.commit.clone();
        info!(sync = %self.sync, %commit, trigger = trigger.as_str(), "sync started");

        self.state.enter(Phase::Parsing);
        let objects = match self.state.cache.parsed.clone() {
            Some(objs) => objs,
            None => {
                let (objs, mut errs) = self.parts.parser.parse(&self.state.cache.source);
                let status = SourceStatus { commit: commit.clone(), errors: summarize(&errs) };
                if let Err(e) = self.write_source(status).await {
                    errs.push(e);
                }
                if !errs.is_empty() {
                    self.fail(trigger, errs);
                    return;
                }
                self.state.cache.parsed = Some(objs.clone());
                objs
            }
        };

        self.state.enter(Phase::Updating);
        let (gvks, mut errs) = self.parts.applier.apply(&objects).await;
        let (watched, watch_errs) = self.parts.remediator.update(&objects, &gvks).await;
        errs.extend(watch_errs);
        debug!(sync = %self.sync, applied = gvks.len(), watched = watched.len(), "update finished");
        self.state.cache.applied = Some(gvks);

        let sync_status = SyncStatus {
            commit: commit.clone(),
            errors: summarize(&errs),
            last_update: Some(chrono::Utc::now().to_rfc3339()),
        };
        self.pending_sync = Some(sync_status.clone());
        if let Err(e) = self.write_sync(sync_status).await {
            errs.push(e);
        }

        histogram!("reconcile_cycle_ms", started.elapsed().as_secs_f64() * 1000.0);
        if errs.is_empty() {
            self.state.checkpoint();
            info!(sync = %self.sync, %commit, ms = started.elapsed().as_millis() as u64, "sync succeeded");
        } else {
            self.fail(trigger, errs);
        }
    }

    fn fail(&mut self, trigger: Trigger, errs: MultiError) {
        for e in errs.iter() {
            let summary = self.taxonomy.describe(e).map(|t| t.summary).unwrap_or("");
            warn!(sync = %self.sync, code = e.code(), class = e.class().as_str(), summary, error = %e, "sync error");
        }
        let conflict = errs.has_class(ErrorClass::ManagementConflict);
        counter!("reconcile_errors_total", errs.len() as u64, "trigger" => trigger.as_str());
        self.state.invalidate(errs);
        if conflict {
            self.state.reset_partial();
        }
    }

    async fn write_source(&mut self, status: SourceStatus) -> Result<(), SyncError> {
        match self.parts.status.write_source(&status).await {
            Ok(()) => {
                self.state.source_status = Some(status);
                Ok(())
            }
            Err(e) => Err(SyncError::Status { message: e.to_string() }),
        }
    }

    async fn write_sync(&mut self, status: SyncStatus) -> Result<(), SyncError> {
        match self.parts.status.write_sync(&status).await {
            Ok(()) => {
                self.state.sync_status = Some(status);
                Ok(())
            }
            Err(e) => Err(SyncError::Status { message: e.to_string() }),
        }
    }

    /// Re-assert the latest status. The writer skips it when nothing changed, so
    /// in practice this repairs failed or overwritten status writes.
    pub async fn heartbeat(&mut self) {
        let Some(pending) = self.pending_sync.clone() else { return };
        match self.write_sync(pending).await {
            Ok(()) => debug!(sync = %self.sync, "status re-asserted"),
            Err(e) => warn!(sync = %self.sync, error = %e, "status heartbeat failed"),
        }
    }
}
