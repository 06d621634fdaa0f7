//! Watches over applied kinds, used to notice objects another reconciler
//! has taken over.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use driftless_core::{metadata, Delta, DeltaKind, DesiredObject, Gvk, MultiError, ObjectIdentity, Scope, SyncError, SyncRef};
use driftless_store::Coalescer;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Remediator: Send + Sync {
    /// Point watches at `applied` and remember `declared` for conflict checks.
    /// Returns the kinds now being watched.
    async fn update(&self, declared: &[DesiredObject], applied: &BTreeSet<Gvk>) -> (BTreeSet<Gvk>, MultiError);

    /// A watch stopped and the set of watches should be refreshed.
    fn needs_update(&self) -> bool;

    /// A declared object was seen carrying another reconciler's manager annotation.
    fn management_conflict(&self) -> bool;
}

/// Remediator that watches nothing.
#[derive(Default)]
pub struct NoopRemediator;

#[async_trait]
impl Remediator for NoopRemediator {
    async fn update(&self, _declared: &[DesiredObject], _applied: &BTreeSet<Gvk>) -> (BTreeSet<Gvk>, MultiError) {
        (BTreeSet::new(), MultiError::new())
    }
    fn needs_update(&self) -> bool { false }
    fn management_conflict(&self) -> bool { false }
}

#[derive(Default)]
struct Observed {
    declared: BTreeSet<ObjectIdentity>,
    conflict: bool,
    needs_update: bool,
    failures: HashMap<Gvk, String>,
}

/// Shared between the watch tasks and the control loop.
#[derive(Clone)]
pub struct ConflictDetector {
    manager: String,
    observed: Arc<Mutex<Observed>>,
}

impl ConflictDetector {
    pub fn new(manager: &str) -> Self { Self { manager: manager.to_string(), observed: Arc::default() } }

    fn lock(&self) -> std::sync::MutexGuard<'_, Observed> { self.observed.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn set_declared(&self, declared: BTreeSet<ObjectIdentity>) {
        let mut o = self.lock();
        o.declared = declared;
        o.conflict = false;
    }

    /// Returns the foreign manager when `d` shows a declared object managed elsewhere.
    pub fn observe(&self, d: &Delta) -> Option<String> {
        if d.kind != DeltaKind::Applied {
            return None;
        }
        let id = d.identity()?;
        let manager = d.annotation(metadata::MANAGER_ANNOTATION)?;
        if manager == self.manager {
            return None;
        }
        let mut o = self.lock();
        if !o.declared.contains(&id) {
            return None;
        }
        o.conflict = true;
        warn!(%id, current = %manager, requesting = %self.manager, "declared object is managed by another reconciler");
        counter!("management_conflicts_total", 1u64, "source" => "watch");
        Some(manager.to_string())
    }

    fn watch_failed(&self, gvk: &Gvk, message: String) {
        let mut o = self.lock();
        o.needs_update = true;
        o.failures.insert(gvk.clone(), message);
    }

    fn take_failures(&self) -> HashMap<Gvk, String> {
        let mut o = self.lock();
        o.needs_update = false;
        std::mem::take(&mut o.failures)
    }

    pub fn conflict(&self) -> bool { self.lock().conflict }
    pub fn needs_update(&self) -> bool { self.lock().needs_update }
}

fn watch_queue_cap() -> usize {
    std::env::var("DRIFTLESS_WATCH_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

/// One kube watcher per applied kind, scoped to the reconciler's namespace
/// for namespace repositories.
pub struct WatchRemediator {
    client: kube::Client,
    namespace: Option<String>,
    detector: ConflictDetector,
    watches: Mutex<HashMap<Gvk, JoinHandle<()>>>,
}

impl WatchRemediator {
    pub fn new(client: kube::Client, sync: &SyncRef) -> Self {
        let namespace = match &sync.scope {
            Scope::Root => None,
            Scope::Namespace(ns) => Some(ns.clone()),
        };
        Self { client, namespace, detector: ConflictDetector::new(&sync.manager()), watches: Mutex::new(HashMap::new()) }
    }

    fn spawn_watch(&self, gvk: Gvk) -> JoinHandle<()> {
        let cap = watch_queue_cap();
        let (tx, mut rx) = mpsc::channel::<Delta>(cap);
        let client = self.client.clone();
        let ns = self.namespace.clone();
        let detector = self.detector.clone();
        tokio::spawn(async move {
            let watch = driftless_kubehub::start_watcher(client, &gvk, ns.as_deref(), tx);
            let consume = async {
                let mut coalescer = Coalescer::with_capacity(cap);
                while let Some(d) = rx.recv().await {
                    coalescer.push(d);
                    while let Ok(d) = rx.try_recv() {
                        coalescer.push(d);
                    }
                    for d in coalescer.drain_ready() {
                        detector.observe(&d);
                    }
                }
            };
            let (res, ()) = tokio::join!(watch, consume);
            let message = match res {
                Ok(()) => "watch stream ended".to_string(),
                Err(e) => format!("{:#}", e),
            };
            warn!(gvk = %gvk, %message, "watch stopped");
            detector.watch_failed(&gvk, message);
        })
    }
}

#[async_trait]
impl Remediator for WatchRemediator {
    async fn update(&self, declared: &[DesiredObject], applied: &BTreeSet<Gvk>) -> (BTreeSet<Gvk>, MultiError) {
        self.detector.set_declared(declared.iter().map(|o| o.identity()).collect());
        let mut errs = MultiError::new();
        for (gvk, message) in self.detector.take_failures() {
            if applied.contains(&gvk) {
                errs.push(SyncError::Watch { gvk, message });
            }
        }
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        watches.retain(|gvk, handle| {
            let keep = applied.contains(gvk) && !handle.is_finished();
            if !keep {
                debug!(%gvk, "stopping watch");
                handle.abort();
            }
            keep
        });
        for gvk in applied {
            if !watches.contains_key(gvk) {
                info!(%gvk, ns = ?self.namespace, "starting watch");
                let handle = self.spawn_watch(gvk.clone());
                watches.insert(gvk.clone(), handle);
            }
        }
        (watches.keys().cloned().collect(), errs)
    }

    fn needs_update(&self) -> bool { self.detector.needs_update() }
    fn management_conflict(&self) -> bool { self.detector.conflict() }
}

impl Drop for WatchRemediator {
    fn drop(&mut self) {
        let watches = self.watches.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, h) in watches.drain() {
            h.abort();
        }
    }
}
