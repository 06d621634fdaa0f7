//! Coalescing queue for watch deltas: the latest delta per object wins,
//! first-seen order is kept, and the oldest entry is dropped at capacity.

use std::collections::VecDeque;

use driftless_core::{Delta, ObjectIdentity};
use rustc_hash::FxHashMap;

pub struct Coalescer {
    map: FxHashMap<ObjectIdentity, Delta>,
    order: VecDeque<ObjectIdentity>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    /// Deltas without a name can't be keyed and are ignored.
    pub fn push(&mut self, d: Delta) {
        let Some(id) = d.identity() else { return };
        if !self.map.contains_key(&id) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(id.clone());
        }
        self.map.insert(id, d);
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&id) {
                out.push(d);
            }
        }
        out
    }
}
