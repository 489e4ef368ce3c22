//! Keel store: the observed-state cache shared by reconcile workers.
//!
//! The id -> slot map lives behind an `ArcSwap`, so lookups never take a
//! lock. Each slot has its own mutex: writes to one node are serialized,
//! writes to different nodes never contend.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use keel_core::{NodeId, NodeStatus, ObservedState};
use keel_persist::StateMap;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::watch;
use tracing::debug;

/// Cached view of one node: persisted state plus the shadow copy of the remote object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeEntry {
    pub state: ObservedState,
    pub shadow: Option<Json>,
}

type Slot = Arc<Mutex<NodeEntry>>;
type SlotMap = FxHashMap<NodeId, Slot>;

pub struct ObservedCache {
    slots: ArcSwap<SlotMap>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for ObservedCache {
    fn default() -> Self { Self::new() }
}

impl ObservedCache {
    pub fn new() -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self { slots: ArcSwap::from_pointee(SlotMap::default()), epoch_tx }
    }

    /// Seed from persisted state. Shadows are not persisted, so every loaded
    /// node will resync before its first diff.
    pub fn from_persisted(rows: StateMap) -> Self {
        let me = Self::new();
        let map: SlotMap = rows
            .into_iter()
            .map(|(id, state)| (id, Arc::new(Mutex::new(NodeEntry { state, shadow: None }))))
            .collect();
        debug!(nodes = map.len(), "observed cache seeded from store");
        me.slots.store(Arc::new(map));
        me
    }

    pub fn len(&self) -> usize { self.slots.load().len() }
    pub fn is_empty(&self) -> bool { self.slots.load().is_empty() }

    pub fn contains(&self, id: &NodeId) -> bool { self.slots.load().contains_key(id) }

    fn slot(&self, id: &NodeId) -> Slot {
        if let Some(s) = self.slots.load().get(id) {
            return Arc::clone(s);
        }
        self.slots.rcu(|cur| {
            if cur.contains_key(id) {
                return Arc::clone(cur);
            }
            let mut next = (**cur).clone();
            next.insert(id.clone(), Arc::new(Mutex::new(NodeEntry::default())));
            Arc::new(next)
        });
        self.slots.load().get(id).map(Arc::clone).unwrap_or_default()
    }

    /// Copy of one node's entry; `None` if the cache has never seen it.
    pub fn get(&self, id: &NodeId) -> Option<NodeEntry> {
        let slot = self.slots.load().get(id).map(Arc::clone)?;
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        Some(guard.clone())
    }

    /// Observed state, `Unknown` for nodes never seen.
    pub fn state(&self, id: &NodeId) -> ObservedState {
        self.get(id).map(|e| e.state).unwrap_or_default()
    }

    pub fn status(&self, id: &NodeId) -> NodeStatus {
        self.state(id).status
    }

    /// Mutate one node's entry under its slot lock (created as `Unknown` if absent).
    pub fn update<R>(&self, id: &NodeId, f: impl FnOnce(&mut NodeEntry) -> R) -> R {
        let slot = self.slot(id);
        let out = {
            let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        };
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
        out
    }

    /// External-change signal: forget the shadow and force a resync on the next diff.
    pub fn invalidate(&self, id: &NodeId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.update(id, |e| {
            e.state.status = NodeStatus::Unknown;
            e.shadow = None;
        });
        counter!("cache_invalidations_total", 1u64);
        debug!(node = %id, "observed state invalidated");
        true
    }

    pub fn remove(&self, id: &NodeId) {
        self.slots.rcu(|cur| {
            let mut next = (**cur).clone();
            next.remove(id);
            next
        });
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
    }

    /// Point-in-time copy of every node's observed state, ordered by id.
    pub fn snapshot(&self) -> BTreeMap<NodeId, ObservedState> {
        let map = self.slots.load_full();
        map.iter()
            .map(|(id, slot)| (id.clone(), slot.lock().unwrap_or_else(|e| e.into_inner()).state.clone()))
            .collect()
    }

    /// Bumped on every committed mutation; lets callers follow progress.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(n: usize) -> NodeId { NodeId::namespaced("v1/ConfigMap", "ns", format!("cm-{}", n)) }

    #[test]
    fn unknown_by_default_and_updates_are_visible() {
        let c = ObservedCache::new();
        assert_eq!(c.status(&id(1)), NodeStatus::Unknown);
        assert!(c.get(&id(1)).is_none());
        c.update(&id(1), |e| {
            e.state.status = NodeStatus::Applied;
            e.state.generation_seen = 3;
            e.shadow = Some(serde_json::json!({ "data": {} }));
        });
        let e = c.get(&id(1)).unwrap();
        assert_eq!(e.state.generation_seen, 3);
        assert!(e.shadow.is_some());
    }

    #[test]
    fn invalidate_resets_to_unknown() {
        let c = ObservedCache::new();
        assert!(!c.invalidate(&id(1)));
        c.update(&id(1), |e| {
            e.state.status = NodeStatus::Applied;
            e.shadow = Some(serde_json::json!({}));
        });
        assert!(c.invalidate(&id(1)));
        let e = c.get(&id(1)).unwrap();
        assert_eq!(e.state.status, NodeStatus::Unknown);
        assert!(e.shadow.is_none());
    }

    #[test]
    fn seeded_entries_have_no_shadow() {
        let mut rows = StateMap::default();
        rows.insert(id(1), ObservedState { generation_seen: 2, remote_fingerprint: Some("ab".into()), status: NodeStatus::Applied });
        let c = ObservedCache::from_persisted(rows);
        let e = c.get(&id(1)).unwrap();
        assert_eq!(e.state.status, NodeStatus::Applied);
        assert!(e.shadow.is_none());
        c.remove(&id(1));
        assert!(c.is_empty());
    }

    #[test]
    fn concurrent_writers_on_distinct_nodes() {
        let c = Arc::new(ObservedCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        c.update(&id(t * 100 + i), |e| e.state.generation_seen += 1);
                        // same node from every thread: increments must not be lost
                        c.update(&id(9999), |e| e.state.generation_seen += 1);
                    }
                })
            })
            .collect();
        for h in handles { h.join().unwrap(); }
        assert_eq!(c.len(), 8 * 50 + 1);
        assert_eq!(c.state(&id(9999)).generation_seen, 400);
        assert_eq!(c.snapshot().len(), 401);
    }

    #[test]
    fn epoch_moves_on_commit() {
        let c = ObservedCache::new();
        let rx = c.subscribe_epoch();
        c.update(&id(1), |e| e.state.status = NodeStatus::Pending);
        c.update(&id(1), |e| e.state.status = NodeStatus::Applying);
        assert_eq!(*rx.borrow(), 2);
    }
}
