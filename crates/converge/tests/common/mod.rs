#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_converge::{ConvergeOptions, Reconciler};
use keel_core::{ClusterClient, ClusterError, NodeId, NodeStatus, ObservedState, RemoteEvent, ResourceNode, Spec};
use keel_persist::{MemoryStore, StateMap, StateStore};
use serde_json::{json, Value as Json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Update,
    Delete,
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    pub id: NodeId,
    pub phase: Phase,
    pub ok: bool,
}

/// In-memory cluster recording every call. Failures and latency are scripted per node.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<NodeId, Json>>,
    log: Mutex<Vec<Call>>,
    queued: Mutex<HashMap<NodeId, VecDeque<ClusterError>>>,
    rejected: Mutex<HashSet<NodeId>>,
    flaky: Mutex<HashSet<NodeId>>,
    delays: Mutex<HashMap<NodeId, Duration>>,
    live: AtomicUsize,
    peak: AtomicUsize,
    version: AtomicU64,
}

fn id_for(kind: &str, namespace: Option<&str>, name: &str) -> NodeId {
    NodeId::new(kind, namespace, name)
}

fn merge(into: &mut Json, patch: &Json) {
    match (into, patch) {
        (Json::Object(dst), Json::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(k) {
                    Some(slot) if slot.is_object() && v.is_object() => merge(slot, v),
                    _ => {
                        dst.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` mutations of `id` fail with `err`.
    pub fn fail_next(&self, id: &NodeId, n: usize, err: ClusterError) {
        let mut q = self.queued.lock().unwrap();
        let slot = q.entry(id.clone()).or_default();
        for _ in 0..n {
            slot.push_back(err.clone());
        }
    }

    /// Every mutation of `id` is rejected.
    pub fn reject(&self, id: &NodeId) {
        self.rejected.lock().unwrap().insert(id.clone());
    }

    /// Every mutation of `id` fails transiently.
    pub fn flaky(&self, id: &NodeId) {
        self.flaky.lock().unwrap().insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        self.flaky.lock().unwrap().remove(id);
        self.rejected.lock().unwrap().remove(id);
        self.queued.lock().unwrap().remove(id);
    }

    /// Latency added to every mutation of `id`.
    pub fn delay(&self, id: &NodeId, d: Duration) {
        self.delays.lock().unwrap().insert(id.clone(), d);
    }

    pub fn object(&self, id: &NodeId) -> Option<Json> {
        self.objects.lock().unwrap().get(id).cloned()
    }

    pub fn exists(&self, id: &NodeId) -> bool {
        self.objects.lock().unwrap().contains_key(id)
    }

    /// Place an object directly, as if someone else created it.
    pub fn seed(&self, id: &NodeId, body: Json) {
        self.objects.lock().unwrap().insert(id.clone(), body);
    }

    /// Out-of-band edit; returns the watch event the change would produce.
    pub fn tamper(&self, id: &NodeId, patch: Json) -> RemoteEvent {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(id).expect("tampering with a missing object");
        merge(obj, &patch);
        obj["metadata"]["resourceVersion"] = json!(self.version.fetch_add(1, Ordering::SeqCst).to_string());
        RemoteEvent { id: id.clone(), object: Some(obj.clone()) }
    }

    /// Out-of-band delete.
    pub fn remove(&self, id: &NodeId) -> RemoteEvent {
        self.objects.lock().unwrap().remove(id);
        RemoteEvent { id: id.clone(), object: None }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    /// Started calls of `op`, optionally for one node.
    pub fn count(&self, op: Op, id: Option<&NodeId>) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.phase == Phase::Start && c.op == op && id.map_or(true, |i| &c.id == i))
            .count()
    }

    pub fn mutations(&self) -> usize {
        self.count(Op::Create, None) + self.count(Op::Update, None) + self.count(Op::Delete, None)
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Position of the first matching log entry.
    pub fn position(&self, op: Op, id: &NodeId, phase: Phase) -> Option<usize> {
        self.log.lock().unwrap().iter().position(|c| c.op == op && &c.id == id && c.phase == phase)
    }

    /// Log index where `id`'s first successful `op` finished.
    pub fn finished(&self, op: Op, id: &NodeId) -> Option<usize> {
        self.log.lock().unwrap().iter().position(|c| c.op == op && &c.id == id && c.phase == Phase::End && c.ok)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, op: Op, id: &NodeId, phase: Phase, ok: bool) {
        self.log.lock().unwrap().push(Call { op, id: id.clone(), phase, ok });
    }

    async fn enter(&self, op: Op, id: &NodeId) -> Result<(), ClusterError> {
        self.record(op, id, Phase::Start, true);
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if op == Op::Get {
            return Ok(());
        }
        let delay = self.delays.lock().unwrap().get(id).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.rejected.lock().unwrap().contains(id) {
            return Err(ClusterError::Rejected(format!("422: {} is invalid", id.name)));
        }
        if self.flaky.lock().unwrap().contains(id) {
            return Err(ClusterError::Transient("503: unavailable".into()));
        }
        if let Some(err) = self.queued.lock().unwrap().get_mut(id).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    fn leave<T>(&self, op: Op, id: &NodeId, r: Result<T, ClusterError>) -> Result<T, ClusterError> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.record(op, id, Phase::End, r.is_ok());
        r
    }

    fn stamp(&self, mut obj: Json, id: &NodeId) -> Json {
        let v = self.version.fetch_add(1, Ordering::SeqCst);
        obj["metadata"]["resourceVersion"] = json!(v.to_string());
        if obj["metadata"].get("uid").is_none() {
            obj["metadata"]["uid"] = json!(format!("uid-{}", id));
        }
        obj
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn create(&self, kind: &str, namespace: Option<&str>, spec: &Spec) -> Result<Json, ClusterError> {
        let name = spec.get("metadata").and_then(|m| m.get("name")).and_then(Json::as_str).unwrap_or_default().to_string();
        let id = id_for(kind, namespace, &name);
        let r = match self.enter(Op::Create, &id).await {
            Ok(()) => {
                let mut objects = self.objects.lock().unwrap();
                if objects.contains_key(&id) {
                    Err(ClusterError::Transient(format!("409: {} already exists", id)))
                } else {
                    let obj = self.stamp(Json::Object(spec.clone()), &id);
                    objects.insert(id.clone(), obj.clone());
                    Ok(obj)
                }
            }
            Err(e) => Err(e),
        };
        self.leave(Op::Create, &id, r)
    }

    async fn update(&self, kind: &str, namespace: Option<&str>, name: &str, fields: &Spec) -> Result<Json, ClusterError> {
        let id = id_for(kind, namespace, name);
        let r = match self.enter(Op::Update, &id).await {
            Ok(()) => {
                let mut objects = self.objects.lock().unwrap();
                match objects.get(&id).cloned() {
                    Some(mut obj) => {
                        merge(&mut obj, &Json::Object(fields.clone()));
                        let obj = self.stamp(obj, &id);
                        objects.insert(id.clone(), obj.clone());
                        Ok(obj)
                    }
                    None => Err(ClusterError::Transient(format!("404: {} not found", id))),
                }
            }
            Err(e) => Err(e),
        };
        self.leave(Op::Update, &id, r)
    }

    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        let id = id_for(kind, namespace, name);
        let r = self.enter(Op::Delete, &id).await.map(|()| {
            let mut objects = self.objects.lock().unwrap();
            objects.remove(&id);
            if id.is_namespace() {
                objects.retain(|k, _| k.namespace.as_deref() != Some(id.name.as_str()));
            }
        });
        self.leave(Op::Delete, &id, r)
    }

    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<Json>, ClusterError> {
        let id = id_for(kind, namespace, name);
        let r = self.enter(Op::Get, &id).await.map(|()| self.object(&id));
        self.leave(Op::Get, &id, r)
    }
}

/// Store that remembers every status it was asked to save, in order.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    saved: Mutex<Vec<(NodeId, NodeStatus)>>,
}

impl RecordingStore {
    pub fn statuses(&self, id: &NodeId) -> Vec<NodeStatus> {
        self.saved.lock().unwrap().iter().filter(|(i, _)| i == id).map(|(_, s)| *s).collect()
    }
}

impl StateStore for RecordingStore {
    fn load(&self) -> anyhow::Result<StateMap> {
        self.inner.load()
    }

    fn save(&self, id: &NodeId, state: &ObservedState) -> anyhow::Result<()> {
        self.saved.lock().unwrap().push((id.clone(), state.status));
        self.inner.save(id, state)
    }

    fn remove(&self, id: &NodeId) -> anyhow::Result<()> {
        self.inner.remove(id)
    }
}

pub fn cm(ns: &str, name: &str) -> NodeId {
    NodeId::namespaced("v1/ConfigMap", ns, name)
}

pub fn node(id: &NodeId, data: Json) -> ResourceNode {
    let mut spec = Spec::new();
    spec.insert("data".into(), data);
    ResourceNode::new(id.clone(), spec)
}

/// Fast, deterministic knobs for paused-clock tests.
pub fn opts() -> ConvergeOptions {
    let mut o = ConvergeOptions {
        max_attempts: 3,
        backoff_base: Duration::from_millis(100),
        backoff_ceiling: Duration::from_secs(1),
        deadline: Duration::from_secs(60),
        ..Default::default()
    };
    o.schedule.apply_timeout = Duration::from_secs(5);
    o
}

pub fn reconciler(fake: &Arc<FakeCluster>, opts: ConvergeOptions) -> Reconciler {
    Reconciler::new(Arc::clone(fake) as Arc<dyn ClusterClient>, opts)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("keel_converge=debug").try_init();
}
