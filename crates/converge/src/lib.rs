//! Keel converge – the convergence loop.
//!
//! A `converge` call runs scheduling passes over the submitted graph until
//! every node is applied or terminally failed. Transient failures are retried
//! in later passes after exponential backoff; dependents of a backing-off node
//! wait, dependents of a terminally failed node are blocked. Nodes dropped
//! from the graph since the last run are then torn down in reverse order.
//! A whole call is bounded by a deadline and honours caller cancellation;
//! a mutation that has been issued always runs to completion (or its own
//! timeout) so the observed state never records something the cluster did not
//! confirm.

#![forbid(unsafe_code)]

mod options;
mod report;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use keel_apply::fingerprint;
use keel_core::{
    ClusterClient, DeletionPolicy, GraphBuilder, GraphValidationError, NodeId, NodeIdx, NodeStatus, ObservedState, RemoteEvent,
    ResourceGraph, ResourceNode, TaskAction,
};
use keel_persist::{MemoryStore, StateStore};
use keel_schedule::{drive, Admission, Direction, PassEnd, Scheduler, Settled, TaskOutcome};
use keel_store::ObservedCache;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use options::ConvergeOptions;
pub use report::{ConvergeReport, ErrorKind, NodeError, NodeReport, Outcome, ReconcileError};
use worker::{Failure, Shared};

#[derive(Default)]
struct Graphs {
    /// Latest submitted generation.
    current: Option<Arc<ResourceGraph>>,
    /// Everything that may still exist on the cluster from earlier runs.
    retired: Option<Arc<ResourceGraph>>,
}

/// Owns the desired graph and drives the cluster towards it.
pub struct Reconciler {
    shared: Arc<Shared>,
    opts: ConvergeOptions,
    graphs: Mutex<Graphs>,
    run_lock: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
}

impl Reconciler {
    /// In-memory observed state.
    pub fn new(client: Arc<dyn ClusterClient>, opts: ConvergeOptions) -> Self {
        Self::assemble(client, Arc::new(MemoryStore::new()), ObservedCache::new(), 1, opts)
    }

    /// Observed state seeded from (and written through to) `store`.
    pub fn with_store(client: Arc<dyn ClusterClient>, store: Arc<dyn StateStore>, opts: ConvergeOptions) -> Result<Self> {
        let rows = store.load()?;
        let next_gen = rows.values().map(|s| s.generation_seen).max().unwrap_or(0) + 1;
        info!(nodes = rows.len(), next_generation = next_gen, "observed state loaded");
        Ok(Self::assemble(client, store, ObservedCache::from_persisted(rows), next_gen, opts))
    }

    fn assemble(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn StateStore>,
        cache: ObservedCache,
        next_gen: u64,
        opts: ConvergeOptions,
    ) -> Self {
        let shared = Shared { client, store, cache: Arc::new(cache), apply_timeout: opts.schedule.apply_timeout };
        Self {
            shared: Arc::new(shared),
            opts,
            graphs: Mutex::new(Graphs::default()),
            run_lock: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(next_gen),
        }
    }

    pub fn options(&self) -> &ConvergeOptions { &self.opts }

    pub fn cache(&self) -> &Arc<ObservedCache> { &self.shared.cache }

    fn graphs(&self) -> std::sync::MutexGuard<'_, Graphs> {
        self.graphs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and install a new desired graph under a fresh generation.
    /// An invalid set leaves the previous graph in place.
    pub fn submit(&self, nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Arc<ResourceGraph>, GraphValidationError> {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let graph = ResourceGraph::submit(generation, nodes).map_err(|e| {
            counter!("graph_rejected_total", 1u64);
            warn!(generation, error = %e, "graph rejected");
            e
        })?;
        Ok(self.install(graph))
    }

    pub fn submit_builder(&self, builder: GraphBuilder) -> Result<Arc<ResourceGraph>, GraphValidationError> {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        Ok(self.install(builder.build(generation)?))
    }

    fn install(&self, graph: ResourceGraph) -> Arc<ResourceGraph> {
        let graph = Arc::new(graph);
        info!(generation = graph.generation(), nodes = graph.len(), "graph submitted");
        let mut g = self.graphs();
        if let Some(prev) = g.current.take() {
            let carried = g.retired.take();
            g.retired = Some(match carried {
                Some(r) => union(&prev, &r),
                None => prev,
            });
        }
        g.current = Some(Arc::clone(&graph));
        graph
    }

    pub fn graph(&self) -> Option<Arc<ResourceGraph>> {
        self.graphs().current.clone()
    }

    pub fn state(&self, id: &NodeId) -> ObservedState {
        self.shared.cache.state(id)
    }

    /// External-change signal for one node: its next diff re-reads the cluster.
    pub fn invalidate(&self, id: &NodeId) -> bool {
        self.shared.cache.invalidate(id)
    }

    /// Feed a watch event. Invalidates the node when the remote object no
    /// longer matches what was last applied; returns whether it did.
    pub fn observe(&self, ev: &RemoteEvent) -> bool {
        let Some(entry) = self.shared.cache.get(&ev.id) else { return false };
        let drifted = match &ev.object {
            None => !matches!(entry.state.status, NodeStatus::Deleted | NodeStatus::Deleting | NodeStatus::Pending),
            Some(obj) => entry.state.remote_fingerprint.as_deref() != Some(fingerprint(obj).as_str()),
        };
        if !drifted || matches!(entry.state.status, NodeStatus::Applying | NodeStatus::Deleting) {
            return false;
        }
        counter!("reconcile_drift_detected_total", 1u64);
        info!(node = %ev.id, deleted = ev.object.is_none(), "remote drift observed");
        self.shared.cache.invalidate(&ev.id)
    }

    /// Apply the current graph, then prune what earlier graphs left behind.
    ///
    /// `Ok` covers both full convergence and a finished run with failed or
    /// blocked nodes (see `ConvergeReport::outcome`). Deadline and
    /// cancellation come back as errors carrying the partial report.
    pub async fn converge(&self, cancel: &CancellationToken) -> Result<ConvergeReport, ReconcileError> {
        let _run = self.run_lock.lock().await;
        let (current, retired) = {
            let g = self.graphs();
            (g.current.clone().ok_or(ReconcileError::NoGraph)?, g.retired.clone())
        };
        let started = Instant::now();
        let pass_cancel = cancel.child_token();
        let timer = self.arm_deadline(&pass_cancel);
        info!(generation = current.generation(), nodes = current.len(), "converge started");

        let applied = self.run(Arc::clone(&current), Direction::Apply, None, &pass_cancel).await;
        let mut runs = vec![applied];

        let mut leftovers: Vec<ResourceNode> = Vec::new();
        if let Some(prev) = &retired {
            let removed: FxHashSet<NodeIdx> = (0..prev.len()).filter(|&i| !current.contains(&prev.node(i).id)).collect();
            if runs[0].interrupted {
                leftovers.extend(removed.iter().map(|&i| prev.node(i).clone()));
            } else if !removed.is_empty() {
                info!(count = removed.len(), "pruning nodes no longer desired");
                let pruned = self.run(Arc::clone(prev), Direction::Teardown, Some(removed), &pass_cancel).await;
                leftovers.extend(pruned.not_done().map(|i| prev.node(i).clone()));
                runs.push(pruned);
            }
        }
        timer.abort();

        {
            let mut g = self.graphs();
            let carried = if leftovers.is_empty() { None } else { Some(with_leftovers(&current, leftovers)) };
            let superseded = !g.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &current));
            g.retired = if superseded {
                // A newer graph arrived mid-run; what we just applied is now prunable.
                Some(carried.unwrap_or_else(|| Arc::clone(&current)))
            } else {
                carried
            };
        }
        self.finish(current.generation(), started, cancel, runs)
    }

    /// Delete every managed node, dependents first, honouring deletion policies.
    /// Nodes that could not be deleted stay tracked for the next teardown.
    pub async fn teardown(&self, cancel: &CancellationToken) -> Result<ConvergeReport, ReconcileError> {
        let _run = self.run_lock.lock().await;
        let (taken, graph) = {
            let g = self.graphs();
            let graph = match (&g.current, &g.retired) {
                (Some(c), Some(r)) => union(c, r),
                (Some(c), None) => Arc::clone(c),
                (None, Some(r)) => Arc::clone(r),
                (None, None) => return Err(ReconcileError::NoGraph),
            };
            (g.current.clone(), graph)
        };
        let started = Instant::now();
        let pass_cancel = cancel.child_token();
        let timer = self.arm_deadline(&pass_cancel);
        info!(nodes = graph.len(), "teardown started");

        let run = self.run(Arc::clone(&graph), Direction::Teardown, None, &pass_cancel).await;
        timer.abort();

        let leftovers: Vec<ResourceNode> = run.not_done().map(|i| graph.node(i).clone()).collect();
        {
            let mut g = self.graphs();
            if let (Some(c), Some(t)) = (&g.current, &taken) {
                if Arc::ptr_eq(c, t) {
                    g.current = None;
                }
            }
            g.retired = if leftovers.is_empty() {
                None
            } else {
                Some(Arc::new(resubmit(graph.generation(), leftovers.into_iter())))
            };
        }
        self.finish(graph.generation(), started, cancel, vec![run])
    }

    fn arm_deadline(&self, pass_cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let token = pass_cancel.clone();
        let deadline = self.opts.deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!(?deadline, "convergence deadline reached");
            token.cancel();
        })
    }

    fn finish(&self, generation: u64, started: Instant, cancel: &CancellationToken, runs: Vec<Run>) -> Result<ConvergeReport, ReconcileError> {
        let interrupted = runs.iter().any(|r| r.interrupted);
        let outcome = if interrupted && cancel.is_cancelled() {
            Outcome::Cancelled
        } else if interrupted {
            Outcome::TimedOut
        } else if runs.iter().all(|r| r.not_done().next().is_none()) {
            Outcome::Converged
        } else {
            Outcome::Degraded
        };
        let unsettled_kind = match outcome {
            Outcome::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Timeout,
        };
        let cycles = runs.iter().map(|r| r.cycles).sum();
        let nodes: Vec<NodeReport> = runs.into_iter().flat_map(|r| r.into_reports(&self.shared.cache, unsettled_kind)).collect();
        let elapsed = started.elapsed();
        histogram!("converge_ms", elapsed.as_secs_f64() * 1000.0);
        counter!("converge_runs_total", 1u64);

        let report = ConvergeReport { generation, outcome, cycles, elapsed, nodes };
        info!(generation, outcome = ?report.outcome, cycles, failed = report.failures().count(), "converge finished");
        match outcome {
            Outcome::Converged | Outcome::Degraded => Ok(report),
            _ => report.into_result(),
        }
    }

    /// Scheduling passes over `members` (all nodes when `None`) until nothing
    /// is left to try or the pass token fires.
    async fn run(&self, graph: Arc<ResourceGraph>, direction: Direction, members: Option<FxHashSet<NodeIdx>>, cancel: &CancellationToken) -> Run {
        let n = graph.len();
        let mut run = Run::new(Arc::clone(&graph), direction, members);
        let slots: Arc<Vec<Mutex<Option<Failure>>>> = Arc::new((0..n).map(|_| Mutex::new(None)).collect());
        let cascaded: Arc<Vec<bool>> = Arc::new(run.cascade.iter().map(Option::is_some).collect());

        loop {
            let now = Instant::now();
            let admission = run.admissions(now);
            if !admission.contains(&Admission::Schedule) {
                let Some(wake) = run.next_wake() else { break };
                debug!(wait_ms = wake.saturating_duration_since(now).as_millis() as u64, "all runnable nodes backing off");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        run.interrupted = true;
                        break;
                    }
                    _ = tokio::time::sleep_until(wake) => continue,
                }
            }

            run.cycles += 1;
            let t0 = Instant::now();
            let attempts = run.attempts.clone();
            let sched = Scheduler::new(Arc::clone(&graph), direction, |i| admission[i], |i| attempts[i] + 1);
            let max_attempts = self.opts.max_attempts;
            let end = drive(Arc::clone(&sched), &self.opts.schedule, cancel, |task| {
                let shared = Arc::clone(&self.shared);
                let graph = Arc::clone(&graph);
                let slots = Arc::clone(&slots);
                let cascaded = Arc::clone(&cascaded);
                let cancel = cancel.clone();
                async move {
                    let node = graph.node(task.idx);
                    let res = match task.action {
                        TaskAction::Apply => shared.apply(node, task.desired_generation, &cancel).await,
                        TaskAction::Delete => shared.delete(node, cascaded[task.idx], &cancel).await,
                    };
                    match res {
                        Ok(()) => TaskOutcome::Done,
                        Err(f) => {
                            let terminal = match &f {
                                Failure::Rejected(_) => true,
                                Failure::Transient(_) => task.attempt >= max_attempts,
                                Failure::Cancelled => false,
                            };
                            *slots[task.idx].lock().unwrap_or_else(|e| e.into_inner()) = Some(f);
                            TaskOutcome::Failed { terminal }
                        }
                    }
                }
            })
            .await;

            let now = Instant::now();
            for i in (0..n).filter(|&i| admission[i] == Admission::Schedule) {
                let failure = slots[i].lock().unwrap_or_else(|e| e.into_inner()).take();
                run.settle(i, sched.outcome(i), failure, &self.opts, now);
            }
            run.resolve_cascades(&self.shared);
            histogram!("reconcile_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
            debug!(cycle = run.cycles, direction = ?direction, remaining = run.not_done().count(), "cycle finished");
            if end == PassEnd::Cancelled || (cancel.is_cancelled() && run.not_done().any(|i| !run.terminal[i])) {
                run.interrupted = true;
                break;
            }
        }
        run
    }
}

/// Per-run bookkeeping, indexed like the graph.
struct Run {
    graph: Arc<ResourceGraph>,
    direction: Direction,
    members: Option<FxHashSet<NodeIdx>>,
    /// Teardown only: the namespace node whose deletion removes this node.
    cascade: Vec<Option<NodeIdx>>,
    /// Handed off to `cascade[i]`; settles with it.
    awaiting: Vec<bool>,
    done: Vec<bool>,
    terminal: Vec<bool>,
    attempts: Vec<u32>,
    retry_at: Vec<Option<Instant>>,
    status: Vec<Option<NodeStatus>>,
    error: Vec<Option<NodeError>>,
    cycles: u32,
    interrupted: bool,
}

impl Run {
    fn new(graph: Arc<ResourceGraph>, direction: Direction, members: Option<FxHashSet<NodeIdx>>) -> Self {
        let n = graph.len();
        let is_member = |i: NodeIdx| members.as_ref().map_or(true, |m| m.contains(&i));
        let cascade = match direction {
            Direction::Apply => vec![None; n],
            Direction::Teardown => {
                let namespaces: FxHashMap<&str, NodeIdx> = (0..n)
                    .filter(|&i| is_member(i))
                    .filter(|&i| graph.node(i).id.is_namespace() && graph.node(i).deletion_policy == DeletionPolicy::CascadeOnNamespaceDelete)
                    .map(|i| (graph.node(i).id.name.as_str(), i))
                    .collect();
                (0..n)
                    .map(|i| {
                        let node = graph.node(i);
                        if !is_member(i) || node.deletion_policy != DeletionPolicy::CascadeOnNamespaceDelete {
                            return None;
                        }
                        node.id.namespace.as_deref().and_then(|ns| namespaces.get(ns).copied())
                    })
                    .collect()
            }
        };
        Self {
            cascade,
            awaiting: vec![false; n],
            graph,
            direction,
            members,
            done: vec![false; n],
            terminal: vec![false; n],
            attempts: vec![0; n],
            retry_at: vec![None; n],
            status: vec![None; n],
            error: vec![None; n],
            cycles: 0,
            interrupted: false,
        }
    }

    fn is_member(&self, i: NodeIdx) -> bool {
        self.members.as_ref().map_or(true, |m| m.contains(&i))
    }

    fn admission(&self, i: NodeIdx, now: Instant) -> Admission {
        if !self.is_member(i) || self.done[i] || self.awaiting[i] {
            Admission::Satisfied
        } else if self.terminal[i] {
            Admission::Terminal
        } else if self.retry_at[i].is_some_and(|t| t > now) {
            Admission::Hold
        } else {
            Admission::Schedule
        }
    }

    /// Admissions for one pass. Anything downstream of a held node is held
    /// too, so a pass never consists solely of nodes that would be deferred.
    fn admissions(&self, now: Instant) -> Vec<Admission> {
        let mut out: Vec<Admission> = (0..self.graph.len()).map(|i| self.admission(i, now)).collect();
        let mut order = self.graph.topological_order();
        if self.direction == Direction::Teardown {
            order.reverse();
        }
        for i in order {
            if out[i] != Admission::Schedule {
                continue;
            }
            let preds = match self.direction {
                Direction::Apply => self.graph.dependencies(i),
                Direction::Teardown => self.graph.dependents(i),
            };
            if preds.iter().any(|&p| out[p] == Admission::Hold) {
                out[i] = Admission::Hold;
            }
        }
        out
    }

    fn next_wake(&self) -> Option<Instant> {
        (0..self.graph.len())
            .filter(|&i| self.is_member(i) && !self.done[i] && !self.terminal[i])
            .filter_map(|i| self.retry_at[i])
            .min()
    }

    fn not_done(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        (0..self.graph.len()).filter(|&i| self.is_member(i) && !self.done[i])
    }

    fn settle(&mut self, i: NodeIdx, outcome: Option<Settled>, failure: Option<Failure>, opts: &ConvergeOptions, now: Instant) {
        let id = &self.graph.node(i).id;
        match outcome {
            Some(Settled::Done) if self.cascade[i].is_some() => {
                if let Some(ns) = self.cascade[i] {
                    self.awaiting[i] = true;
                    self.retry_at[i] = None;
                    self.error[i] = Some(NodeError::caused_by(ErrorKind::Waiting, &self.graph.node(ns).id));
                }
            }
            Some(Settled::Done) => {
                self.attempts[i] += 1;
                self.done[i] = true;
                self.retry_at[i] = None;
                self.error[i] = None;
                self.status[i] = Some(match self.direction {
                    Direction::Apply => NodeStatus::Applied,
                    Direction::Teardown => NodeStatus::Deleted,
                });
            }
            Some(Settled::Failed) => match failure {
                Some(Failure::Rejected(msg)) => {
                    self.attempts[i] += 1;
                    self.terminal[i] = true;
                    self.status[i] = Some(NodeStatus::Blocked);
                    warn!(node = %id, error = %msg, "rejected by cluster");
                    self.error[i] = Some(NodeError::new(ErrorKind::Rejected, msg));
                }
                Some(Failure::Transient(msg)) => {
                    self.attempts[i] += 1;
                    let tries = self.attempts[i];
                    if tries >= opts.max_attempts {
                        self.terminal[i] = true;
                        self.status[i] = Some(NodeStatus::Failed);
                        warn!(node = %id, attempts = tries, error = %msg, "giving up");
                        self.error[i] = Some(NodeError::new(ErrorKind::Apply, format!("gave up after {} attempts: {}", tries, msg)));
                    } else {
                        let delay = opts.backoff(tries);
                        counter!("reconcile_retry_total", 1u64);
                        debug!(node = %id, attempt = tries, delay_ms = delay.as_millis() as u64, error = %msg, "will retry");
                        self.retry_at[i] = Some(now + delay);
                        self.error[i] = Some(NodeError::new(ErrorKind::Apply, msg));
                    }
                }
                Some(Failure::Cancelled) => {
                    self.error[i] = Some(NodeError::new(ErrorKind::Cancelled, "stopped before mutating"));
                }
                None => {
                    self.attempts[i] += 1;
                    self.terminal[i] = true;
                    self.status[i] = Some(NodeStatus::Failed);
                    self.error[i] = Some(NodeError::new(ErrorKind::Apply, "reconcile task panicked"));
                }
            },
            Some(Settled::Blocked { by }) => {
                self.terminal[i] = true;
                self.status[i] = Some(NodeStatus::Blocked);
                self.error[i] = Some(NodeError::caused_by(ErrorKind::Blocked, &self.graph.node(by).id));
            }
            Some(Settled::Deferred { by }) => {
                self.error[i] = Some(NodeError::caused_by(ErrorKind::Waiting, &self.graph.node(by).id));
            }
            None => {}
        }
    }

    /// Settle nodes left to their namespace once it has an outcome: deleted
    /// with it, or blocked and still tracked when it could not be deleted.
    fn resolve_cascades(&mut self, shared: &Shared) {
        for i in 0..self.graph.len() {
            let Some(ns) = self.cascade[i].filter(|_| self.awaiting[i]) else { continue };
            if self.done[ns] {
                self.awaiting[i] = false;
                self.done[i] = true;
                self.status[i] = Some(NodeStatus::Deleted);
                self.error[i] = None;
                shared.forget(&self.graph.node(i).id);
                debug!(node = %self.graph.node(i).id, "removed with its namespace");
            } else if self.terminal[ns] {
                self.awaiting[i] = false;
                self.terminal[i] = true;
                self.status[i] = Some(NodeStatus::Blocked);
                self.error[i] = Some(NodeError::caused_by(ErrorKind::Blocked, &self.graph.node(ns).id));
            }
        }
    }

    fn into_reports(self, cache: &ObservedCache, unsettled: ErrorKind) -> Vec<NodeReport> {
        (0..self.graph.len())
            .filter(|&i| self.is_member(i))
            .map(|i| {
                let id = self.graph.node(i).id.clone();
                let status = self.status[i].unwrap_or_else(|| cache.status(&id));
                let error = if self.done[i] || self.terminal[i] {
                    self.error[i].clone()
                } else if self.interrupted {
                    let reason = self.error[i].as_ref().map(|e| e.message.as_str()).unwrap_or("not started");
                    Some(NodeError { kind: unsettled, message: reason.to_string(), cause: None })
                } else {
                    self.error[i].clone()
                };
                NodeReport { id, status, attempts: self.attempts[i], error }
            })
            .collect()
    }
}

/// Rebuild a graph from nodes, dropping edges to nodes not in the set.
fn resubmit(generation: u64, nodes: impl Iterator<Item = ResourceNode>) -> ResourceGraph {
    let nodes: Vec<ResourceNode> = nodes.collect();
    let present: FxHashSet<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
    let nodes = nodes.into_iter().map(|mut n| {
        n.depends_on.retain(|d| present.contains(d));
        n
    });
    match ResourceGraph::submit(generation, nodes) {
        Ok(g) => g,
        Err(e) => {
            // Subsets of validated graphs stay acyclic and unique, so this is unreachable in practice.
            warn!(error = %e, "could not rebuild tracked graph; tracking nothing");
            ResourceGraph::default()
        }
    }
}

/// `current` plus `leftovers` that `current` does not redefine.
fn with_leftovers(current: &ResourceGraph, leftovers: Vec<ResourceNode>) -> Arc<ResourceGraph> {
    let extra = leftovers.into_iter().filter(|n| !current.contains(&n.id));
    Arc::new(resubmit(current.generation(), current.nodes().iter().cloned().chain(extra)))
}

/// `newer` with every node of `older` it does not redefine.
fn union(newer: &ResourceGraph, older: &ResourceGraph) -> Arc<ResourceGraph> {
    with_leftovers(newer, older.nodes().to_vec())
}
