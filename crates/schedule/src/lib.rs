//! Keel schedule: dependency-ordered readiness propagation over a resource graph.
//!
//! Every node in a pass carries an atomic count of unsatisfied predecessors
//! (its dependencies when applying, its dependents when tearing down).
//! Completing a node decrements each successor and releases those that hit
//! zero into the ready queue. No lock is held across the pass; the only
//! mutex guards the ready-queue sender so the last settled node can close it.

#![forbid(unsafe_code)]

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use keel_core::{NodeIdx, ReconcileTask, ResourceGraph, TaskAction};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Parallelism knobs for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Upper bound on concurrently running tasks.
    pub max_concurrent_applies: usize,
    /// Deadline for each cluster call made by a task.
    pub apply_timeout: Duration,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self { max_concurrent_applies: 8, apply_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Apply,
    Teardown,
}

/// How the caller wants a node treated in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Already done; counts as a satisfied predecessor.
    Satisfied,
    /// Run it in this pass.
    Schedule,
    /// Not this pass (waiting for backoff); successors are deferred.
    Hold,
    /// Terminally failed earlier; successors are blocked.
    Terminal,
}

/// How a scheduled node left the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Done,
    Failed,
    /// A predecessor failed terminally.
    Blocked { by: NodeIdx },
    /// A predecessor failed transiently or is held; try again next pass.
    Deferred { by: NodeIdx },
}

/// Result reported by a task body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed { terminal: bool },
}

const OUT: u8 = 0;
const WAITING: u8 = 1;
const READY: u8 = 2;
const DONE: u8 = 3;
const FAILED: u8 = 4;
const BLOCKED: u8 = 5;
const DEFERRED: u8 = 6;
const NO_CAUSE: usize = usize::MAX;

pub struct Scheduler {
    graph: Arc<ResourceGraph>,
    direction: Direction,
    attempts: Vec<u32>,
    pending: Vec<AtomicUsize>,
    state: Vec<AtomicU8>,
    cause: Vec<AtomicUsize>,
    remaining: AtomicUsize,
    ready_tx: Mutex<Option<mpsc::UnboundedSender<ReconcileTask>>>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReconcileTask>>,
}

impl Scheduler {
    /// Build one pass. `admit` classifies every node; `attempt` numbers the
    /// task emitted for each scheduled node.
    pub fn new(
        graph: Arc<ResourceGraph>,
        direction: Direction,
        admit: impl Fn(NodeIdx) -> Admission,
        attempt: impl Fn(NodeIdx) -> u32,
    ) -> Arc<Self> {
        let n = graph.len();
        let admission: Vec<Admission> = (0..n).map(&admit).collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduled = admission.iter().filter(|a| **a == Admission::Schedule).count();
        let me = Arc::new(Self {
            attempts: (0..n).map(&attempt).collect(),
            pending: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            state: admission.iter().map(|a| AtomicU8::new(if *a == Admission::Schedule { WAITING } else { OUT })).collect(),
            cause: (0..n).map(|_| AtomicUsize::new(NO_CAUSE)).collect(),
            remaining: AtomicUsize::new(scheduled),
            ready_tx: Mutex::new(Some(tx)),
            ready_rx: tokio::sync::Mutex::new(rx),
            graph,
            direction,
        });

        for i in 0..n {
            if admission[i] != Admission::Schedule { continue; }
            let unsatisfied = me.predecessors(i).iter().filter(|&&p| admission[p] != Admission::Satisfied).count();
            me.pending[i].store(unsatisfied, Ordering::Relaxed);
        }
        for (i, a) in admission.iter().enumerate() {
            match a {
                Admission::Hold => me.propagate(i, DEFERRED),
                Admission::Terminal => me.propagate(i, BLOCKED),
                _ => {}
            }
        }
        for i in 0..n {
            if me.pending[i].load(Ordering::Acquire) == 0 && me.transition(i, WAITING, READY) {
                me.emit(i);
            }
        }
        if scheduled == 0 {
            me.close();
        }
        debug!(direction = ?direction, scheduled, nodes = n, "scheduler pass built");
        me
    }

    pub fn graph(&self) -> &Arc<ResourceGraph> { &self.graph }
    pub fn direction(&self) -> Direction { self.direction }

    fn predecessors(&self, idx: NodeIdx) -> &[NodeIdx] {
        match self.direction {
            Direction::Apply => self.graph.dependencies(idx),
            Direction::Teardown => self.graph.dependents(idx),
        }
    }

    fn successors(&self, idx: NodeIdx) -> &[NodeIdx] {
        match self.direction {
            Direction::Apply => self.graph.dependents(idx),
            Direction::Teardown => self.graph.dependencies(idx),
        }
    }

    fn transition(&self, idx: NodeIdx, from: u8, to: u8) -> bool {
        self.state[idx].compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn emit(&self, idx: NodeIdx) {
        let task = ReconcileTask {
            idx,
            node: self.graph.node(idx).id.clone(),
            desired_generation: self.graph.generation(),
            attempt: self.attempts[idx],
            action: match self.direction {
                Direction::Apply => TaskAction::Apply,
                Direction::Teardown => TaskAction::Delete,
            },
        };
        counter!("schedule_tasks_emitted_total", 1u64);
        let guard = self.ready_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(task);
        }
    }

    fn close(&self) {
        self.ready_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn settle_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close();
        }
    }

    /// Mark every transitive successor still waiting as `mark` (blocked or deferred) with `root` as the cause.
    fn propagate(&self, root: NodeIdx, mark: u8) {
        let mut stack: Vec<NodeIdx> = self.successors(root).to_vec();
        while let Some(s) = stack.pop() {
            if self.transition(s, WAITING, mark) {
                self.cause[s].store(root, Ordering::Release);
                self.settle_one();
                stack.extend_from_slice(self.successors(s));
            }
        }
    }

    /// Next ready task; `None` once every scheduled node has settled.
    pub async fn next(&self) -> Option<ReconcileTask> {
        self.ready_rx.lock().await.recv().await
    }

    /// Record success and release successors whose last predecessor this was.
    pub fn complete(&self, idx: NodeIdx) {
        if !self.transition(idx, READY, DONE) {
            return;
        }
        for &s in self.successors(idx) {
            if self.state[s].load(Ordering::Acquire) != WAITING { continue; }
            if self.pending[s].fetch_sub(1, Ordering::AcqRel) == 1 && self.transition(s, WAITING, READY) {
                self.emit(s);
            }
        }
        self.settle_one();
    }

    /// Record failure. Terminal failures block successors; others defer them.
    pub fn fail(&self, idx: NodeIdx, terminal: bool) {
        if !self.transition(idx, READY, FAILED) {
            return;
        }
        self.propagate(idx, if terminal { BLOCKED } else { DEFERRED });
        self.settle_one();
    }

    pub fn outcome(&self, idx: NodeIdx) -> Option<Settled> {
        let by = || self.cause[idx].load(Ordering::Acquire);
        match self.state[idx].load(Ordering::Acquire) {
            DONE => Some(Settled::Done),
            FAILED => Some(Settled::Failed),
            BLOCKED => Some(Settled::Blocked { by: by() }),
            DEFERRED => Some(Settled::Deferred { by: by() }),
            _ => None,
        }
    }

    /// Scheduled nodes that have not settled (only non-empty after a cancelled pass).
    pub fn unsettled(&self) -> Vec<NodeIdx> {
        (0..self.graph.len())
            .filter(|&i| matches!(self.state[i].load(Ordering::Acquire), WAITING | READY))
            .collect()
    }

    pub fn remaining(&self) -> usize { self.remaining.load(Ordering::Acquire) }
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassEnd {
    Drained,
    Cancelled,
}

/// Run one pass: pull ready tasks, run at most `max_concurrent_applies` of
/// them at a time, and feed outcomes back into the scheduler from the worker
/// tasks themselves. On cancellation no new task starts; running tasks finish
/// and their outcomes are recorded.
pub async fn drive<F, Fut>(sched: Arc<Scheduler>, opts: &ScheduleOptions, cancel: &CancellationToken, work: F) -> PassEnd
where
    F: Fn(ReconcileTask) -> Fut,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    let t0 = std::time::Instant::now();
    let sem = Arc::new(Semaphore::new(opts.max_concurrent_applies.max(1)));
    let mut inflight: JoinSet<()> = JoinSet::new();
    let mut stopping = false;
    let mut drained = false;

    let next_with_permit = |sched: Arc<Scheduler>, sem: Arc<Semaphore>| async move {
        let permit = sem.acquire_owned().await.ok()?;
        let task = sched.next().await?;
        Some((task, permit))
    };

    loop {
        if (drained || stopping) && inflight.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled(), if !stopping => {
                stopping = true;
                info!(in_flight = inflight.len(), "pass cancelled; waiting for in-flight tasks");
            }
            Some(joined) = inflight.join_next() => {
                if let Err(e) = joined {
                    error!(error = %e, "reconcile task aborted");
                }
            }
            next = next_with_permit(Arc::clone(&sched), Arc::clone(&sem)), if !stopping && !drained => {
                match next {
                    Some((task, permit)) => {
                        let idx = task.idx;
                        debug!(node = %task.node, attempt = task.attempt, "task started");
                        let fut = work(task);
                        let sched = Arc::clone(&sched);
                        inflight.spawn(async move {
                            let outcome = AssertUnwindSafe(fut).catch_unwind().await.unwrap_or_else(|_| {
                                error!(idx, "reconcile task panicked");
                                TaskOutcome::Failed { terminal: true }
                            });
                            match outcome {
                                TaskOutcome::Done => sched.complete(idx),
                                TaskOutcome::Failed { terminal } => sched.fail(idx, terminal),
                            }
                            drop(permit);
                        });
                    }
                    None => drained = true,
                }
            }
            else => break,
        }
    }

    histogram!("schedule_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
    if stopping && !sched.unsettled().is_empty() { PassEnd::Cancelled } else { PassEnd::Drained }
}
