//! Per-node outcome reporting and the run-level error taxonomy.

use std::fmt;
use std::time::Duration;

use keel_core::{NodeId, NodeStatus};
use serde::Serialize;

/// Why a node did not reach its target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Transient cluster failure (kept while retries remain, final once exhausted).
    Apply,
    /// The cluster refused the mutation; never retried.
    Rejected,
    /// A dependency failed terminally.
    Blocked,
    /// Unsettled when the convergence deadline fired.
    Timeout,
    /// Unsettled when the caller cancelled.
    Cancelled,
    /// Still waiting on a dependency that is backing off.
    Waiting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Root failing node for `Blocked`/`Waiting`.
    pub cause: Option<NodeId>,
}

impl NodeError {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None }
    }

    pub(crate) fn caused_by(kind: ErrorKind, cause: &NodeId) -> Self {
        let verb = if kind == ErrorKind::Blocked { "blocked by" } else { "waiting on" };
        Self { kind, message: format!("{} {}", verb, cause), cause: Some(cause.clone()) }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub status: NodeStatus,
    /// Tries made during this run, resyncs excluded.
    pub attempts: u32,
    pub error: Option<NodeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// Every node reached its target state.
    Converged,
    /// The run finished but some nodes failed or were blocked.
    Degraded,
    TimedOut,
    Cancelled,
}

/// Result of one `converge` or `teardown` call, node by node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvergeReport {
    pub generation: u64,
    pub outcome: Outcome,
    /// Scheduling passes run, prune passes included.
    pub cycles: u32,
    pub elapsed: Duration,
    pub nodes: Vec<NodeReport>,
}

impl ConvergeReport {
    pub fn node(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn status(&self, id: &NodeId) -> Option<NodeStatus> {
        self.node(id).map(|n| n.status)
    }

    pub fn is_converged(&self) -> bool {
        self.outcome == Outcome::Converged
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.error.is_some())
    }

    /// Strict view: anything short of full convergence becomes an error
    /// carrying this report.
    pub fn into_result(self) -> Result<ConvergeReport, ReconcileError> {
        match self.outcome {
            Outcome::Converged => Ok(self),
            Outcome::Degraded => Err(ReconcileError::Incomplete { failed: self.failures().count(), report: Box::new(self) }),
            Outcome::TimedOut => Err(ReconcileError::ConvergenceTimeout {
                elapsed: self.elapsed,
                unsettled: self.failures().count(),
                report: Box::new(self),
            }),
            Outcome::Cancelled => Err(ReconcileError::Cancelled { unsettled: self.failures().count(), report: Box::new(self) }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("no graph submitted")]
    NoGraph,
    #[error("convergence deadline exceeded after {elapsed:?}; {unsettled} node(s) not converged")]
    ConvergenceTimeout { elapsed: Duration, unsettled: usize, report: Box<ConvergeReport> },
    #[error("convergence cancelled; {unsettled} node(s) not converged")]
    Cancelled { unsettled: usize, report: Box<ConvergeReport> },
    #[error("{failed} node(s) failed to converge")]
    Incomplete { failed: usize, report: Box<ConvergeReport> },
}

impl ReconcileError {
    /// Partial state for the errors that have one.
    pub fn report(&self) -> Option<&ConvergeReport> {
        match self {
            ReconcileError::ConvergenceTimeout { report, .. }
            | ReconcileError::Cancelled { report, .. }
            | ReconcileError::Incomplete { report, .. } => Some(report),
            _ => None,
        }
    }
}
