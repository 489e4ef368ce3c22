//! One node, one try: resync if needed, diff, issue at most one mutation,
//! commit what the cluster confirmed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_apply::{diff, fingerprint, merge_patch, needs_resync, render_for_create, strip_noisy, Diff};
use keel_core::{ClusterClient, ClusterError, DeletionPolicy, NodeId, NodeStatus, ResourceNode};
use keel_persist::StateStore;
use keel_store::{NodeEntry, ObservedCache};
use metrics::counter;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Transient(String),
    Rejected(String),
    /// Stopped before issuing a mutation.
    Cancelled,
}

impl From<ClusterError> for Failure {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Transient(m) => Failure::Transient(m),
            ClusterError::Rejected(m) => Failure::Rejected(m),
        }
    }
}

/// Collaborators every task needs.
pub(crate) struct Shared {
    pub client: Arc<dyn ClusterClient>,
    pub store: Arc<dyn StateStore>,
    pub cache: Arc<ObservedCache>,
    pub apply_timeout: Duration,
}

impl Shared {
    async fn call<T>(&self, what: &str, fut: impl Future<Output = Result<T, ClusterError>>) -> Result<T, Failure> {
        match tokio::time::timeout(self.apply_timeout, fut).await {
            Ok(r) => r.map_err(Failure::from),
            Err(_) => Err(Failure::Transient(format!("{} timed out after {:?}", what, self.apply_timeout))),
        }
    }

    fn persist(&self, id: &NodeId, entry: &NodeEntry) {
        if let Err(e) = self.store.save(id, &entry.state) {
            counter!("state_store_errors_total", 1u64);
            warn!(node = %id, error = %e, "persisting observed state failed");
        }
    }

    /// Commit a confirmed remote object as the new shadow copy.
    fn commit_applied(&self, id: &NodeId, generation: u64, remote: Option<Json>) {
        let remote = remote.map(strip_noisy);
        let fp = remote.as_ref().map(fingerprint);
        let (changed, entry) = self.cache.update(id, |e| {
            let next = NodeEntry {
                state: keel_core::ObservedState { generation_seen: generation, remote_fingerprint: fp, status: NodeStatus::Applied },
                shadow: remote,
            };
            let changed = e.state != next.state;
            *e = next;
            (changed, e.clone())
        });
        if changed {
            self.persist(id, &entry);
        }
    }

    /// Record a failed mutation. The shadow is dropped so the next try
    /// re-reads the cluster before diffing.
    fn commit_failed(&self, id: &NodeId, failure: &Failure) {
        let status = match failure {
            Failure::Rejected(_) => NodeStatus::Blocked,
            Failure::Transient(_) => NodeStatus::Failed,
            Failure::Cancelled => return,
        };
        let entry = self.cache.update(id, |e| {
            e.state.status = status;
            e.shadow = None;
            e.clone()
        });
        self.persist(id, &entry);
    }

    pub(crate) fn forget(&self, id: &NodeId) {
        self.cache.remove(id);
        if let Err(e) = self.store.remove(id) {
            counter!("state_store_errors_total", 1u64);
            warn!(node = %id, error = %e, "removing observed state failed");
        }
    }

    fn mark(&self, id: &NodeId, status: NodeStatus) {
        self.cache.update(id, |e| e.state.status = status);
    }

    /// Bring one node to its desired spec.
    pub(crate) async fn apply(&self, node: &ResourceNode, generation: u64, cancel: &CancellationToken) -> Result<(), Failure> {
        let id = &node.id;
        let ns = id.namespace.as_deref();
        let entry = self.cache.get(id).unwrap_or_default();

        let (status, shadow) = if needs_resync(entry.state.status, entry.shadow.as_ref()) {
            let remote = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Failure::Cancelled),
                r = self.call("get", self.client.get(node.kind(), ns, &id.name)) => r?,
            };
            counter!("reconcile_resync_total", 1u64);
            match remote.map(strip_noisy) {
                Some(remote) => {
                    let fp = fingerprint(&remote);
                    if entry.state.remote_fingerprint.as_ref().is_some_and(|old| *old != fp) {
                        counter!("reconcile_drift_detected_total", 1u64);
                        info!(node = %id, "remote object changed outside keel");
                    }
                    (NodeStatus::Applied, Some(remote))
                }
                None => {
                    let entry = self.cache.update(id, |e| {
                        e.state.status = NodeStatus::Pending;
                        e.shadow = None;
                        e.clone()
                    });
                    self.persist(id, &entry);
                    (NodeStatus::Pending, None)
                }
            }
        } else {
            (entry.state.status, entry.shadow)
        };

        let result = match diff(Some(&node.desired_spec), status, shadow.as_ref()) {
            Diff::NoChange => {
                counter!("reconcile_noop_total", 1u64);
                self.commit_applied(id, generation, shadow);
                return Ok(());
            }
            Diff::Create => {
                if cancel.is_cancelled() {
                    return Err(Failure::Cancelled);
                }
                self.mark(id, NodeStatus::Applying);
                let body = render_for_create(node);
                debug!(node = %id, "creating");
                self.call("create", self.client.create(node.kind(), ns, &body)).await
            }
            Diff::Update(changes) => {
                if cancel.is_cancelled() {
                    return Err(Failure::Cancelled);
                }
                self.mark(id, NodeStatus::Applying);
                let patch = merge_patch(&changes);
                debug!(node = %id, fields = changes.len(), "updating");
                self.call("update", self.client.update(node.kind(), ns, &id.name, &patch)).await
            }
            Diff::Delete => Err(Failure::Rejected("desired node diffed as delete".into())),
        };

        match result {
            Ok(remote) => {
                counter!("reconcile_apply_ok_total", 1u64);
                self.commit_applied(id, generation, Some(remote));
                Ok(())
            }
            Err(f) => {
                counter!("reconcile_apply_err_total", 1u64);
                self.commit_failed(id, &f);
                Err(f)
            }
        }
    }

    /// Remove one node from the cluster according to its deletion policy.
    /// `cascaded` means its namespace is deleted in the same run; the caller
    /// forgets the node once that delete is confirmed.
    pub(crate) async fn delete(&self, node: &ResourceNode, cascaded: bool, cancel: &CancellationToken) -> Result<(), Failure> {
        let id = &node.id;
        match node.deletion_policy {
            DeletionPolicy::ForbidDelete => return Err(Failure::Rejected("deletion forbidden by policy".into())),
            DeletionPolicy::Orphan => {
                info!(node = %id, "orphaned; left on the cluster");
                self.forget(id);
                return Ok(());
            }
            DeletionPolicy::CascadeOnNamespaceDelete if cascaded => {
                // still tracked until the namespace delete is confirmed
                debug!(node = %id, "left to namespace deletion");
                return Ok(());
            }
            DeletionPolicy::CascadeOnNamespaceDelete => {}
        }

        let entry = self.cache.get(id).unwrap_or_default();
        if diff(None, entry.state.status, entry.shadow.as_ref()).is_noop() {
            self.forget(id);
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Failure::Cancelled);
        }
        self.mark(id, NodeStatus::Deleting);
        match self.call("delete", self.client.delete(node.kind(), id.namespace.as_deref(), &id.name)).await {
            Ok(()) => {
                counter!("reconcile_delete_ok_total", 1u64);
                info!(node = %id, "deleted");
                self.forget(id);
                Ok(())
            }
            Err(f) => {
                counter!("reconcile_delete_err_total", 1u64);
                self.commit_failed(id, &f);
                Err(f)
            }
        }
    }
}
