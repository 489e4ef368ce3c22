//! Keel core types: desired resource nodes, observed state, and the cluster client seam.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod graph;

pub use graph::{GraphBuilder, GraphValidationError, NodeIdx, ResourceGraph};

/// Opaque structured object body (`desiredSpec`, update field sets).
pub type Spec = serde_json::Map<String, Json>;

/// Kind key used for namespace nodes.
pub const NAMESPACE_KIND: &str = "v1/Namespace";

/// Stable key of a resource node: kind + namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl NodeId {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, None, name)
    }

    pub fn namespaced(kind: impl Into<String>, namespace: &str, name: impl Into<String>) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    pub fn is_namespace(&self) -> bool {
        self.kind == NAMESPACE_KIND
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

impl FromStr for NodeId {
    type Err = ManifestError;

    /// Parses the `Display` form back (`kind:ns/name` or `kind:name`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s.split_once(':').ok_or_else(|| ManifestError::BadId(s.to_string()))?;
        if kind.is_empty() || rest.is_empty() {
            return Err(ManifestError::BadId(s.to_string()));
        }
        Ok(match rest.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => NodeId::namespaced(kind, ns, name),
            Some(_) => return Err(ManifestError::BadId(s.to_string())),
            None => NodeId::cluster(kind, rest),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not an object")]
    NotAnObject,
    #[error("manifest missing {0}")]
    Missing(&'static str),
    #[error("malformed node id: {0}")]
    BadId(String),
}

/// What teardown does with a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Delete explicitly, unless the owning namespace is deleted in the same teardown.
    #[default]
    CascadeOnNamespaceDelete,
    /// Stop managing the object; leave it in the cluster.
    Orphan,
    /// Refuse to delete.
    ForbidDelete,
}

/// One desired object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: NodeId,
    pub desired_spec: Spec,
    pub depends_on: BTreeSet<NodeId>,
    pub deletion_policy: DeletionPolicy,
}

impl ResourceNode {
    pub fn new(id: NodeId, desired_spec: Spec) -> Self {
        Self { id, desired_spec, depends_on: BTreeSet::new(), deletion_policy: DeletionPolicy::default() }
    }

    /// Derive the node id from a Kubernetes-style manifest
    /// (`apiVersion`, `kind`, `metadata.name`, optional `metadata.namespace`).
    pub fn from_manifest(manifest: Json) -> Result<Self, ManifestError> {
        let Json::Object(spec) = manifest else { return Err(ManifestError::NotAnObject) };
        let api_version = spec.get("apiVersion").and_then(|v| v.as_str()).ok_or(ManifestError::Missing("apiVersion"))?;
        let kind = spec.get("kind").and_then(|v| v.as_str()).ok_or(ManifestError::Missing("kind"))?;
        let meta = spec.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or(ManifestError::Missing("metadata.name"))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
        let id = NodeId::new(format!("{}/{}", api_version, kind), namespace, name);
        Ok(Self::new(id, spec))
    }

    pub fn kind(&self) -> &str {
        &self.id.kind
    }

    pub fn depends_on(mut self, dep: NodeId) -> Self {
        self.depends_on.insert(dep);
        self
    }

    pub fn with_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = policy;
        self
    }
}

/// Reconciliation status of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Pending,
    Applying,
    Applied,
    Failed,
    Deleting,
    Deleted,
    /// Terminal: rejected, or a dependency (dependent, on teardown) terminally failed.
    Blocked,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Pending => "pending",
            NodeStatus::Applying => "applying",
            NodeStatus::Applied => "applied",
            NodeStatus::Failed => "failed",
            NodeStatus::Deleting => "deleting",
            NodeStatus::Deleted => "deleted",
            NodeStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "unknown" => NodeStatus::Unknown,
            "pending" => NodeStatus::Pending,
            "applying" => NodeStatus::Applying,
            "applied" => NodeStatus::Applied,
            "failed" => NodeStatus::Failed,
            "deleting" => NodeStatus::Deleting,
            "deleted" => NodeStatus::Deleted,
            "blocked" => NodeStatus::Blocked,
            other => return Err(format!("unknown node status: {}", other)),
        })
    }
}

/// Last known cluster-side state for a node. This is what gets persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    pub generation_seen: u64,
    pub remote_fingerprint: Option<String>,
    pub status: NodeStatus,
}

/// Direction of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskAction {
    Apply,
    Delete,
}

/// Unit of work for one node in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileTask {
    pub idx: NodeIdx,
    pub node: NodeId,
    pub desired_generation: u64,
    pub attempt: u32,
    pub action: TaskAction,
}

/// Change seen on the cluster for a managed object; `object: None` means it was deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub id: NodeId,
    pub object: Option<Json>,
}

/// Errors surfaced by a cluster API client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Network trouble, timeouts, conflicts, throttling: worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Invalid spec, permission denied: retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

/// External collaborator performing the actual cluster mutations.
///
/// `kind` is the node's opaque kind tag; implementations decide how to interpret it.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create(&self, kind: &str, namespace: Option<&str>, spec: &Spec) -> Result<Json, ClusterError>;

    async fn update(&self, kind: &str, namespace: Option<&str>, name: &str, fields: &Spec) -> Result<Json, ClusterError>;

    /// Idempotent: a missing object is success.
    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<(), ClusterError>;

    /// Only used to resynchronize the shadow copy.
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<Json>, ClusterError>;
}

pub mod prelude {
    pub use super::{
        ClusterClient, ClusterError, DeletionPolicy, GraphBuilder, GraphValidationError, NodeId, NodeIdx, NodeStatus,
        ObservedState, ReconcileTask, RemoteEvent, ResourceGraph, ResourceNode, Spec, TaskAction,
    };
}
