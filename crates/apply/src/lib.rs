//! Keel apply: pure diff engine between a desired spec and the cached shadow copy,
//! plus the helpers that shape what gets sent to and remembered from the cluster.

#![forbid(unsafe_code)]

use keel_core::{NodeStatus, ResourceNode, Spec};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

/// One managed field whose desired value is absent or different in the shadow copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: Vec<String>,
    pub desired: Json,
}

impl FieldChange {
    /// JSON pointer form, e.g. `/spec/replicas`.
    pub fn pointer(&self) -> String {
        let mut out = String::new();
        for seg in &self.path {
            out.push('/');
            out.push_str(&seg.replace('~', "~0").replace('/', "~1"));
        }
        out
    }
}

/// Outcome of comparing desired against observed for one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    NoChange,
    Create,
    Update(Vec<FieldChange>),
    Delete,
}

impl Diff {
    pub fn is_noop(&self) -> bool { matches!(self, Diff::NoChange) }
}

/// Whether the shadow copy must be refreshed from the cluster before diffing.
///
/// `Unknown` means first sight or an external-change signal. A node that is
/// neither known-absent (`Pending`, `Deleted`) nor carrying a shadow copy
/// (state loaded from a store after restart) also needs a fresh read.
pub fn needs_resync(status: NodeStatus, shadow: Option<&Json>) -> bool {
    match status {
        NodeStatus::Unknown => true,
        NodeStatus::Pending | NodeStatus::Deleted => false,
        _ => shadow.is_none(),
    }
}

/// Compare `desired` (None = node is being torn down) with the shadow copy.
///
/// Fields present in `desired` but absent or different in the shadow are
/// updates. Fields the shadow carries but `desired` does not are never touched.
pub fn diff(desired: Option<&Spec>, status: NodeStatus, shadow: Option<&Json>) -> Diff {
    match (desired, shadow) {
        (None, None) if matches!(status, NodeStatus::Pending | NodeStatus::Deleted) => Diff::NoChange,
        (None, _) if status == NodeStatus::Deleted => Diff::NoChange,
        (None, _) => Diff::Delete,
        (Some(_), None) => Diff::Create,
        (Some(want), Some(have)) => {
            let changes = changed_fields(want, have);
            if changes.is_empty() { Diff::NoChange } else { Diff::Update(changes) }
        }
    }
}

/// Leaf-level comparison through nested objects; arrays and scalars compare whole.
pub fn changed_fields(desired: &Spec, shadow: &Json) -> Vec<FieldChange> {
    fn walk(want: &Spec, have: Option<&serde_json::Map<String, Json>>, path: &mut Vec<String>, out: &mut Vec<FieldChange>) {
        for (k, wv) in want.iter() {
            path.push(k.clone());
            match (wv, have.and_then(|h| h.get(k))) {
                (Json::Object(wo), Some(Json::Object(ho))) => walk(wo, Some(ho), path, out),
                (_, Some(hv)) if hv == wv => {}
                _ => out.push(FieldChange { path: path.clone(), desired: wv.clone() }),
            }
            path.pop();
        }
    }
    let mut out = Vec::new();
    walk(desired, shadow.as_object(), &mut Vec::new(), &mut out);
    out
}

/// Fold field changes into a sparse merge-patch object.
pub fn merge_patch(changes: &[FieldChange]) -> Spec {
    let mut root = Spec::new();
    for ch in changes {
        let Some((last, parents)) = ch.path.split_last() else { continue };
        let mut cur = &mut root;
        for seg in parents {
            let entry = cur.entry(seg.clone()).or_insert_with(|| Json::Object(Spec::new()));
            if !entry.is_object() {
                *entry = Json::Object(Spec::new());
            }
            match entry {
                Json::Object(m) => cur = m,
                _ => unreachable!("entry was just made an object"),
            }
        }
        cur.insert(last.clone(), ch.desired.clone());
    }
    root
}

/// Body sent on create: the desired spec with `metadata.name`/`metadata.namespace` pinned to the node id.
pub fn render_for_create(node: &ResourceNode) -> Spec {
    let mut spec = node.desired_spec.clone();
    ensure_metadata(&mut spec, &node.id.name, node.id.namespace.as_deref());
    spec
}

fn ensure_metadata(v: &mut Spec, name: &str, ns: Option<&str>) {
    let meta = v.entry("metadata").or_insert_with(|| Json::Object(Spec::new()));
    if !meta.is_object() {
        *meta = Json::Object(Spec::new());
    }
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("name".into(), Json::String(name.to_string()));
        if let Some(ns) = ns { obj.insert("namespace".into(), Json::String(ns.to_string())); }
    }
}

/// Drop server-populated fields that would otherwise make every read look like drift.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("selfLink");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// SHA-256 (hex) over the noise-stripped canonical JSON. Object keys serialize
/// in sorted order, so equal content hashes equal.
pub fn fingerprint(remote: &Json) -> String {
    let stripped = strip_noisy(remote.clone());
    let bytes = serde_json::to_vec(&stripped).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
