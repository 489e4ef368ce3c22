//! Resource graph model: validated, immutable desired-state submissions.
//!
//! Nodes are stored sorted by id and addressed by dense indices so that
//! schedulers can keep per-node counters in flat arrays.

use std::collections::{BTreeMap, BinaryHeap};
use std::cmp::Reverse;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{NodeId, ResourceNode, Spec, NAMESPACE_KIND};

/// Dense index of a node inside one `ResourceGraph`.
pub type NodeIdx = usize;

type Edges = SmallVec<[NodeIdx; 4]>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphValidationError {
    #[error("duplicate node id {0}")]
    Duplicate(NodeId),
    #[error("node {node} depends on unknown node {missing}")]
    Dangling { node: NodeId, missing: NodeId },
    #[error("dependency cycle: {}", render_cycle(.cycle))]
    Cycle { cycle: Vec<NodeId> },
}

impl GraphValidationError {
    /// Node(s) the failure is attributed to.
    pub fn offending(&self) -> Vec<&NodeId> {
        match self {
            GraphValidationError::Duplicate(id) => vec![id],
            GraphValidationError::Dangling { node, .. } => vec![node],
            GraphValidationError::Cycle { cycle } => cycle.iter().collect(),
        }
    }
}

fn render_cycle(cycle: &[NodeId]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

/// Immutable snapshot of one desired-state submission.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    generation: u64,
    nodes: Vec<ResourceNode>,
    index: FxHashMap<NodeId, NodeIdx>,
    deps: Vec<Edges>,
    rdeps: Vec<Edges>,
}

impl ResourceGraph {
    /// Validate `nodes` and build the graph. All-or-nothing: duplicates,
    /// dangling references and cycles reject the whole submission.
    pub fn submit(generation: u64, nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Self, GraphValidationError> {
        let mut by_id: BTreeMap<NodeId, ResourceNode> = BTreeMap::new();
        for node in nodes {
            if by_id.contains_key(&node.id) {
                return Err(GraphValidationError::Duplicate(node.id));
            }
            by_id.insert(node.id.clone(), node);
        }
        let nodes: Vec<ResourceNode> = by_id.into_values().collect();
        let index: FxHashMap<NodeId, NodeIdx> = nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), i)).collect();

        let mut deps: Vec<Edges> = vec![Edges::new(); nodes.len()];
        let mut rdeps: Vec<Edges> = vec![Edges::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in node.depends_on.iter() {
                let Some(&j) = index.get(dep) else {
                    return Err(GraphValidationError::Dangling { node: node.id.clone(), missing: dep.clone() });
                };
                deps[i].push(j);
                rdeps[j].push(i);
            }
        }

        if let Some(cycle) = find_cycle(&deps) {
            return Err(GraphValidationError::Cycle { cycle: cycle.into_iter().map(|i| nodes[i].id.clone()).collect() });
        }

        Ok(Self { generation, nodes, index, deps, rdeps })
    }

    pub fn generation(&self) -> u64 { self.generation }
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn nodes(&self) -> &[ResourceNode] { &self.nodes }
    pub fn node(&self, idx: NodeIdx) -> &ResourceNode { &self.nodes[idx] }
    pub fn index_of(&self, id: &NodeId) -> Option<NodeIdx> { self.index.get(id).copied() }
    pub fn get(&self, id: &NodeId) -> Option<&ResourceNode> { self.index_of(id).map(|i| &self.nodes[i]) }
    pub fn contains(&self, id: &NodeId) -> bool { self.index.contains_key(id) }

    /// Nodes `idx` depends on.
    pub fn dependencies(&self, idx: NodeIdx) -> &[NodeIdx] { &self.deps[idx] }

    /// Nodes depending on `idx` (reverse index, used for fan-out on completion).
    pub fn dependents(&self, idx: NodeIdx) -> &[NodeIdx] { &self.rdeps[idx] }

    /// Deterministic topological order; ties are broken by node id.
    pub fn topological_order(&self) -> Vec<NodeIdx> {
        let mut indeg: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut ready: BinaryHeap<Reverse<NodeIdx>> = indeg.iter().enumerate().filter(|(_, d)| **d == 0).map(|(i, _)| Reverse(i)).collect();
        let mut out = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            out.push(i);
            for &j in self.rdeps[i].iter() {
                indeg[j] -= 1;
                if indeg[j] == 0 { ready.push(Reverse(j)); }
            }
        }
        out
    }
}

/// Iterative DFS with an on-stack marker. Returns the nodes on the first cycle found.
fn find_cycle(deps: &[Edges]) -> Option<Vec<NodeIdx>> {
    const WHITE: u8 = 0;
    const ON_STACK: u8 = 1;
    const DONE: u8 = 2;
    let mut mark = vec![WHITE; deps.len()];
    let mut path: Vec<NodeIdx> = Vec::new();
    let mut stack: Vec<(NodeIdx, usize)> = Vec::new();
    for root in 0..deps.len() {
        if mark[root] != WHITE { continue; }
        mark[root] = ON_STACK;
        path.push(root);
        stack.push((root, 0));
        while let Some((node, child)) = stack.last_mut() {
            let node = *node;
            if let Some(&next) = deps[node].get(*child) {
                *child += 1;
                match mark[next] {
                    WHITE => {
                        mark[next] = ON_STACK;
                        path.push(next);
                        stack.push((next, 0));
                    }
                    ON_STACK => {
                        let start = path.iter().position(|&p| p == next).unwrap_or(0);
                        return Some(path[start..].to_vec());
                    }
                    _ => {}
                }
            } else {
                mark[node] = DONE;
                path.pop();
                stack.pop();
            }
        }
    }
    None
}

/// Data-driven graph construction. With implicit namespace edges on (default),
/// every namespaced node gets a `dependsOn` edge to its namespace node when
/// that namespace is part of the same submission.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    nodes: Vec<ResourceNode>,
    implicit_namespace_edges: bool,
}

impl Default for GraphBuilder {
    fn default() -> Self { Self::new() }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self { nodes: Vec::new(), implicit_namespace_edges: true }
    }

    pub fn implicit_namespace_edges(mut self, on: bool) -> Self {
        self.implicit_namespace_edges = on;
        self
    }

    /// Add a namespace node with a minimal spec.
    pub fn namespace(&mut self, name: &str, labels: &[(&str, &str)]) -> NodeId {
        let mut meta = Spec::new();
        meta.insert("name".into(), name.into());
        if !labels.is_empty() {
            let l: Spec = labels.iter().map(|(k, v)| (k.to_string(), serde_json::Value::from(*v))).collect();
            meta.insert("labels".into(), l.into());
        }
        let mut spec = Spec::new();
        spec.insert("metadata".into(), meta.into());
        self.add(ResourceNode::new(NodeId::cluster(NAMESPACE_KIND, name), spec))
    }

    pub fn add(&mut self, node: ResourceNode) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn build(self, generation: u64) -> Result<ResourceGraph, GraphValidationError> {
        let mut nodes = self.nodes;
        if self.implicit_namespace_edges {
            let namespaces: FxHashMap<String, NodeId> = nodes
                .iter()
                .filter(|n| n.id.is_namespace())
                .map(|n| (n.id.name.clone(), n.id.clone()))
                .collect();
            for node in nodes.iter_mut() {
                if let Some(ns_id) = node.id.namespace.as_ref().and_then(|ns| namespaces.get(ns)) {
                    if *ns_id != node.id {
                        node.depends_on.insert(ns_id.clone());
                    }
                }
            }
        }
        ResourceGraph::submit(generation, nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(name: &str, deps: &[&str]) -> ResourceNode {
        let mut n = ResourceNode::new(NodeId::cluster("v1/ConfigMap", name), Spec::new());
        for d in deps {
            n = n.depends_on(NodeId::cluster("v1/ConfigMap", *d));
        }
        n
    }

    fn id(name: &str) -> NodeId { NodeId::cluster("v1/ConfigMap", name) }

    #[test]
    fn diamond_submits_with_reverse_index() {
        let g = ResourceGraph::submit(1, vec![node("a", &[]), node("b", &["a"]), node("c", &["a"]), node("d", &["b", "c"])]).unwrap();
        let a = g.index_of(&id("a")).unwrap();
        let mut fanout: Vec<_> = g.dependents(a).iter().map(|&i| g.node(i).id.name.clone()).collect();
        fanout.sort();
        assert_eq!(fanout, vec!["b", "c"]);
        let order: Vec<_> = g.topological_order().into_iter().map(|i| g.node(i).id.name.clone()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let err = ResourceGraph::submit(1, vec![node("a", &["b"]), node("b", &["a"])]).unwrap_err();
        match &err {
            GraphValidationError::Cycle { cycle } => {
                assert_eq!(cycle.len(), 2);
                assert!(cycle.contains(&id("a")) && cycle.contains(&id("b")));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        assert!(err.to_string().starts_with("dependency cycle: "));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let err = ResourceGraph::submit(1, vec![node("a", &["a"])]).unwrap_err();
        assert_eq!(err, GraphValidationError::Cycle { cycle: vec![id("a")] });
    }

    #[test]
    fn dangling_and_duplicate_are_rejected() {
        let err = ResourceGraph::submit(1, vec![node("a", &["ghost"])]).unwrap_err();
        assert_eq!(err, GraphValidationError::Dangling { node: id("a"), missing: id("ghost") });
        let err = ResourceGraph::submit(1, vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert_eq!(err, GraphValidationError::Duplicate(id("a")));
        assert_eq!(err.offending(), vec![&id("a")]);
    }

    #[test]
    fn builder_adds_namespace_edges() {
        let mut b = GraphBuilder::new();
        let ns = b.namespace("metallb-system", &[("app", "metallb")]);
        let sa = b.add(ResourceNode::new(NodeId::namespaced("v1/ServiceAccount", "metallb-system", "speaker"), Spec::new()));
        let other = b.add(ResourceNode::new(NodeId::namespaced("v1/ServiceAccount", "elsewhere", "x"), Spec::new()));
        let g = b.build(3).unwrap();
        assert_eq!(g.generation(), 3);
        assert!(g.get(&sa).unwrap().depends_on.contains(&ns));
        assert!(g.get(&other).unwrap().depends_on.is_empty());
        assert!(g.get(&ns).unwrap().depends_on.is_empty());
        let labels = &g.get(&ns).unwrap().desired_spec["metadata"]["labels"];
        assert_eq!(labels["app"], "metallb");
    }

    #[test]
    fn builder_without_implicit_edges_keeps_nodes_untouched() {
        let mut b = GraphBuilder::new().implicit_namespace_edges(false);
        b.namespace("ns", &[]);
        let sa = b.add(ResourceNode::new(NodeId::namespaced("v1/ServiceAccount", "ns", "x"), Spec::new()));
        let g = b.build(1).unwrap();
        assert!(g.get(&sa).unwrap().depends_on.is_empty());
    }

    // Edges only point from higher to lower index: acyclic by construction.
    fn acyclic_edges() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (2usize..12).prop_flat_map(|n| {
            let edges = proptest::collection::vec((1..n, 0..n), 0..(n * 2))
                .prop_map(|v| v.into_iter().filter(|(a, b)| b < a).collect::<Vec<_>>());
            (Just(n), edges)
        })
    }

    fn build(n: usize, edges: &[(usize, usize)]) -> Vec<ResourceNode> {
        (0..n)
            .map(|i| {
                let mut nd = ResourceNode::new(id(&format!("n{}", i)), Spec::new());
                for (_, b) in edges.iter().filter(|(a, _)| *a == i) {
                    nd = nd.depends_on(id(&format!("n{}", b)));
                }
                nd
            })
            .collect()
    }

    proptest! {
        #[test]
        fn acyclic_graphs_submit((n, edges) in acyclic_edges()) {
            let g = ResourceGraph::submit(1, build(n, &edges)).unwrap();
            let order = g.topological_order();
            prop_assert_eq!(order.len(), n);
            let pos: FxHashMap<NodeIdx, usize> = order.iter().enumerate().map(|(p, &i)| (i, p)).collect();
            for i in 0..n {
                for &d in g.dependencies(i) {
                    prop_assert!(pos[&d] < pos[&i]);
                }
            }
        }

        #[test]
        fn back_edge_makes_submit_fail((n, edges) in acyclic_edges(), pick in 0usize..64) {
            prop_assume!(!edges.is_empty());
            // Close a cycle: the edge a -> b plus b -> a.
            let (a, b) = edges[pick % edges.len()];
            let mut all = edges.clone();
            all.push((b, a));
            let err = ResourceGraph::submit(1, build(n, &all)).unwrap_err();
            match err {
                GraphValidationError::Cycle { cycle } => {
                    prop_assert!(!cycle.is_empty());
                    // every reported node is part of some cycle: it can reach itself
                    let g_nodes = build(n, &all);
                    for c in cycle.iter() {
                        prop_assert!(reaches_self(&g_nodes, c));
                    }
                }
                other => prop_assert!(false, "expected cycle, got {:?}", other),
            }
        }
    }

    fn reaches_self(nodes: &[ResourceNode], start: &NodeId) -> bool {
        let by_id: FxHashMap<&NodeId, &ResourceNode> = nodes.iter().map(|n| (&n.id, n)).collect();
        let mut seen = rustc_hash::FxHashSet::default();
        let mut stack: Vec<&NodeId> = by_id[start].depends_on.iter().collect();
        while let Some(cur) = stack.pop() {
            if cur == start { return true; }
            if seen.insert(cur) {
                stack.extend(by_id[cur].depends_on.iter());
            }
        }
        false
    }
}
