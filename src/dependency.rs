//! Dependency bookkeeping shared by sound and number nodes.
//!
//! Edges are indexed from both ends, so dependencies and dependents of a node
//! are available without scanning the edge set. The relation is kept acyclic:
//! an edge is refused if the dependency already (transitively) depends on the
//! dependent.

use crate::error::GraphError;
use std::collections::VecDeque;
use std::fmt;

/// Unique identifier for a node. Ids are never reused within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Which signal a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Audio-rate chunks.
    Sound,
    /// Scalar values.
    Number,
}

/// Both edge directions of one node, in insertion order.
#[derive(Debug, Clone)]
pub struct Adjacency {
    /// Kind of the node.
    pub kind: SignalKind,
    /// Nodes this node pulls from.
    pub dependencies: Vec<NodeId>,
    /// Nodes pulling from this node.
    pub dependents: Vec<NodeId>,
}

/// The dependency DAG over every node of a graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Option<Adjacency>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Add a node with no edges.
    pub fn add_node(&mut self, kind: SignalKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Adjacency {
            kind,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }));
        id
    }

    /// True if the node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.adjacency(id).is_ok()
    }

    /// Kind of a live node.
    pub fn kind(&self, id: NodeId) -> Option<SignalKind> {
        self.adjacency(id).ok().map(|a| a.kind)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// True if there are no live nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of live nodes in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i))
    }

    fn adjacency(&self, id: NodeId) -> Result<&Adjacency, GraphError> {
        self.nodes
            .get(id.0)
            .and_then(|n| n.as_ref())
            .ok_or(GraphError::InvalidNode(id))
    }

    fn adjacency_mut(&mut self, id: NodeId) -> Result<&mut Adjacency, GraphError> {
        self.nodes
            .get_mut(id.0)
            .and_then(|n| n.as_mut())
            .ok_or(GraphError::InvalidNode(id))
    }

    /// Direct dependencies, in insertion order. Empty for unknown nodes.
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        self.adjacency(id)
            .map(|a| a.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Direct dependents, in insertion order. Empty for unknown nodes.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.adjacency(id)
            .map(|a| a.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// The `index`-th direct dependency of the given kind.
    pub fn nth_dependency(&self, id: NodeId, kind: SignalKind, index: usize) -> Option<NodeId> {
        self.dependencies(id)
            .iter()
            .copied()
            .filter(|d| self.kind(*d) == Some(kind))
            .nth(index)
    }

    /// Number of direct dependencies of the given kind.
    pub fn count_dependencies(&self, id: NodeId, kind: SignalKind) -> usize {
        self.dependencies(id)
            .iter()
            .filter(|d| self.kind(**d) == Some(kind))
            .count()
    }

    /// True if `dependent` directly depends on `dependency`.
    pub fn has_edge(&self, dependent: NodeId, dependency: NodeId) -> bool {
        self.dependencies(dependent).contains(&dependency)
    }

    /// True if `node` reaches `target` through one or more dependency edges.
    pub fn depends_on(&self, node: NodeId, target: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.dependencies(node).to_vec();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if visited[current.0] {
                continue;
            }
            visited[current.0] = true;
            stack.extend_from_slice(self.dependencies(current));
        }
        false
    }

    /// Every node reachable through dependency edges, excluding `id`.
    pub fn transitive_dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.walk(id, |a| &a.dependencies)
    }

    /// Every node reaching `id` through dependency edges, excluding `id`.
    pub fn transitive_dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.walk(id, |a| &a.dependents)
    }

    fn walk(&self, start: NodeId, next: impl Fn(&Adjacency) -> &Vec<NodeId>) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut found = Vec::new();
        let Ok(adjacency) = self.adjacency(start) else {
            return found;
        };
        if start.0 < visited.len() {
            visited[start.0] = true;
        }
        let mut stack: Vec<NodeId> = next(adjacency).clone();
        while let Some(current) = stack.pop() {
            if visited[current.0] {
                continue;
            }
            visited[current.0] = true;
            found.push(current);
            if let Ok(adjacency) = self.adjacency(current) {
                stack.extend(next(adjacency).iter().copied());
            }
        }
        found
    }

    /// Validate an edge without adding it.
    pub fn check_edge(&self, dependent: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        let dependent_kind = self.adjacency(dependent)?.kind;
        let dependency_kind = self.adjacency(dependency)?.kind;
        if dependent_kind == SignalKind::Number && dependency_kind == SignalKind::Sound {
            return Err(GraphError::KindMismatch {
                dependent,
                dependency,
            });
        }
        if self.has_edge(dependent, dependency) {
            return Err(GraphError::DuplicateEdge {
                dependent,
                dependency,
            });
        }
        if dependent == dependency || self.depends_on(dependency, dependent) {
            return Err(GraphError::Cycle {
                dependent,
                dependency,
            });
        }
        Ok(())
    }

    /// Add an edge with no admission predicate.
    pub fn add_dependency(&mut self, dependent: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        self.add_dependency_with(dependent, dependency, |_| Ok(()))
    }

    /// Add an edge, then let `admit` inspect the resulting graph. If it
    /// refuses, the edge is withdrawn and its error returned.
    pub fn add_dependency_with<F>(
        &mut self,
        dependent: NodeId,
        dependency: NodeId,
        admit: F,
    ) -> Result<(), GraphError>
    where
        F: FnOnce(&Self) -> Result<(), GraphError>,
    {
        self.check_edge(dependent, dependency)?;
        self.adjacency_mut(dependent)?.dependencies.push(dependency);
        self.adjacency_mut(dependency)?.dependents.push(dependent);
        if let Err(err) = admit(self) {
            self.unlink(dependent, dependency);
            return Err(err);
        }
        Ok(())
    }

    /// Remove an existing edge.
    pub fn remove_dependency(&mut self, dependent: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        self.adjacency(dependent)?;
        self.adjacency(dependency)?;
        if !self.has_edge(dependent, dependency) {
            return Err(GraphError::EdgeNotFound {
                dependent,
                dependency,
            });
        }
        self.unlink(dependent, dependency);
        Ok(())
    }

    fn unlink(&mut self, dependent: NodeId, dependency: NodeId) {
        if let Ok(a) = self.adjacency_mut(dependent) {
            a.dependencies.retain(|d| *d != dependency);
        }
        if let Ok(a) = self.adjacency_mut(dependency) {
            a.dependents.retain(|d| *d != dependent);
        }
    }

    /// Sever every edge of `id`, then remove it. Returns the severed edges
    /// as `(dependent, dependency)` pairs.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Vec<(NodeId, NodeId)>, GraphError> {
        let adjacency = self.adjacency(id)?.clone();
        let mut severed = Vec::with_capacity(adjacency.dependencies.len() + adjacency.dependents.len());
        for dependency in adjacency.dependencies {
            self.unlink(id, dependency);
            severed.push((id, dependency));
        }
        for dependent in adjacency.dependents {
            self.unlink(dependent, id);
            severed.push((dependent, id));
        }
        self.nodes[id.0] = None;
        Ok(severed)
    }

    /// Live nodes ordered so that every dependency precedes its dependents.
    /// Ties are broken by id, so the order is deterministic.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut pending = vec![0usize; self.nodes.len()];
        let mut queue = VecDeque::new();
        for id in self.node_ids() {
            pending[id.0] = self.dependencies(id).len();
            if pending[id.0] == 0 {
                queue.push_back(id);
            }
        }

        let mut order = Vec::with_capacity(pending.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &dependent in self.dependents(node) {
                pending[dependent.0] -= 1;
                if pending[dependent.0] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        order
    }

    /// Position of every node in [`topological_order`](Self::topological_order),
    /// indexed by id. Removed ids rank `usize::MAX`.
    pub fn ranks(&self) -> Vec<usize> {
        let mut ranks = vec![usize::MAX; self.nodes.len()];
        for (rank, id) in self.topological_order().into_iter().enumerate() {
            ranks[id.0] = rank;
        }
        ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sound_graph(n: usize) -> (DependencyGraph, Vec<NodeId>) {
        let mut graph = DependencyGraph::new();
        let ids = (0..n).map(|_| graph.add_node(SignalKind::Sound)).collect();
        (graph, ids)
    }

    #[test]
    fn cycle_is_rejected() {
        let (mut graph, ids) = sound_graph(3);
        graph.add_dependency(ids[0], ids[1]).unwrap();
        graph.add_dependency(ids[1], ids[2]).unwrap();
        assert_eq!(
            graph.add_dependency(ids[2], ids[0]),
            Err(GraphError::Cycle {
                dependent: ids[2],
                dependency: ids[0]
            })
        );
        assert_eq!(
            graph.add_dependency(ids[1], ids[1]),
            Err(GraphError::Cycle {
                dependent: ids[1],
                dependency: ids[1]
            })
        );
    }

    #[test]
    fn number_cannot_pull_sound() {
        let mut graph = DependencyGraph::new();
        let sound = graph.add_node(SignalKind::Sound);
        let number = graph.add_node(SignalKind::Number);
        assert!(matches!(
            graph.add_dependency(number, sound),
            Err(GraphError::KindMismatch { .. })
        ));
        graph.add_dependency(sound, number).unwrap();
        assert_eq!(graph.nth_dependency(sound, SignalKind::Number, 0), Some(number));
        assert_eq!(graph.nth_dependency(sound, SignalKind::Sound, 0), None);
    }

    #[test]
    fn rejected_admission_withdraws_edge() {
        let (mut graph, ids) = sound_graph(2);
        let result = graph.add_dependency_with(ids[0], ids[1], |g| {
            assert!(g.has_edge(ids[0], ids[1]));
            Err(GraphError::Policy {
                node: ids[1],
                reason: "test",
            })
        });
        assert!(result.is_err());
        assert!(!graph.has_edge(ids[0], ids[1]));
        assert!(graph.dependents(ids[1]).is_empty());
    }

    #[test]
    fn remove_node_severs_both_directions() {
        let (mut graph, ids) = sound_graph(3);
        graph.add_dependency(ids[0], ids[1]).unwrap();
        graph.add_dependency(ids[1], ids[2]).unwrap();
        let severed = graph.remove_node(ids[1]).unwrap();
        assert_eq!(severed, vec![(ids[1], ids[2]), (ids[0], ids[1])]);
        assert!(graph.dependencies(ids[0]).is_empty());
        assert!(graph.dependents(ids[2]).is_empty());
        assert!(!graph.contains(ids[1]));
        assert_eq!(graph.remove_node(ids[1]), Err(GraphError::InvalidNode(ids[1])));
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let (mut graph, ids) = sound_graph(4);
        graph.add_dependency(ids[0], ids[3]).unwrap();
        graph.add_dependency(ids[3], ids[1]).unwrap();
        graph.add_dependency(ids[2], ids[1]).unwrap();
        let ranks = graph.ranks();
        assert!(ranks[ids[1].0] < ranks[ids[3].0]);
        assert!(ranks[ids[3].0] < ranks[ids[0].0]);
        assert!(ranks[ids[1].0] < ranks[ids[2].0]);
    }

    fn reference_closure(n: usize, edges: &[(usize, usize)]) -> Vec<Vec<bool>> {
        let mut reach = vec![vec![false; n]; n];
        for &(a, b) in edges {
            reach[a][b] = true;
        }
        for k in 0..n {
            for i in 0..n {
                for j in 0..n {
                    if reach[i][k] && reach[k][j] {
                        reach[i][j] = true;
                    }
                }
            }
        }
        reach
    }

    proptest! {
        #[test]
        fn transitive_query_matches_reference(
            pairs in proptest::collection::vec((0usize..12, 0usize..12), 0..40)
        ) {
            let (mut graph, ids) = sound_graph(12);
            let mut accepted = Vec::new();
            for (a, b) in pairs {
                let before = reference_closure(12, &accepted);
                let result = graph.add_dependency(ids[a], ids[b]);
                let duplicate = accepted.contains(&(a, b));
                let cyclic = a == b || before[b][a];
                prop_assert_eq!(result.is_ok(), !duplicate && !cyclic);
                if result.is_ok() {
                    accepted.push((a, b));
                }
            }
            let reach = reference_closure(12, &accepted);
            for a in 0..12 {
                let mut deps: Vec<usize> = graph.transitive_dependencies(ids[a]).iter().map(|n| n.0).collect();
                deps.sort_unstable();
                let expected: Vec<usize> = (0..12).filter(|&b| reach[a][b]).collect();
                prop_assert_eq!(deps, expected);
                for b in 0..12 {
                    prop_assert_eq!(graph.depends_on(ids[a], ids[b]), reach[a][b]);
                }
            }
        }

        #[test]
        fn add_then_remove_restores_reachability(
            pairs in proptest::collection::vec((0usize..8, 0usize..8), 0..20),
            extra in (0usize..8, 0usize..8),
        ) {
            let (mut graph, ids) = sound_graph(8);
            for (a, b) in pairs {
                let _ = graph.add_dependency(ids[a], ids[b]);
            }
            let snapshot: Vec<(Vec<NodeId>, Vec<NodeId>)> = ids
                .iter()
                .map(|id| {
                    let mut deps = graph.transitive_dependencies(*id);
                    let mut dependents = graph.transitive_dependents(*id);
                    deps.sort();
                    dependents.sort();
                    (deps, dependents)
                })
                .collect();
            if graph.add_dependency(ids[extra.0], ids[extra.1]).is_ok() {
                graph.remove_dependency(ids[extra.0], ids[extra.1]).unwrap();
            }
            for (id, (deps, dependents)) in ids.iter().zip(snapshot) {
                let mut now_deps = graph.transitive_dependencies(*id);
                let mut now_dependents = graph.transitive_dependents(*id);
                now_deps.sort();
                now_dependents.sort();
                prop_assert_eq!(now_deps, deps);
                prop_assert_eq!(now_dependents, dependents);
            }
        }
    }
}
