//! Errors surfaced by structural graph edits.
//!
//! Every variant here is recoverable: the edit is rejected and the graph is
//! left exactly as it was. Programmer-usage violations (slot index out of
//! range, lock misuse) are not represented here; they panic.

use crate::dependency::NodeId;
use crate::multiplicity::Key;
use thiserror::Error;

/// Rejection of a structural edit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The node was never added or has been removed.
    #[error("node {0} not found")]
    InvalidNode(NodeId),
    /// The dependency already reaches the dependent.
    #[error("adding {dependent} -> {dependency} would create a cycle")]
    Cycle {
        /// Node that would gain the dependency.
        dependent: NodeId,
        /// Node that would be depended upon.
        dependency: NodeId,
    },
    /// A stateful number node would be evaluated where its state cannot be resolved.
    #[error("state visibility rule rejects {node}: {reason}")]
    Policy {
        /// The stateful node whose state would become unreachable.
        node: NodeId,
        /// Which half of the rule failed.
        reason: &'static str,
    },
    /// An uncontrolled node may have at most one dependent sound node.
    #[error("uncontrolled node {node} already has dependent {existing}")]
    Multiplicity {
        /// The uncontrolled node.
        node: NodeId,
        /// Its current dependent.
        existing: NodeId,
    },
    /// The edge already exists.
    #[error("{dependent} already depends on {dependency}")]
    DuplicateEdge {
        /// Dependent end.
        dependent: NodeId,
        /// Dependency end.
        dependency: NodeId,
    },
    /// The edge does not exist.
    #[error("{dependent} does not depend on {dependency}")]
    EdgeNotFound {
        /// Dependent end.
        dependent: NodeId,
        /// Dependency end.
        dependency: NodeId,
    },
    /// Number nodes are evaluated inline and cannot pull audio.
    #[error("number node {dependent} cannot depend on sound node {dependency}")]
    KindMismatch {
        /// The number node.
        dependent: NodeId,
        /// The sound node.
        dependency: NodeId,
    },
    /// The operation needs a sound node.
    #[error("node {0} is not a sound node")]
    NotSound(NodeId),
    /// The operation needs a number node.
    #[error("node {0} is not a number node")]
    NotNumber(NodeId),
    /// Keys only exist on divergent nodes.
    #[error("node {0} is not divergent")]
    NotDivergent(NodeId),
    /// The key is already present.
    #[error("node {node} already has key {key}")]
    DuplicateKey {
        /// The divergent node.
        node: NodeId,
        /// The duplicated key.
        key: Key,
    },
    /// The key is not present.
    #[error("node {node} has no key {key}")]
    KeyNotFound {
        /// The divergent node.
        node: NodeId,
        /// The missing key.
        key: Key,
    },
    /// Only stateful number nodes can borrow state.
    #[error("number node {0} keeps no state and cannot borrow")]
    Stateless(NodeId),
    /// The node has no settable value.
    #[error("node {0} does not accept values")]
    NotSettable(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_both_endpoints() {
        let err = GraphError::Cycle {
            dependent: NodeId(1),
            dependency: NodeId(2),
        };
        assert_eq!(
            err.to_string(),
            "adding NodeId(1) -> NodeId(2) would create a cycle"
        );
        let err = GraphError::KeyNotFound {
            node: NodeId(0),
            key: Key(7),
        };
        assert_eq!(err.to_string(), "node NodeId(0) has no key Key(7)");
    }
}
