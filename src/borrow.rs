//! Visibility rule for borrowed number state.
//!
//! A stateful number node finds its state by walking the evaluation context
//! outward until it meets a slot of its lender. The rule checked here makes
//! sure that walk can succeed wherever the node can be evaluated:
//!
//! * for every attached node `u` that depends on `x` and every attached node
//!   `d` that `x` depends on (both including `x`), the lender of `d` must be
//!   the lender of `u` or one of its dependents;
//! * for every sound node `s` that evaluates `x` directly, the lender of
//!   every attached `d` must be `s` or one of its dependents.
//!
//! Unattached nodes evaluate to their neutral value and are not checked.

use crate::dependency::{DependencyGraph, NodeId, SignalKind};
use crate::error::GraphError;

/// Answers "who lends to this node".
pub(crate) trait Lenders {
    fn lender(&self, node: NodeId) -> Option<NodeId>;
}

impl<F: Fn(NodeId) -> Option<NodeId>> Lenders for F {
    fn lender(&self, node: NodeId) -> Option<NodeId> {
        self(node)
    }
}

fn is_number(topology: &DependencyGraph, node: NodeId) -> bool {
    topology.kind(node) == Some(SignalKind::Number)
}

/// `x` plus every number node that depends on it.
fn number_consumers(topology: &DependencyGraph, x: NodeId) -> Vec<NodeId> {
    let mut consumers = vec![x];
    consumers.extend(
        topology
            .transitive_dependents(x)
            .into_iter()
            .filter(|n| is_number(topology, *n)),
    );
    consumers
}

/// Sound nodes that evaluate any of `numbers` directly.
fn evaluators(topology: &DependencyGraph, numbers: &[NodeId]) -> Vec<NodeId> {
    let mut sounds: Vec<NodeId> = numbers
        .iter()
        .flat_map(|n| topology.dependents(*n).iter().copied())
        .filter(|n| topology.kind(*n) == Some(SignalKind::Sound))
        .collect();
    sounds.sort_unstable();
    sounds.dedup();
    sounds
}

/// `x` plus everything it depends on.
fn feeders(topology: &DependencyGraph, x: NodeId) -> Vec<NodeId> {
    let mut feeders = vec![x];
    feeders.extend(topology.transitive_dependencies(x));
    feeders
}

fn reaches(topology: &DependencyGraph, from: NodeId, to: NodeId) -> bool {
    from == to || topology.depends_on(from, to)
}

fn check(
    topology: &DependencyGraph,
    lenders: &impl Lenders,
    consumers: &[NodeId],
    sounds: &[NodeId],
    feeders: &[NodeId],
) -> Result<(), GraphError> {
    let attached: Vec<(NodeId, NodeId)> = feeders
        .iter()
        .filter_map(|d| lenders.lender(*d).map(|l| (*d, l)))
        .collect();

    for u in consumers {
        let Some(consumer_lender) = lenders.lender(*u) else {
            continue;
        };
        for &(d, feeder_lender) in &attached {
            if !reaches(topology, feeder_lender, consumer_lender) {
                return Err(GraphError::Policy {
                    node: d,
                    reason: "lender is not visible from a dependent borrower's lender",
                });
            }
        }
    }

    for s in sounds {
        for &(d, feeder_lender) in &attached {
            if !reaches(topology, feeder_lender, *s) {
                return Err(GraphError::Policy {
                    node: d,
                    reason: "lender is not in the evaluating node's context",
                });
            }
        }
    }
    Ok(())
}

/// Check a freshly added edge `dependent -> dependency`, where `dependency`
/// is a number node. `topology` already contains the edge.
pub(crate) fn admit_edge(
    topology: &DependencyGraph,
    lenders: &impl Lenders,
    dependent: NodeId,
    dependency: NodeId,
) -> Result<(), GraphError> {
    let (consumers, sounds) = if is_number(topology, dependent) {
        let consumers = number_consumers(topology, dependent);
        let sounds = evaluators(topology, &consumers);
        (consumers, sounds)
    } else {
        (Vec::new(), vec![dependent])
    };
    check(topology, lenders, &consumers, &sounds, &feeders(topology, dependency))
}

/// Check that `borrower` may borrow from `lender`. `lenders` must already
/// report the new lender for `borrower`.
pub(crate) fn admit_lender(
    topology: &DependencyGraph,
    lenders: &impl Lenders,
    borrower: NodeId,
) -> Result<(), GraphError> {
    let consumers = number_consumers(topology, borrower);
    let sounds = evaluators(topology, &consumers);
    check(topology, lenders, &consumers, &sounds, &feeders(topology, borrower))
}
