//! DSL module: builder API for graphs.

use crate::dependency::NodeId;
use crate::error::GraphError;
use crate::graph::Graph;
use crate::multiplicity::Key;
use crate::node::{NumberSource, SoundSource, StatefulNumberSource};
use crate::EngineConfig;
use std::collections::HashMap;
use thiserror::Error;

/// Handle to a node in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(pub NodeId);

/// The graph builder.
#[derive(Debug)]
pub struct GraphBuilder {
    graph: Graph,
    node_names: HashMap<String, NodeId>,
}

impl GraphBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a builder for a graph with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            graph: Graph::new(config),
            node_names: HashMap::new(),
        }
    }

    fn claim(&self, name: &str) -> Result<(), DslError> {
        if self.node_names.contains_key(name) {
            return Err(DslError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Add a sound node.
    pub fn sound<S: SoundSource>(&mut self, source: S) -> NodeHandle {
        NodeHandle(self.graph.add_sound(source))
    }

    /// Add a named sound node.
    pub fn sound_named<S: SoundSource>(&mut self, name: &str, source: S) -> Result<NodeHandle, DslError> {
        self.claim(name)?;
        let id = self.graph.add_sound_named(name, source);
        self.node_names.insert(name.to_string(), id);
        Ok(NodeHandle(id))
    }

    /// Add a pure number node.
    pub fn number<N: NumberSource>(&mut self, source: N) -> NodeHandle {
        NodeHandle(self.graph.add_number(source))
    }

    /// Add a named pure number node.
    pub fn number_named<N: NumberSource>(&mut self, name: &str, source: N) -> Result<NodeHandle, DslError> {
        self.claim(name)?;
        let id = self.graph.add_number_named(name, source);
        self.node_names.insert(name.to_string(), id);
        Ok(NodeHandle(id))
    }

    /// Add a stateful number node.
    pub fn stateful<N: StatefulNumberSource>(&mut self, source: N) -> NodeHandle {
        NodeHandle(self.graph.add_stateful_number(source))
    }

    /// Add a named stateful number node.
    pub fn stateful_named<N: StatefulNumberSource>(
        &mut self,
        name: &str,
        source: N,
    ) -> Result<NodeHandle, DslError> {
        self.claim(name)?;
        let id = self.graph.add_stateful_number_named(name, source);
        self.node_names.insert(name.to_string(), id);
        Ok(NodeHandle(id))
    }

    /// Look up a named node.
    pub fn handle(&self, name: &str) -> Result<NodeHandle, DslError> {
        self.node_names
            .get(name)
            .map(|id| NodeHandle(*id))
            .ok_or_else(|| DslError::UnknownName(name.to_string()))
    }

    /// Make `dependent` pull from `dependency`.
    pub fn connect(&mut self, dependent: NodeHandle, dependency: NodeHandle) -> Result<(), DslError> {
        self.graph.add_dependency(dependent.0, dependency.0)?;
        Ok(())
    }

    /// [`connect`](Self::connect) by name.
    pub fn connect_named(&mut self, dependent: &str, dependency: &str) -> Result<(), DslError> {
        let dependent = self.handle(dependent)?;
        let dependency = self.handle(dependency)?;
        self.connect(dependent, dependency)
    }

    /// Attach a stateful number node to its lender.
    pub fn borrow(&mut self, borrower: NodeHandle, lender: NodeHandle) -> Result<(), DslError> {
        self.graph.borrow_from(borrower.0, Some(lender.0))?;
        Ok(())
    }

    /// Add a key to a divergent node.
    pub fn key(&mut self, node: NodeHandle, key: Key) -> Result<(), DslError> {
        self.graph.add_key(node.0, key)?;
        Ok(())
    }

    /// Build the graph.
    pub fn build(self) -> Graph {
        self.graph
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DslError {
    /// The graph rejected the edit.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// No node was registered under this name.
    #[error("no node named {0:?}")]
    UnknownName(String),
    /// A node is already registered under this name.
    #[error("name {0:?} already in use")]
    DuplicateName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::nodes::{ConstantSound, Counter, Ensemble, Mixer};

    #[test]
    fn dsl_equivalence() {
        let mut builder = GraphBuilder::new();
        let mix = builder.sound_named("mix", Mixer).unwrap();
        let voice = builder.sound_named("voice", ConstantSound::divergent(0.25, 0.25)).unwrap();
        let ensemble = builder.sound(Ensemble);
        builder.connect(mix, ensemble).unwrap();
        builder.connect(ensemble, voice).unwrap();
        builder.key(voice, Key(1)).unwrap();
        builder.key(voice, Key(2)).unwrap();
        let dsl_graph = builder.build();

        let manual_graph = Graph::default();
        let m_mix = manual_graph.add_sound(Mixer);
        let m_voice = manual_graph.add_sound(ConstantSound::divergent(0.25, 0.25));
        let m_ensemble = manual_graph.add_sound(Ensemble);
        manual_graph.add_dependency(m_mix, m_ensemble).unwrap();
        manual_graph.add_dependency(m_ensemble, m_voice).unwrap();
        manual_graph.add_key(m_voice, Key(1)).unwrap();
        manual_graph.add_key(m_voice, Key(2)).unwrap();

        let mut a = Chunk::new();
        let mut b = Chunk::new();
        dsl_graph.render_chunk(mix.0, &mut a);
        manual_graph.render_chunk(m_mix, &mut b);
        assert_eq!(a, b);
        assert_eq!(a[0], [0.5, 0.5]);
        assert_eq!(dsl_graph.name(voice.0).as_deref(), Some("voice"));
    }

    #[test]
    fn ui_tests() {
        let mut builder = GraphBuilder::new();
        builder.sound_named("a", Mixer).unwrap();
        builder.sound_named("b", Mixer).unwrap();
        builder.stateful_named("count", Counter).unwrap();
        assert_eq!(
            builder.sound_named("a", Mixer).unwrap_err(),
            DslError::DuplicateName("a".into())
        );
        assert_eq!(
            builder.connect_named("a", "missing").unwrap_err(),
            DslError::UnknownName("missing".into())
        );
        builder.connect_named("a", "b").unwrap();
        let err = builder.connect_named("b", "a").unwrap_err();
        assert!(matches!(err, DslError::Graph(GraphError::Cycle { .. })));
        let count = builder.handle("count").unwrap();
        let b = builder.handle("b").unwrap();
        builder.borrow(count, b).unwrap();
        assert_eq!(builder.build().lender_of(count.0), Some(b.0));
    }
}
