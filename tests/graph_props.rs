use flowstate::nodes::{ConstantSound, Ensemble, Mixer};
use flowstate::{Chunk, Graph, GraphError, Key, NodeId};
use proptest::prelude::*;

const NODES: usize = 6;

fn edits() -> impl Strategy<Value = Vec<(bool, usize, usize)>> {
    prop::collection::vec((any::<bool>(), 0..NODES, 0..NODES), 0..40)
}

proptest! {
    #[test]
    fn edits_keep_the_graph_acyclic(ops in edits()) {
        let graph = Graph::default();
        let ids: Vec<NodeId> = (0..NODES).map(|_| graph.add_sound(Mixer)).collect();

        for (add, from, to) in ops {
            let (a, b) = (ids[from], ids[to]);
            if add {
                let reverse = a == b || graph.depends_on(b, a);
                let existing = graph.dependencies(a).contains(&b);
                match graph.add_dependency(a, b) {
                    Ok(()) => prop_assert!(!reverse && !existing),
                    Err(GraphError::Cycle { .. }) => prop_assert!(reverse),
                    Err(GraphError::DuplicateEdge { .. }) => prop_assert!(existing),
                    Err(other) => prop_assert!(false, "unexpected {other}"),
                }
            } else {
                let existing = graph.dependencies(a).contains(&b);
                prop_assert_eq!(graph.remove_dependency(a, b).is_ok(), existing);
            }
            for &n in &ids {
                prop_assert!(!graph.depends_on(n, n));
                for d in graph.dependencies(n) {
                    prop_assert!(graph.dependents(d).contains(&n));
                }
            }
        }

        // Every root renders without deadlock.
        let mut out = Chunk::new();
        for &n in &ids {
            prop_assert!(graph.render_chunk(n, &mut out));
        }
    }

    #[test]
    fn divergent_grid_follows_key_edits(
        contexts in 1usize..4,
        ops in prop::collection::vec((any::<bool>(), 0u32..6), 0..30),
    ) {
        let graph = Graph::default();
        let voice = graph.add_sound(ConstantSound::divergent(0.5, 0.5));
        let roots: Vec<NodeId> = (0..contexts)
            .map(|_| {
                let root = graph.add_sound(Ensemble);
                graph.add_dependency(root, voice).unwrap();
                root
            })
            .collect();
        // Contexts register on first render, which needs a key to resolve.
        graph.add_key(voice, Key(100)).unwrap();
        let mut out = Chunk::new();
        for &root in &roots {
            graph.render_chunk(root, &mut out);
        }

        let mut keys = std::collections::BTreeSet::from([Key(100)]);
        for (add, k) in ops {
            let key = Key(k);
            if add {
                prop_assert_eq!(graph.add_key(voice, key).is_ok(), keys.insert(key));
            } else {
                prop_assert_eq!(graph.remove_key(voice, key).is_ok(), keys.remove(&key));
            }
            prop_assert_eq!(graph.state_count(voice), keys.len() * contexts);
        }
        prop_assert_eq!(graph.keys(voice), keys.iter().copied().collect::<Vec<_>>());
    }
}
