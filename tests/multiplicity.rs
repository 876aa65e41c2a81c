use flowstate::nodes::{ConstantSound, Ensemble, LiveInput, Mixer, Oscillator};
use flowstate::{
    Chunk, Graph, GraphError, Key, Multiplicity, NodeId, RenderContext, SoundSource, StateCell,
};
use std::sync::Arc;

/// Divergent pass-through: one slot per key, each pulling its own input slot.
struct Voice;

impl SoundSource for Voice {
    type State = ();

    fn multiplicity(&self) -> Multiplicity {
        Multiplicity::Divergent
    }

    fn init_state(&self, _slot: &StateCell) {}

    fn render_next_chunk(&self, out: &mut Chunk, _state: &mut (), ctx: &RenderContext<'_>) {
        ctx.render_input(0, out);
        ctx.adjust_time(out.len() as u64);
    }
}

fn render(graph: &Graph, root: NodeId) -> Chunk {
    let mut out = Chunk::new();
    graph.render_chunk(root, &mut out);
    out
}

#[test]
fn divergent_node_keeps_one_slot_per_context_and_key() {
    let graph = Graph::default();
    let voice = graph.add_sound(ConstantSound::divergent(0.25, 0.25));
    graph.add_key(voice, Key(1)).unwrap();
    graph.add_key(voice, Key(2)).unwrap();
    let roots: Vec<NodeId> = (0..3)
        .map(|_| {
            let root = graph.add_sound(Ensemble);
            graph.add_dependency(root, voice).unwrap();
            root
        })
        .collect();
    for root in &roots {
        assert_eq!(render(&graph, *root)[0], [0.5, 0.5]);
    }
    assert_eq!(graph.state_count(voice), 3 * 2);
    let before = graph.states(voice);

    graph.add_key(voice, Key(7)).unwrap();
    assert_eq!(graph.state_count(voice), 3 * 3);
    let after = graph.states(voice);
    for cell in &before {
        assert!(after.iter().any(|c| Arc::ptr_eq(c, cell)));
    }
    assert_eq!(graph.keys(voice), vec![Key(1), Key(2), Key(7)]);
    assert_eq!(render(&graph, roots[0])[0], [0.75, 0.75]);

    graph.remove_key(voice, Key(1)).unwrap();
    assert_eq!(graph.state_count(voice), 3 * 2);
}

#[test]
fn same_context_and_key_resolve_to_the_same_slot() {
    let graph = Graph::default();
    let root = graph.add_sound(Ensemble);
    let voice = graph.add_sound(ConstantSound::divergent(0.1, 0.1));
    graph.add_dependency(root, voice).unwrap();
    graph.add_key(voice, Key(3)).unwrap();
    graph.add_key(voice, Key(4)).unwrap();
    render(&graph, root);

    let context = graph.states(root)[0].clone();
    let a = graph.state_for(voice, Some(&context), Some(Key(3))).unwrap();
    let b = graph.state_for(voice, Some(&context), Some(Key(3))).unwrap();
    let c = graph.state_for(voice, Some(&context), Some(Key(4))).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(a.key(), Some(Key(3)));
    assert_eq!(a.context().map(|c| c.id()), Some(context.id()));
    assert!(graph.state_for(voice, Some(&context), Some(Key(5))).is_none());
    assert!(graph.state_for(voice, Some(&context), None).is_none());
}

#[test]
fn removing_a_key_tears_down_slots_below_it() {
    let graph = Graph::default();
    let root = graph.add_sound(Ensemble);
    let voice = graph.add_sound(Voice);
    let osc = graph.add_sound(Oscillator::new(330.0));
    graph.add_dependency(root, voice).unwrap();
    graph.add_dependency(voice, osc).unwrap();
    for k in 0..4 {
        graph.add_key(voice, Key(k)).unwrap();
    }
    render(&graph, root);
    assert_eq!(graph.state_count(voice), 4);
    assert_eq!(graph.state_count(osc), 4);

    graph.remove_key(voice, Key(2)).unwrap();
    assert_eq!(graph.state_count(voice), 3);
    assert_eq!(graph.state_count(osc), 3);
    assert!(graph
        .states(osc)
        .iter()
        .all(|cell| cell.context().and_then(|c| c.key()) != Some(Key(2))));

    graph.remove_dependency(root, voice).unwrap();
    assert_eq!(graph.state_count(voice), 0);
    assert_eq!(graph.state_count(osc), 0);
}

#[test]
fn key_edits_are_checked() {
    let graph = Graph::default();
    let singular = graph.add_sound(Mixer);
    let voice = graph.add_sound(Voice);
    assert_eq!(graph.add_key(singular, Key(1)), Err(GraphError::NotDivergent(singular)));
    graph.add_key(voice, Key(1)).unwrap();
    assert_eq!(
        graph.add_key(voice, Key(1)),
        Err(GraphError::DuplicateKey {
            node: voice,
            key: Key(1)
        })
    );
    assert_eq!(
        graph.remove_key(voice, Key(9)),
        Err(GraphError::KeyNotFound {
            node: voice,
            key: Key(9)
        })
    );
    assert!(graph.keys(singular).is_empty());
}

#[test]
fn singular_node_gets_a_slot_per_dependent_context() {
    let graph = Graph::default();
    let shared = graph.add_sound(Oscillator::new(50.0));
    let a = graph.add_sound(Mixer);
    let b = graph.add_sound(Mixer);
    graph.add_dependency(a, shared).unwrap();
    graph.add_dependency(b, shared).unwrap();

    let first = render(&graph, a);
    let other = render(&graph, b);
    assert_eq!(first, other);
    assert_eq!(graph.state_count(shared), 2);
}

#[test]
fn uncontrolled_node_has_one_slot_and_one_sound_dependent() {
    let graph = Graph::default();
    let (input, mut producer) = LiveInput::new(16);
    let live = graph.add_sound(input);
    assert_eq!(graph.state_count(live), 1);
    assert_eq!(graph.multiplicity(live), Some(Multiplicity::Uncontrolled));

    let mix = graph.add_sound(Mixer);
    let other = graph.add_sound(Mixer);
    graph.add_dependency(mix, live).unwrap();
    assert_eq!(
        graph.add_dependency(other, live),
        Err(GraphError::Multiplicity {
            node: live,
            existing: mix
        })
    );

    producer.push([0.5, -0.5]).unwrap();
    assert_eq!(render(&graph, mix)[0], [0.5, -0.5]);
    assert_eq!(graph.state_count(live), 1);
    assert!(graph.states(live)[0].context().is_none());

    // Disconnecting keeps the single slot alive.
    graph.remove_dependency(mix, live).unwrap();
    assert_eq!(graph.state_count(live), 1);
    graph.add_dependency(other, live).unwrap();
}
