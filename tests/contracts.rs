//! Each structural path proves which invariants it checked. The log is
//! shared by every test in this binary and only grows, so none clears it.

use flowstate::invariant_ppt::{
    contract_test, BORROWER_ATTACHED, BORROWER_DETACHED, CONTEXT_TEARDOWN,
    DIVERGENT_GRID, EDGE_ADMITTED, EDGE_REJECTED, GRAPH_ACYCLIC, NODE_SEVERED, TABLE_RELAYOUT,
    UNCONTROLLED_SINGLE_SLOT,
};
use flowstate::nodes::{ConstantSound, ControlRate, Counter, Ensemble, LiveInput, Mixer};
use flowstate::{Chunk, Graph, Key};

#[test]
fn edge_contracts() {
    let graph = Graph::default();
    let a = graph.add_sound(Mixer);
    let b = graph.add_sound(Mixer);
    graph.add_dependency(a, b).unwrap();
    graph.add_dependency(b, a).unwrap_err();
    contract_test("edge admission", &[GRAPH_ACYCLIC, EDGE_ADMITTED, EDGE_REJECTED]);
}

#[test]
fn slot_contracts() {
    let graph = Graph::default();
    let root = graph.add_sound(Ensemble);
    let voice = graph.add_sound(ConstantSound::divergent(0.1, 0.1));
    graph.add_dependency(root, voice).unwrap();
    graph.add_key(voice, Key(1)).unwrap();
    let mut out = Chunk::new();
    graph.render_chunk(root, &mut out);
    graph.add_key(voice, Key(2)).unwrap();
    graph.remove_key(voice, Key(1)).unwrap();
    graph.remove_dependency(root, voice).unwrap();

    let (input, _producer) = LiveInput::new(4);
    graph.add_sound(input);
    contract_test(
        "slot bookkeeping",
        &[DIVERGENT_GRID, CONTEXT_TEARDOWN, UNCONTROLLED_SINGLE_SLOT],
    );
}

#[test]
fn borrow_contracts() {
    let graph = Graph::default();
    let lender = graph.add_sound(ControlRate);
    let counter = graph.add_stateful_number(Counter);
    graph.add_dependency(lender, counter).unwrap();
    let mut out = Chunk::new();
    graph.render_chunk(lender, &mut out);
    graph.borrow_from(counter, Some(lender)).unwrap();
    graph.borrow_from(counter, None).unwrap();
    graph.remove_node(lender).unwrap();
    contract_test(
        "borrowing",
        &[TABLE_RELAYOUT, BORROWER_ATTACHED, BORROWER_DETACHED, NODE_SEVERED],
    );
}
