use flowstate::invariant_rt::{
    contract_test_rt, drain_invariant_signals, INV_CHUNK_FILLED, INV_RENDER_CLEAN,
    INV_SILENT_FALLBACK,
};
use flowstate::nodes::{Constant, ConstantSound, ControlRate, Mixer, Oscillator, Sum};
use flowstate::{render_offline, Chunk, Graph, Renderer, CHUNK_SIZE};
use std::sync::Arc;

#[test]
fn mixer_without_inputs_is_silent() {
    let graph = Arc::new(Graph::default());
    let mix = graph.add_sound(Mixer);
    let out = render_offline(&graph, mix, 2);
    assert!(out.iter().all(|s| *s == 0.0));
}

#[test]
fn constant_reaches_root_through_mixer() {
    let graph = Arc::new(Graph::default());
    let mix = graph.add_sound(Mixer);
    let constant = graph.add_sound(ConstantSound::new(0.5, 0.5));
    graph.add_dependency(mix, constant).unwrap();

    let mut renderer = Renderer::new(graph.clone(), mix);
    let mut out = Chunk::new();
    for _ in 0..4 {
        assert!(renderer.render_next_chunk(&mut out));
        assert!(out.frames().iter().all(|f| *f == [0.5, 0.5]));
    }
    assert_eq!(renderer.chunks_rendered(), 4);
    assert_eq!(graph.states(constant)[0].time().samples(), 4 * CHUNK_SIZE as u64);
}

#[test]
fn oscillator_is_continuous_across_chunks() {
    let graph = Arc::new(Graph::default());
    let osc = graph.add_sound(Oscillator::new(440.0));
    let out = render_offline(&graph, osc, 3);
    let max_step = 2.0 * std::f32::consts::PI * 440.0 / 44_100.0 + 1e-4;
    for pair in out.chunks(2).collect::<Vec<_>>().windows(2) {
        assert!((pair[1][0] - pair[0][0]).abs() <= max_step);
    }
}

#[test]
fn number_input_drives_sound() {
    let graph = Arc::new(Graph::default());
    let dc = graph.add_sound(ControlRate);
    let sum = graph.add_number(Sum);
    let a = graph.add_number(Constant::new(0.125));
    let b = graph.add_number(Constant::new(0.25));
    graph.add_dependency(sum, a).unwrap();
    graph.add_dependency(sum, b).unwrap();
    graph.add_dependency(dc, sum).unwrap();

    let mut out = Chunk::new();
    graph.render_chunk(dc, &mut out);
    assert_eq!(out[0], [0.375, 0.375]);

    graph.set_value(b, 0.5).unwrap();
    graph.render_chunk(dc, &mut out);
    assert_eq!(out[CHUNK_SIZE - 1], [0.625, 0.625]);
}

#[test]
fn renderer_reports_filled_chunks() {
    let graph = Arc::new(Graph::default());
    let osc = graph.add_sound(Oscillator::new(220.0));
    let (mut renderer, mut signals) = Renderer::new_with_signals(graph.clone(), osc);
    let mut out = Chunk::new();
    for _ in 0..10 {
        renderer.render_next_chunk_safe(&mut out);
    }
    let seen = drain_invariant_signals(&mut signals);
    contract_test_rt("filled chunks", &seen, &[INV_CHUNK_FILLED, INV_RENDER_CLEAN]);
    assert_eq!(seen.iter().filter(|&&id| id == INV_CHUNK_FILLED).count(), 10);
    assert!(!seen.contains(&INV_SILENT_FALLBACK));
}

#[test]
fn removed_root_falls_back_to_silence() {
    let graph = Arc::new(Graph::default());
    let constant = graph.add_sound(ConstantSound::new(1.0, 1.0));
    let (mut renderer, mut signals) = Renderer::new_with_signals(graph.clone(), constant);
    let mut out = Chunk::new();
    assert!(renderer.render_next_chunk(&mut out));
    graph.remove_node(constant).unwrap();
    assert!(!renderer.render_next_chunk(&mut out));
    assert!(out.is_silent());
    let seen = drain_invariant_signals(&mut signals);
    assert_eq!(seen, vec![INV_CHUNK_FILLED, INV_SILENT_FALLBACK]);
}
