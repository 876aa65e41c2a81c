use flowstate::nodes::{Constant, ElapsedTime, Mixer, Oscillator, Resampler, Sum};
use flowstate::{
    Chunk, Graph, NodeId, RenderContext, SoundSource, StateCell, TimeDomain, CHUNK_SIZE,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Out-of-sync node running its input at a fixed speed.
struct FixedSpeed(f64);

impl SoundSource for FixedSpeed {
    type State = ();

    fn time_domain(&self) -> TimeDomain {
        TimeDomain::OutOfSync
    }

    fn init_state(&self, _slot: &StateCell) {}

    fn render_next_chunk(&self, out: &mut Chunk, _state: &mut (), ctx: &RenderContext<'_>) {
        ctx.set_time_speed(self.0);
        ctx.render_input(0, out);
        ctx.adjust_time((CHUNK_SIZE as f64 * self.0) as u64);
    }
}

/// Records elapsed samples, at the root and at `at`, after advancing a chunk.
struct TimeSampler {
    at: Option<NodeId>,
    seen: Arc<Mutex<Vec<(f64, f64)>>>,
}

impl SoundSource for TimeSampler {
    type State = ();

    fn init_state(&self, _slot: &StateCell) {}

    fn render_next_chunk(&self, out: &mut Chunk, _state: &mut (), ctx: &RenderContext<'_>) {
        ctx.adjust_time(CHUNK_SIZE as u64);
        let rate = ctx.sample_rate();
        let global = ctx.elapsed_seconds() * rate;
        let local = self.at.map_or(global, |node| ctx.elapsed_seconds_at(node) * rate);
        self.seen.lock().push((global, local));
        out.silence();
    }
}

fn speed_chain(speed: f64) -> (Graph, NodeId, Arc<Mutex<Vec<(f64, f64)>>>) {
    let graph = Graph::default();
    let root = graph.add_sound(Mixer);
    let fixed = graph.add_sound(FixedSpeed(speed));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sampler = graph.add_sound(TimeSampler {
        at: Some(fixed),
        seen: seen.clone(),
    });
    graph.add_dependency(root, fixed).unwrap();
    graph.add_dependency(fixed, sampler).unwrap();
    (graph, root, seen)
}

#[test]
fn double_speed_halves_elapsed_time_at_the_root() {
    let (graph, root, seen) = speed_chain(2.0);
    let mut out = Chunk::new();
    graph.render_chunk(root, &mut out);
    graph.render_chunk(root, &mut out);

    let seen = seen.lock();
    assert_eq!(seen[0], (512.0, 1024.0));
    assert_eq!(seen[1], (1536.0, 3072.0));
}

#[test]
fn zero_speed_contributes_nothing() {
    let (graph, root, seen) = speed_chain(0.0);
    let mut out = Chunk::new();
    graph.render_chunk(root, &mut out);
    assert_eq!(seen.lock()[0].0, 0.0);
}

#[test]
fn realtime_nodes_ignore_speed_changes() {
    struct Stubborn;

    impl SoundSource for Stubborn {
        type State = ();

        fn init_state(&self, _slot: &StateCell) {}

        fn render_next_chunk(&self, out: &mut Chunk, _state: &mut (), ctx: &RenderContext<'_>) {
            ctx.set_time_speed(3.0);
            ctx.adjust_time(CHUNK_SIZE as u64);
            out.silence();
        }
    }

    let graph = Graph::default();
    let node = graph.add_sound(Stubborn);
    let mut out = Chunk::new();
    graph.render_chunk(node, &mut out);
    let slot = &graph.states(node)[0];
    assert_eq!(slot.time_speed(), 1.0);
    assert_eq!(slot.time().samples(), CHUNK_SIZE as u64);
}

#[test]
fn speed_may_depend_on_elapsed_time() {
    let graph = Graph::default();
    let resampler = graph.add_sound(Resampler);
    let source = graph.add_sound(Oscillator::new(110.0));
    let speed = graph.add_number(Sum);
    let elapsed = graph.add_number(ElapsedTime::global());
    let one = graph.add_number(Constant::new(1.0));
    graph.add_dependency(speed, elapsed).unwrap();
    graph.add_dependency(speed, one).unwrap();
    graph.add_dependency(resampler, source).unwrap();
    graph.add_dependency(resampler, speed).unwrap();

    let mut out = Chunk::new();
    assert!(graph.render_chunk(resampler, &mut out));
    let slot = graph.states(resampler)[0].clone();
    assert_eq!(slot.time_speed(), 1.0);
    assert_eq!(slot.time().samples(), CHUNK_SIZE as u64);

    assert!(graph.render_chunk(resampler, &mut out));
    assert!(slot.time_speed() > 1.0);
}

#[test]
fn elapsed_time_outside_render_is_zero() {
    let graph = Graph::default();
    let elapsed = graph.add_number(ElapsedTime::global());
    assert_eq!(graph.evaluate(elapsed), 0.0);
}
