//! Small reference nodes.
//!
//! They exist to exercise the state core from tests, benches and embedding
//! code; none of them aims to be a serious DSP building block.

// Render-path module: no assert_invariant or PPT logging here.

use crate::chunk::{Chunk, CHUNK_SIZE};
use crate::dependency::NodeId;
use crate::multiplicity::{Multiplicity, TimeDomain};
use crate::node::{EvalContext, NumberSource, RenderContext, SoundSource, StatefulNumberSource};
use crate::states::StateCell;
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};

// ---- sound ---------------------------------------------------------------

/// Renders a fixed stereo pair.
#[derive(Debug, Clone)]
pub struct ConstantSound {
    left: f32,
    right: f32,
    multiplicity: Multiplicity,
}

impl ConstantSound {
    /// One instance per dependent context.
    pub fn new(left: f32, right: f32) -> Self {
        Self {
            left,
            right,
            multiplicity: Multiplicity::Singular,
        }
    }

    /// One instance per dependent context per key.
    pub fn divergent(left: f32, right: f32) -> Self {
        Self {
            multiplicity: Multiplicity::Divergent,
            ..Self::new(left, right)
        }
    }
}

impl SoundSource for ConstantSound {
    type State = ();

    fn multiplicity(&self) -> Multiplicity {
        self.multiplicity
    }

    fn init_state(&self, _slot: &StateCell) {}

    fn render_next_chunk(&self, out: &mut Chunk, _state: &mut (), ctx: &RenderContext<'_>) {
        out.fill(self.left, self.right);
        ctx.adjust_time(CHUNK_SIZE as u64);
    }
}

/// Sine oscillator. Number input 0 overrides the frequency and is read
/// once per sample.
#[derive(Debug, Clone)]
pub struct Oscillator {
    frequency: f64,
}

/// Phase of an [`Oscillator`] slot, in cycles.
#[derive(Debug, Default, Clone, Copy)]
pub struct OscillatorState {
    /// Position in the current cycle, `0.0..1.0`.
    pub phase: f64,
}

impl Oscillator {
    /// Oscillator at `frequency` Hz.
    pub fn new(frequency: f64) -> Self {
        Self { frequency }
    }
}

impl SoundSource for Oscillator {
    type State = OscillatorState;

    fn init_state(&self, _slot: &StateCell) -> OscillatorState {
        OscillatorState::default()
    }

    fn render_next_chunk(&self, out: &mut Chunk, state: &mut OscillatorState, ctx: &RenderContext<'_>) {
        let sample_rate = ctx.sample_rate();
        for frame in out.frames_mut() {
            let frequency = ctx.evaluate_input(0, self.frequency);
            let value = (state.phase * TAU).sin() as f32;
            *frame = [value, value];
            state.phase = (state.phase + frequency / sample_rate).rem_euclid(1.0);
            ctx.adjust_time(1);
        }
    }
}

/// Sums every sound input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mixer;

impl SoundSource for Mixer {
    type State = Chunk;

    fn init_state(&self, _slot: &StateCell) -> Chunk {
        Chunk::new()
    }

    fn render_next_chunk(&self, out: &mut Chunk, scratch: &mut Chunk, ctx: &RenderContext<'_>) {
        out.silence();
        for input in 0..ctx.sound_input_count() {
            if ctx.render_input(input, scratch) {
                out.mix_from(scratch);
            }
        }
        ctx.adjust_time(CHUNK_SIZE as u64);
    }
}

/// Sums every key of sound input 0, which is expected to be divergent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ensemble;

impl SoundSource for Ensemble {
    type State = Chunk;

    fn init_state(&self, _slot: &StateCell) -> Chunk {
        Chunk::new()
    }

    fn render_next_chunk(&self, out: &mut Chunk, scratch: &mut Chunk, ctx: &RenderContext<'_>) {
        out.silence();
        for index in 0..ctx.input_key_count(0) {
            let key = ctx.input_key(0, index);
            if ctx.get_next_chunk_for(0, key, scratch) {
                out.mix_from(scratch);
            }
        }
        ctx.adjust_time(CHUNK_SIZE as u64);
    }
}

/// Renders number input 0, sampled once at the start of each chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRate;

impl SoundSource for ControlRate {
    type State = ();

    fn init_state(&self, _slot: &StateCell) {}

    fn render_next_chunk(&self, out: &mut Chunk, _state: &mut (), ctx: &RenderContext<'_>) {
        let value = ctx.evaluate_input(0, 0.0) as f32;
        out.fill(value, value);
        ctx.adjust_time(CHUNK_SIZE as u64);
    }
}

/// Fastest [`Resampler`] speed: one whole source chunk per output sample.
pub const MAX_RESAMPLE_SPEED: f64 = CHUNK_SIZE as f64;

/// Zero-order-hold resampler. Number input 0 is the playback speed
/// (default 1.0, clamped to [`MAX_RESAMPLE_SPEED`]), read once per chunk;
/// sound input 0 is the source.
///
/// Local time counts source samples consumed, so the reported speed is
/// source samples per output sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resampler;

/// Read position of a [`Resampler`] slot.
#[derive(Debug, Clone)]
pub struct ResamplerState {
    input: Chunk,
    read: f64,
    primed: bool,
}

impl SoundSource for Resampler {
    type State = ResamplerState;

    fn time_domain(&self) -> TimeDomain {
        TimeDomain::OutOfSync
    }

    fn init_state(&self, _slot: &StateCell) -> ResamplerState {
        ResamplerState {
            input: Chunk::new(),
            read: 0.0,
            primed: false,
        }
    }

    fn render_next_chunk(&self, out: &mut Chunk, state: &mut ResamplerState, ctx: &RenderContext<'_>) {
        let requested = ctx.evaluate_input(0, 1.0);
        let speed = if requested.is_finite() && requested > 0.0 {
            requested.min(MAX_RESAMPLE_SPEED)
        } else {
            0.0
        };
        ctx.set_time_speed(speed);

        // read < chunk on entry and speed <= chunk, so one pull per frame
        // brings read back below chunk.
        let chunk = CHUNK_SIZE as f64;
        for frame in out.frames_mut() {
            if !state.primed || state.read >= chunk {
                if state.primed {
                    state.read -= chunk;
                }
                ctx.render_input(0, &mut state.input);
                state.primed = true;
            }
            *frame = state.input[state.read as usize];
            let before = state.read.floor();
            state.read += speed;
            ctx.adjust_time((state.read.floor() - before) as u64);
        }
    }
}

/// Plays stereo frames pushed from outside the graph, e.g. an audio input
/// callback. Its state is bound to one queue, so it is uncontrolled.
pub struct LiveInput {
    queue: Mutex<Option<Consumer<[f32; 2]>>>,
}

impl LiveInput {
    /// A live input and the producer that feeds it.
    pub fn new(capacity: usize) -> (Self, Producer<[f32; 2]>) {
        let (producer, consumer) = RingBuffer::new(capacity);
        (
            Self {
                queue: Mutex::new(Some(consumer)),
            },
            producer,
        )
    }
}

impl SoundSource for LiveInput {
    type State = Option<Consumer<[f32; 2]>>;

    fn multiplicity(&self) -> Multiplicity {
        Multiplicity::Uncontrolled
    }

    fn init_state(&self, _slot: &StateCell) -> Option<Consumer<[f32; 2]>> {
        self.queue.lock().take()
    }

    fn render_next_chunk(&self, out: &mut Chunk, queue: &mut Option<Consumer<[f32; 2]>>, ctx: &RenderContext<'_>) {
        match queue {
            Some(consumer) => {
                for frame in out.frames_mut() {
                    *frame = consumer.pop().unwrap_or([0.0, 0.0]);
                }
            }
            None => out.silence(),
        }
        ctx.adjust_time(CHUNK_SIZE as u64);
    }
}

// ---- number --------------------------------------------------------------

/// A settable value.
#[derive(Debug)]
pub struct Constant {
    bits: AtomicU64,
}

impl Constant {
    /// Constant holding `value`.
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }
}

impl NumberSource for Constant {
    fn evaluate(&self, _ctx: &EvalContext<'_>) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn set_value(&self, value: f64) -> bool {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
        true
    }
}

/// Sum of all inputs. Zero when disconnected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl NumberSource for Sum {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> f64 {
        (0..ctx.input_count()).map(|i| ctx.evaluate_input(i, 0.0)).sum()
    }
}

/// Product of all inputs. One when disconnected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Product;

impl NumberSource for Product {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> f64 {
        (0..ctx.input_count()).map(|i| ctx.evaluate_input(i, 1.0)).product()
    }
}

/// Seconds elapsed in the evaluating context, at the render root or at a
/// given node.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElapsedTime {
    at: Option<NodeId>,
}

impl ElapsedTime {
    /// Elapsed time at the render root.
    pub fn global() -> Self {
        Self { at: None }
    }

    /// Elapsed time as seen by `node`.
    pub fn at(node: NodeId) -> Self {
        Self { at: Some(node) }
    }
}

impl NumberSource for ElapsedTime {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> f64 {
        match self.at {
            Some(node) => ctx.elapsed_seconds_at(node),
            None => ctx.elapsed_seconds(),
        }
    }
}

/// Counts its evaluations, per lender slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counter;

impl StatefulNumberSource for Counter {
    type State = u64;

    fn init_state(&self, _slot: &StateCell) -> u64 {
        0
    }

    fn evaluate(&self, count: &mut u64, _ctx: &EvalContext<'_>) -> f64 {
        *count += 1;
        *count as f64
    }
}

/// Running sum of input 0, per lender slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator;

impl StatefulNumberSource for Accumulator {
    type State = f64;

    fn init_state(&self, _slot: &StateCell) -> f64 {
        0.0
    }

    fn evaluate(&self, total: &mut f64, ctx: &EvalContext<'_>) -> f64 {
        *total += ctx.evaluate_input(0, 0.0);
        *total
    }
}
