//! Capability traits implemented by concrete nodes, and the contexts the
//! engine hands them.
//!
//! Implement [`SoundSource`] for audio-rate nodes, [`NumberSource`] for pure
//! scalar nodes and [`StatefulNumberSource`] for scalar nodes that keep
//! per-context state borrowed from a sound node. The engine stores them
//! behind the object-safe [`SoundSourceDyn`] and [`NumberSourceDyn`].

#![forbid(unsafe_code)]

// Render-path module: no assert_invariant or PPT logging here.

use crate::allocator::{StateAllocator, TypedAllocator};
use crate::chunk::Chunk;
use crate::dependency::{NodeId, SignalKind};
use crate::graph::Graph;
use crate::multiplicity::{Key, Multiplicity, TimeDomain};
use crate::states::{SampleTime, StateCell, SubState};
use std::sync::Arc;

/// An audio-rate node.
pub trait SoundSource: Send + Sync + 'static {
    /// Per-slot state.
    type State: Send + 'static;

    /// Instance policy. Fixed for the node's lifetime.
    fn multiplicity(&self) -> Multiplicity {
        Multiplicity::Singular
    }

    /// Time relation to the dependent. Fixed for the node's lifetime.
    fn time_domain(&self) -> TimeDomain {
        TimeDomain::Realtime
    }

    /// Build the state for a new slot.
    fn init_state(&self, slot: &StateCell) -> Self::State;

    /// Fill `out` with the next chunk for this slot.
    fn render_next_chunk(&self, out: &mut Chunk, state: &mut Self::State, ctx: &RenderContext<'_>);
}

/// Object-safe form of [`SoundSource`].
pub trait SoundSourceDyn: Send + Sync {
    /// See [`SoundSource::multiplicity`].
    fn multiplicity(&self) -> Multiplicity;
    /// See [`SoundSource::time_domain`].
    fn time_domain(&self) -> TimeDomain;
    /// Allocator building this node's main state.
    fn state_allocator(self: Arc<Self>) -> Arc<dyn StateAllocator>;
    /// Render with a type-erased state.
    fn render_next_chunk(&self, out: &mut Chunk, state: &mut SubState, ctx: &RenderContext<'_>);
}

impl<T: SoundSource> SoundSourceDyn for T {
    fn multiplicity(&self) -> Multiplicity {
        <T as SoundSource>::multiplicity(self)
    }

    fn time_domain(&self) -> TimeDomain {
        <T as SoundSource>::time_domain(self)
    }

    fn state_allocator(self: Arc<Self>) -> Arc<dyn StateAllocator> {
        Arc::new(TypedAllocator::new(move |slot: &StateCell| self.init_state(slot)))
    }

    fn render_next_chunk(&self, out: &mut Chunk, state: &mut SubState, ctx: &RenderContext<'_>) {
        if let Some(typed) = state.downcast_mut::<T::State>() {
            <T as SoundSource>::render_next_chunk(self, out, typed, ctx);
        } else {
            tracing::warn!(node = %ctx.node(), "state type mismatch, rendering silence");
            out.silence();
        }
    }
}

/// A scalar node without state.
pub trait NumberSource: Send + Sync + 'static {
    /// Value in `ctx`. NaN and infinities pass through.
    fn evaluate(&self, ctx: &EvalContext<'_>) -> f64;

    /// Change the node's value. Returns false if the node has none.
    fn set_value(&self, _value: f64) -> bool {
        false
    }
}

/// A scalar node whose state lives in a lender's slots.
pub trait StatefulNumberSource: Send + Sync + 'static {
    /// Per-lender-slot state.
    type State: Send + 'static;

    /// Build the state for one lender slot.
    fn init_state(&self, slot: &StateCell) -> Self::State;

    /// Value in `ctx`, given the state found for it.
    fn evaluate(&self, state: &mut Self::State, ctx: &EvalContext<'_>) -> f64;

    /// Value when no state can be resolved: not attached, or evaluated
    /// outside the lender's context.
    fn neutral(&self) -> f64 {
        0.0
    }
}

/// Object-safe form of both number traits.
pub trait NumberSourceDyn: Send + Sync {
    /// True if the node needs a lender.
    fn is_stateful(&self) -> bool;
    /// Allocator for borrowed state. `None` for pure nodes.
    fn state_allocator(self: Arc<Self>) -> Option<Arc<dyn StateAllocator>>;
    /// Evaluate without state.
    fn evaluate(&self, ctx: &EvalContext<'_>) -> f64;
    /// Evaluate with a type-erased borrowed state.
    fn evaluate_with(&self, state: &mut SubState, ctx: &EvalContext<'_>) -> f64;
    /// Fallback value.
    fn neutral(&self) -> f64;
    /// See [`NumberSource::set_value`].
    fn set_value(&self, value: f64) -> bool;
}

/// Adapter for [`NumberSource`].
pub struct Pure<N>(pub N);

impl<N: NumberSource> NumberSourceDyn for Pure<N> {
    fn is_stateful(&self) -> bool {
        false
    }

    fn state_allocator(self: Arc<Self>) -> Option<Arc<dyn StateAllocator>> {
        None
    }

    fn evaluate(&self, ctx: &EvalContext<'_>) -> f64 {
        self.0.evaluate(ctx)
    }

    fn evaluate_with(&self, _state: &mut SubState, ctx: &EvalContext<'_>) -> f64 {
        self.0.evaluate(ctx)
    }

    fn neutral(&self) -> f64 {
        0.0
    }

    fn set_value(&self, value: f64) -> bool {
        self.0.set_value(value)
    }
}

/// Adapter for [`StatefulNumberSource`].
pub struct Stateful<N>(pub N);

impl<N: StatefulNumberSource> NumberSourceDyn for Stateful<N> {
    fn is_stateful(&self) -> bool {
        true
    }

    fn state_allocator(self: Arc<Self>) -> Option<Arc<dyn StateAllocator>> {
        Some(Arc::new(TypedAllocator::new(move |slot: &StateCell| self.0.init_state(slot))))
    }

    fn evaluate(&self, _ctx: &EvalContext<'_>) -> f64 {
        self.0.neutral()
    }

    fn evaluate_with(&self, state: &mut SubState, ctx: &EvalContext<'_>) -> f64 {
        match state.downcast_mut::<N::State>() {
            Some(typed) => self.0.evaluate(typed, ctx),
            None => {
                tracing::warn!(node = %ctx.node(), "borrowed state type mismatch");
                self.0.neutral()
            }
        }
    }

    fn neutral(&self) -> f64 {
        self.0.neutral()
    }

    fn set_value(&self, _value: f64) -> bool {
        false
    }
}

/// What a sound node sees while rendering one slot.
pub struct RenderContext<'a> {
    graph: &'a Graph,
    node: NodeId,
    time_domain: TimeDomain,
    state: &'a Arc<StateCell>,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(graph: &'a Graph, node: NodeId, time_domain: TimeDomain, state: &'a Arc<StateCell>) -> Self {
        Self {
            graph,
            node,
            time_domain,
            state,
        }
    }

    /// Node being rendered.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Slot being rendered.
    pub fn state(&self) -> &Arc<StateCell> {
        self.state
    }

    /// Engine sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.graph.config().sample_rate
    }

    /// Number of connected sound inputs.
    pub fn sound_input_count(&self) -> usize {
        self.graph.count_inputs(self.node, SignalKind::Sound)
    }

    /// Number of connected number inputs.
    pub fn number_input_count(&self) -> usize {
        self.graph.count_inputs(self.node, SignalKind::Number)
    }

    /// Render sound input `input` for this slot into `out`. Divergent inputs
    /// need `key`. Returns false and leaves `out` silent if the input is
    /// missing or cannot resolve a state.
    pub fn get_next_chunk_for(&self, input: usize, key: Option<Key>, out: &mut Chunk) -> bool {
        match self.graph.input(self.node, SignalKind::Sound, input) {
            Some(dependency) => self.graph.render_node(dependency, Some(self.state), key, out),
            None => {
                out.silence();
                false
            }
        }
    }

    /// [`get_next_chunk_for`](Self::get_next_chunk_for) without a key.
    pub fn render_input(&self, input: usize, out: &mut Chunk) -> bool {
        self.get_next_chunk_for(input, None, out)
    }

    /// Number of keys on sound input `input`. Zero unless it is divergent.
    pub fn input_key_count(&self, input: usize) -> usize {
        self.graph
            .input(self.node, SignalKind::Sound, input)
            .map_or(0, |dependency| self.graph.key_count(dependency))
    }

    /// The `index`-th key of sound input `input`, ascending.
    pub fn input_key(&self, input: usize, index: usize) -> Option<Key> {
        let dependency = self.graph.input(self.node, SignalKind::Sound, input)?;
        self.graph.key_at(dependency, index)
    }

    /// Evaluate number input `input` in this slot's context, or return
    /// `default` if it is not connected.
    pub fn evaluate_input(&self, input: usize, default: f64) -> f64 {
        match self.graph.input(self.node, SignalKind::Number, input) {
            Some(dependency) => self.graph.evaluate_in(dependency, Some(self.state)),
            None => default,
        }
    }

    /// Local time of this slot.
    pub fn time(&self) -> SampleTime {
        self.state.time()
    }

    /// Advance local time by `samples`.
    pub fn adjust_time(&self, samples: u64) {
        self.state.adjust_time(samples);
    }

    /// Report this slot's speed relative to its dependent. Ignored on
    /// realtime nodes.
    pub fn set_time_speed(&self, speed: f64) {
        match self.time_domain {
            TimeDomain::OutOfSync => self.state.set_time_speed(speed),
            TimeDomain::Realtime => {
                tracing::warn!(node = %self.node, speed, "time speed ignored on realtime node");
            }
        }
    }

    /// Seconds elapsed at the render root.
    pub fn elapsed_seconds(&self) -> f64 {
        self.state.elapsed_samples_at(None) / self.sample_rate()
    }

    /// Seconds elapsed as seen by `node`.
    pub fn elapsed_seconds_at(&self, node: NodeId) -> f64 {
        self.state.elapsed_samples_at(Some(node)) / self.sample_rate()
    }
}

/// What a number node sees while evaluating.
pub struct EvalContext<'a> {
    graph: &'a Graph,
    node: NodeId,
    context: Option<&'a Arc<StateCell>>,
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(graph: &'a Graph, node: NodeId, context: Option<&'a Arc<StateCell>>) -> Self {
        Self { graph, node, context }
    }

    /// Node being evaluated.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// State of the sound node that asked, if any.
    pub fn context(&self) -> Option<&Arc<StateCell>> {
        self.context
    }

    /// Engine sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.graph.config().sample_rate
    }

    /// Number of connected number inputs.
    pub fn input_count(&self) -> usize {
        self.graph.count_inputs(self.node, SignalKind::Number)
    }

    /// Evaluate number input `input` in the same context, or return
    /// `default` if it is not connected.
    pub fn evaluate_input(&self, input: usize, default: f64) -> f64 {
        match self.graph.input(self.node, SignalKind::Number, input) {
            Some(dependency) => self.graph.evaluate_in(dependency, self.context),
            None => default,
        }
    }

    /// Seconds elapsed at the render root. Zero outside a render.
    pub fn elapsed_seconds(&self) -> f64 {
        self.context
            .map_or(0.0, |cell| cell.elapsed_samples_at(None) / self.sample_rate())
    }

    /// Seconds elapsed as seen by `node`. Zero outside a render.
    pub fn elapsed_seconds_at(&self, node: NodeId) -> f64 {
        self.context
            .map_or(0.0, |cell| cell.elapsed_samples_at(Some(node)) / self.sample_rate())
    }
}
