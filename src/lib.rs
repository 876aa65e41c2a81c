//! State-graph core for real-time audio and control-signal node graphs.
//!
//! Sound nodes render stereo [`Chunk`](chunk::Chunk)s, number nodes produce
//! scalars on demand. Every sound node keeps one state slot per dependent
//! context (more for divergent nodes), and stateful number nodes borrow a
//! sub-state inside the slots of a sound node. A [`Graph`](graph::Graph) can
//! be edited from control threads while a [`Renderer`](rt::Renderer) pulls
//! chunks on the audio thread.

pub mod allocator;
mod borrow;
pub mod chunk;
pub mod dependency;
pub mod dsl;
pub mod error;
pub mod graph;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod lock;
pub mod multiplicity;
pub mod node;
pub mod nodes;
pub mod rt;
pub mod signal;
pub mod states;
pub mod table;

pub use chunk::{Chunk, CHUNK_SIZE};
pub use dependency::{NodeId, SignalKind};
pub use error::GraphError;
pub use graph::Graph;
pub use multiplicity::{Key, Multiplicity, TimeDomain};
pub use node::{EvalContext, NumberSource, RenderContext, SoundSource, StatefulNumberSource};
pub use rt::{render_offline, Renderer};
pub use states::{SampleTime, StateCell};

/// Sample rate used when none is configured.
pub const DEFAULT_SAMPLE_RATE: f64 = 44_100.0;

/// Engine parameters fixed at graph creation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Samples per second, used to convert local time to seconds.
    pub sample_rate: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}
