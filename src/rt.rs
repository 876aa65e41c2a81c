//! Render driver: pulls chunks from a root node on the audio thread.

// IMPORTANT: Do not call assert_invariant or any PPT logging in RT paths to avoid locks/allocs.

use crate::chunk::Chunk;
use crate::dependency::NodeId;
use crate::graph::Graph;
use crate::invariant_rt::{
    new_invariant_queue, signal_invariant, INV_CHUNK_FILLED, INV_RENDER_CLEAN, INV_RENDER_PANICKED,
    INV_SILENT_FALLBACK,
};
use crate::multiplicity::Key;
use rtrb::{Consumer, Producer};
use std::fmt;
use std::sync::Arc;

/// Pulls successive chunks from one root node.
///
/// The root's slot has no dependent context, so every render of the same
/// root advances the same state.
pub struct Renderer {
    graph: Arc<Graph>,
    root: NodeId,
    key: Option<Key>,
    invariant_tx: Option<Producer<u8>>,
    chunks_rendered: u64,
}

impl Renderer {
    /// Renderer for `root`.
    pub fn new(graph: Arc<Graph>, root: NodeId) -> Self {
        Self {
            graph,
            root,
            key: None,
            invariant_tx: None,
            chunks_rendered: 0,
        }
    }

    /// Renderer that also reports RT invariants through the returned queue.
    pub fn new_with_signals(graph: Arc<Graph>, root: NodeId) -> (Self, Consumer<u8>) {
        let (tx, rx) = new_invariant_queue();
        let renderer = Self {
            invariant_tx: Some(tx),
            ..Self::new(graph, root)
        };
        (renderer, rx)
    }

    /// Render one key of a divergent root.
    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// The rendered node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The graph being rendered.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Chunks rendered so far, silent fallbacks included.
    pub fn chunks_rendered(&self) -> u64 {
        self.chunks_rendered
    }

    fn signal(&mut self, id: u8) {
        if let Some(tx) = self.invariant_tx.as_mut() {
            signal_invariant(tx, id);
        }
    }

    /// Render the next chunk into `out`. Returns false, with `out` silent,
    /// if the root is gone or could not resolve a state.
    pub fn render_next_chunk(&mut self, out: &mut Chunk) -> bool {
        let rendered = self.graph.render_chunk_keyed(self.root, self.key, out);
        self.chunks_rendered += 1;
        if rendered {
            self.signal(INV_CHUNK_FILLED);
        } else {
            self.signal(INV_SILENT_FALLBACK);
        }
        rendered
    }

    /// [`render_next_chunk`](Self::render_next_chunk) with panic
    /// containment: a panicking node yields a silent chunk instead of
    /// unwinding into the audio callback.
    pub fn render_next_chunk_safe(&mut self, out: &mut Chunk) -> bool {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.render_next_chunk(out)));
        match result {
            Ok(rendered) => {
                self.signal(INV_RENDER_CLEAN);
                rendered
            }
            Err(_) => {
                // Fail closed: silence output
                out.silence();
                self.signal(INV_RENDER_PANICKED);
                self.signal(INV_SILENT_FALLBACK);
                false
            }
        }
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("root", &self.root)
            .field("key", &self.key)
            .field("chunks_rendered", &self.chunks_rendered)
            .field("signals", &self.invariant_tx.is_some())
            .finish()
    }
}

/// Render `chunks` chunks of `root` into one interleaved stereo buffer.
pub fn render_offline(graph: &Arc<Graph>, root: NodeId, chunks: usize) -> Vec<f32> {
    let mut renderer = Renderer::new(graph.clone(), root);
    let mut chunk = Chunk::new();
    let mut output = Vec::with_capacity(chunks * chunk.as_interleaved().len());
    for _ in 0..chunks {
        renderer.render_next_chunk(&mut chunk);
        output.extend_from_slice(chunk.as_interleaved());
    }
    output
}
