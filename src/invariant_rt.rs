//! Lock-free invariant signaling for the render path.
//!
//! The render thread cannot take the mutex behind
//! [`assert_invariant`](crate::invariant_ppt), so it pushes small integer ids
//! into an SPSC ring instead. A non-RT thread drains the ring and judges the
//! contract.
//!
//! ```ignore
//! let (mut renderer, mut signals) = Renderer::new_with_signals(graph, root);
//! renderer.render_next_chunk_safe(&mut chunk);
//! let seen = drain_invariant_signals(&mut signals);
//! contract_test_rt("one chunk", &seen, &[INV_CHUNK_FILLED, INV_RENDER_CLEAN]);
//! ```

use rtrb::{Consumer, Producer, RingBuffer};

/// The root produced a full chunk.
pub const INV_CHUNK_FILLED: u8 = 1;

/// The output was replaced by silence.
pub const INV_SILENT_FALLBACK: u8 = 2;

/// A render call returned without panicking.
pub const INV_RENDER_CLEAN: u8 = 3;

/// A render call panicked and was contained.
pub const INV_RENDER_PANICKED: u8 = 4;

/// Capacity for invariant signal queue. Large enough for several chunks
/// between drains.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Creates a new invariant signal queue pair: producer for the render
/// thread, consumer for the observer.
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signals an invariant from the render path. A full queue drops the signal.
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

/// Drains all pending invariant signals.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Asserts that every required invariant was signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();

    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_CHUNK_FILLED => "CHUNK_FILLED",
        INV_SILENT_FALLBACK => "SILENT_FALLBACK",
        INV_RENDER_CLEAN => "RENDER_CLEAN",
        INV_RENDER_PANICKED => "RENDER_PANICKED",
        _ => "UNKNOWN",
    }
}
