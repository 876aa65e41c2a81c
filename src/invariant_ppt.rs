//! Invariant enforcement for the control path, with contract tracking.
//!
//! Structural edits call [`assert_invariant`] as they go. With the `ppt`
//! feature enabled every passing assertion is recorded, so integration tests
//! can prove that a given code path actually checked what it claims to check
//! via [`contract_test`]. Never call into this module from the render path;
//! the log is behind a mutex.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

/// Dependency relation stayed acyclic after an edge insertion.
pub const GRAPH_ACYCLIC: u32 = 1;
/// An edge passed the kind, cycle and visibility checks.
pub const EDGE_ADMITTED: u32 = 2;
/// A refused edge left the graph unchanged.
pub const EDGE_REJECTED: u32 = 3;
/// A slot index was within the table.
pub const SLOT_INDEX_IN_RANGE: u32 = 4;
/// Every slot was rebuilt with the new layout.
pub const TABLE_RELAYOUT: u32 = 5;
/// A divergent table holds one slot per (context, key).
pub const DIVERGENT_GRID: u32 = 6;
/// An uncontrolled table holds exactly one slot.
pub const UNCONTROLLED_SINGLE_SLOT: u32 = 7;
/// A borrower's sub-state exists in every lender slot.
pub const BORROWER_ATTACHED: u32 = 8;
/// A borrower's sub-state is gone from every lender slot.
pub const BORROWER_DETACHED: u32 = 9;
/// No slot outlived the context that created it.
pub const CONTEXT_TEARDOWN: u32 = 10;
/// A removed node kept no edges.
pub const NODE_SEVERED: u32 = 11;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

fn failure_message(id: u32, message: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) => format!("Invariant {} failed: {} (context: {})", id, message, ctx),
        None => format!("Invariant {} failed: {}", id, message),
    }
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        fail_invariant(id, message, context);
    }
    INVARIANT_LOG.lock().insert(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        fail_invariant(id, message, context);
    }
}

/// Report a violated invariant. Used where the check is a plain branch and
/// logging a pass would be noise.
#[cold]
pub(crate) fn fail_invariant(id: u32, message: &str, context: Option<&str>) -> ! {
    let full_message = failure_message(id, message, context);
    tracing::error!("{}", full_message);
    panic!("{}", full_message);
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let log = INVARIANT_LOG.lock();
    let missing: Vec<u32> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !log.contains(inv))
        .collect();
    drop(log);
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    INVARIANT_LOG.lock().clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}
