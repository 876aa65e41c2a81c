//! State slots, the context chain they form, and per-slot time.
//!
//! A [`StateCell`] is one slot of a sound node's state table: the node's own
//! state plus the sub-states lent to borrowing number nodes, a back-reference
//! to the dependent state it was created for, and the slot's local clock.
//! Following `context` from any cell walks outward to the root of the
//! render, which is what elapsed-time queries do.

// Render-path module: no assert_invariant or PPT logging here.

use crate::chunk::CHUNK_SIZE;
use crate::dependency::NodeId;
use crate::multiplicity::Key;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Type-erased state owned by a slot.
pub type SubState = Box<dyn Any + Send>;

/// Identity of a slot. Unique within a graph, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u64);

/// Source of fresh [`StateId`]s.
#[derive(Debug, Default)]
pub struct StateIds {
    next: AtomicU64,
}

impl StateIds {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh id.
    pub fn next_id(&self) -> StateId {
        StateId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A sample position split into whole chunks and the offset inside a chunk.
///
/// Ordering is by chunk, then offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleTime {
    /// Whole chunks elapsed.
    pub coarse: u64,
    /// Samples into the current chunk, always below [`CHUNK_SIZE`].
    pub fine: u32,
}

impl SampleTime {
    /// Zero.
    pub const ZERO: SampleTime = SampleTime { coarse: 0, fine: 0 };

    /// Split a sample count.
    pub fn from_samples(samples: u64) -> Self {
        let chunk = CHUNK_SIZE as u64;
        Self {
            coarse: samples / chunk,
            fine: (samples % chunk) as u32,
        }
    }

    /// Total samples.
    pub fn samples(self) -> u64 {
        self.coarse * CHUNK_SIZE as u64 + u64::from(self.fine)
    }

    /// Move forward by `samples`.
    pub fn advance(&mut self, samples: u64) {
        *self = Self::from_samples(self.samples() + samples);
    }

    /// Samples as seconds at `sample_rate`.
    pub fn seconds(self, sample_rate: f64) -> f64 {
        self.samples() as f64 / sample_rate
    }
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    time: SampleTime,
    chunk_start: SampleTime,
    speed: f64,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            time: SampleTime::ZERO,
            chunk_start: SampleTime::ZERO,
            speed: 1.0,
        }
    }
}

impl Clock {
    fn progress(&self) -> f64 {
        (self.time.samples() - self.chunk_start.samples()) as f64
    }
}

/// One slot of a sound node's state table.
pub struct StateCell {
    id: StateId,
    owner: NodeId,
    key: Option<Key>,
    context: Option<Arc<StateCell>>,
    clock: Mutex<Clock>,
    substates: RwLock<Vec<Mutex<SubState>>>,
}

impl StateCell {
    /// A slot with no sub-states yet. The owning table constructs them.
    pub fn new(id: StateId, owner: NodeId, key: Option<Key>, context: Option<Arc<StateCell>>) -> Self {
        Self {
            id,
            owner,
            key,
            context,
            clock: Mutex::new(Clock::default()),
            substates: RwLock::new(Vec::new()),
        }
    }

    /// Slot identity.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// The node whose table holds this slot.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// The key this slot was created for, on divergent nodes.
    pub fn key(&self) -> Option<Key> {
        self.key
    }

    /// The dependent state this slot serves. `None` at the render root and
    /// for uncontrolled nodes.
    pub fn context(&self) -> Option<&Arc<StateCell>> {
        self.context.as_ref()
    }

    /// This cell followed by every context up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &StateCell> {
        std::iter::successors(Some(self), |cell| cell.context.as_deref())
    }

    /// The nearest cell in the chain, this one included, owned by `node`.
    pub fn find_ancestor(&self, node: NodeId) -> Option<&StateCell> {
        self.ancestors().find(|cell| cell.owner == node)
    }

    /// True if `other` is this cell or one of its contexts.
    pub fn descends_from(&self, other: StateId) -> bool {
        self.ancestors().any(|cell| cell.id == other)
    }

    // ---- time ------------------------------------------------------------

    /// Local time of this slot.
    pub fn time(&self) -> SampleTime {
        self.clock.lock().time
    }

    /// Advance local time. Nodes call this while iterating a chunk so that
    /// evaluations part-way through see the right position.
    pub fn adjust_time(&self, samples: u64) {
        self.clock.lock().time.advance(samples);
    }

    /// Cache the speed of this slot relative to its context: local samples
    /// per context sample.
    pub fn set_time_speed(&self, speed: f64) {
        self.clock.lock().speed = speed;
    }

    /// Last cached speed. 1.0 unless an out-of-sync node changed it.
    pub fn time_speed(&self) -> f64 {
        self.clock.lock().speed
    }

    /// Mark the start of a chunk render.
    pub fn begin_chunk(&self) {
        let mut clock = self.clock.lock();
        clock.chunk_start = clock.time;
    }

    /// Samples advanced since the current chunk began.
    pub fn progress(&self) -> f64 {
        self.clock.lock().progress()
    }

    /// Elapsed samples as seen by `target`, or by the root of the chain when
    /// `target` is `None` or not found.
    ///
    /// Each hop converts the accumulated in-chunk offset into the context's
    /// units by dividing by the hop's cached speed. A zero or non-finite
    /// speed contributes nothing. Only cached clocks are read, so the walk
    /// never calls back into node code.
    pub fn elapsed_samples_at(&self, target: Option<NodeId>) -> f64 {
        let mut carried = 0.0;
        for cell in self.ancestors() {
            let clock = *cell.clock.lock();
            if Some(cell.owner) == target || cell.context.is_none() {
                return clock.time.samples() as f64 + carried;
            }
            carried = if clock.speed.is_finite() && clock.speed > 0.0 {
                (carried + clock.progress()) / clock.speed
            } else {
                0.0
            };
        }
        carried
    }

    // ---- sub-states ------------------------------------------------------

    /// Number of constructed sub-states: the main state plus one per
    /// attached borrower.
    pub fn substate_count(&self) -> usize {
        self.substates.read_recursive().len()
    }

    /// Run `f` on sub-state `index`. `None` if it does not exist.
    pub fn with_substate<R>(&self, index: usize, f: impl FnOnce(&mut SubState) -> R) -> Option<R> {
        let substates = self.substates.read_recursive();
        let mut substate = substates.get(index)?.lock();
        Some(f(&mut substate))
    }

    /// Run `f` on sub-state `index` if it holds a `T`.
    pub fn with_typed<T: 'static, R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.with_substate(index, |state| state.downcast_mut::<T>().map(f))
            .flatten()
    }

    /// Run `f` on the owner's own state if it holds a `T`.
    pub fn with_main<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.with_typed(0, f)
    }

    pub(crate) fn push_substate(&self, state: SubState) {
        self.substates.write().push(Mutex::new(state));
    }

    pub(crate) fn take_substates(&self) -> Vec<SubState> {
        self.substates
            .write()
            .drain(..)
            .map(Mutex::into_inner)
            .collect()
    }

    pub(crate) fn install_substates(&self, states: Vec<SubState>) {
        let mut substates = self.substates.write();
        substates.clear();
        substates.extend(states.into_iter().map(Mutex::new));
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("context", &self.context.as_ref().map(|c| c.id))
            .field("time", &self.time())
            .field("substates", &self.substate_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(speeds: &[f64]) -> Vec<Arc<StateCell>> {
        let ids = StateIds::new();
        let mut cells: Vec<Arc<StateCell>> = Vec::new();
        for (n, speed) in speeds.iter().enumerate() {
            let cell = Arc::new(StateCell::new(ids.next_id(), NodeId(n), None, cells.last().cloned()));
            cell.set_time_speed(*speed);
            cells.push(cell);
        }
        cells
    }

    #[test]
    fn sample_time_splits_at_chunk() {
        let t = SampleTime::from_samples(CHUNK_SIZE as u64 * 3 + 7);
        assert_eq!(t, SampleTime { coarse: 3, fine: 7 });
        let mut u = t;
        u.advance(CHUNK_SIZE as u64 - 7);
        assert_eq!(u, SampleTime { coarse: 4, fine: 0 });
        assert!(t < u);
        assert_eq!(SampleTime::from_samples(44_100).seconds(44_100.0), 1.0);
    }

    #[test]
    fn elapsed_at_root_divides_by_speed() {
        // root <- resampler(speed 2) <- leaf
        let cells = chain(&[1.0, 2.0, 1.0]);
        cells.iter().for_each(|c| c.begin_chunk());
        cells[2].adjust_time(1024);
        assert_eq!(cells[2].elapsed_samples_at(None), 512.0);
        cells[1].adjust_time(1024);
        assert_eq!(cells[2].elapsed_samples_at(None), 1024.0);
    }

    #[test]
    fn elapsed_stops_at_target() {
        let cells = chain(&[1.0, 2.0, 1.0]);
        cells[1].adjust_time(4096);
        cells.iter().for_each(|c| c.begin_chunk());
        cells[2].adjust_time(100);
        assert_eq!(cells[2].elapsed_samples_at(Some(NodeId(1))), 4196.0);
        assert_eq!(cells[2].elapsed_samples_at(Some(NodeId(2))), 100.0);
    }

    #[test]
    fn zero_speed_contributes_nothing() {
        let cells = chain(&[1.0, 0.0, 1.0]);
        cells[0].adjust_time(10);
        cells[2].adjust_time(500);
        assert_eq!(cells[2].elapsed_samples_at(None), 10.0);
    }

    #[test]
    fn typed_access_checks_type() {
        let cell = StateCell::new(StateId(0), NodeId(0), None, None);
        cell.push_substate(Box::new(5u32));
        assert_eq!(cell.with_main(|v: &mut u32| { *v += 1; *v }), Some(6));
        assert_eq!(cell.with_main(|v: &mut f32| *v), None);
        assert_eq!(cell.with_typed(1, |v: &mut u32| *v), None);
    }

    #[test]
    fn find_ancestor_walks_context() {
        let cells = chain(&[1.0, 1.0, 1.0]);
        assert_eq!(cells[2].find_ancestor(NodeId(0)).map(|c| c.id()), Some(cells[0].id()));
        assert!(cells[0].find_ancestor(NodeId(2)).is_none());
        assert!(cells[2].descends_from(cells[1].id()));
    }
}
