//! Per-node slot storage.
//!
//! A [`StateTable`] owns every slot of one sound node. Each slot hosts the
//! node's main state at sub-state index 0 followed by one sub-state per
//! attached borrower, in attachment order. Borrowers are addressed through a
//! stable [`BorrowerId`], never through a raw offset, so relayouts cannot
//! leave a borrower pointing at the wrong bytes.
//!
//! Slots are kept ordered by `(context id, key)` so lookups can binary search.

use crate::allocator::{SlotLayout, StateAllocator};
use crate::dependency::NodeId;
use crate::invariant_ppt::{assert_invariant, fail_invariant, SLOT_INDEX_IN_RANGE, TABLE_RELAYOUT};
use crate::multiplicity::Key;
use crate::states::{StateCell, StateId, SubState};
use std::fmt;
use std::sync::Arc;

/// Stable handle for a borrower's allocator entry in one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BorrowerId(pub usize);

/// The slot array of one node.
pub struct StateTable {
    owner: NodeId,
    main: Arc<dyn StateAllocator>,
    borrowers: Vec<(BorrowerId, Arc<dyn StateAllocator>)>,
    next_borrower: usize,
    layout: SlotLayout,
    slots: Vec<Arc<StateCell>>,
}

impl StateTable {
    /// An empty table whose slots hold states built by `main`.
    pub fn new(owner: NodeId, main: Arc<dyn StateAllocator>) -> Self {
        let layout = SlotLayout::compute([main.layout()]);
        Self {
            owner,
            main,
            borrowers: Vec::new(),
            next_borrower: 0,
            layout,
            slots: Vec::new(),
        }
    }

    /// Node owning the table.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Bytes one slot accounts for: main state plus every borrowed
    /// sub-state, aligned.
    pub fn slot_size(&self) -> usize {
        self.layout.size()
    }

    /// Current slot layout.
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Number of attached borrowers.
    pub fn borrower_count(&self) -> usize {
        self.borrowers.len()
    }

    /// Every slot, in table order.
    pub fn slots(&self) -> &[Arc<StateCell>] {
        &self.slots
    }

    fn check_index(&self, index: usize, limit: usize) {
        if index >= limit {
            fail_invariant(
                SLOT_INDEX_IN_RANGE,
                "SlotIndexError",
                Some(format!("{}: index {} of {}", self.owner, index, self.slots.len()).as_str()),
            );
        }
    }

    /// Slot at `index`.
    ///
    /// # Panics
    /// `SlotIndexError` if `index >= size()`.
    pub fn get_state(&self, index: usize) -> &Arc<StateCell> {
        self.check_index(index, self.slots.len());
        &self.slots[index]
    }

    /// Position of the slot with identity `id`.
    pub fn position_of(&self, id: StateId) -> Option<usize> {
        self.slots.iter().position(|cell| cell.id() == id)
    }

    /// Binary search by `(context, key)`; `Err` carries the insertion point.
    pub fn search(&self, context: Option<StateId>, key: Option<Key>) -> Result<usize, usize> {
        self.slots
            .binary_search_by(|cell| (cell.context().map(|c| c.id()), cell.key()).cmp(&(context, key)))
    }

    /// Insert `cell` at `index`, constructing its main state and every
    /// borrowed sub-state.
    ///
    /// # Panics
    /// `SlotIndexError` if `index > size()`.
    pub fn insert_slot(&mut self, index: usize, cell: Arc<StateCell>) -> &Arc<StateCell> {
        self.check_index(index, self.slots.len() + 1);
        cell.push_substate(self.main.construct(&cell));
        for (_, allocator) in &self.borrowers {
            cell.push_substate(allocator.construct(&cell));
        }
        tracing::trace!(owner = %self.owner, index, "slot_insert");
        self.slots.insert(index, cell);
        &self.slots[index]
    }

    /// Remove the slot at `index`, destroying every sub-state it holds. The
    /// returned cell is empty; stale references to it see no state.
    ///
    /// # Panics
    /// `SlotIndexError` if `index >= size()`.
    pub fn erase_slot(&mut self, index: usize) -> Arc<StateCell> {
        self.check_index(index, self.slots.len());
        let cell = self.slots.remove(index);
        self.destroy_substates(&cell);
        tracing::trace!(owner = %self.owner, index, "slot_erase");
        cell
    }

    /// Erase every slot.
    pub fn clear(&mut self) -> Vec<Arc<StateCell>> {
        let cells: Vec<Arc<StateCell>> = self.slots.drain(..).collect();
        for cell in &cells {
            self.destroy_substates(cell);
        }
        cells
    }

    fn destroy_substates(&self, cell: &StateCell) {
        let allocators = std::iter::once(&self.main).chain(self.borrowers.iter().map(|(_, a)| a));
        for (state, allocator) in cell.take_substates().into_iter().zip(allocators) {
            allocator.destroy(state);
        }
    }

    fn recompute_layout(&mut self) {
        let parts = std::iter::once(self.main.layout())
            .chain(self.borrowers.iter().map(|(_, a)| a.layout()));
        self.layout = SlotLayout::compute(parts);
    }

    /// Register a borrower's allocator and relayout every slot: existing
    /// sub-states are relocated, then the new one is constructed at the end.
    pub fn add_borrower_allocator(&mut self, allocator: Arc<dyn StateAllocator>) -> BorrowerId {
        let id = BorrowerId(self.next_borrower);
        self.next_borrower += 1;
        let before = self.slot_size();

        for cell in &self.slots {
            let old = cell.take_substates();
            let allocators = std::iter::once(&self.main).chain(self.borrowers.iter().map(|(_, a)| a));
            let mut moved: Vec<SubState> = old
                .into_iter()
                .zip(allocators)
                .map(|(state, a)| a.move_construct(state))
                .collect();
            moved.push(allocator.construct(cell));
            cell.install_substates(moved);
        }

        self.borrowers.push((id, allocator));
        self.recompute_layout();

        let expected = self.borrowers.len() + 1;
        assert_invariant(
            TABLE_RELAYOUT,
            self.slots.iter().all(|c| c.substate_count() == expected),
            "every slot carries the new sub-state",
            None,
        );
        tracing::debug!(
            owner = %self.owner,
            borrower = id.0,
            slots = self.slots.len(),
            "table_relayout: slot size {} -> {}",
            before,
            self.slot_size()
        );
        id
    }

    /// Deregister a borrower, destroying its sub-state in every slot and
    /// compacting the rest. Returns false if `id` is not attached.
    pub fn remove_borrower_allocator(&mut self, id: BorrowerId) -> bool {
        let Some(position) = self.borrowers.iter().position(|(b, _)| *b == id) else {
            return false;
        };
        let before = self.slot_size();
        let (_, removed) = self.borrowers.remove(position);
        let removed_index = position + 1;

        for cell in &self.slots {
            let old = cell.take_substates();
            let mut kept = Vec::with_capacity(old.len().saturating_sub(1));
            let mut allocators = std::iter::once(&self.main).chain(self.borrowers.iter().map(|(_, a)| a));
            for (index, state) in old.into_iter().enumerate() {
                if index == removed_index {
                    removed.destroy(state);
                } else if let Some(allocator) = allocators.next() {
                    kept.push(allocator.move_construct(state));
                }
            }
            cell.install_substates(kept);
        }

        self.recompute_layout();
        let expected = self.borrowers.len() + 1;
        assert_invariant(
            TABLE_RELAYOUT,
            self.slots.iter().all(|c| c.substate_count() == expected),
            "every slot dropped the borrowed sub-state",
            None,
        );
        tracing::debug!(
            owner = %self.owner,
            borrower = id.0,
            slots = self.slots.len(),
            "table_relayout: slot size {} -> {}",
            before,
            self.slot_size()
        );
        true
    }

    /// Sub-state index of a borrower inside every slot.
    pub fn borrowed_index(&self, id: BorrowerId) -> Option<usize> {
        self.borrowers
            .iter()
            .position(|(b, _)| *b == id)
            .map(|p| p + 1)
    }

    /// Run `f` on the sub-state of borrower `id` in the slot at
    /// `main_index`. `None` if the borrower is not attached.
    ///
    /// # Panics
    /// `SlotIndexError` if `main_index >= size()`.
    pub fn get_borrowed_state<R>(
        &self,
        main_index: usize,
        id: BorrowerId,
        f: impl FnOnce(&mut SubState) -> R,
    ) -> Option<R> {
        let cell = self.get_state(main_index);
        let index = self.borrowed_index(id)?;
        cell.with_substate(index, f)
    }
}

impl Drop for StateTable {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for StateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTable")
            .field("owner", &self.owner)
            .field("slots", &self.slots.len())
            .field("borrowers", &self.borrowers.iter().map(|(b, _)| b.0).collect::<Vec<_>>())
            .field("slot_size", &self.slot_size())
            .finish()
    }
}
