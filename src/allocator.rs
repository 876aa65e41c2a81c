//! The allocator descriptor seam between node authors and the state table.
//!
//! A state table never knows the concrete type of anything it stores. Each
//! sub-state kind is described by a [`StateAllocator`], which constructs,
//! relocates and destroys values of that kind and reports their size and
//! alignment. [`SlotLayout`] folds those sizes into the per-slot footprint.

use crate::invariant_ppt::fail_invariant;
use crate::states::{StateCell, SubState};
use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;

/// Constructs, relocates and destroys one kind of sub-state.
pub trait StateAllocator: Send + Sync {
    /// Build a default value for `slot`. The slot's owner, key and context
    /// are available; its sub-states may be mid-relayout.
    fn construct(&self, slot: &StateCell) -> SubState;

    /// Relocate a value into a new slot layout.
    fn move_construct(&self, src: SubState) -> SubState {
        src
    }

    /// Tear a value down.
    fn destroy(&self, state: SubState) {
        drop(state);
    }

    /// Size in bytes of one value.
    fn size(&self) -> usize;

    /// Alignment in bytes of one value.
    fn alignment(&self) -> usize;

    /// Size and alignment as a [`Layout`].
    fn layout(&self) -> Layout {
        match Layout::from_size_align(self.size(), self.alignment()) {
            Ok(layout) => layout,
            Err(_) => fail_invariant(
                crate::invariant_ppt::TABLE_RELAYOUT,
                "allocator reports an invalid layout",
                None,
            ),
        }
    }
}

/// Allocator for a concrete `T`, constructed by a closure.
pub struct TypedAllocator<T, F> {
    make: F,
    _state: PhantomData<fn() -> T>,
}

impl<T, F> TypedAllocator<T, F>
where
    T: Send + 'static,
    F: Fn(&StateCell) -> T + Send + Sync,
{
    /// Wrap a constructor.
    pub fn new(make: F) -> Self {
        Self {
            make,
            _state: PhantomData,
        }
    }
}

impl<T, F> StateAllocator for TypedAllocator<T, F>
where
    T: Send + 'static,
    F: Fn(&StateCell) -> T + Send + Sync,
{
    fn construct(&self, slot: &StateCell) -> SubState {
        Box::new((self.make)(slot))
    }

    fn size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn alignment(&self) -> usize {
        std::mem::align_of::<T>()
    }
}

impl<T, F> fmt::Debug for TypedAllocator<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedAllocator")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Allocator that default-constructs `T`.
pub fn default_allocator<T: Default + Send + 'static>() -> TypedAllocator<T, fn(&StateCell) -> T> {
    let make: fn(&StateCell) -> T = |_| T::default();
    TypedAllocator::new(make)
}

/// Per-slot footprint: the main state followed by each borrowed sub-state,
/// each at an offset aligned for its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    layout: Layout,
    offsets: Vec<usize>,
}

impl SlotLayout {
    /// Lay out `parts` in order. Panics if the total overflows.
    pub fn compute<I: IntoIterator<Item = Layout>>(parts: I) -> Self {
        let mut layout = Layout::new::<()>();
        let mut offsets = Vec::new();
        for part in parts {
            let Ok((extended, offset)) = layout.extend(part) else {
                fail_invariant(
                    crate::invariant_ppt::TABLE_RELAYOUT,
                    "slot layout overflows",
                    None,
                );
            };
            layout = extended;
            offsets.push(offset);
        }
        Self {
            layout: layout.pad_to_align(),
            offsets,
        }
    }

    /// Bytes per slot, padded to the slot alignment.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Strictest alignment among the parts.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Byte offset of each part.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
}
