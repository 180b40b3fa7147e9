use std::collections::{TryReserveError, VecDeque};
use std::num::NonZero;

/// FIFO queue of free slot indices.
///
/// Allocation takes from the head, release appends to the tail. A fresh list yields indices in
/// ascending order. The backing buffer is sized for the full capacity up front and never grows.
#[derive(Debug)]
pub(crate) struct FreeList {
    indices: VecDeque<usize>,
    capacity: NonZero<usize>,
}

impl FreeList {
    /// Creates a list holding every index in `0..capacity`, in ascending order.
    ///
    /// Fails instead of aborting if the backing buffer cannot be reserved.
    pub(crate) fn try_full(capacity: NonZero<usize>) -> Result<Self, TryReserveError> {
        let mut indices = VecDeque::new();
        indices.try_reserve_exact(capacity.get())?;
        indices.extend(0..capacity.get());

        Ok(Self { indices, capacity })
    }

    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Mutating this breaks conservation checks in every test.
    pub(crate) fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Takes the index at the head of the list.
    pub(crate) fn pop(&mut self) -> Option<usize> {
        self.indices.pop_front()
    }

    /// Returns an index to the tail of the list.
    ///
    /// # Panics
    ///
    /// Panics if the list already holds every index, which would mean a slot was freed twice.
    pub(crate) fn push(&mut self, index: usize) {
        assert!(
            self.indices.len() < self.capacity.get(),
            "free list overflow when returning slot {index}: all {} slots are already free",
            self.capacity.get()
        );
        debug_assert!(index < self.capacity.get());

        self.indices.push_back(index);
    }

    /// Iterates over the free indices from head to tail.
    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }
}
