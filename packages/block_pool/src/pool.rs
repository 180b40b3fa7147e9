use std::num::NonZero;
use std::ops::Range;
use std::{fmt, thread};

use tracing::{debug, trace};

use crate::failure::escalate;
use crate::{
    BlockPoolBuilder, DropPolicy, Error, FailurePolicy, FreeList, Handle, HandleProblem, PoolConfig,
    PoolId, ReportStatus, Result, SlotInfo, SlotMeta, TypeTag,
};

/// Outcome of a successful [`BlockPool::release()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Released {
    /// That was the last reference. The slot is free again.
    Freed,

    /// Other references to the slot remain.
    StillReferenced {
        /// Number of references left after this release.
        remaining: NonZero<u32>,
    },
}

/// A fixed-capacity pool of equally sized byte slots with reference-counted handles.
///
/// All storage is allocated when the pool is built and is never grown, shrunk or moved
/// afterwards. Allocation and release are O(1): free slots are kept in a FIFO free list, so a
/// fresh pool hands out slots in ascending index order and a released slot is reused only after
/// every slot that was already free.
///
/// Each allocated slot carries a reference count. [`allocate()`][Self::allocate] creates the
/// first reference, [`add_reference()`][Self::add_reference] creates more and
/// [`release()`][Self::release] gives one back; the slot is zeroed and returned to the free list
/// when the last reference is released.
///
/// Every failed operation is logged and handed to the pool's [`FailurePolicy`] before the
/// [`Error`] is returned.
///
/// # Example
///
/// ```
/// use block_pool::{BlockPool, Released, TypeTag};
/// use new_zealand::nz;
///
/// let mut pool = BlockPool::builder()
///     .capacity(nz!(3))
///     .slot_size(nz!(16))
///     .build()
///     .unwrap();
///
/// let handle = pool.allocate(8, TypeTag::new(1)).unwrap();
/// pool.bytes_mut(&handle).unwrap().copy_from_slice(b"pool blk");
///
/// let shared = pool.add_reference(&handle).unwrap();
/// assert_eq!(pool.query(&shared).unwrap().ref_count, 2);
///
/// assert!(matches!(pool.release(handle), Ok(Released::StillReferenced { .. })));
/// assert_eq!(pool.bytes(&shared).unwrap(), b"pool blk");
/// assert_eq!(pool.release(shared), Ok(Released::Freed));
/// assert!(pool.is_empty());
/// ```
///
/// # Thread safety
///
/// The pool is single-threaded: it may hold a non-thread-safe failure policy and is therefore
/// neither [`Send`] nor [`Sync`]. Callers that need to share an allocator between threads must
/// serialize access themselves.
pub struct BlockPool {
    /// Handles carry this ID so they cannot be used with a different pool.
    pool_id: PoolId,

    capacity: NonZero<usize>,
    slot_size: NonZero<usize>,
    max_references: NonZero<u32>,

    /// `capacity * slot_size` bytes, slot `i` occupying `i * slot_size..(i + 1) * slot_size`.
    storage: Box<[u8]>,

    /// Index-aligned with the slots in `storage`.
    metadata: Box<[SlotMeta]>,

    /// Holds exactly the indices of free slots.
    free_list: FreeList,

    drop_policy: DropPolicy,
    failure_policy: Box<dyn FailurePolicy>,
}

impl BlockPool {
    /// Creates a builder for configuring and constructing a [`BlockPool`].
    ///
    /// # Example
    ///
    /// ```
    /// use block_pool::BlockPool;
    /// use new_zealand::nz;
    ///
    /// let pool = BlockPool::builder()
    ///     .capacity(nz!(10))
    ///     .slot_size_of::<u64>()
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(pool.len(), 0);
    /// assert_eq!(pool.free_len(), 10);
    /// ```
    #[inline]
    pub fn builder() -> BlockPoolBuilder {
        BlockPoolBuilder::new()
    }

    /// Creates a pool from a [`PoolConfig`] with the default drop and failure policies.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] if the capacity or slot
    /// size is zero, the total storage size overflows `usize` or the storage cannot be reserved.
    pub fn from_config(config: PoolConfig) -> Result<Self> {
        Self::new_inner(
            Some(config.capacity()),
            Some(config.slot_size()),
            config.max_references(),
            DropPolicy::default(),
            Box::new(ReportStatus),
        )
    }

    pub(crate) fn new_inner(
        capacity: Option<usize>,
        slot_size: Option<usize>,
        max_references: NonZero<u32>,
        drop_policy: DropPolicy,
        failure_policy: Box<dyn FailurePolicy>,
    ) -> Result<Self> {
        let pool_id = PoolId::generate();

        let reject = |error: Error| -> Result<Self> { Err(escalate(&*failure_policy, error)) };

        let (Some(capacity), Some(slot_size)) = (capacity, slot_size) else {
            return reject(Error::NullInput {
                pool_id,
                slot_index: None,
                problem: "capacity and slot size must be set before building a pool",
            });
        };

        let Some(capacity) = NonZero::new(capacity) else {
            return reject(Error::CapacityError {
                pool_id,
                slot_index: None,
                problem: "pool capacity must be non-zero",
            });
        };

        let Some(slot_size) = NonZero::new(slot_size) else {
            return reject(Error::CapacityError {
                pool_id,
                slot_index: None,
                problem: "slot size must be non-zero",
            });
        };

        let Some(storage_size) = capacity.get().checked_mul(slot_size.get()) else {
            return reject(Error::CapacityError {
                pool_id,
                slot_index: None,
                problem: "total storage size overflows the address space",
            });
        };

        if capacity.get().checked_mul(size_of::<SlotMeta>()).is_none() {
            return reject(Error::CapacityError {
                pool_id,
                slot_index: None,
                problem: "slot metadata size overflows the address space",
            });
        }

        // Reserving up front lets an oversized pool fail through the policy instead of aborting.
        let mut storage: Vec<u8> = Vec::new();
        let mut metadata: Vec<SlotMeta> = Vec::new();

        if storage.try_reserve_exact(storage_size).is_err()
            || metadata.try_reserve_exact(capacity.get()).is_err()
        {
            return reject(Error::CapacityError {
                pool_id,
                slot_index: None,
                problem: "cannot reserve memory for the pool storage",
            });
        }

        let Ok(free_list) = FreeList::try_full(capacity) else {
            return reject(Error::CapacityError {
                pool_id,
                slot_index: None,
                problem: "cannot reserve memory for the free list",
            });
        };

        storage.resize(storage_size, 0_u8);
        metadata.resize(capacity.get(), SlotMeta::default());

        debug!(
            pool_id = pool_id.get(),
            capacity = capacity.get(),
            slot_size = slot_size.get(),
            "created block pool"
        );

        Ok(Self {
            pool_id,
            capacity,
            slot_size,
            max_references,
            storage: storage.into_boxed_slice(),
            metadata: metadata.into_boxed_slice(),
            free_list,
            drop_policy,
            failure_policy,
        })
    }

    /// The identity of this pool, carried by every handle it issues.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The fixed number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// The fixed number of bytes per slot.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size.get()
    }

    /// The maximum number of simultaneous references to one slot.
    #[must_use]
    pub fn max_references(&self) -> u32 {
        self.max_references.get()
    }

    /// The number of allocated slots.
    #[must_use]
    pub fn len(&self) -> usize {
        // The free list never holds more than `capacity` entries.
        self.capacity.get().wrapping_sub(self.free_list.len())
    }

    /// The number of free slots.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free_list.len()
    }

    /// Whether no slot is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every slot is allocated, so that the next allocation will fail.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free_list.is_empty()
    }

    /// Allocates a slot for a payload of `size_bytes` bytes and returns the first handle to it.
    ///
    /// The slot with the lowest position in the free list is used. Its payload bytes are zero.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::NullInput`][crate::ErrorKind::NullInput] if `size_bytes` is zero.
    /// * [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] if `size_bytes` exceeds
    ///   the slot size.
    /// * [`ErrorKind::PoolExhausted`][crate::ErrorKind::PoolExhausted] if every slot is
    ///   allocated.
    pub fn allocate(&mut self, size_bytes: usize, type_tag: TypeTag) -> Result<Handle> {
        if size_bytes == 0 {
            return Err(self.fail(Error::NullInput {
                pool_id: self.pool_id,
                slot_index: None,
                problem: "cannot allocate an empty payload",
            }));
        }

        if size_bytes > self.slot_size.get() {
            return Err(self.fail(Error::CapacityError {
                pool_id: self.pool_id,
                slot_index: None,
                problem: "requested payload is larger than the slot size",
            }));
        }

        let Some(slot_index) = self.free_list.pop() else {
            return Err(self.fail(Error::PoolExhausted {
                pool_id: self.pool_id,
                capacity: self.capacity.get(),
            }));
        };

        let meta = self.meta_mut(slot_index);
        meta.occupy(size_bytes, type_tag);
        let generation = meta.generation();

        trace!(
            pool_id = self.pool_id.get(),
            slot_index,
            size_bytes,
            type_tag = type_tag.get(),
            "allocated slot"
        );

        #[cfg(debug_assertions)]
        self.integrity_check();

        Ok(Handle::new(self.pool_id, slot_index, generation))
    }

    /// Gives back the reference held by `handle`.
    ///
    /// If it was the last reference, the slot is zeroed, its metadata is cleared and it is
    /// appended to the tail of the free list.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle is from a
    /// different pool, names a free slot (double release) or is stale. The pool is not modified.
    pub fn release(&mut self, handle: Handle) -> Result<Released> {
        let slot_index = self.validate_live(&handle)?;

        let remaining = self.meta_mut(slot_index).decrement();

        let released = if let Some(remaining) = NonZero::new(remaining) {
            trace!(
                pool_id = self.pool_id.get(),
                slot_index,
                remaining = remaining.get(),
                "released reference"
            );

            Released::StillReferenced { remaining }
        } else {
            let range = self.slot_range(slot_index);
            self.storage_mut(range).fill(0);
            self.free_list.push(slot_index);

            trace!(pool_id = self.pool_id.get(), slot_index, "freed slot");

            Released::Freed
        };

        #[cfg(debug_assertions)]
        self.integrity_check();

        Ok(released)
    }

    /// Adds a reference to the slot named by `handle` and returns a new handle for it.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle does not
    ///   name a live allocation of this pool.
    /// * [`ErrorKind::RefCountOverflow`][crate::ErrorKind::RefCountOverflow] if the slot already
    ///   has the maximum number of references.
    pub fn add_reference(&mut self, handle: &Handle) -> Result<Handle> {
        let slot_index = self.validate_live(handle)?;
        let max_references = self.max_references.get();

        let Some(ref_count) = self.meta_mut(slot_index).increment(max_references) else {
            return Err(self.fail(Error::RefCountOverflow {
                pool_id: self.pool_id,
                slot_index,
                max_references,
            }));
        };

        trace!(
            pool_id = self.pool_id.get(),
            slot_index,
            ref_count,
            "added reference"
        );

        Ok(Handle::new(self.pool_id, slot_index, handle.generation()))
    }

    /// Returns the bookkeeping of the slot named by `handle` without modifying anything.
    ///
    /// A handle whose allocation has been fully released still queries successfully (the slot
    /// reports [`SlotState::Free`][crate::SlotState::Free]) until the slot is allocated again.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle is from a
    /// different pool, out of bounds or stale.
    pub fn query(&self, handle: &Handle) -> Result<SlotInfo> {
        let slot_index = self.validate_identity(handle)?;
        Ok(self.meta(slot_index).info())
    }

    /// Returns the bookkeeping of the slot at `slot_index`, or `None` if out of bounds.
    ///
    /// This is a diagnostic view that needs no handle.
    #[must_use]
    pub fn slot_info(&self, slot_index: usize) -> Option<SlotInfo> {
        self.metadata.get(slot_index).map(SlotMeta::info)
    }

    /// Changes the recorded payload size of the slot named by `handle`.
    ///
    /// Bytes beyond a shrunken payload are zeroed so that growing it again never exposes
    /// stale data.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle does not
    ///   name a live allocation of this pool.
    /// * [`ErrorKind::NullInput`][crate::ErrorKind::NullInput] if `new_size` is zero.
    /// * [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] if `new_size` exceeds the
    ///   slot size.
    pub fn resize(&mut self, handle: &Handle, new_size: usize) -> Result<()> {
        let slot_index = self.validate_live(handle)?;

        if new_size == 0 {
            return Err(self.fail(Error::NullInput {
                pool_id: self.pool_id,
                slot_index: Some(slot_index),
                problem: "cannot resize a payload to zero bytes",
            }));
        }

        if new_size > self.slot_size.get() {
            return Err(self.fail(Error::CapacityError {
                pool_id: self.pool_id,
                slot_index: Some(slot_index),
                problem: "resized payload is larger than the slot size",
            }));
        }

        let old_size = self.meta(slot_index).size_bytes();

        if new_size < old_size {
            let slot = self.slot_range(slot_index);
            // Both bounds are within the slot, checked above.
            let tail = slot.start.wrapping_add(new_size)..slot.start.wrapping_add(old_size);
            self.storage_mut(tail).fill(0);
        }

        self.meta_mut(slot_index).set_size_bytes(new_size);
        Ok(())
    }

    /// Returns the payload bytes of the slot named by `handle`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle does not
    /// name a live allocation of this pool.
    pub fn bytes(&self, handle: &Handle) -> Result<&[u8]> {
        let slot_index = self.validate_live(handle)?;
        let range = self.payload_range(slot_index);
        Ok(self.storage(range))
    }

    /// Returns the payload bytes of the slot named by `handle` for modification.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle does not
    /// name a live allocation of this pool.
    pub fn bytes_mut(&mut self, handle: &Handle) -> Result<&mut [u8]> {
        let slot_index = self.validate_live(handle)?;
        let range = self.payload_range(slot_index);
        Ok(self.storage_mut(range))
    }

    /// Copies the payload of `source` to the start of the payload of `destination`.
    ///
    /// Both handles may name the same slot, in which case nothing changes.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if either handle does
    ///   not name a live allocation of this pool.
    /// * [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] if the source payload is
    ///   larger than the destination payload.
    pub fn copy_payload(&mut self, destination: &Handle, source: &Handle) -> Result<()> {
        let destination_index = self.validate_live(destination)?;
        let source_index = self.validate_live(source)?;

        let source_range = self.payload_range(source_index);
        let destination_range = self.payload_range(destination_index);

        if source_range.len() > destination_range.len() {
            return Err(self.fail(Error::CapacityError {
                pool_id: self.pool_id,
                slot_index: Some(destination_index),
                problem: "source payload does not fit in destination payload",
            }));
        }

        self.storage
            .copy_within(source_range, destination_range.start);
        Ok(())
    }

    /// Routes `error` through this pool's failure policy, as if this pool had raised it.
    ///
    /// This lets wrappers around the pool report their own failures consistently.
    ///
    /// # Panics
    ///
    /// Panics if the failure policy responds with [`Response::Trap`][crate::Response::Trap].
    pub fn escalate(&self, error: Error) -> Error {
        self.fail(error)
    }

    fn fail(&self, error: Error) -> Error {
        escalate(&*self.failure_policy, error)
    }

    /// Checks that the handle was issued by this pool for a slot within bounds and of the
    /// current generation. The slot may be free.
    fn validate_identity(&self, handle: &Handle) -> Result<usize> {
        let slot_index = handle.slot_index();

        let problem = if handle.pool_id() != self.pool_id {
            Some(HandleProblem::ForeignPool {
                issued_by: handle.pool_id(),
            })
        } else if slot_index >= self.capacity.get() {
            Some(HandleProblem::OutOfBounds)
        } else if self.meta(slot_index).generation() != handle.generation() {
            Some(HandleProblem::Stale)
        } else {
            None
        };

        match problem {
            Some(problem) => Err(self.fail(Error::InvalidHandle {
                pool_id: self.pool_id,
                slot_index,
                problem,
            })),
            None => Ok(slot_index),
        }
    }

    /// Like [`validate_identity()`][Self::validate_identity] but also requires the slot to be
    /// allocated.
    fn validate_live(&self, handle: &Handle) -> Result<usize> {
        let slot_index = self.validate_identity(handle)?;

        if !self.meta(slot_index).is_allocated() {
            return Err(self.fail(Error::InvalidHandle {
                pool_id: self.pool_id,
                slot_index,
                problem: HandleProblem::SlotFree,
            }));
        }

        Ok(slot_index)
    }

    fn meta(&self, slot_index: usize) -> &SlotMeta {
        self.metadata
            .get(slot_index)
            .expect("slot index was validated against capacity")
    }

    fn meta_mut(&mut self, slot_index: usize) -> &mut SlotMeta {
        self.metadata
            .get_mut(slot_index)
            .expect("slot index was validated against capacity")
    }

    fn slot_range(&self, slot_index: usize) -> Range<usize> {
        // Cannot overflow: `capacity * slot_size` was checked when the pool was built.
        let start = slot_index.wrapping_mul(self.slot_size.get());
        start..start.wrapping_add(self.slot_size.get())
    }

    fn payload_range(&self, slot_index: usize) -> Range<usize> {
        let start = self.slot_range(slot_index).start;
        // The payload size never exceeds the slot size.
        start..start.wrapping_add(self.meta(slot_index).size_bytes())
    }

    fn storage(&self, range: Range<usize>) -> &[u8] {
        self.storage
            .get(range)
            .expect("slot ranges are always within storage")
    }

    fn storage_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        self.storage
            .get_mut(range)
            .expect("slot ranges are always within storage")
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    /// Verifies that the free list holds exactly the free slots, that allocated slots have
    /// references and that the slot counts add up to the capacity.
    ///
    /// # Panics
    ///
    /// Panics if any of these invariants is violated.
    pub(crate) fn integrity_check(&self) {
        let mut listed_as_free = vec![false; self.capacity.get()];

        for index in self.free_list.iter() {
            let listed = listed_as_free
                .get_mut(index)
                .expect("free list entry out of bounds");

            assert!(!*listed, "slot {index} appears twice in the free list");
            *listed = true;
        }

        let mut allocated_count = 0_usize;

        for (index, (meta, listed)) in self.metadata.iter().zip(listed_as_free).enumerate() {
            if meta.is_allocated() {
                assert!(
                    !listed,
                    "allocated slot {index} is present in the free list"
                );
                assert!(meta.ref_count() > 0, "allocated slot {index} has no references");
                allocated_count = allocated_count.wrapping_add(1);
            } else {
                assert!(listed, "free slot {index} is missing from the free list");
                assert_eq!(meta.ref_count(), 0, "free slot {index} has references");
            }
        }

        assert_eq!(
            allocated_count.wrapping_add(self.free_list.len()),
            self.capacity.get(),
            "allocated and free slots do not add up to the capacity"
        );
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("pool_id", &self.pool_id)
            .field("capacity", &self.capacity)
            .field("slot_size", &self.slot_size)
            .field("max_references", &self.max_references)
            .field("len", &self.len())
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        if self.drop_policy == DropPolicy::MustBeEmpty && !thread::panicking() {
            assert!(
                self.is_empty(),
                "dropped block pool {} with {} allocated slots while the drop policy requires it to be empty",
                self.pool_id,
                self.len()
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use new_zealand::nz;
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{ErrorKind, Failure, FnPolicy, Response, SlotState, TrapOnViolation};

    assert_not_impl_any!(BlockPool: Send, Sync);

    const TAG: TypeTag = TypeTag::new(0x7a);

    fn pool(capacity: NonZero<usize>) -> BlockPool {
        BlockPool::builder()
            .capacity(capacity)
            .slot_size(nz!(8))
            .build()
            .unwrap()
    }

    /// A pool whose failure policy records every failure it sees.
    fn recording_pool(
        capacity: NonZero<usize>,
        max_references: NonZero<u32>,
    ) -> (BlockPool, Rc<RefCell<Vec<Failure>>>) {
        let failures = Rc::new(RefCell::new(Vec::new()));
        let failures_clone = Rc::clone(&failures);

        let pool = BlockPool::builder()
            .capacity(capacity)
            .slot_size(nz!(8))
            .max_references(max_references)
            .failure_policy(FnPolicy::new(move |failure: &Failure| {
                failures_clone.borrow_mut().push(*failure);
                Response::Report
            }))
            .build()
            .unwrap();

        (pool, failures)
    }

    #[test]
    fn smoke_test() {
        let mut pool = pool(nz!(4));

        assert_eq!(pool.len(), 0);
        assert!(pool.is_empty());
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.slot_size(), 8);

        let a = pool.allocate(8, TAG).unwrap();
        let b = pool.allocate(4, TAG).unwrap();

        pool.bytes_mut(&a).unwrap().copy_from_slice(&[1; 8]);
        pool.bytes_mut(&b).unwrap().copy_from_slice(&[2; 4]);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.bytes(&a).unwrap(), &[1; 8]);
        assert_eq!(pool.bytes(&b).unwrap(), &[2; 4]);

        assert_eq!(pool.release(a), Ok(Released::Freed));
        assert_eq!(pool.release(b), Ok(Released::Freed));
        assert!(pool.is_empty());
    }

    #[test]
    fn allocation_order_is_ascending_then_fifo() {
        let mut pool = pool(nz!(3));

        let h0 = pool.allocate(1, TAG).unwrap();
        let h1 = pool.allocate(1, TAG).unwrap();
        let h2 = pool.allocate(1, TAG).unwrap();

        assert_eq!(h0.slot_index(), 0);
        assert_eq!(h1.slot_index(), 1);
        assert_eq!(h2.slot_index(), 2);

        pool.release(h1).unwrap();
        let again = pool.allocate(1, TAG).unwrap();
        assert_eq!(again.slot_index(), 1);

        pool.release(h0).unwrap();
        pool.release(h2).unwrap();

        // Released slots are reused in release order.
        assert_eq!(pool.allocate(1, TAG).unwrap().slot_index(), 0);
        assert_eq!(pool.allocate(1, TAG).unwrap().slot_index(), 2);
        pool.release(again).unwrap();
    }

    #[test]
    fn query_after_allocate() {
        let mut pool = pool(nz!(2));

        let handle = pool.allocate(8, TAG).unwrap();
        let info = pool.query(&handle).unwrap();

        assert_eq!(info.state, SlotState::Allocated);
        assert_eq!(info.ref_count, 1);
        assert_eq!(info.size_bytes, 8);
        assert_eq!(info.type_tag, TAG);
        assert_eq!(info.generation, 1);

        pool.release(handle).unwrap();
    }

    #[test]
    fn query_after_full_release_reports_free() {
        let mut pool = pool(nz!(2));

        let handle = pool.allocate(8, TAG).unwrap();
        let raw = handle.raw();
        pool.release(handle).unwrap();

        let info = pool.query(&Handle::from_raw(raw)).unwrap();
        assert_eq!(info.state, SlotState::Free);
        assert_eq!(info.ref_count, 0);
        assert_eq!(info.size_bytes, 0);
        assert_eq!(info.type_tag, TypeTag::UNTYPED);
    }

    #[test]
    fn exhaustion_reported_once_through_policy() {
        let (mut pool, failures) = recording_pool(nz!(1), nz!(10));

        let _first = pool.allocate(8, TAG).unwrap();
        let error = pool.allocate(8, TAG).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::PoolExhausted);
        assert_eq!(failures.borrow().len(), 1);
        assert_eq!(failures.borrow()[0].kind(), ErrorKind::PoolExhausted);
        assert_eq!(failures.borrow()[0].pool_id(), pool.pool_id());
        assert_eq!(failures.borrow()[0].slot_index(), None);
    }

    #[test]
    fn capacity_plus_one_is_exhausted() {
        let mut pool = pool(nz!(5));

        let handles: Vec<_> = (0..5).map(|_| pool.allocate(1, TAG).unwrap()).collect();
        assert!(pool.is_full());

        let error = pool.allocate(1, TAG).unwrap_err();
        assert_eq!(
            error,
            Error::PoolExhausted {
                pool_id: pool.pool_id(),
                capacity: 5
            }
        );

        for handle in handles {
            pool.release(handle).unwrap();
        }

        // Exhaustion is recoverable.
        let handle = pool.allocate(1, TAG).unwrap();
        pool.release(handle).unwrap();
    }

    #[test]
    fn reference_symmetry() {
        let mut pool = pool(nz!(2));

        let first = pool.allocate(2, TAG).unwrap();
        let extra: Vec<_> = (0..4).map(|_| pool.add_reference(&first).unwrap()).collect();

        assert_eq!(pool.query(&first).unwrap().ref_count, 5);

        for (released, handle) in extra.into_iter().enumerate() {
            let remaining = pool.release(handle).unwrap();
            assert_eq!(
                remaining,
                Released::StillReferenced {
                    remaining: NonZero::new(4 - released as u32).unwrap()
                }
            );
        }

        assert_eq!(pool.release(first), Ok(Released::Freed));
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn double_release_is_invalid_and_changes_nothing() {
        let (mut pool, failures) = recording_pool(nz!(2), nz!(10));

        let handle = pool.allocate(8, TAG).unwrap();
        let raw = handle.raw();
        pool.release(handle).unwrap();

        let free_before = pool.free_len();
        let error = pool.release(Handle::from_raw(raw)).unwrap_err();

        assert_eq!(
            error,
            Error::InvalidHandle {
                pool_id: pool.pool_id(),
                slot_index: 0,
                problem: HandleProblem::SlotFree,
            }
        );
        assert_eq!(pool.free_len(), free_before);
        assert_eq!(failures.borrow().len(), 1);
        assert_eq!(failures.borrow()[0].slot_index(), Some(0));
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut pool = pool(nz!(1));

        let old = pool.allocate(8, TAG).unwrap();
        let raw = old.raw();
        pool.release(old).unwrap();

        let new = pool.allocate(8, TAG).unwrap();
        assert_eq!(new.slot_index(), raw.slot_index());

        let stale = Handle::from_raw(raw);

        for error in [
            pool.query(&stale).unwrap_err(),
            pool.bytes(&stale).unwrap_err(),
            pool.add_reference(&stale).unwrap_err(),
        ] {
            assert_eq!(
                error,
                Error::InvalidHandle {
                    pool_id: pool.pool_id(),
                    slot_index: 0,
                    problem: HandleProblem::Stale,
                }
            );
        }

        assert_eq!(pool.release(stale).unwrap_err().kind(), ErrorKind::InvalidHandle);

        // The new occupant is untouched.
        assert_eq!(pool.query(&new).unwrap().ref_count, 1);
        pool.release(new).unwrap();
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut pool_a = pool(nz!(1));
        let mut pool_b = pool(nz!(1));

        let handle = pool_a.allocate(1, TAG).unwrap();
        let raw = handle.raw();

        let error = pool_b.release(handle).unwrap_err();
        assert_eq!(
            error,
            Error::InvalidHandle {
                pool_id: pool_b.pool_id(),
                slot_index: 0,
                problem: HandleProblem::ForeignPool {
                    issued_by: pool_a.pool_id()
                },
            }
        );

        // Still allocated in the pool that issued it.
        pool_a.release(Handle::from_raw(raw)).unwrap();
    }

    #[test]
    fn out_of_bounds_handle_is_rejected() {
        let pool = pool(nz!(2));
        let forged = Handle::new(pool.pool_id(), 2, 1);

        let error = pool.query(&forged).unwrap_err();
        assert_eq!(
            error,
            Error::InvalidHandle {
                pool_id: pool.pool_id(),
                slot_index: 2,
                problem: HandleProblem::OutOfBounds,
            }
        );
    }

    #[test]
    fn ref_count_overflow() {
        let (mut pool, failures) = recording_pool(nz!(1), nz!(2));

        let first = pool.allocate(1, TAG).unwrap();
        let second = pool.add_reference(&first).unwrap();

        let error = pool.add_reference(&first).unwrap_err();
        assert_eq!(
            error,
            Error::RefCountOverflow {
                pool_id: pool.pool_id(),
                slot_index: 0,
                max_references: 2,
            }
        );
        assert_eq!(failures.borrow()[0].kind(), ErrorKind::RefCountOverflow);
        assert_eq!(pool.query(&first).unwrap().ref_count, 2);

        pool.release(second).unwrap();
        pool.release(first).unwrap();
    }

    #[test]
    fn zero_size_allocation_is_null_input() {
        let mut pool = pool(nz!(1));
        let error = pool.allocate(0, TAG).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::NullInput);
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn oversized_allocation_is_capacity_error() {
        let mut pool = pool(nz!(1));
        let error = pool.allocate(9, TAG).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::CapacityError);
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn zero_capacity_config_is_capacity_error() {
        let error = BlockPool::from_config(PoolConfig::new(0, 8)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::CapacityError);

        let error = BlockPool::from_config(PoolConfig::new(8, 0)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::CapacityError);
    }

    #[test]
    fn unreservable_storage_is_capacity_error() {
        // Fits in `usize` but exceeds what any allocation may request.
        let error = BlockPool::from_config(PoolConfig::new(usize::MAX / 2, 2)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::CapacityError);
    }

    #[test]
    fn unreservable_storage_consults_policy() {
        let failures = Rc::new(RefCell::new(Vec::new()));
        let failures_clone = Rc::clone(&failures);

        let error = BlockPool::builder()
            .capacity(NonZero::new(usize::MAX / 4).unwrap())
            .slot_size(nz!(2))
            .failure_policy(FnPolicy::new(move |failure: &Failure| {
                failures_clone.borrow_mut().push(*failure);
                Response::Report
            }))
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::CapacityError);
        assert_eq!(failures.borrow().len(), 1);
    }

    #[test]
    fn released_slot_is_zeroed() {
        let mut pool = pool(nz!(1));

        let handle = pool.allocate(8, TAG).unwrap();
        pool.bytes_mut(&handle).unwrap().fill(0xff);
        pool.release(handle).unwrap();

        let handle = pool.allocate(8, TAG).unwrap();
        assert_eq!(pool.bytes(&handle).unwrap(), &[0; 8]);
        pool.release(handle).unwrap();
    }

    #[test]
    fn free_slot_bytes_are_inaccessible() {
        let mut pool = pool(nz!(1));

        let handle = pool.allocate(8, TAG).unwrap();
        let raw = handle.raw();
        pool.release(handle).unwrap();

        let released = Handle::from_raw(raw);
        assert_eq!(pool.bytes(&released).unwrap_err().kind(), ErrorKind::InvalidHandle);
        assert_eq!(
            pool.bytes_mut(&released).unwrap_err().kind(),
            ErrorKind::InvalidHandle
        );
    }

    #[test]
    fn payload_view_is_limited_to_size() {
        let mut pool = pool(nz!(1));

        let handle = pool.allocate(3, TAG).unwrap();
        assert_eq!(pool.bytes(&handle).unwrap().len(), 3);
        assert_eq!(pool.bytes_mut(&handle).unwrap().len(), 3);
        pool.release(handle).unwrap();
    }

    #[test]
    fn resize_within_slot() {
        let mut pool = pool(nz!(1));

        let handle = pool.allocate(4, TAG).unwrap();
        pool.bytes_mut(&handle).unwrap().copy_from_slice(&[9, 9, 9, 9]);

        pool.resize(&handle, 8).unwrap();
        assert_eq!(pool.bytes(&handle).unwrap(), &[9, 9, 9, 9, 0, 0, 0, 0]);

        pool.resize(&handle, 2).unwrap();
        pool.resize(&handle, 4).unwrap();
        assert_eq!(pool.bytes(&handle).unwrap(), &[9, 9, 0, 0]);

        assert_eq!(
            pool.resize(&handle, 9).unwrap_err().kind(),
            ErrorKind::CapacityError
        );
        assert_eq!(
            pool.resize(&handle, 0).unwrap_err().kind(),
            ErrorKind::NullInput
        );
        assert_eq!(pool.query(&handle).unwrap().size_bytes, 4);

        pool.release(handle).unwrap();
    }

    #[test]
    fn copy_payload_between_slots() {
        let mut pool = pool(nz!(2));

        let source = pool.allocate(4, TAG).unwrap();
        let destination = pool.allocate(8, TAG).unwrap();

        pool.bytes_mut(&source).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        pool.copy_payload(&destination, &source).unwrap();
        assert_eq!(pool.bytes(&destination).unwrap(), &[1, 2, 3, 4, 0, 0, 0, 0]);

        // The larger payload does not fit in the smaller one.
        let error = pool.copy_payload(&source, &destination).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::CapacityError);
        assert_eq!(error.slot_index(), Some(source.slot_index()));

        // Copying onto itself is a no-op.
        pool.copy_payload(&source, &source).unwrap();
        assert_eq!(pool.bytes(&source).unwrap(), &[1, 2, 3, 4]);

        pool.release(source).unwrap();
        pool.release(destination).unwrap();
    }

    #[test]
    fn slot_info_diagnostics() {
        let mut pool = pool(nz!(2));
        let handle = pool.allocate(5, TAG).unwrap();

        assert_eq!(pool.slot_info(0).unwrap().state, SlotState::Allocated);
        assert_eq!(pool.slot_info(1).unwrap().state, SlotState::Free);
        assert!(pool.slot_info(2).is_none());

        pool.release(handle).unwrap();
    }

    #[test]
    fn conservation_over_mixed_operations() {
        let mut pool = pool(nz!(4));
        let mut live = Vec::new();

        for round in 0..20_usize {
            if round % 3 == 2 {
                if let Some(handle) = live.pop() {
                    pool.release(handle).unwrap();
                }
            } else if let Ok(handle) = pool.allocate(1, TAG) {
                live.push(handle);
            }

            assert_eq!(pool.len() + pool.free_len(), pool.capacity());
            assert_eq!(pool.len(), live.len());
        }

        for handle in live {
            pool.release(handle).unwrap();
        }
    }

    #[test]
    #[should_panic]
    fn trap_policy_panics_on_double_release() {
        let mut pool = BlockPool::builder()
            .capacity(nz!(1))
            .slot_size(nz!(8))
            .failure_policy(TrapOnViolation)
            .build()
            .unwrap();

        let handle = pool.allocate(1, TAG).unwrap();
        let raw = handle.raw();
        pool.release(handle).unwrap();

        _ = pool.release(Handle::from_raw(raw));
    }

    #[test]
    fn trap_policy_still_reports_exhaustion() {
        let mut pool = BlockPool::builder()
            .capacity(nz!(1))
            .slot_size(nz!(8))
            .failure_policy(TrapOnViolation)
            .build()
            .unwrap();

        let handle = pool.allocate(1, TAG).unwrap();
        assert!(pool.allocate(1, TAG).is_err());
        pool.release(handle).unwrap();
    }

    #[test]
    fn escalate_uses_pool_policy() {
        let (pool, failures) = recording_pool(nz!(1), nz!(1));

        let error = Error::PoolExhausted {
            pool_id: pool.pool_id(),
            capacity: 1,
        };

        assert_eq!(pool.escalate(error), error);
        assert_eq!(failures.borrow().len(), 1);
    }

    #[test]
    fn drop_when_empty_does_not_panic_if_policy_must_be_empty() {
        let mut pool = BlockPool::builder()
            .capacity(nz!(1))
            .slot_size(nz!(8))
            .drop_policy(DropPolicy::MustBeEmpty)
            .build()
            .unwrap();

        let handle = pool.allocate(1, TAG).unwrap();
        pool.release(handle).unwrap();

        drop(pool);
    }

    #[test]
    #[should_panic]
    fn drop_with_allocation_panics_if_policy_must_be_empty() {
        let mut pool = BlockPool::builder()
            .capacity(nz!(1))
            .slot_size(nz!(8))
            .drop_policy(DropPolicy::MustBeEmpty)
            .build()
            .unwrap();

        _ = pool.allocate(1, TAG).unwrap().into_raw();

        drop(pool);
    }

    #[test]
    fn drop_with_allocation_is_fine_by_default() {
        let mut pool = pool(nz!(1));
        _ = pool.allocate(1, TAG).unwrap().into_raw();
        drop(pool);
    }

    #[test]
    fn debug_output_names_pool() {
        let pool = pool(nz!(1));
        let debug_output = format!("{pool:?}");

        assert!(debug_output.contains("BlockPool"));
        assert!(debug_output.contains("capacity"));
    }
}
