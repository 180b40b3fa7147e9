use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use std::{fmt, mem, thread};

use bytemuck::Pod;
use tracing::{trace, warn};

use crate::{Allocator, AllocatorExt, Handle, PoolId, RawHandle, Result, SlotInfo, TypeTag};

/// A single-threaded, cloneable handle to an [`Allocator`] that hands out self-releasing
/// [`Shared`] references.
///
/// Every clone of a `SharedPool` refers to the same allocator, which stays alive as long as
/// any clone or any [`Shared`] allocated from it exists.
///
/// # Single-threaded design
///
/// This type is neither [`Send`] nor [`Sync`]. The wrapped allocator is borrowed for the
/// duration of each call, so the closures passed to [`Shared::read()`] and [`Shared::write()`]
/// must not call back into the same pool.
///
/// A [`Shared`] may still be dropped inside such a closure. Its release is then queued and
/// carried out by the next access to the pool.
///
/// # Example
///
/// ```
/// use block_pool::{BlockPool, PoolConfig, SharedPool, TypeTag};
///
/// let pool = SharedPool::new(BlockPool::from_config(PoolConfig::new(4, 8)).unwrap());
///
/// let first = pool.allocate(8, TypeTag::UNTYPED).unwrap();
/// let second = first.clone();
/// assert_eq!(first.info().unwrap().ref_count, 2);
///
/// drop(first);
/// assert_eq!(pool.len(), 1);
///
/// drop(second);
/// assert!(pool.is_empty());
/// ```
pub struct SharedPool<A: Allocator> {
    state: Rc<SharedState<A>>,
}

struct SharedState<A: Allocator> {
    allocator: RefCell<A>,

    /// Releases of references dropped while the allocator was borrowed or the thread was
    /// unwinding. Each entry is a live reference, so the queue is bounded by the total reference
    /// count of the pool.
    deferred: RefCell<Vec<RawHandle>>,
}

impl<A: Allocator> SharedPool<A> {
    /// Takes ownership of `allocator` and makes it shareable.
    #[must_use]
    pub fn new(allocator: A) -> Self {
        Self {
            state: Rc::new(SharedState {
                allocator: RefCell::new(allocator),
                deferred: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Borrows the allocator after carrying out any queued releases that can run now.
    fn allocator(&self) -> Ref<'_, A> {
        if let Ok(mut allocator) = self.state.allocator.try_borrow_mut() {
            self.release_deferred(&mut allocator);
        }

        self.state.allocator.borrow()
    }

    /// Mutably borrows the allocator after carrying out any queued releases.
    fn allocator_mut(&self) -> RefMut<'_, A> {
        let mut allocator = self.state.allocator.borrow_mut();
        self.release_deferred(&mut allocator);
        allocator
    }

    fn defer_release(&self, raw: RawHandle) {
        trace!(slot_index = raw.slot_index(), "queued release of shared reference");

        self.state.deferred.borrow_mut().push(raw);
    }

    fn release_deferred(&self, allocator: &mut A) {
        // Taken out first so that a failure policy dropping references can queue more.
        let deferred = mem::take(&mut *self.state.deferred.borrow_mut());

        for raw in deferred {
            release_logged(allocator, Handle::from_raw(raw));
        }
    }

    /// Allocates a slot and returns the first reference to it.
    ///
    /// The slot is released automatically when the last [`Shared`] referring to it is dropped.
    ///
    /// # Errors
    ///
    /// Fails as [`Allocator::allocate()`] does.
    pub fn allocate(&self, size_bytes: usize, type_tag: TypeTag) -> Result<Shared<A>> {
        let handle = self.allocator_mut().allocate(size_bytes, type_tag)?;

        Ok(Shared {
            handle,
            pool: self.clone(),
        })
    }

    /// Allocates a slot sized for `value` and writes `value` into it.
    ///
    /// # Errors
    ///
    /// Fails as [`Allocator::allocate()`] does.
    pub fn allocate_value<T: Pod>(&self, value: &T, type_tag: TypeTag) -> Result<Shared<A>> {
        let shared = self.allocate(size_of::<T>(), type_tag)?;
        shared.write_value(value)?;
        Ok(shared)
    }

    /// The identity of the wrapped allocator.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.allocator().pool_id()
    }

    /// The fixed number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.allocator().capacity()
    }

    /// The number of allocated slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocator().len()
    }

    /// The number of free slots.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.allocator().free_len()
    }

    /// Whether no slot is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocator().is_empty()
    }

    /// Whether every slot is allocated.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.allocator().is_full()
    }

    /// Calls `f` with shared access to the wrapped allocator.
    pub fn inspect<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&self.allocator())
    }
}

impl<A: Allocator> Clone for SharedPool<A> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<A: Allocator> From<A> for SharedPool<A> {
    fn from(allocator: A) -> Self {
        Self::new(allocator)
    }
}

impl<A: Allocator> fmt::Debug for SharedPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("pool_id", &self.pool_id())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// One reference to a slot of a [`SharedPool`], released automatically when dropped.
///
/// Cloning adds a reference to the same slot; the slot returns to the free list when the last
/// clone is dropped.
///
/// # Panics
///
/// [`Clone::clone()`] panics if the slot's reference count is already at its maximum. Use
/// [`try_clone()`][Self::try_clone] to handle that case.
pub struct Shared<A: Allocator> {
    handle: Handle,
    pool: SharedPool<A>,
}

impl<A: Allocator> Shared<A> {
    /// The handle for this reference. It remains owned by the `Shared`.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The pool this reference belongs to.
    #[must_use]
    pub fn pool(&self) -> &SharedPool<A> {
        &self.pool
    }

    /// Returns the bookkeeping of the slot.
    ///
    /// # Errors
    ///
    /// Fails as [`Allocator::query()`] does, which only happens if the handle was released
    /// behind this reference's back.
    pub fn info(&self) -> Result<SlotInfo> {
        self.pool.allocator().query(&self.handle)
    }

    /// Calls `f` with the payload bytes.
    ///
    /// # Errors
    ///
    /// Fails as [`Allocator::bytes()`] does.
    ///
    /// # Panics
    ///
    /// Panics if `f` accesses the same pool.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let pool = self.pool.allocator();
        Ok(f(pool.bytes(&self.handle)?))
    }

    /// Calls `f` with the payload bytes for modification.
    ///
    /// # Errors
    ///
    /// Fails as [`Allocator::bytes_mut()`] does.
    ///
    /// # Panics
    ///
    /// Panics if `f` accesses the same pool.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut pool = self.pool.allocator_mut();
        Ok(f(pool.bytes_mut(&self.handle)?))
    }

    /// Reads a `T` from the start of the payload.
    ///
    /// # Errors
    ///
    /// Fails as [`AllocatorExt::read_value()`] does.
    pub fn read_value<T: Pod>(&self) -> Result<T> {
        self.pool.allocator().read_value(&self.handle)
    }

    /// Writes `value` to the start of the payload.
    ///
    /// # Errors
    ///
    /// Fails as [`AllocatorExt::write_value()`] does.
    pub fn write_value<T: Pod>(&self, value: &T) -> Result<()> {
        self.pool.allocator_mut().write_value(&self.handle, value)
    }

    /// Adds a reference to the slot and returns it.
    ///
    /// # Errors
    ///
    /// Fails as [`Allocator::add_reference()`] does, e.g. if the reference count is at its
    /// maximum.
    pub fn try_clone(&self) -> Result<Self> {
        let handle = self.pool.allocator_mut().add_reference(&self.handle)?;

        Ok(Self {
            handle,
            pool: self.pool.clone(),
        })
    }
}

impl<A: Allocator> Clone for Shared<A> {
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(shared) => shared,
            Err(error) => panic!("cannot clone shared slot reference: {error}"),
        }
    }
}

impl<A: Allocator> Drop for Shared<A> {
    fn drop(&mut self) {
        let raw = self.handle.raw();

        // A failed release may trap, which must not happen while the thread is unwinding.
        if thread::panicking() {
            self.pool.defer_release(raw);
            return;
        }

        let Ok(mut allocator) = self.pool.state.allocator.try_borrow_mut() else {
            self.pool.defer_release(raw);
            return;
        };

        self.pool.release_deferred(&mut allocator);
        release_logged(&mut *allocator, Handle::from_raw(raw));
    }
}

/// Releases a reference on behalf of a [`Shared`] that no longer exists.
fn release_logged<A: Allocator>(allocator: &mut A, handle: Handle) {
    // The allocator has already consulted its failure policy, all that is left is to log.
    if let Err(error) = allocator.release(handle) {
        warn!(
            pool_id = error.pool_id().get(),
            slot_index = error.slot_index(),
            "failed to release shared reference: {error}"
        );
    }
}

impl<A: Allocator> fmt::Debug for Shared<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::num::NonZero;
    use std::panic::{self, AssertUnwindSafe};

    use new_zealand::nz;
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{
        BlockPool, ErrorKind, Failure, FaultInjector, FnPolicy, PoolConfig, Response,
        TrapOnViolation,
    };

    assert_not_impl_any!(SharedPool<BlockPool>: Send, Sync);
    assert_not_impl_any!(Shared<BlockPool>: Send, Sync);

    fn shared_pool(capacity: usize) -> SharedPool<BlockPool> {
        SharedPool::new(BlockPool::from_config(PoolConfig::new(capacity, 8)).unwrap())
    }

    #[test]
    fn clone_increments_and_last_drop_frees() {
        let pool = shared_pool(2);

        let first = pool.allocate(4, TypeTag::UNTYPED).unwrap();
        let second = first.clone();
        let third = second.clone();

        assert_eq!(first.info().unwrap().ref_count, 3);

        drop(first);
        drop(third);
        assert_eq!(second.info().unwrap().ref_count, 1);
        assert_eq!(pool.len(), 1);

        drop(second);
        assert!(pool.is_empty());
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn clones_see_the_same_bytes() {
        let pool = shared_pool(1);

        let writer = pool.allocate(4, TypeTag::UNTYPED).unwrap();
        let reader = writer.clone();

        writer.write(|bytes| bytes.copy_from_slice(b"abcd")).unwrap();
        assert_eq!(reader.read(<[u8]>::to_vec).unwrap(), b"abcd");
    }

    #[test]
    fn typed_values() {
        let pool = shared_pool(1);

        let shared = pool.allocate_value(&0x0102_0304_u32, TypeTag::new(4)).unwrap();
        assert_eq!(shared.read_value::<u32>().unwrap(), 0x0102_0304);
        assert_eq!(shared.info().unwrap().size_bytes, 4);

        shared.write_value(&7_u32).unwrap();
        assert_eq!(shared.read_value::<u32>().unwrap(), 7);
    }

    #[test]
    fn try_clone_reports_overflow() {
        let pool = SharedPool::new(
            BlockPool::builder()
                .capacity(nz!(1))
                .slot_size(nz!(8))
                .max_references(nz!(2))
                .build()
                .unwrap(),
        );

        let first = pool.allocate(1, TypeTag::UNTYPED).unwrap();
        let second = first.try_clone().unwrap();

        let error = second.try_clone().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::RefCountOverflow);

        drop(first);
        drop(second);
        assert!(pool.is_empty());
    }

    #[test]
    #[should_panic]
    fn clone_panics_on_overflow() {
        let pool = SharedPool::new(
            BlockPool::builder()
                .capacity(nz!(1))
                .slot_size(nz!(8))
                .max_references(nz!(1))
                .build()
                .unwrap(),
        );

        let first = pool.allocate(1, TypeTag::UNTYPED).unwrap();
        let _second = first.clone();
    }

    #[test]
    fn pool_outlives_its_handles() {
        let shared = {
            let pool = shared_pool(1);
            pool.allocate(1, TypeTag::UNTYPED).unwrap()
        };

        assert_eq!(shared.pool().len(), 1);
        let pool = shared.pool().clone();

        drop(shared);
        assert!(pool.is_empty());
    }

    #[test]
    fn exhaustion_is_reported() {
        let pool = shared_pool(1);

        let _held = pool.allocate(1, TypeTag::UNTYPED).unwrap();
        let error = pool.allocate(1, TypeTag::UNTYPED).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::PoolExhausted);
        assert!(pool.is_full());
    }

    #[test]
    fn drop_with_released_slot_consults_policy_without_panicking() {
        let failures = Rc::new(Cell::new(0_usize));
        let failures_clone = Rc::clone(&failures);

        let pool = SharedPool::new(
            BlockPool::builder()
                .capacity(nz!(1))
                .slot_size(nz!(8))
                .failure_policy(FnPolicy::new(move |_: &Failure| {
                    failures_clone.set(failures_clone.get() + 1);
                    Response::Report
                }))
                .build()
                .unwrap(),
        );

        let shared = pool.allocate(1, TypeTag::UNTYPED).unwrap();

        // Release the reference behind the `Shared`'s back.
        let stolen = Handle::from_raw(shared.handle().raw());
        pool.state.allocator.borrow_mut().release(stolen).unwrap();

        drop(shared);

        assert_eq!(failures.get(), 1);
        assert!(pool.is_empty());
    }

    fn counting_pool(capacity: NonZero<usize>) -> (SharedPool<BlockPool>, Rc<Cell<usize>>) {
        let failures = Rc::new(Cell::new(0_usize));
        let failures_clone = Rc::clone(&failures);

        let pool = SharedPool::new(
            BlockPool::builder()
                .capacity(capacity)
                .slot_size(nz!(8))
                .failure_policy(FnPolicy::new(move |_: &Failure| {
                    failures_clone.set(failures_clone.get() + 1);
                    Response::Report
                }))
                .build()
                .unwrap(),
        );

        (pool, failures)
    }

    #[test]
    fn drop_inside_read_is_released_later() {
        let (pool, failures) = counting_pool(nz!(1));

        let first = pool.allocate(4, TypeTag::UNTYPED).unwrap();
        let second = first.clone();

        first.read(move |_| drop(second)).unwrap();
        assert_eq!(first.info().unwrap().ref_count, 1);

        drop(first);

        assert!(pool.is_empty());
        assert_eq!(failures.get(), 0);

        // The slot is usable again.
        let _again = pool.allocate(4, TypeTag::UNTYPED).unwrap();
    }

    #[test]
    fn drop_inside_inspect_is_released_by_next_access() {
        let (pool, failures) = counting_pool(nz!(2));

        let shared = pool.allocate(4, TypeTag::UNTYPED).unwrap();
        pool.inspect(move |_| drop(shared));

        assert_eq!(pool.len(), 0);
        assert_eq!(pool.free_len(), 2);
        assert_eq!(failures.get(), 0);
    }

    #[test]
    fn last_reference_dropped_inside_write_frees_the_slot() {
        let (pool, _failures) = counting_pool(nz!(2));

        let holder = pool.allocate(4, TypeTag::UNTYPED).unwrap();
        let victim = pool.allocate(4, TypeTag::UNTYPED).unwrap();

        holder.write(move |_| drop(victim)).unwrap();

        assert!(!pool.is_full());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn drop_while_unwinding_does_not_trap() {
        let pool = SharedPool::new(
            BlockPool::builder()
                .capacity(nz!(1))
                .slot_size(nz!(8))
                .failure_policy(TrapOnViolation)
                .build()
                .unwrap(),
        );

        let shared = pool.allocate(1, TypeTag::UNTYPED).unwrap();

        // Release the reference behind the `Shared`'s back so its own release would trap.
        let stolen = Handle::from_raw(shared.handle().raw());
        pool.state.allocator.borrow_mut().release(stolen).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            let _shared = shared;
            panic!("unwinding with a shared reference alive");
        }));

        assert!(result.is_err());
        assert_eq!(pool.state.deferred.borrow().len(), 1);
    }

    #[test]
    fn drop_while_unwinding_releases_on_next_access() {
        let pool = shared_pool(1);
        let shared = pool.allocate(1, TypeTag::UNTYPED).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            let _shared = shared;
            panic!("unwinding with a shared reference alive");
        }));

        assert!(result.is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn works_over_any_allocator() {
        let pool = SharedPool::new(FaultInjector::new(
            BlockPool::from_config(PoolConfig::new(2, 4)).unwrap(),
        ));

        let shared = pool.allocate(4, TypeTag::UNTYPED).unwrap();
        drop(shared.clone());
        drop(shared);

        pool.inspect(|allocator| {
            assert_eq!(allocator.calls().allocate(), 1);
            assert_eq!(allocator.calls().add_reference(), 1);
            assert_eq!(allocator.calls().release(), 2);
        });
    }

    #[test]
    fn boxed_allocator_can_be_shared() {
        let allocator: Box<dyn Allocator> =
            Box::new(BlockPool::from_config(PoolConfig::new(1, 4)).unwrap());
        let pool = SharedPool::from(allocator);

        let shared = pool.allocate(4, TypeTag::UNTYPED).unwrap();
        assert_eq!(shared.info().unwrap().ref_count, 1);
        assert_eq!(pool.capacity(), 1);
    }
}
