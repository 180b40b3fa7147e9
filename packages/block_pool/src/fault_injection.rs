use std::cell::Cell;

use tracing::debug;

use crate::{Allocator, Error, Handle, PoolId, Released, Result, SlotInfo, TypeTag};

/// Instrumented wrapper around another [`Allocator`] for testing code that consumes one.
///
/// Every call is forwarded to the wrapped allocator. The wrapper counts the calls it sees and,
/// when armed via [`fail_next_allocations()`][Self::fail_next_allocations], makes allocations
/// fail with [`ErrorKind::PoolExhausted`][crate::ErrorKind::PoolExhausted] without touching the
/// wrapped allocator. Injected failures go through the wrapped allocator's failure policy just
/// like real ones.
///
/// # Example
///
/// ```
/// use block_pool::{Allocator, BlockPool, ErrorKind, FaultInjector, PoolConfig, TypeTag};
///
/// let pool = BlockPool::from_config(PoolConfig::new(4, 8)).unwrap();
/// let mut allocator = FaultInjector::new(pool);
///
/// allocator.fail_next_allocations(1);
///
/// let error = allocator.allocate(8, TypeTag::UNTYPED).unwrap_err();
/// assert_eq!(error.kind(), ErrorKind::PoolExhausted);
///
/// let handle = allocator.allocate(8, TypeTag::UNTYPED).unwrap();
/// allocator.release(handle).unwrap();
///
/// assert_eq!(allocator.calls().allocate(), 2);
/// assert_eq!(allocator.calls().release(), 1);
/// ```
#[derive(Debug)]
pub struct FaultInjector<A> {
    inner: A,

    allocate_calls: Cell<usize>,
    release_calls: Cell<usize>,
    add_reference_calls: Cell<usize>,
    query_calls: Cell<usize>,

    pending_failures: usize,
}

impl<A: Allocator> FaultInjector<A> {
    /// Wraps `inner`, with all counters at zero and no failures armed.
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocate_calls: Cell::new(0),
            release_calls: Cell::new(0),
            add_reference_calls: Cell::new(0),
            query_calls: Cell::new(0),
            pending_failures: 0,
        }
    }

    /// Makes the next `count` calls to `allocate()` fail. Replaces any previously armed count.
    pub fn fail_next_allocations(&mut self, count: usize) {
        self.pending_failures = count;
    }

    /// The number of allocations that will still fail.
    #[must_use]
    pub fn pending_failures(&self) -> usize {
        self.pending_failures
    }

    /// A snapshot of how often each operation has been called.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            allocate: self.allocate_calls.get(),
            release: self.release_calls.get(),
            add_reference: self.add_reference_calls.get(),
            query: self.query_calls.get(),
        }
    }

    /// The wrapped allocator.
    #[must_use]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Unwraps the allocator, discarding the counters.
    #[must_use]
    pub fn into_inner(self) -> A {
        self.inner
    }
}

fn bump(counter: &Cell<usize>) {
    counter.set(counter.get().saturating_add(1));
}

impl<A: Allocator> Allocator for FaultInjector<A> {
    fn pool_id(&self) -> PoolId {
        self.inner.pool_id()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn slot_size(&self) -> usize {
        self.inner.slot_size()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn allocate(&mut self, size_bytes: usize, type_tag: TypeTag) -> Result<Handle> {
        bump(&self.allocate_calls);

        if let Some(remaining) = self.pending_failures.checked_sub(1) {
            self.pending_failures = remaining;

            debug!(
                pool_id = self.inner.pool_id().get(),
                remaining, "injecting allocation failure"
            );

            return Err(self.inner.escalate(Error::PoolExhausted {
                pool_id: self.inner.pool_id(),
                capacity: self.inner.capacity(),
            }));
        }

        self.inner.allocate(size_bytes, type_tag)
    }

    fn release(&mut self, handle: Handle) -> Result<Released> {
        bump(&self.release_calls);
        self.inner.release(handle)
    }

    fn add_reference(&mut self, handle: &Handle) -> Result<Handle> {
        bump(&self.add_reference_calls);
        self.inner.add_reference(handle)
    }

    fn query(&self, handle: &Handle) -> Result<SlotInfo> {
        bump(&self.query_calls);
        self.inner.query(handle)
    }

    fn resize(&mut self, handle: &Handle, new_size: usize) -> Result<()> {
        self.inner.resize(handle, new_size)
    }

    fn bytes(&self, handle: &Handle) -> Result<&[u8]> {
        self.inner.bytes(handle)
    }

    fn bytes_mut(&mut self, handle: &Handle) -> Result<&mut [u8]> {
        self.inner.bytes_mut(handle)
    }

    fn copy_payload(&mut self, destination: &Handle, source: &Handle) -> Result<()> {
        self.inner.copy_payload(destination, source)
    }

    fn escalate(&self, error: Error) -> Error {
        self.inner.escalate(error)
    }
}

/// How often each operation of a [`FaultInjector`] has been called, including calls that
/// failed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CallCounts {
    allocate: usize,
    release: usize,
    add_reference: usize,
    query: usize,
}

impl CallCounts {
    /// Calls to `allocate()`, including injected failures.
    #[must_use]
    pub fn allocate(&self) -> usize {
        self.allocate
    }

    /// Calls to `release()`.
    #[must_use]
    pub fn release(&self) -> usize {
        self.release
    }

    /// Calls to `add_reference()`.
    #[must_use]
    pub fn add_reference(&self) -> usize {
        self.add_reference
    }

    /// Calls to `query()`.
    #[must_use]
    pub fn query(&self) -> usize {
        self.query
    }
}
