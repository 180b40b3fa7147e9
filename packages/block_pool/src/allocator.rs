use bytemuck::Pod;

use crate::{BlockPool, Error, Handle, PoolId, Released, Result, SlotInfo, TypeTag};

/// A backing store that hands out reference-counted slots through [`Handle`]s.
///
/// Code that consumes an allocator is written against this trait, either generically or
/// through `Box<dyn Allocator>`, so the backing store is chosen once when the allocator is
/// constructed and can be substituted without changing call sites. [`BlockPool`] is the
/// built-in implementation; [`FaultInjector`][crate::FaultInjector] wraps any implementation to
/// observe calls and inject failures in tests.
///
/// Implementations consult their failure policy on every failed operation before returning the
/// error.
pub trait Allocator {
    /// The identity of the allocator, carried by every handle it issues.
    fn pool_id(&self) -> PoolId;

    /// The fixed number of slots.
    fn capacity(&self) -> usize;

    /// The fixed number of bytes per slot.
    fn slot_size(&self) -> usize;

    /// The number of allocated slots.
    fn len(&self) -> usize;

    /// The number of free slots.
    fn free_len(&self) -> usize {
        // `len()` never exceeds `capacity()`.
        self.capacity().wrapping_sub(self.len())
    }

    /// Whether no slot is allocated.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every slot is allocated.
    fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Allocates a slot for a payload of `size_bytes` bytes. See [`BlockPool::allocate()`].
    ///
    /// # Errors
    ///
    /// Fails if the size is zero or larger than a slot, or if no slot is free.
    fn allocate(&mut self, size_bytes: usize, type_tag: TypeTag) -> Result<Handle>;

    /// Gives back one reference. See [`BlockPool::release()`].
    ///
    /// # Errors
    ///
    /// Fails if the handle does not name a live allocation of this allocator.
    fn release(&mut self, handle: Handle) -> Result<Released>;

    /// Adds a reference and returns a new handle for it. See [`BlockPool::add_reference()`].
    ///
    /// # Errors
    ///
    /// Fails if the handle does not name a live allocation or the reference count is at its
    /// maximum.
    fn add_reference(&mut self, handle: &Handle) -> Result<Handle>;

    /// Returns the bookkeeping of the slot named by `handle`. See [`BlockPool::query()`].
    ///
    /// # Errors
    ///
    /// Fails if the handle is foreign, out of bounds or stale.
    fn query(&self, handle: &Handle) -> Result<SlotInfo>;

    /// Changes the recorded payload size. See [`BlockPool::resize()`].
    ///
    /// # Errors
    ///
    /// Fails if the handle does not name a live allocation or the size is out of range.
    fn resize(&mut self, handle: &Handle, new_size: usize) -> Result<()>;

    /// Returns the payload bytes. See [`BlockPool::bytes()`].
    ///
    /// # Errors
    ///
    /// Fails if the handle does not name a live allocation.
    fn bytes(&self, handle: &Handle) -> Result<&[u8]>;

    /// Returns the payload bytes for modification. See [`BlockPool::bytes_mut()`].
    ///
    /// # Errors
    ///
    /// Fails if the handle does not name a live allocation.
    fn bytes_mut(&mut self, handle: &Handle) -> Result<&mut [u8]>;

    /// Copies one payload into another. See [`BlockPool::copy_payload()`].
    ///
    /// # Errors
    ///
    /// Fails if either handle does not name a live allocation or the source payload does not
    /// fit in the destination payload.
    fn copy_payload(&mut self, destination: &Handle, source: &Handle) -> Result<()>;

    /// Logs `error` and routes it through the allocator's failure policy.
    ///
    /// # Panics
    ///
    /// Panics if the failure policy responds with [`Response::Trap`][crate::Response::Trap].
    fn escalate(&self, error: Error) -> Error;
}

impl Allocator for BlockPool {
    fn pool_id(&self) -> PoolId {
        self.pool_id()
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }

    fn slot_size(&self) -> usize {
        self.slot_size()
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn free_len(&self) -> usize {
        self.free_len()
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn is_full(&self) -> bool {
        self.is_full()
    }

    fn allocate(&mut self, size_bytes: usize, type_tag: TypeTag) -> Result<Handle> {
        self.allocate(size_bytes, type_tag)
    }

    fn release(&mut self, handle: Handle) -> Result<Released> {
        self.release(handle)
    }

    fn add_reference(&mut self, handle: &Handle) -> Result<Handle> {
        self.add_reference(handle)
    }

    fn query(&self, handle: &Handle) -> Result<SlotInfo> {
        self.query(handle)
    }

    fn resize(&mut self, handle: &Handle, new_size: usize) -> Result<()> {
        self.resize(handle, new_size)
    }

    fn bytes(&self, handle: &Handle) -> Result<&[u8]> {
        self.bytes(handle)
    }

    fn bytes_mut(&mut self, handle: &Handle) -> Result<&mut [u8]> {
        self.bytes_mut(handle)
    }

    fn copy_payload(&mut self, destination: &Handle, source: &Handle) -> Result<()> {
        self.copy_payload(destination, source)
    }

    fn escalate(&self, error: Error) -> Error {
        self.escalate(error)
    }
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    fn pool_id(&self) -> PoolId {
        (**self).pool_id()
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn slot_size(&self) -> usize {
        (**self).slot_size()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn free_len(&self) -> usize {
        (**self).free_len()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn is_full(&self) -> bool {
        (**self).is_full()
    }

    fn allocate(&mut self, size_bytes: usize, type_tag: TypeTag) -> Result<Handle> {
        (**self).allocate(size_bytes, type_tag)
    }

    fn release(&mut self, handle: Handle) -> Result<Released> {
        (**self).release(handle)
    }

    fn add_reference(&mut self, handle: &Handle) -> Result<Handle> {
        (**self).add_reference(handle)
    }

    fn query(&self, handle: &Handle) -> Result<SlotInfo> {
        (**self).query(handle)
    }

    fn resize(&mut self, handle: &Handle, new_size: usize) -> Result<()> {
        (**self).resize(handle, new_size)
    }

    fn bytes(&self, handle: &Handle) -> Result<&[u8]> {
        (**self).bytes(handle)
    }

    fn bytes_mut(&mut self, handle: &Handle) -> Result<&mut [u8]> {
        (**self).bytes_mut(handle)
    }

    fn copy_payload(&mut self, destination: &Handle, source: &Handle) -> Result<()> {
        (**self).copy_payload(destination, source)
    }

    fn escalate(&self, error: Error) -> Error {
        (**self).escalate(error)
    }
}

/// Typed and convenience access to slot payloads, available on every [`Allocator`].
///
/// Typed access is limited to plain-old-data types ([`Pod`]), so any byte pattern in a slot is
/// a valid value and no alignment is required of the slot storage.
///
/// # Example
///
/// ```
/// use block_pool::{AllocatorExt, BlockPool, PoolConfig, TypeTag};
///
/// let mut pool = BlockPool::from_config(PoolConfig::for_type::<[u32; 2]>(4)).unwrap();
///
/// let handle = pool.allocate(8, TypeTag::new(2)).unwrap();
/// pool.write_value(&handle, &[7_u32, 11]).unwrap();
///
/// let value: [u32; 2] = pool.read_value(&handle).unwrap();
/// assert_eq!(value, [7, 11]);
///
/// pool.reset_payload(&handle).unwrap();
/// assert_eq!(pool.read_value::<[u32; 2]>(&handle).unwrap(), [0, 0]);
/// # pool.release(handle).unwrap();
/// ```
pub trait AllocatorExt: Allocator {
    /// Writes `value` to the start of the payload named by `handle`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle does not
    ///   name a live allocation.
    /// * [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] if `T` is larger than
    ///   the payload.
    fn write_value<T: Pod>(&mut self, handle: &Handle, value: &T) -> Result<()> {
        let source = bytemuck::bytes_of(value);
        let payload = self.bytes_mut(handle)?;

        if let Some(prefix) = payload.get_mut(..source.len()) {
            prefix.copy_from_slice(source);
            return Ok(());
        }

        Err(self.escalate(value_too_large(self, handle)))
    }

    /// Reads a `T` from the start of the payload named by `handle`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle does not
    ///   name a live allocation.
    /// * [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] if `T` is larger than
    ///   the payload.
    fn read_value<T: Pod>(&self, handle: &Handle) -> Result<T> {
        let payload = self.bytes(handle)?;

        match payload.get(..size_of::<T>()) {
            Some(prefix) => Ok(bytemuck::pod_read_unaligned(prefix)),
            None => Err(self.escalate(value_too_large(self, handle))),
        }
    }

    /// Zeroes the payload named by `handle`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidHandle`][crate::ErrorKind::InvalidHandle] if the handle does not
    /// name a live allocation.
    fn reset_payload(&mut self, handle: &Handle) -> Result<()> {
        self.bytes_mut(handle)?.fill(0);
        Ok(())
    }
}

impl<A: Allocator + ?Sized> AllocatorExt for A {}

fn value_too_large<A: Allocator + ?Sized>(allocator: &A, handle: &Handle) -> Error {
    Error::CapacityError {
        pool_id: allocator.pool_id(),
        slot_index: Some(handle.slot_index()),
        problem: "value is larger than the payload",
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use bytemuck::{Pod, Zeroable};
    use new_zealand::nz;

    use super::*;
    use crate::{ErrorKind, Failure, FnPolicy, PoolConfig, Response, SlotState};

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn boxed_pool(capacity: usize, slot_size: usize) -> Box<dyn Allocator> {
        Box::new(BlockPool::from_config(PoolConfig::new(capacity, slot_size)).unwrap())
    }

    /// Exercises an allocator only through the trait, as a collaborator would.
    fn fill_and_drain(allocator: &mut dyn Allocator) -> usize {
        let mut handles = Vec::new();

        while let Ok(handle) = allocator.allocate(1, TypeTag::UNTYPED) {
            handles.push(handle);
        }

        let allocated = handles.len();

        for handle in handles {
            allocator.release(handle).unwrap();
        }

        allocated
    }

    #[test]
    fn trait_object_dispatch() {
        let mut allocator = boxed_pool(3, 4);

        assert_eq!(fill_and_drain(&mut *allocator), 3);
        assert!(allocator.is_empty());
        assert_eq!(allocator.free_len(), 3);
        assert_eq!(allocator.slot_size(), 4);
    }

    #[test]
    fn boxed_allocator_is_an_allocator() {
        fn capacity_of(allocator: &impl Allocator) -> usize {
            allocator.capacity()
        }

        let allocator = boxed_pool(5, 4);
        assert_eq!(capacity_of(&allocator), 5);
    }

    #[test]
    fn provided_methods_follow_len() {
        let mut allocator = boxed_pool(2, 4);

        let first = allocator.allocate(4, TypeTag::UNTYPED).unwrap();
        assert!(!allocator.is_empty());
        assert!(!allocator.is_full());

        let second = allocator.allocate(4, TypeTag::UNTYPED).unwrap();
        assert!(allocator.is_full());
        assert_eq!(allocator.free_len(), 0);

        allocator.release(first).unwrap();
        allocator.release(second).unwrap();
    }

    #[test]
    fn typed_round_trip() {
        let mut allocator = boxed_pool(1, 16);

        let handle = allocator.allocate(size_of::<Point>(), TypeTag::new(1)).unwrap();
        allocator.write_value(&handle, &Point { x: -3, y: 9 }).unwrap();

        assert_eq!(
            allocator.read_value::<Point>(&handle).unwrap(),
            Point { x: -3, y: 9 }
        );

        allocator.release(handle).unwrap();
    }

    #[test]
    fn value_larger_than_payload_is_capacity_error() {
        let calls = Rc::new(Cell::new(0_usize));
        let calls_clone = Rc::clone(&calls);

        let mut pool = BlockPool::builder()
            .capacity(nz!(1))
            .slot_size(nz!(16))
            .failure_policy(FnPolicy::new(move |failure: &Failure| {
                assert_eq!(failure.kind(), ErrorKind::CapacityError);
                calls_clone.set(calls_clone.get() + 1);
                Response::Report
            }))
            .build()
            .unwrap();

        let handle = pool.allocate(4, TypeTag::UNTYPED).unwrap();

        let error = pool.write_value(&handle, &0_u64).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::CapacityError);
        assert_eq!(error.slot_index(), Some(0));

        let error = pool.read_value::<u64>(&handle).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::CapacityError);

        assert_eq!(calls.get(), 2);
        pool.release(handle).unwrap();
    }

    #[test]
    fn reset_payload_zeroes_bytes() {
        let mut allocator = boxed_pool(1, 4);

        let handle = allocator.allocate(4, TypeTag::UNTYPED).unwrap();
        allocator.bytes_mut(&handle).unwrap().fill(0xab);
        allocator.reset_payload(&handle).unwrap();

        assert_eq!(allocator.bytes(&handle).unwrap(), &[0; 4]);
        allocator.release(handle).unwrap();
    }

    #[test]
    fn typed_access_to_released_slot_is_invalid() {
        let mut allocator = boxed_pool(1, 4);

        let handle = allocator.allocate(4, TypeTag::UNTYPED).unwrap();
        let raw = handle.raw();
        allocator.release(handle).unwrap();

        let released = Handle::from_raw(raw);
        assert_eq!(
            allocator.read_value::<u32>(&released).unwrap_err().kind(),
            ErrorKind::InvalidHandle
        );
        assert_eq!(
            allocator.reset_payload(&released).unwrap_err().kind(),
            ErrorKind::InvalidHandle
        );
        assert_eq!(allocator.query(&released).unwrap().state, SlotState::Free);
    }
}
