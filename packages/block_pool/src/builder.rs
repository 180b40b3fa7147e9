use std::fmt;
use std::num::NonZero;

use crate::{BlockPool, DropPolicy, FailurePolicy, PoolConfig, ReportStatus, Result};

/// Builder for creating an instance of [`BlockPool`].
///
/// The slot count and slot size are mandatory, whereas other settings are optional. They can
/// be given individually or together via [`config()`][Self::config].
///
/// # Examples
///
/// Using explicit sizes:
///
/// ```
/// use block_pool::BlockPool;
/// use new_zealand::nz;
///
/// let pool = BlockPool::builder()
///     .capacity(nz!(64))
///     .slot_size(nz!(24))
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.capacity(), 64);
/// ```
///
/// Using type-based slot size:
///
/// ```
/// use block_pool::BlockPool;
/// use new_zealand::nz;
///
/// let pool = BlockPool::builder()
///     .capacity(nz!(16))
///     .slot_size_of::<[u32; 4]>()
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.slot_size(), 16);
/// ```
#[must_use]
pub struct BlockPoolBuilder {
    capacity: Option<usize>,
    slot_size: Option<usize>,
    max_references: NonZero<u32>,
    drop_policy: DropPolicy,
    failure_policy: Box<dyn FailurePolicy>,
}

impl BlockPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            capacity: None,
            slot_size: None,
            max_references: PoolConfig::DEFAULT_MAX_REFERENCES,
            drop_policy: DropPolicy::default(),
            failure_policy: Box::new(ReportStatus),
        }
    }

    /// Sets the number of slots in the pool. The pool never grows beyond this.
    #[inline]
    pub fn capacity(mut self, capacity: NonZero<usize>) -> Self {
        self.capacity = Some(capacity.get());
        self
    }

    /// Sets the number of bytes in each slot.
    #[inline]
    pub fn slot_size(mut self, slot_size: NonZero<usize>) -> Self {
        self.slot_size = Some(slot_size.get());
        self
    }

    /// Sets the slot size to the size of `T`.
    ///
    /// A zero-sized `T` is accepted here and rejected by [`build()`][Self::build].
    #[inline]
    pub fn slot_size_of<T>(mut self) -> Self {
        self.slot_size = Some(size_of::<T>());
        self
    }

    /// Takes slot count, slot size and reference count ceiling from `config`.
    #[inline]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.capacity = Some(config.capacity());
        self.slot_size = Some(config.slot_size());
        self.max_references = config.max_references();
        self
    }

    /// Sets the maximum number of simultaneous references to one slot. Adding a reference
    /// beyond this fails with [`ErrorKind::RefCountOverflow`][crate::ErrorKind::RefCountOverflow].
    ///
    /// The default is [`u32::MAX`].
    #[inline]
    pub fn max_references(mut self, max_references: NonZero<u32>) -> Self {
        self.max_references = max_references;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Registers the [failure policy][FailurePolicy] of the pool. It cannot be changed after
    /// the pool is built.
    ///
    /// The default is [`ReportStatus`]. The policy is also consulted if `build()` fails.
    #[inline]
    pub fn failure_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.failure_policy = Box::new(policy);
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::NullInput`][crate::ErrorKind::NullInput] if the capacity or the slot size
    ///   was never set.
    /// * [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] if the capacity or the
    ///   slot size is zero, or if the storage size overflows `usize` or cannot be reserved.
    ///
    /// # Panics
    ///
    /// Panics if the failure policy responds to an error with
    /// [`Response::Trap`][crate::Response::Trap].
    pub fn build(self) -> Result<BlockPool> {
        BlockPool::new_inner(
            self.capacity,
            self.slot_size,
            self.max_references,
            self.drop_policy,
            self.failure_policy,
        )
    }
}

impl fmt::Debug for BlockPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPoolBuilder")
            .field("capacity", &self.capacity)
            .field("slot_size", &self.slot_size)
            .field("max_references", &self.max_references)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use new_zealand::nz;
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{ErrorKind, Failure, FnPolicy, Response, TrapOnViolation};

    assert_not_impl_any!(BlockPoolBuilder: Send, Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = BlockPoolBuilder::new();
        assert!(builder.capacity.is_none());
        assert!(builder.slot_size.is_none());
        assert_eq!(builder.max_references, PoolConfig::DEFAULT_MAX_REFERENCES);
        assert_eq!(builder.drop_policy, DropPolicy::default());
    }

    #[test]
    fn sizes_are_recorded() {
        let builder = BlockPoolBuilder::new().capacity(nz!(3)).slot_size(nz!(5));
        assert_eq!(builder.capacity, Some(3));
        assert_eq!(builder.slot_size, Some(5));

        let builder = builder.slot_size_of::<u64>();
        assert_eq!(builder.slot_size, Some(8));
    }

    #[test]
    fn config_sets_everything() {
        let config = PoolConfig::new(7, 9).with_max_references(nz!(2));
        let builder = BlockPoolBuilder::new().config(config);

        assert_eq!(builder.capacity, Some(7));
        assert_eq!(builder.slot_size, Some(9));
        assert_eq!(builder.max_references.get(), 2);
    }

    #[test]
    fn later_settings_override_earlier_ones() {
        let builder = BlockPoolBuilder::new()
            .capacity(nz!(1))
            .config(PoolConfig::new(2, 2))
            .capacity(nz!(3));

        assert_eq!(builder.capacity, Some(3));
        assert_eq!(builder.slot_size, Some(2));
    }

    #[test]
    fn build_succeeds_with_sizes() {
        let pool = BlockPoolBuilder::new()
            .capacity(nz!(4))
            .slot_size(nz!(12))
            .max_references(nz!(10))
            .drop_policy(DropPolicy::MustBeEmpty)
            .failure_policy(TrapOnViolation)
            .build()
            .unwrap();

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.slot_size(), 12);
        assert_eq!(pool.max_references(), 10);
    }

    #[test]
    fn build_without_capacity_is_null_input() {
        let error = BlockPoolBuilder::new()
            .slot_size(nz!(4))
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::NullInput);
    }

    #[test]
    fn build_without_slot_size_is_null_input() {
        let error = BlockPoolBuilder::new().capacity(nz!(4)).build().unwrap_err();

        assert_eq!(error.kind(), ErrorKind::NullInput);
    }

    #[test]
    fn zero_sized_slot_is_capacity_error() {
        let error = BlockPoolBuilder::new()
            .capacity(nz!(4))
            .slot_size_of::<()>()
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::CapacityError);
    }

    #[test]
    fn overflowing_storage_is_capacity_error() {
        let error = BlockPoolBuilder::new()
            .capacity(NonZero::new(usize::MAX).unwrap())
            .slot_size(nz!(2))
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::CapacityError);
    }

    #[test]
    fn overflowing_metadata_is_capacity_error() {
        let error = BlockPoolBuilder::new()
            .capacity(NonZero::new(usize::MAX).unwrap())
            .slot_size(nz!(1))
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::CapacityError);
    }

    #[test]
    fn unreservable_storage_is_capacity_error() {
        let error = BlockPoolBuilder::new()
            .config(PoolConfig::new(usize::MAX / 2, 2))
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::CapacityError);
    }

    #[test]
    fn build_failure_consults_policy() {
        let calls = Rc::new(Cell::new(0_usize));
        let calls_clone = Rc::clone(&calls);

        let result = BlockPoolBuilder::new()
            .config(PoolConfig::new(0, 8))
            .failure_policy(FnPolicy::new(move |failure: &Failure| {
                assert_eq!(failure.kind(), ErrorKind::CapacityError);
                calls_clone.set(calls_clone.get() + 1);
                Response::Report
            }))
            .build();

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn builder_is_debug() {
        let builder = BlockPoolBuilder::new().capacity(nz!(2));
        let debug_output = format!("{builder:?}");
        assert!(debug_output.contains("BlockPoolBuilder"));
    }
}
