use std::num::NonZero;

/// Compile-time description of the pool a collaborator needs.
///
/// A `PoolConfig` is a plain `const`-constructible value so that a data structure can declare
/// its slot count and slot size next to its element type, e.g. as an associated constant.
/// Zero values are representable on purpose: they are rejected with
/// [`ErrorKind::CapacityError`][crate::ErrorKind::CapacityError] when a pool is built, which
/// routes the mistake through the pool's failure policy.
///
/// # Example
///
/// ```
/// use block_pool::{BlockPool, PoolConfig};
///
/// #[derive(Clone, Copy)]
/// struct Node {
///     next: u16,
///     value: u32,
/// }
///
/// const NODES: PoolConfig = PoolConfig::for_type::<Node>(100);
///
/// let pool = BlockPool::from_config(NODES).unwrap();
/// assert_eq!(pool.capacity(), 100);
/// assert_eq!(pool.slot_size(), size_of::<Node>());
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    capacity: usize,
    slot_size: usize,
    max_references: NonZero<u32>,
}

impl PoolConfig {
    /// Reference count ceiling used unless configured otherwise.
    pub const DEFAULT_MAX_REFERENCES: NonZero<u32> = NonZero::<u32>::MAX;

    /// Describes a pool of `capacity` slots of `slot_size` bytes each.
    #[must_use]
    pub const fn new(capacity: usize, slot_size: usize) -> Self {
        Self {
            capacity,
            slot_size,
            max_references: Self::DEFAULT_MAX_REFERENCES,
        }
    }

    /// Describes a pool of `capacity` slots, each large enough for one `T`.
    #[must_use]
    pub const fn for_type<T>(capacity: usize) -> Self {
        Self::new(capacity, size_of::<T>())
    }

    /// Returns a copy with a different reference count ceiling.
    #[must_use]
    pub const fn with_max_references(self, max_references: NonZero<u32>) -> Self {
        Self {
            max_references,
            ..self
        }
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per slot.
    #[must_use]
    pub const fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Maximum number of simultaneous references to one slot.
    #[must_use]
    pub const fn max_references(&self) -> NonZero<u32> {
        self.max_references
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    const SAMPLE: PoolConfig = PoolConfig::for_type::<u64>(10);

    #[test]
    fn const_construction() {
        assert_eq!(SAMPLE.capacity(), 10);
        assert_eq!(SAMPLE.slot_size(), 8);
        assert_eq!(SAMPLE.max_references(), PoolConfig::DEFAULT_MAX_REFERENCES);
    }

    #[test]
    fn with_max_references_keeps_other_fields() {
        let config = SAMPLE.with_max_references(nz!(4));

        assert_eq!(config.capacity(), 10);
        assert_eq!(config.slot_size(), 8);
        assert_eq!(config.max_references().get(), 4);
    }

    #[test]
    fn zero_sized_type_yields_zero_slot_size() {
        let config = PoolConfig::for_type::<()>(4);
        assert_eq!(config.slot_size(), 0);
    }
}
