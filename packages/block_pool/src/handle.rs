use crate::PoolId;

/// One reference to an allocated slot.
///
/// A `Handle` is returned by [`Allocator::allocate()`][crate::Allocator::allocate] and by
/// [`Allocator::add_reference()`][crate::Allocator::add_reference]. Each handle accounts for
/// exactly one unit of the slot's reference count and must eventually be given back through
/// [`Allocator::release()`][crate::Allocator::release].
///
/// Handles cannot be cloned or copied. Passing a handle by value transfers its reference to the
/// receiver; sharing the slot requires an explicit `add_reference()` that produces a second
/// handle. For release on scope exit, use [`SharedPool`][crate::SharedPool] instead.
///
/// A handle identifies its slot by pool, slot index and generation. The generation changes
/// every time the slot is allocated, so a handle that outlived its allocation (e.g. one rebuilt
/// via [`from_raw()`][Self::from_raw]) is rejected instead of being confused with the slot's
/// new occupant.
#[derive(Debug, Eq, PartialEq)]
#[must_use = "dropping a handle without releasing it leaks the slot"]
pub struct Handle {
    raw: RawHandle,
}

impl Handle {
    #[must_use = "dropping a handle without releasing it leaks the slot"]
    pub(crate) fn new(pool_id: PoolId, slot_index: usize, generation: u32) -> Self {
        Self {
            raw: RawHandle {
                pool_id,
                slot_index,
                generation,
            },
        }
    }

    /// The pool that issued the handle.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.raw.pool_id
    }

    /// The index of the slot the handle refers to.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.raw.slot_index
    }

    /// The generation of the slot at the time the handle was issued.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.raw.generation
    }

    /// Returns the plain-data identity of the handle without giving up the reference.
    #[must_use]
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Converts the handle into its plain-data identity.
    ///
    /// The reference the handle accounted for is not released. Whoever holds the
    /// [`RawHandle`] is responsible for turning it back into a `Handle` via
    /// [`from_raw()`][Self::from_raw] and releasing it.
    #[must_use]
    pub fn into_raw(self) -> RawHandle {
        self.raw
    }

    /// Rebuilds a handle from its plain-data identity.
    ///
    /// This never causes memory unsafety: the pool validates the identity on every use and
    /// rejects handles that do not name a live allocation. Rebuilding more handles than there
    /// are references is a protocol violation that the pool detects once the slot is freed.
    #[must_use = "dropping a handle without releasing it leaks the slot"]
    pub fn from_raw(raw: RawHandle) -> Self {
        Self { raw }
    }
}

/// The plain-data identity of a [`Handle`]: pool, slot index and generation.
///
/// A `RawHandle` carries no reference of its own. It exists for storing handles in
/// foreign or type-erased structures and for diagnostics.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RawHandle {
    pool_id: PoolId,
    slot_index: usize,
    generation: u32,
}

impl RawHandle {
    /// The pool that issued the handle.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The index of the slot the handle refers to.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// The generation of the slot at the time the handle was issued.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(Handle: Send, Sync, Debug);
    assert_not_impl_any!(Handle: Clone, Copy);
    assert_impl_all!(RawHandle: Send, Sync, Copy, Debug);

    #[test]
    fn raw_round_trip_preserves_identity() {
        let pool_id = PoolId::generate();
        let handle = Handle::new(pool_id, 3, 9);

        let raw = handle.raw();
        assert_eq!(raw.pool_id(), pool_id);
        assert_eq!(raw.slot_index(), 3);
        assert_eq!(raw.generation(), 9);

        let rebuilt = Handle::from_raw(handle.into_raw());
        assert_eq!(rebuilt.pool_id(), pool_id);
        assert_eq!(rebuilt.slot_index(), 3);
        assert_eq!(rebuilt.generation(), 9);
        assert_eq!(rebuilt.raw(), raw);
    }
}
