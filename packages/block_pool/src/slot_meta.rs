use std::fmt;

/// Caller-defined tag describing what kind of payload occupies a slot.
///
/// The pool stores the tag and reports it back through [`SlotInfo`] but never interprets it.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TypeTag(u32);

impl TypeTag {
    /// Tag for payloads whose type the caller does not track.
    pub const UNTYPED: Self = Self(0);

    /// Creates a tag from a caller-chosen value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the numeric value of the tag.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for TypeTag {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Occupancy state of a slot.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SlotState {
    /// The slot is on the free list and its bytes are not accessible.
    #[default]
    Free,

    /// The slot holds a payload with at least one live reference.
    Allocated,
}

/// Snapshot of a slot's bookkeeping, as returned by queries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct SlotInfo {
    /// Whether the slot is allocated.
    pub state: SlotState,

    /// Number of live references. Zero exactly when the slot is free.
    pub ref_count: u32,

    /// Bytes of the slot occupied by the payload. Zero when free.
    pub size_bytes: usize,

    /// Tag supplied at allocation time. [`TypeTag::UNTYPED`] when free.
    pub type_tag: TypeTag,

    /// Number of times the slot has been allocated, wrapping on overflow.
    pub generation: u32,
}

/// Per-slot bookkeeping record, index-aligned with the pool's storage.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SlotMeta {
    state: SlotState,
    ref_count: u32,
    size_bytes: usize,
    type_tag: TypeTag,
    generation: u32,
}

impl SlotMeta {
    #[must_use]
    pub(crate) fn is_allocated(&self) -> bool {
        self.state == SlotState::Allocated
    }

    #[must_use]
    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[must_use]
    pub(crate) fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Transitions a free slot to allocated with a single reference and a fresh generation.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already allocated.
    pub(crate) fn occupy(&mut self, size_bytes: usize, type_tag: TypeTag) {
        assert!(
            !self.is_allocated(),
            "free list yielded a slot that is already allocated"
        );

        self.state = SlotState::Allocated;
        self.ref_count = 1;
        self.size_bytes = size_bytes;
        self.type_tag = type_tag;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Adds one reference, returning the new count, or `None` if that would exceed `max`.
    pub(crate) fn increment(&mut self, max: u32) -> Option<u32> {
        debug_assert!(self.is_allocated());

        if self.ref_count >= max {
            return None;
        }

        // Cannot overflow, bounded by `max` above.
        self.ref_count = self.ref_count.wrapping_add(1);
        Some(self.ref_count)
    }

    /// Drops one reference and returns the remaining count. At zero the slot becomes free
    /// and its payload description is cleared. The generation is kept so that handles
    /// issued before the release can be recognized as stale.
    pub(crate) fn decrement(&mut self) -> u32 {
        debug_assert!(self.is_allocated() && self.ref_count > 0);

        // Allocated slots always hold at least one reference.
        self.ref_count = self.ref_count.wrapping_sub(1);

        if self.ref_count == 0 {
            self.state = SlotState::Free;
            self.size_bytes = 0;
            self.type_tag = TypeTag::UNTYPED;
        }

        self.ref_count
    }

    pub(crate) fn set_size_bytes(&mut self, size_bytes: usize) {
        debug_assert!(self.is_allocated());
        self.size_bytes = size_bytes;
    }

    #[must_use]
    pub(crate) fn info(&self) -> SlotInfo {
        SlotInfo {
            state: self.state,
            ref_count: self.ref_count,
            size_bytes: self.size_bytes,
            type_tag: self.type_tag,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_is_free_and_empty() {
        let meta = SlotMeta::default();
        let info = meta.info();

        assert_eq!(info.state, SlotState::Free);
        assert_eq!(info.ref_count, 0);
        assert_eq!(info.size_bytes, 0);
        assert_eq!(info.type_tag, TypeTag::UNTYPED);
        assert_eq!(info.generation, 0);
    }

    #[test]
    fn occupy_then_release() {
        let mut meta = SlotMeta::default();
        meta.occupy(8, TypeTag::new(7));

        assert!(meta.is_allocated());
        assert_eq!(meta.ref_count(), 1);
        assert_eq!(meta.size_bytes(), 8);
        assert_eq!(meta.generation(), 1);

        assert_eq!(meta.decrement(), 0);
        assert!(!meta.is_allocated());

        let info = meta.info();
        assert_eq!(info.size_bytes, 0);
        assert_eq!(info.type_tag, TypeTag::UNTYPED);

        // The generation survives the release.
        assert_eq!(info.generation, 1);
    }

    #[test]
    fn increment_respects_ceiling() {
        let mut meta = SlotMeta::default();
        meta.occupy(1, TypeTag::UNTYPED);

        assert_eq!(meta.increment(3), Some(2));
        assert_eq!(meta.increment(3), Some(3));
        assert_eq!(meta.increment(3), None);
        assert_eq!(meta.ref_count(), 3);
    }

    #[test]
    fn generation_advances_on_each_occupy() {
        let mut meta = SlotMeta::default();

        for expected in 1..=3 {
            meta.occupy(1, TypeTag::UNTYPED);
            assert_eq!(meta.generation(), expected);
            meta.decrement();
        }
    }

    #[test]
    #[should_panic]
    fn occupy_twice_panics() {
        let mut meta = SlotMeta::default();
        meta.occupy(1, TypeTag::UNTYPED);
        meta.occupy(1, TypeTag::UNTYPED);
    }

    #[test]
    fn type_tag_conversions() {
        assert_eq!(TypeTag::from(5), TypeTag::new(5));
        assert_eq!(TypeTag::new(255).to_string(), "0xff");
        assert_eq!(TypeTag::default(), TypeTag::UNTYPED);
    }
}
