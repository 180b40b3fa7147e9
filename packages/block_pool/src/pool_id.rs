use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies one allocator instance within the process.
///
/// Every handle carries the ID of the pool that issued it, so a handle can never be
/// returned to (or read through) a different pool, even one with identical configuration.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(u64);

impl PoolId {
    /// Generates a new process-unique pool ID.
    #[must_use]
    pub(crate) fn generate() -> Self {
        Self(POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the numeric value of the ID.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolId: Send, Sync, Copy, fmt::Debug, fmt::Display);

    #[test]
    fn generated_ids_are_unique() {
        let a = PoolId::generate();
        let b = PoolId::generate();

        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn display_includes_number() {
        let id = PoolId::generate();
        assert_eq!(id.to_string(), format!("#{}", id.get()));
    }
}
