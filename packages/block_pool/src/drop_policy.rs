/// Determines what happens when a pool is dropped while some of its slots are still allocated.
///
/// Slots hold plain bytes, so dropping a pool never runs destructors for payloads. The policy
/// only decides whether outstanding allocations at that point are acceptable.
///
/// # Examples
///
/// ```
/// use block_pool::{BlockPool, DropPolicy};
/// use new_zealand::nz;
///
/// // The drop policy is set at pool creation time.
/// let pool = BlockPool::builder()
///     .capacity(nz!(8))
///     .slot_size(nz!(32))
///     .drop_policy(DropPolicy::MustBeEmpty)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool may be dropped with allocated slots; any handles to them become dangling
    /// identities that no other pool will accept. This is the default.
    #[default]
    MayHoldAllocations,

    /// The pool will panic if any slot is still allocated when it is dropped.
    ///
    /// This turns reference leaks into a detectable failure at the end of the owner's lifetime.
    MustBeEmpty,
}
