use std::fmt;
use std::rc::Rc;

use tracing::warn;

use crate::{Error, ErrorKind, PoolId};

/// Structured description of an operation that could not complete, handed to a
/// [`FailurePolicy`] before the corresponding [`Error`] is returned to the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Failure {
    kind: ErrorKind,
    pool_id: PoolId,
    slot_index: Option<usize>,
}

impl Failure {
    #[must_use]
    pub(crate) fn new(kind: ErrorKind, pool_id: PoolId, slot_index: Option<usize>) -> Self {
        Self {
            kind,
            pool_id,
            slot_index,
        }
    }

    /// What went wrong.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The pool in which the failure occurred.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The slot involved, if the failure concerns a specific slot.
    #[must_use]
    pub fn slot_index(&self) -> Option<usize> {
        self.slot_index
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot_index {
            Some(slot_index) => write!(
                f,
                "{} in pool {} at slot {slot_index}",
                self.kind, self.pool_id
            ),
            None => write!(f, "{} in pool {}", self.kind, self.pool_id),
        }
    }
}

/// What the allocator does after a [`FailurePolicy`] has seen a failure.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Response {
    /// Return the error to the caller. This is the default.
    #[default]
    Report,

    /// Panic instead of returning. The failing operation never returns.
    ///
    /// On targets where a panic halts or resets the device this is a fatal trap.
    Trap,
}

/// Decides how an allocator responds to failures.
///
/// Exactly one policy is registered per allocator, at construction time. The policy is
/// consulted on every failed operation, after the failure is logged and before the error is
/// returned to the caller. A policy may also diverge on its own (e.g. by calling
/// [`std::process::abort`]), in which case the operation never returns either.
///
/// The policy is held by the allocator for its whole lifetime. To observe a policy from the
/// outside, register an [`Rc`] or a reference to it.
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use block_pool::{BlockPool, ErrorKind, Failure, FailurePolicy, Response, TypeTag};
/// use new_zealand::nz;
///
/// #[derive(Debug, Default)]
/// struct CountExhaustion(Cell<usize>);
///
/// impl FailurePolicy for CountExhaustion {
///     fn on_failure(&self, failure: &Failure) -> Response {
///         if failure.kind() == ErrorKind::PoolExhausted {
///             self.0.set(self.0.get() + 1);
///         }
///
///         Response::Report
///     }
/// }
///
/// let policy = Rc::new(CountExhaustion::default());
///
/// let mut pool = BlockPool::builder()
///     .capacity(nz!(1))
///     .slot_size(nz!(16))
///     .failure_policy(Rc::clone(&policy))
///     .build()
///     .unwrap();
///
/// let _first = pool.allocate(16, TypeTag::UNTYPED).unwrap();
/// assert!(pool.allocate(16, TypeTag::UNTYPED).is_err());
/// assert_eq!(policy.0.get(), 1);
/// ```
pub trait FailurePolicy {
    /// Called once for every failed operation.
    fn on_failure(&self, failure: &Failure) -> Response;
}

impl<P: FailurePolicy + ?Sized> FailurePolicy for &P {
    fn on_failure(&self, failure: &Failure) -> Response {
        (**self).on_failure(failure)
    }
}

impl<P: FailurePolicy + ?Sized> FailurePolicy for Rc<P> {
    fn on_failure(&self, failure: &Failure) -> Response {
        (**self).on_failure(failure)
    }
}

impl<P: FailurePolicy + ?Sized> FailurePolicy for Box<P> {
    fn on_failure(&self, failure: &Failure) -> Response {
        (**self).on_failure(failure)
    }
}

/// Returns every error to the caller and never traps. This is the default policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportStatus;

impl FailurePolicy for ReportStatus {
    fn on_failure(&self, _failure: &Failure) -> Response {
        Response::Report
    }
}

/// Traps on protocol violations ([`ErrorKind::InvalidHandle`] and
/// [`ErrorKind::RefCountOverflow`]), which indicate memory-safety bugs in the caller.
/// Exhaustion and configuration errors are reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrapOnViolation;

impl FailurePolicy for TrapOnViolation {
    fn on_failure(&self, failure: &Failure) -> Response {
        if failure.kind().is_protocol_violation() {
            Response::Trap
        } else {
            Response::Report
        }
    }
}

/// Adapts a closure into a [`FailurePolicy`].
///
/// # Example
///
/// ```
/// use block_pool::{ErrorKind, Failure, FnPolicy, Response};
///
/// let policy = FnPolicy::new(|failure: &Failure| {
///     if failure.kind() == ErrorKind::RefCountOverflow {
///         Response::Trap
///     } else {
///         Response::Report
///     }
/// });
/// # drop(policy);
/// ```
pub struct FnPolicy<F>(F);

impl<F> FnPolicy<F>
where
    F: Fn(&Failure) -> Response,
{
    /// Wraps `f` so it can be registered as a failure policy.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> FailurePolicy for FnPolicy<F>
where
    F: Fn(&Failure) -> Response,
{
    fn on_failure(&self, failure: &Failure) -> Response {
        (self.0)(failure)
    }
}

impl<F> fmt::Debug for FnPolicy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPolicy").finish_non_exhaustive()
    }
}

/// Logs `error`, consults `policy` and either returns `error` for the caller to propagate
/// or panics if the policy asks for a trap.
///
/// # Panics
///
/// Panics if the policy responds with [`Response::Trap`].
pub(crate) fn escalate(policy: &dyn FailurePolicy, error: Error) -> Error {
    let failure = error.failure();

    warn!(
        pool_id = failure.pool_id().get(),
        slot_index = failure.slot_index(),
        kind = %failure.kind(),
        "{error}"
    );

    match policy.on_failure(&failure) {
        Response::Report => error,
        Response::Trap => panic!("allocator trap: {error}"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::HandleProblem;

    assert_impl_all!(Failure: Send, Sync, Copy, fmt::Debug, fmt::Display);
    assert_impl_all!(ReportStatus: FailurePolicy, Send, Sync);
    assert_impl_all!(TrapOnViolation: FailurePolicy, Send, Sync);

    fn exhausted() -> Error {
        Error::PoolExhausted {
            pool_id: PoolId::generate(),
            capacity: 1,
        }
    }

    fn double_release() -> Error {
        Error::InvalidHandle {
            pool_id: PoolId::generate(),
            slot_index: 0,
            problem: HandleProblem::SlotFree,
        }
    }

    #[test]
    fn report_status_returns_error() {
        let error = exhausted();
        assert_eq!(escalate(&ReportStatus, error), error);

        let error = double_release();
        assert_eq!(escalate(&ReportStatus, error), error);
    }

    #[test]
    fn trap_on_violation_reports_exhaustion() {
        let error = exhausted();
        assert_eq!(escalate(&TrapOnViolation, error), error);
    }

    #[test]
    #[should_panic]
    fn trap_on_violation_traps_invalid_handle() {
        _ = escalate(&TrapOnViolation, double_release());
    }

    #[test]
    fn fn_policy_sees_every_failure() {
        let calls = Cell::new(0_usize);
        let policy = FnPolicy::new(|failure: &Failure| {
            assert_eq!(failure.kind(), ErrorKind::PoolExhausted);
            calls.set(calls.get() + 1);
            Response::Report
        });

        _ = escalate(&policy, exhausted());
        _ = escalate(&policy, exhausted());

        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn failure_display_mentions_slot() {
        let failure = double_release().failure();
        assert!(failure.to_string().contains("slot 0"));

        let failure = exhausted().failure();
        assert!(!failure.to_string().contains("slot"));
    }
}
