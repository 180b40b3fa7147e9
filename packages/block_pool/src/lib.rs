#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A fixed-capacity block pool allocator with reference-counted handles.
//!
//! This crate provides [`BlockPool`], an allocator that reserves all of its storage up front as
//! a fixed number of equally sized byte slots and never allocates, grows, compacts or moves data
//! afterwards. It is intended for code that must run with bounded memory, e.g. on embedded
//! targets, while still guarding against the classic manual-memory mistakes.
//!
//! # Key Features
//!
//! - **Fixed capacity**: storage is sized at construction; exhaustion is a recoverable error
//! - **O(1) allocation and release**: free slots are kept in a FIFO free list
//! - **Reference counting**: one slot can be shared through several [`Handle`]s and is freed when
//!   the last one is released
//! - **Safe handles**: handles carry the pool identity and a per-slot generation, so double
//!   release, use after release and use with the wrong pool are all detected and rejected
//! - **Pluggable backing stores**: consumers are written against the [`Allocator`] trait
//! - **Failure policies**: every failure is reported to one [`FailurePolicy`] registered at
//!   construction, which decides whether the error is returned or the program traps
//! - **Automatic release**: [`SharedPool`] hands out [`Shared`] references that release on drop
//!
//! # Handles
//!
//! A [`Handle`] is one unit of a slot's reference count. It cannot be cloned or copied: moving
//! it transfers the reference, while [`add_reference()`][BlockPool::add_reference] creates a
//! second handle to the same slot. Every handle must be given back through
//! [`release()`][BlockPool::release]; the slot returns to the free list when its last reference
//! is released.
//!
//! # Examples
//!
//! ## Manual reference management
//!
//! ```rust
//! use block_pool::{BlockPool, Released, TypeTag};
//! use new_zealand::nz;
//!
//! let mut pool = BlockPool::builder()
//!     .capacity(nz!(2))
//!     .slot_size(nz!(32))
//!     .build()
//!     .unwrap();
//!
//! let greeting = pool.allocate(5, TypeTag::new(1)).unwrap();
//! pool.bytes_mut(&greeting).unwrap().copy_from_slice(b"hello");
//!
//! let also_greeting = pool.add_reference(&greeting).unwrap();
//!
//! assert!(matches!(
//!     pool.release(greeting),
//!     Ok(Released::StillReferenced { .. })
//! ));
//! assert_eq!(pool.bytes(&also_greeting).unwrap(), b"hello");
//! assert_eq!(pool.release(also_greeting), Ok(Released::Freed));
//! ```
//!
//! ## Automatic release
//!
//! ```rust
//! use block_pool::{BlockPool, PoolConfig, SharedPool, TypeTag};
//!
//! let pool = SharedPool::new(BlockPool::from_config(PoolConfig::for_type::<u64>(8)).unwrap());
//!
//! let value = pool.allocate_value(&42_u64, TypeTag::new(7)).unwrap();
//! let copy = value.clone();
//! drop(value);
//!
//! assert_eq!(copy.read_value::<u64>().unwrap(), 42);
//! drop(copy);
//!
//! assert!(pool.is_empty());
//! ```
//!
//! ## Trapping on protocol violations
//!
//! ```rust,should_panic
//! use block_pool::{BlockPool, Handle, TrapOnViolation, TypeTag};
//! use new_zealand::nz;
//!
//! let mut pool = BlockPool::builder()
//!     .capacity(nz!(1))
//!     .slot_size(nz!(8))
//!     .failure_policy(TrapOnViolation)
//!     .build()
//!     .unwrap();
//!
//! let handle = pool.allocate(8, TypeTag::UNTYPED).unwrap();
//! let copy = Handle::from_raw(handle.raw());
//!
//! pool.release(handle).unwrap();
//!
//! // Double release: the policy turns this into a panic.
//! _ = pool.release(copy);
//! ```

mod allocator;
mod builder;
mod config;
mod drop_policy;
mod error;
mod failure;
mod fault_injection;
mod free_list;
mod handle;
mod pool;
mod pool_id;
mod shared;
mod slot_meta;

pub use allocator::*;
pub use builder::*;
pub use config::*;
pub use drop_policy::*;
pub use error::*;
pub use failure::{Failure, FailurePolicy, FnPolicy, ReportStatus, Response, TrapOnViolation};
pub use fault_injection::*;
pub(crate) use free_list::*;
pub use handle::*;
pub use pool::*;
pub use pool_id::*;
pub use shared::*;
pub use slot_meta::{SlotInfo, SlotState, TypeTag};
pub(crate) use slot_meta::SlotMeta;
