//! # Platform shim for the heap allocator
//!
//! Small synchronization and identity primitives the allocator builds on:
//! an owner-tracking spinlock mutex and an opaque task-identity hook used to
//! stamp allocations and lock holders with their owner.
//!
//! The allocator's locking protocol is expressed in terms of
//! [`SpinMutex::lock`] (spin until acquired) and [`SpinMutex::try_lock`]
//! (single attempt); [`SpinMutex::acquire`] folds the two behind the
//! caller's per-operation wait decision. Nothing in this crate blocks on an
//! OS primitive.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod task;

pub use mutex::{MutexGuard, SpinMutex};
pub use task::{TaskId, current_task, set_task_source};
