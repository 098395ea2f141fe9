//! Synchronization primitives, swapped for shuttle's under the `shuttle`
//! feature so the concurrency tests can explore interleavings.

pub(crate) use std::sync::{Arc, Weak};

#[cfg(not(feature = "shuttle"))]
pub(crate) use std::sync::{Condvar, Mutex};

#[cfg(feature = "shuttle")]
pub(crate) use shuttle::sync::{Condvar, Mutex};

#[cfg(all(test, not(feature = "shuttle")))]
pub(crate) use std::sync::Barrier;

#[cfg(all(test, feature = "shuttle"))]
pub(crate) use shuttle::sync::Barrier;

#[cfg(not(feature = "shuttle"))]
pub(crate) use std::sync::atomic;

#[cfg(feature = "shuttle")]
pub(crate) use shuttle::sync::atomic;

#[cfg(not(feature = "shuttle"))]
pub(crate) use std::thread;

#[cfg(feature = "shuttle")]
pub(crate) use shuttle::thread;
