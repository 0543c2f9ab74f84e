//! Trio: notification orchestration engine.
//!
//! Fans one business event out to an email, a persisted in-app message and
//! a real-time push, treating the three as a single unit of work with
//! compensating rollback, error classification and advisory recovery.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod channels;
pub mod ledger;
pub mod metrics;
pub mod recovery;

pub mod coordinator;

pub use coordinator::{TrioCoordinator, TrioDeps, TrioRequest, TrioResult};

use std::sync::{Mutex, MutexGuard};

/// Lock a counter mutex, recovering the data if a writer panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
