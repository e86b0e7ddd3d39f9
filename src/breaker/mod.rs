//! Per-endpoint circuit breaking.
//!
//! Snapshots live in a shared [`BreakerStore`] and are read-modify-written on
//! every evaluated attempt without a lock. Two workers racing on the same
//! tenant can both act on a stale snapshot, so a trip can be late by at most
//! one extra attempt per concurrent worker, never early.

mod engine;
mod notify;
mod store;

pub use engine::{CircuitBreakerManager, Transition, breaker_key};
pub use notify::{AlertLimiter, BreakerNotifier, LogNotifier};
pub use store::{BreakerStore, MemoryBreakerStore, SqliteBreakerStore};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit breaker not found")]
    NotFound,
    #[error("breaker store unavailable: {0}")]
    Store(#[from] sqlx::Error),
    #[error("invalid breaker snapshot: {0}")]
    Corrupt(String),
    #[error("breaker config lookup failed: {0}")]
    Config(#[from] StoreError),
}
