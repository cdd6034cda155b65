//! Concurrency primitives used by the core.

pub mod rwlock;

pub use rwlock::TurnstileRwLock;
