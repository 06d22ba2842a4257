//! Provisor Exec — applies one planned action at a time, trying each of its
//! strategies in a fixed priority order.

pub mod executor;

pub use executor::Executor;
