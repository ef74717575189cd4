//! Executor slots and per-node pools for Crucible.

pub mod executor;
pub mod pool;

pub use executor::{CurrentWork, Executor};
pub use pool::ExecutorPool;
