//! Crucible Core
//!
//! Core domain types, traits, and error handling for the Crucible
//! scheduler. This crate has minimal dependencies and defines the
//! shared vocabulary used across all other crates.

pub mod actions;
pub mod build;
pub mod error;
pub mod ids;
pub mod label;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
