//! Core constants, error types and identifier allocation.
//!
//! This module has no I/O dependencies and is always compiled.

pub mod constants;
mod context;
mod error;

pub use context::NetContext;
pub use error::*;
