//! Utilities
//!
//! Common utilities used throughout the orchestration layer.

pub mod error;

pub use error::*;
