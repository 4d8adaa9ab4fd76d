//! Data Models
//!
//! Contains the data structures shared across the orchestration layer.

pub mod generation;
pub mod settings;

pub use generation::*;
pub use settings::*;
