//! IdeaForge Desktop backend library
//!
//! Orchestration layer between a desktop UI and the external AI
//! code-generation runtimes: process lifecycle, phase-tagged progress,
//! parallel agent fan-out, and the persistent monitoring worker.

pub mod models;
pub mod services;
pub mod utils;

pub use utils::error::{AppError, AppResult};
