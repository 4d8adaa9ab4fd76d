//! Service layer

pub mod generation;
pub mod worker;
