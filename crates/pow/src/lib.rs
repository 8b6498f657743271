//! Compact targets, chain weight and proof-of-work checks.

pub mod difficulty;
pub mod validation;
