//! Infrastructure layer
//!
//! Implementations of domain contracts against external systems.

pub mod knowledge;
