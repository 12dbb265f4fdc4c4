//! Domain layer
//!
//! Core data model and persistence contracts.

pub mod knowledge;
