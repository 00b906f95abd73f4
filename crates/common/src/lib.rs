//! Common types shared across the environment orchestrator crates.

#![warn(clippy::pedantic)]

/// Module for infrastructure capability types
pub mod types;

/// Module for human-readable duration (de)serialization
pub mod duration;
