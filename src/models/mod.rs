//! Data models for the storage layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{Access, Engine, SslMode};
pub use query::{QueryParam, Row};
