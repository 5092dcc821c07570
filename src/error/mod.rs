//! Error types for the knock daemon.
//!
//! Provides a unified error handling system using thiserror.

mod types;

pub use types::*;
