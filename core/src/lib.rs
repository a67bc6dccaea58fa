//! Imagetest Core - Foundational Types and Abstractions
//!
//! This crate provides the plain-data test specification records,
//! diagnostics, error types, and run policy shared across the
//! imagetest workspace.

pub mod diagnostics;
pub mod error;
pub mod labels;
pub mod policy;
pub mod spec;

// Re-export commonly used types
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{ImagetestError, Result};
pub use labels::{evaluate_skip, SkipVerdict};
pub use policy::{ExecutionPolicy, TeardownPolicy};
pub use spec::{ContentMount, DriverKind, TestSpec, TestsSpec};

/// Imagetest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
