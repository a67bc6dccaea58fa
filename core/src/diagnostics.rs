//! Run diagnostics surfaced to the caller.
//!
//! A run produces an ordered list of diagnostics; any `Error` severity
//! entry fails the run.

use serde::{Deserialize, Serialize};

use crate::error::ImagetestError;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single diagnostic entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Short summary keyed to the failing component.
    pub summary: String,
    /// Underlying detail, including the assembled test image reference
    /// when one is available for local reproduction.
    pub detail: String,
}

impl Diagnostic {
    /// Create a warning diagnostic.
    pub fn warn(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warn,
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    /// Create an error diagnostic from a typed error.
    pub fn from_error(summary: impl Into<String>, err: &ImagetestError) -> Self {
        Self::error(summary, err.to_string())
    }
}

/// Ordered collection of diagnostics for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a diagnostic.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    /// All entries, in emission order.
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no diagnostics were emitted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any entry has `Error` severity.
    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count entries of a given severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
