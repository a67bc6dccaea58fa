//! Run policy read from the environment.
//!
//! Recognized environment variables, the teardown predicate, and the
//! global execution policy (label filters plus the skip-all kill-switch).

use std::collections::HashMap;

use crate::labels::{evaluate_skip, SkipVerdict};

/// Suppress driver teardown unconditionally.
pub const ENV_SKIP_TEARDOWN: &str = "SKIP_TEARDOWN";

/// Suppress driver teardown only when the run failed.
pub const ENV_SKIP_TEARDOWN_ON_FAILURE: &str = "SKIP_TEARDOWN_ON_FAILURE";

/// Treat every run as skipped.
pub const ENV_SKIP_ALL: &str = "SKIP_ALL";

/// Set when the host is itself running docker-in-docker.
pub const ENV_WORKSTATION: &str = "WORKSTATION";

/// Injected into test images: JSON map of resolved images.
pub const ENV_IMAGES: &str = "IMAGES";

/// Injected into test images: the driver name.
pub const ENV_IMAGETEST_DRIVER: &str = "IMAGETEST_DRIVER";

/// Injected into test images: hold a failing sandbox open for inspection.
pub const ENV_IMAGETEST_PAUSE_ON_ERROR: &str = "IMAGETEST_PAUSE_ON_ERROR";

fn env_set(name: &str) -> bool {
    std::env::var(name).map_or(false, |v| !v.is_empty())
}

/// Global execution policy applied to every run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPolicy {
    /// A non-empty map restricts runs to suites matching all entries.
    pub include_by_label: HashMap<String, String>,
    /// Suites matching any entry are skipped.
    pub exclude_by_label: HashMap<String, String>,
    /// Kill-switch: skip every run.
    pub skip_all: bool,
}

impl ExecutionPolicy {
    /// Build a policy with the given label filters, reading the
    /// `SKIP_ALL` kill-switch from the environment.
    pub fn from_env(
        include_by_label: HashMap<String, String>,
        exclude_by_label: HashMap<String, String>,
    ) -> Self {
        Self {
            include_by_label,
            exclude_by_label,
            skip_all: env_set(ENV_SKIP_ALL),
        }
    }

    /// Evaluate the skip rules for a suite's labels.
    pub fn evaluate(&self, labels: &HashMap<String, String>) -> SkipVerdict {
        evaluate_skip(
            labels,
            &self.include_by_label,
            &self.exclude_by_label,
            self.skip_all,
        )
    }
}

/// Teardown decision evaluated once at run exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownDecision {
    /// Invoke the driver's teardown.
    Teardown,
    /// Leave resources in place, with the warning to surface.
    Skip(String),
}

/// The teardown predicate, captured once at run entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeardownPolicy {
    skip_teardown: bool,
    skip_on_failure: bool,
}

impl TeardownPolicy {
    /// Capture the policy from the environment.
    pub fn from_env() -> Self {
        Self {
            skip_teardown: env_set(ENV_SKIP_TEARDOWN),
            skip_on_failure: env_set(ENV_SKIP_TEARDOWN_ON_FAILURE),
        }
    }

    /// Build a policy explicitly (used by tests and embedders).
    pub fn new(skip_teardown: bool, skip_on_failure: bool) -> Self {
        Self {
            skip_teardown,
            skip_on_failure,
        }
    }

    /// Decide whether to tear down, given whether the run errored.
    pub fn evaluate(&self, run_failed: bool) -> TeardownDecision {
        if self.skip_teardown {
            return TeardownDecision::Skip(format!(
                "teardown skipped: {} is set",
                ENV_SKIP_TEARDOWN
            ));
        }
        if self.skip_on_failure && run_failed {
            return TeardownDecision::Skip(format!(
                "teardown skipped after failure: {} is set",
                ENV_SKIP_TEARDOWN_ON_FAILURE
            ));
        }
        TeardownDecision::Teardown
    }

    /// Whether test images should be built with pause-on-error enabled,
    /// so a held sandbox is actually inspectable when teardown is skipped.
    pub fn pause_on_error(&self) -> bool {
        self.skip_teardown || self.skip_on_failure
    }
}
