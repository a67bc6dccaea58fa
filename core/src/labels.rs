//! Skip evaluation against label include/exclude policy.

use std::collections::HashMap;

/// Outcome of evaluating a suite against the skip policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipVerdict {
    /// The suite should run.
    Run,
    /// The suite is skipped, with the reason to surface as a warning.
    Skip(String),
}

impl SkipVerdict {
    /// True when the verdict is a skip.
    pub fn is_skip(&self) -> bool {
        matches!(self, SkipVerdict::Skip(_))
    }
}

/// Evaluate the skip rules, in order:
///
/// 1. `skip_all` wins over everything.
/// 2. A non-empty include set must be fully covered by the suite labels
///    (every include key present with a matching value).
/// 3. Any exclude key present with a matching value skips the suite.
///
/// Evaluation is pure; the same inputs always yield the same verdict.
pub fn evaluate_skip(
    labels: &HashMap<String, String>,
    include: &HashMap<String, String>,
    exclude: &HashMap<String, String>,
    skip_all: bool,
) -> SkipVerdict {
    if skip_all {
        return SkipVerdict::Skip("all tests skipped".to_string());
    }

    if !include.is_empty() {
        let covered = include
            .iter()
            .all(|(k, v)| labels.get(k).map_or(false, |lv| lv == v));
        if !covered {
            return SkipVerdict::Skip("does not match include labels".to_string());
        }
    }

    if exclude
        .iter()
        .any(|(k, v)| labels.get(k).map_or(false, |lv| lv == v))
    {
        return SkipVerdict::Skip("matches exclude label".to_string());
    }

    SkipVerdict::Run
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_policy_runs() {
        let verdict = evaluate_skip(
            &labels(&[("foo", "bar")]),
            &HashMap::new(),
            &HashMap::new(),
            false,
        );
        assert_eq!(verdict, SkipVerdict::Run);
    }

    #[test]
    fn test_skip_all_wins() {
        let verdict = evaluate_skip(
            &labels(&[("foo", "bar")]),
            &labels(&[("foo", "bar")]),
            &HashMap::new(),
            true,
        );
        assert_eq!(verdict, SkipVerdict::Skip("all tests skipped".to_string()));
    }

    #[test]
    fn test_include_mismatch_skips() {
        let verdict = evaluate_skip(
            &labels(&[("foo", "bar")]),
            &labels(&[("foo", "baz")]),
            &HashMap::new(),
            false,
        );
        assert_eq!(
            verdict,
            SkipVerdict::Skip("does not match include labels".to_string())
        );
    }

    #[test]
    fn test_include_missing_key_skips() {
        let verdict = evaluate_skip(
            &labels(&[("foo", "bar")]),
            &labels(&[("env", "ci")]),
            &HashMap::new(),
            false,
        );
        assert!(verdict.is_skip());
    }

    #[test]
    fn test_include_full_coverage_runs() {
        let verdict = evaluate_skip(
            &labels(&[("foo", "bar"), ("env", "ci")]),
            &labels(&[("foo", "bar"), ("env", "ci")]),
            &HashMap::new(),
            false,
        );
        assert_eq!(verdict, SkipVerdict::Run);
    }

    #[test]
    fn test_include_partial_coverage_skips() {
        let verdict = evaluate_skip(
            &labels(&[("foo", "bar")]),
            &labels(&[("foo", "bar"), ("env", "ci")]),
            &HashMap::new(),
            false,
        );
        assert!(verdict.is_skip());
    }

    #[test]
    fn test_exclude_match_skips() {
        let verdict = evaluate_skip(
            &labels(&[("flaky", "true")]),
            &HashMap::new(),
            &labels(&[("flaky", "true")]),
            false,
        );
        assert_eq!(
            verdict,
            SkipVerdict::Skip("matches exclude label".to_string())
        );
    }

    #[test]
    fn test_exclude_value_mismatch_runs() {
        let verdict = evaluate_skip(
            &labels(&[("flaky", "false")]),
            &HashMap::new(),
            &labels(&[("flaky", "true")]),
            false,
        );
        assert_eq!(verdict, SkipVerdict::Run);
    }

    #[test]
    fn test_include_checked_before_exclude() {
        // Both rules would fire; include is evaluated first.
        let verdict = evaluate_skip(
            &labels(&[("flaky", "true")]),
            &labels(&[("env", "ci")]),
            &labels(&[("flaky", "true")]),
            false,
        );
        assert_eq!(
            verdict,
            SkipVerdict::Skip("does not match include labels".to_string())
        );
    }

    #[test]
    fn test_idempotent() {
        let suite = labels(&[("foo", "bar")]);
        let include = labels(&[("foo", "bar")]);
        let exclude = labels(&[("skip", "yes")]);
        let first = evaluate_skip(&suite, &include, &exclude, false);
        let second = evaluate_skip(&suite, &include, &exclude, false);
        assert_eq!(first, second);
    }
}
