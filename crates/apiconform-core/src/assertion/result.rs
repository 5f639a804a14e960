//! Outcome of running a set of assertions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Assertion, DiffEntry};

/// Result of one validator against one captured value.
///
/// `valid` is `Some(diff.is_empty())` for every evaluated result and `None`
/// only for inconclusive results, which always carry an empty diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssertionResult {
    /// Validator key, e.g. `"status"`, `"headers"`, `"schema:post"`
    pub key: String,
    pub assertions: Vec<Assertion>,
    pub failed_assertions: Vec<Assertion>,
    pub diff: Vec<DiffEntry>,
    pub valid: Option<bool>,
}

impl AssertionResult {
    /// Run every assertion against `actual`.
    #[must_use]
    pub fn evaluate(key: impl Into<String>, assertions: Vec<Assertion>, actual: &Value) -> Self {
        let mut failed = Vec::new();
        let mut diff = Vec::new();
        for assertion in &assertions {
            if let Some(entry) = assertion.check(actual) {
                failed.push(assertion.clone());
                diff.push(entry);
            }
        }
        Self::from_parts(key, assertions, failed, diff)
    }

    /// Assemble a result from precomputed parts; validity follows the diff.
    #[must_use]
    pub fn from_parts(
        key: impl Into<String>,
        assertions: Vec<Assertion>,
        failed_assertions: Vec<Assertion>,
        diff: Vec<DiffEntry>,
    ) -> Self {
        let valid = Some(diff.is_empty());
        Self {
            key: key.into(),
            assertions,
            failed_assertions,
            diff,
            valid,
        }
    }

    /// Result for an expectation nothing could be checked against.
    #[must_use]
    pub fn inconclusive(key: impl Into<String>, assertions: Vec<Assertion>) -> Self {
        Self {
            key: key.into(),
            assertions,
            failed_assertions: Vec::new(),
            diff: Vec::new(),
            valid: None,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid == Some(true)
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.valid == Some(false)
    }

    #[must_use]
    pub fn is_inconclusive(&self) -> bool {
        self.valid.is_none()
    }

    /// Number of assertions that held.
    #[must_use]
    pub fn passing_count(&self) -> usize {
        self.assertions.len().saturating_sub(self.failed_assertions.len())
    }

    /// Negate this result: assertions that held now fail and vice versa.
    ///
    /// A result that becomes invalid gets one `replace` entry per assertion
    /// that unexpectedly held (or one root entry when there were none).
    /// Inconclusive results are returned unchanged.
    #[must_use]
    pub fn invert(&self) -> Self {
        if self.is_inconclusive() {
            return self.clone();
        }
        let failed: Vec<Assertion> = self
            .assertions
            .iter()
            .filter(|a| !self.failed_assertions.contains(a))
            .cloned()
            .collect();

        let diff = if self.is_valid() {
            let mut diff: Vec<DiffEntry> = failed
                .iter()
                .map(|a| unexpected_match(&a.path, a.expected.to_value()))
                .collect();
            if diff.is_empty() {
                diff.push(unexpected_match("", Value::Null));
            }
            diff
        } else {
            Vec::new()
        };

        Self::from_parts(self.key.clone(), self.assertions.clone(), failed, diff)
    }
}

fn unexpected_match(path: &str, value: Value) -> DiffEntry {
    DiffEntry {
        op: super::DiffOp::Replace,
        path: path.to_string(),
        value: Some(value),
        current_value: None,
        message: Some("unexpected match".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::Expected;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample() -> AssertionResult {
        AssertionResult::evaluate(
            "body",
            vec![
                Assertion::new("/id", Expected::Exact(json!("Tent!"))),
                Assertion::new("/kind", Expected::Exact(json!("post"))),
            ],
            &json!({"id": "Tent!", "kind": "status"}),
        )
    }

    #[test]
    fn validity_follows_diff() {
        let r = sample();
        assert_eq!(r.valid, Some(false));
        assert_eq!(r.diff.len(), 1);
        assert_eq!(r.failed_assertions.len(), 1);
        assert_eq!(r.passing_count(), 1);
    }

    #[test]
    fn invert_swaps_failed_set() {
        let r = sample();
        let inv = r.invert();
        assert_eq!(inv.failed_assertions.len(), 1);
        assert_eq!(inv.failed_assertions[0].path, "/id");
        assert_eq!(inv.valid, Some(true));
        assert!(inv.diff.is_empty());
    }

    #[test]
    fn invert_of_valid_reports_unexpected_matches() {
        let r = AssertionResult::evaluate(
            "body",
            vec![Assertion::new("/id", Expected::Exact(json!(1)))],
            &json!({"id": 1}),
        );
        let inv = r.invert();
        assert_eq!(inv.valid, Some(false));
        assert_eq!(inv.diff.len(), 1);
        assert_eq!(inv.diff[0].path, "/id");
        assert_eq!(inv.diff[0].message.as_deref(), Some("unexpected match"));
    }

    #[test]
    fn invert_of_invalid_is_valid_with_empty_diff() {
        let r = AssertionResult::evaluate(
            "body",
            vec![Assertion::new("/id", Expected::Exact(json!(1)))],
            &json!({"id": 2}),
        );
        let inv = r.invert();
        assert_eq!(inv.valid, Some(true));
        assert!(inv.diff.is_empty());
        assert!(inv.failed_assertions.is_empty());
    }

    #[test]
    fn invert_without_assertions_still_fails() {
        let r = AssertionResult::evaluate("empty", vec![], &json!({}));
        let inv = r.invert();
        assert_eq!(inv.valid, Some(false));
        assert_eq!(inv.diff.len(), 1);
    }

    #[test]
    fn inconclusive_stays_inconclusive() {
        let r = AssertionResult::inconclusive("async", vec![]);
        assert!(r.invert().is_inconclusive());
        assert!(r.diff.is_empty());
    }

    proptest! {
        #[test]
        fn double_inversion_restores_failed_set(
            expected in proptest::collection::vec(0i64..4, 0..6),
            actual in proptest::collection::vec(0i64..4, 0..6),
        ) {
            let assertions: Vec<Assertion> = expected
                .iter()
                .enumerate()
                .map(|(i, v)| Assertion::new(format!("/{i}"), Expected::Exact(json!(v))))
                .collect();
            let r = AssertionResult::evaluate("p", assertions, &json!(actual));
            let twice = r.invert().invert();
            prop_assert_eq!(&twice.failed_assertions, &r.failed_assertions);
            prop_assert_eq!(twice.valid, Some(twice.diff.is_empty()));
            prop_assert_eq!(r.valid, Some(r.diff.is_empty()));
        }
    }
}
