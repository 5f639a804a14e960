//! Assertion module - leaf comparisons, diff entries, and results

mod diff;
mod expected;
mod result;

pub use diff::{DiffEntry, DiffOp};
pub use expected::{Expected, ExpectedError, JsonType, Pattern};
pub use result::AssertionResult;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One path-scoped expected-vs-actual comparison.
///
/// `path` is a JSON Pointer into the value under test; the empty string
/// addresses the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Assertion {
    pub path: String,
    #[schemars(with = "Value")]
    #[serde(rename = "value")]
    pub expected: Expected,
    /// Declared JSON type (schema-derived assertions)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<JsonType>,
    /// Declared format, informational (`date-time`, `uri`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Assertion {
    #[must_use]
    pub fn new(path: impl Into<String>, expected: Expected) -> Self {
        Self {
            path: path.into(),
            expected,
            ty: None,
            format: None,
        }
    }

    /// Presence assertion that also checks the runtime type.
    #[must_use]
    pub fn typed(path: impl Into<String>, ty: JsonType, format: Option<String>) -> Self {
        Self {
            path: path.into(),
            expected: Expected::Present,
            ty: Some(ty),
            format,
        }
    }

    /// Check this assertion against `root`. `None` means it holds.
    #[must_use]
    pub fn check(&self, root: &Value) -> Option<DiffEntry> {
        let Some(actual) = lookup(root, &self.path) else {
            let value = match (&self.expected, self.ty) {
                (Expected::Exact(v), _) => v.clone(),
                (_, Some(ty)) => ty.placeholder(),
                (other, None) => other.to_value(),
            };
            return Some(DiffEntry::add(&self.path, value));
        };

        if let Some(ty) = self.ty {
            if !ty.accepts(actual) {
                return Some(
                    DiffEntry::replace(&self.path, ty.placeholder(), actual.clone()).with_message(
                        format!("expected type {ty}, got {}", JsonType::of(actual)),
                    ),
                );
            }
        }

        if self.expected.matches(actual) {
            None
        } else {
            Some(DiffEntry::replace(
                &self.path,
                self.expected.to_value(),
                actual.clone(),
            ))
        }
    }
}

/// Resolve a JSON Pointer; the empty pointer is the root itself.
#[must_use]
pub fn lookup<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
    if pointer.is_empty() {
        Some(root)
    } else {
        root.pointer(pointer)
    }
}

/// Append one reference token to a JSON Pointer, escaping `~` and `/`.
#[must_use]
pub fn pointer_push(base: &str, token: &str) -> String {
    let escaped = token.replace('~', "~0").replace('/', "~1");
    format!("{base}/{escaped}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_match_passes() {
        let a = Assertion::new("/id", Expected::Exact(json!("Tent!")));
        assert!(a.check(&json!({"id": "Tent!"})).is_none());
    }

    #[test]
    fn mismatch_emits_replace_with_current_value() {
        let a = Assertion::new("/id", Expected::Exact(json!("Tent!")));
        let d = a.check(&json!({"id": "Foo Bar"})).unwrap();
        assert_eq!(d.op, DiffOp::Replace);
        assert_eq!(d.path, "/id");
        assert_eq!(d.value, Some(json!("Tent!")));
        assert_eq!(d.current_value, Some(json!("Foo Bar")));
    }

    #[test]
    fn missing_value_emits_add() {
        let a = Assertion::new("/meta/name", Expected::Exact(json!("x")));
        let d = a.check(&json!({"meta": {}})).unwrap();
        assert_eq!(d.op, DiffOp::Add);
        assert_eq!(d.value, Some(json!("x")));
        assert_eq!(d.current_value, None);
    }

    #[test]
    fn typed_assertion_reports_type_mismatch() {
        let a = Assertion::typed("/count", JsonType::Integer, None);
        let d = a.check(&json!({"count": "3"})).unwrap();
        assert_eq!(d.op, DiffOp::Replace);
        assert_eq!(d.value, Some(json!(0)));
        assert_eq!(d.message.as_deref(), Some("expected type integer, got string"));
    }

    #[test]
    fn typed_assertion_missing_adds_placeholder() {
        let a = Assertion::typed("/tags", JsonType::Array, None);
        let d = a.check(&json!({})).unwrap();
        assert_eq!(d.op, DiffOp::Add);
        assert_eq!(d.value, Some(json!([])));
    }

    #[test]
    fn empty_path_addresses_whole_value() {
        let a = Assertion::new("", Expected::Exact(json!(200)));
        assert!(a.check(&json!(200)).is_none());
        assert!(a.check(&json!(201)).is_some());
    }

    #[test]
    fn pointer_push_escapes_tokens() {
        assert_eq!(pointer_push("", "a/b"), "/a~1b");
        assert_eq!(pointer_push("/x", "m~n"), "/x/m~0n");
        let doc = json!({"a/b": {"m~n": 1}});
        assert_eq!(lookup(&doc, "/a~1b/m~0n"), Some(&json!(1)));
    }
}
