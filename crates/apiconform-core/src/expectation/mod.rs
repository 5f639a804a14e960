//! Expectation containers
//!
//! A container bundles independent validators; each validator turns one
//! captured exchange into one [`AssertionResult`].

mod request;
mod response;
mod schema;

pub use request::RequestExpectation;
pub use response::ResponseExpectation;
pub use schema::SchemaValidator;

use serde_json::{Map, Value};

use crate::assertion::{
    Assertion, AssertionResult, Expected, ExpectedError, pointer_push,
};
use crate::exchange::CapturedExchange;

/// One independent check over a captured exchange.
pub trait Validator: Send + Sync {
    /// Stable key used to label results, e.g. `"status"`.
    fn key(&self) -> String;

    /// Assertions this validator would evaluate (used for skip counts).
    fn assertions(&self) -> Vec<Assertion>;

    fn validate(&self, exchange: &CapturedExchange) -> AssertionResult;
}

/// Part of an exchange a validator looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Method,
    Path,
    Url,
    Params,
    RequestHeaders,
    RequestBody,
    Status,
    ResponseHeaders,
    ResponseBody,
}

impl Target {
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Path => "path",
            Self::Url => "url",
            Self::Params => "params",
            Self::RequestHeaders => "request_headers",
            Self::RequestBody => "request_body",
            Self::Status => "status",
            Self::ResponseHeaders => "headers",
            Self::ResponseBody => "properties",
        }
    }

    /// Project the exchange onto a JSON value for this target.
    ///
    /// Missing responses yield `null` for the status and `{}` for headers
    /// and body, so every check reports instead of erroring.
    #[must_use]
    pub fn extract(self, exchange: &CapturedExchange) -> Value {
        let req = &exchange.request;
        let resp = exchange.response.as_ref();
        match self {
            Self::Method => Value::String(req.method.clone()),
            Self::Path => Value::String(req.path.clone()),
            Self::Url => Value::String(req.url.clone()),
            Self::Params => string_map(req.params.iter()),
            Self::RequestHeaders => string_map(req.headers.iter()),
            Self::RequestBody => req.json(),
            Self::Status => resp.map_or(Value::Null, |r| Value::from(r.status)),
            Self::ResponseHeaders => resp.map_or_else(
                || Value::Object(Map::new()),
                |r| string_map(r.headers.iter()),
            ),
            Self::ResponseBody => resp.map_or_else(|| Value::Object(Map::new()), |r| r.json()),
        }
    }

    /// Whether this target only identifies a request (method, path, url).
    #[must_use]
    pub const fn is_identity(self) -> bool {
        matches!(self, Self::Method | Self::Path | Self::Url)
    }
}

fn string_map<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> Value {
    Value::Object(
        entries
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Validator evaluating a fixed list of assertions against one target.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionValidator {
    target: Target,
    assertions: Vec<Assertion>,
}

impl AssertionValidator {
    #[must_use]
    pub fn new(target: Target, assertions: Vec<Assertion>) -> Self {
        Self { target, assertions }
    }

    /// Single assertion over the whole target value (status, method, ...).
    #[must_use]
    pub fn whole(target: Target, expected: Expected) -> Self {
        Self::new(target, vec![Assertion::new("", expected)])
    }

    #[must_use]
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn push(&mut self, assertion: Assertion) {
        self.assertions.push(assertion);
    }
}

impl Validator for AssertionValidator {
    fn key(&self) -> String {
        self.target.key().to_string()
    }

    fn assertions(&self) -> Vec<Assertion> {
        self.assertions.clone()
    }

    fn validate(&self, exchange: &CapturedExchange) -> AssertionResult {
        let actual = self.target.extract(exchange);
        AssertionResult::evaluate(self.key(), self.assertions.clone(), &actual)
    }
}

/// Walk an expected JSON structure; every terminal becomes one assertion
/// keyed by its JSON Pointer.
///
/// Terminals are scalars, empty containers and marker objects
/// (see [`Expected::from_value`]).
///
/// # Errors
///
/// Returns an error when a marker object is malformed.
pub fn assertions_from_value(expected: &Value) -> Result<Vec<Assertion>, ExpectedError> {
    let mut out = Vec::new();
    collect(expected, "", &mut out)?;
    Ok(out)
}

fn collect(value: &Value, path: &str, out: &mut Vec<Assertion>) -> Result<(), ExpectedError> {
    match value {
        Value::Object(obj) if !obj.is_empty() && !Expected::is_marker(value) => {
            for (k, v) in obj {
                collect(v, &pointer_push(path, k), out)?;
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                collect(v, &pointer_push(path, &i.to_string()), out)?;
            }
        }
        _ => out.push(Assertion::new(path, Expected::from_value(value)?)),
    }
    Ok(())
}

/// Header assertions keyed by lowercased header name.
pub(crate) fn header_assertion(name: &str, expected: Expected) -> Assertion {
    Assertion::new(pointer_push("", &name.to_ascii_lowercase()), expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{CapturedRequest, CapturedResponse};
    use serde_json::json;

    #[test]
    fn terminals_become_pointer_assertions() {
        let a = assertions_from_value(&json!({
            "id": "Tent!",
            "content": {"text": {"$pattern": "^h"}, "tags": ["a", {}]},
            "n": 1
        }))
        .unwrap();
        let paths: Vec<_> = a.iter().map(|x| x.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/content/tags/0", "/content/tags/1", "/content/text", "/id", "/n"]
        );
        assert!(matches!(a[2].expected, Expected::Pattern(_)));
        assert_eq!(a[1].expected, Expected::Exact(json!({})));
    }

    #[test]
    fn scalar_root_is_single_assertion() {
        let a = assertions_from_value(&json!(5)).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].path, "");
    }

    #[test]
    fn missing_response_is_reported_not_panicking() {
        let ex = CapturedExchange::new("x", CapturedRequest::new("GET", "/"));
        let v = AssertionValidator::whole(Target::Status, Expected::Exact(json!(200)));
        let r = v.validate(&ex);
        assert_eq!(r.valid, Some(false));
        assert_eq!(r.diff[0].current_value, Some(Value::Null));
    }

    #[test]
    fn targets_extract_expected_parts() {
        let ex = CapturedExchange::new(
            "x",
            CapturedRequest::new("POST", "/posts?limit=1").with_header("X-A", "b"),
        )
        .with_response(CapturedResponse::new(201).with_header("ETag", "v1"));
        assert_eq!(Target::Params.extract(&ex), json!({"limit": "1"}));
        assert_eq!(Target::RequestHeaders.extract(&ex), json!({"x-a": "b"}));
        assert_eq!(Target::Status.extract(&ex), json!(201));
        assert_eq!(Target::ResponseHeaders.extract(&ex), json!({"etag": "v1"}));
        assert_eq!(Target::ResponseBody.extract(&ex), json!({}));
    }
}
