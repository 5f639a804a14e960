//! Request-side expectation container

use std::sync::Arc;

use serde_json::Value;

use super::{
    AssertionValidator, SchemaValidator, Target, Validator, assertions_from_value,
    header_assertion,
};
use crate::assertion::{Assertion, AssertionResult, Expected, ExpectedError, pointer_push};
use crate::exchange::CapturedExchange;
use crate::registry::{RegistryError, SchemaRegistry};

/// Checks against a captured request: identity (method, path, url), query
/// parameters, headers and body.
///
/// A negative expectation inverts every result; it asserts the request did
/// *not* look like this.
#[derive(Clone, Default)]
pub struct RequestExpectation {
    method: Option<AssertionValidator>,
    path: Option<AssertionValidator>,
    url: Option<AssertionValidator>,
    params: Option<AssertionValidator>,
    headers: Option<AssertionValidator>,
    schemas: Vec<Arc<SchemaValidator>>,
    properties: Option<AssertionValidator>,
    custom: Vec<Arc<dyn Validator>>,
    negative: bool,
}

impl RequestExpectation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `new().method(method).path(path)`.
    #[must_use]
    pub fn to(method: &str, path: impl Into<Expected>) -> Self {
        Self::new().method(method).path(path)
    }

    /// Method compared in upper case.
    #[must_use]
    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(AssertionValidator::whole(
            Target::Method,
            Expected::from(method.to_ascii_uppercase()),
        ));
        self
    }

    #[must_use]
    pub fn path(mut self, expected: impl Into<Expected>) -> Self {
        self.path = Some(AssertionValidator::whole(Target::Path, expected.into()));
        self
    }

    #[must_use]
    pub fn url(mut self, expected: impl Into<Expected>) -> Self {
        self.url = Some(AssertionValidator::whole(Target::Url, expected.into()));
        self
    }

    /// Query parameter `name` (decoded) must match.
    #[must_use]
    pub fn param(mut self, name: &str, expected: impl Into<Expected>) -> Self {
        self.params
            .get_or_insert_with(|| AssertionValidator::new(Target::Params, Vec::new()))
            .push(Assertion::new(pointer_push("", name), expected.into()));
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, expected: impl Into<Expected>) -> Self {
        self.headers
            .get_or_insert_with(|| AssertionValidator::new(Target::RequestHeaders, Vec::new()))
            .push(header_assertion(name, expected.into()));
        self
    }

    /// Request body must conform to the registry schema `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown schema names.
    pub fn schema(
        mut self,
        registry: &Arc<SchemaRegistry>,
        name: &str,
    ) -> Result<Self, RegistryError> {
        let validator = SchemaValidator::from_registry(registry, name, Target::RequestBody)?;
        self.schemas.push(Arc::new(validator));
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an error when a marker object is malformed.
    pub fn properties(mut self, expected: &Value) -> Result<Self, ExpectedError> {
        let assertions = assertions_from_value(expected)?;
        let properties = self
            .properties
            .get_or_insert_with(|| AssertionValidator::new(Target::RequestBody, Vec::new()));
        for assertion in assertions {
            properties.push(assertion);
        }
        Ok(self)
    }

    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.custom.push(Arc::new(validator));
        self
    }

    /// Invert every result produced by [`RequestExpectation::validate`].
    #[must_use]
    pub fn negative(mut self) -> Self {
        self.negative = true;
        self
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Method, path and url validators only.
    #[must_use]
    pub fn identity_validators(&self) -> Vec<&dyn Validator> {
        [&self.method, &self.path, &self.url]
            .into_iter()
            .flatten()
            .map(|v| v as &dyn Validator)
            .collect()
    }

    /// Whether the captured request passes every identity check.
    ///
    /// Never inverted, even for negative expectations.
    #[must_use]
    pub fn matches_identity(&self, exchange: &CapturedExchange) -> bool {
        self.identity_validators()
            .iter()
            .all(|v| v.validate(exchange).is_valid())
    }

    /// All active validators, in evaluation order.
    #[must_use]
    pub fn expectations(&self) -> Vec<&dyn Validator> {
        let mut out = self.identity_validators();
        if let Some(v) = &self.params {
            out.push(v);
        }
        if let Some(v) = &self.headers {
            out.push(v);
        }
        out.extend(self.schemas.iter().map(|s| s.as_ref() as &dyn Validator));
        if let Some(v) = &self.properties {
            out.push(v);
        }
        out.extend(self.custom.iter().map(|v| &**v));
        out
    }

    /// Run every validator; inverted when negative.
    #[must_use]
    pub fn validate(&self, exchange: &CapturedExchange) -> Vec<AssertionResult> {
        let results = self.evaluate(exchange);
        if self.negative {
            results.iter().map(AssertionResult::invert).collect()
        } else {
            results
        }
    }

    /// Run every validator without inversion.
    #[must_use]
    pub fn evaluate(&self, exchange: &CapturedExchange) -> Vec<AssertionResult> {
        self.expectations()
            .into_iter()
            .map(|v| v.validate(exchange))
            .collect()
    }

    #[must_use]
    pub fn assertion_count(&self) -> usize {
        self.expectations()
            .iter()
            .map(|v| v.assertions().len().max(1))
            .sum()
    }

    /// Short label such as `PUT /webhook`.
    #[must_use]
    pub fn label(&self) -> String {
        let method = self
            .method
            .as_ref()
            .map_or_else(|| "*".to_string(), whole_value);
        let path = self
            .path
            .as_ref()
            .or(self.url.as_ref())
            .map_or_else(|| "*".to_string(), whole_value);
        format!("{method} {path}")
    }
}

fn whole_value(validator: &AssertionValidator) -> String {
    match validator.assertions().first().map(|a| a.expected.to_value()) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => "*".to_string(),
    }
}

impl std::fmt::Debug for RequestExpectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.expectations().iter().map(|v| v.key()).collect();
        f.debug_struct("RequestExpectation")
            .field("validators", &keys)
            .field("negative", &self.negative)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::Pattern;
    use crate::exchange::CapturedRequest;
    use serde_json::json;

    fn inbound(method: &str, url: &str, body: &Value) -> CapturedExchange {
        CapturedExchange::new(
            "in",
            CapturedRequest::new(method, url)
                .with_header("Content-Type", "application/json")
                .with_body(body.to_string()),
        )
    }

    #[test]
    fn identity_filters_on_method_and_path() {
        let expect = RequestExpectation::to("put", "/webhook");
        assert!(expect.matches_identity(&inbound("PUT", "/webhook", &json!({}))));
        assert!(!expect.matches_identity(&inbound("POST", "/webhook", &json!({}))));
        assert!(!expect.matches_identity(&inbound("PUT", "/other", &json!({}))));
        assert_eq!(expect.identity_validators().len(), 2);
        assert_eq!(expect.label(), "PUT /webhook");
    }

    #[test]
    fn path_pattern_and_params() {
        let expect = RequestExpectation::new()
            .path(Pattern::new(r"^/posts/\d+$").unwrap())
            .param("limit", "2")
            .param("before", Expected::Present);
        let results = expect.validate(&inbound("GET", "/posts/12?limit=2&before=a%20b", &json!({})));
        assert!(results.iter().all(AssertionResult::is_valid));

        let results = expect.validate(&inbound("GET", "/posts/12?limit=3", &json!({})));
        assert_eq!(results[1].key, "params");
        assert_eq!(results[1].failed_assertions.len(), 2);
    }

    #[test]
    fn body_properties_checked_on_request() {
        let expect = RequestExpectation::to("PUT", "/webhook")
            .properties(&json!({"post": {"type": "status"}}))
            .unwrap();
        let ok = expect.validate(&inbound("PUT", "/webhook", &json!({"post": {"type": "status"}})));
        assert!(ok.iter().all(AssertionResult::is_valid));
        let bad = expect.validate(&inbound("PUT", "/webhook", &json!({"post": {"type": "photo"}})));
        assert_eq!(bad.last().unwrap().diff[0].path, "/post/type");
    }

    #[test]
    fn negative_expectation_inverts_results() {
        let expect = RequestExpectation::new()
            .header("Authorization", Expected::Present)
            .negative();
        let without = inbound("GET", "/", &json!({}));
        let results = expect.validate(&without);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].valid, Some(true));
        assert!(results[0].diff.is_empty());

        let with = CapturedExchange::new(
            "in",
            CapturedRequest::new("GET", "/").with_header("Authorization", "Bearer x"),
        );
        let results = expect.validate(&with);
        assert_eq!(results[0].valid, Some(false));
        assert_eq!(results[0].diff[0].path, "/authorization");
        assert_eq!(expect.evaluate(&with)[0].valid, Some(true));
    }
}
