//! Response-side expectation container

use std::sync::Arc;

use serde_json::Value;

use super::{
    AssertionValidator, SchemaValidator, Target, Validator, assertions_from_value,
    header_assertion,
};
use crate::assertion::{Assertion, AssertionResult, Expected, ExpectedError};
use crate::exchange::CapturedExchange;
use crate::registry::{RegistryError, SchemaRegistry};

/// Status, header, schema and body checks for one response.
///
/// Built with chained `with`-style calls:
///
/// ```
/// use apiconform_core::ResponseExpectation;
/// use serde_json::json;
///
/// let expect = ResponseExpectation::new()
///     .status(200)
///     .header("Content-Type", "application/json")
///     .properties(&json!({"id": "Tent!"}))
///     .unwrap();
/// assert_eq!(expect.assertion_count(), 3);
/// ```
#[derive(Clone, Default)]
pub struct ResponseExpectation {
    status: Option<AssertionValidator>,
    headers: Option<AssertionValidator>,
    schemas: Vec<Arc<SchemaValidator>>,
    properties: Option<AssertionValidator>,
    custom: Vec<Arc<dyn Validator>>,
}

impl ResponseExpectation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(self, status: u16) -> Self {
        self.status_matching(Expected::Exact(Value::from(status)))
    }

    /// Status matched by any expected kind, e.g. a `200..=299` range.
    #[must_use]
    pub fn status_matching(mut self, expected: Expected) -> Self {
        self.status = Some(AssertionValidator::whole(Target::Status, expected));
        self
    }

    /// Header compared by case-insensitive name.
    #[must_use]
    pub fn header(mut self, name: &str, expected: impl Into<Expected>) -> Self {
        self.headers
            .get_or_insert_with(|| AssertionValidator::new(Target::ResponseHeaders, Vec::new()))
            .push(header_assertion(name, expected.into()));
        self
    }

    /// List-valued header (`Access-Control-Allow-Methods` style) that must
    /// contain every member.
    #[must_use]
    pub fn header_includes(self, name: &str, members: &[&str]) -> Self {
        let members = members.iter().map(|m| Value::from(*m)).collect();
        self.header(name, Expected::Includes(members))
    }

    /// Body must conform to the registry schema `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown schema names.
    pub fn schema(
        mut self,
        registry: &Arc<SchemaRegistry>,
        name: &str,
    ) -> Result<Self, RegistryError> {
        let validator = SchemaValidator::from_registry(registry, name, Target::ResponseBody)?;
        self.schemas.push(Arc::new(validator));
        Ok(self)
    }

    /// Every terminal of `expected` must be present in the body with that value.
    ///
    /// # Errors
    ///
    /// Returns an error when a marker object is malformed.
    pub fn properties(mut self, expected: &Value) -> Result<Self, ExpectedError> {
        let assertions = assertions_from_value(expected)?;
        let properties = self
            .properties
            .get_or_insert_with(|| AssertionValidator::new(Target::ResponseBody, Vec::new()));
        for assertion in assertions {
            properties.push(assertion);
        }
        Ok(self)
    }

    /// Single body assertion at a JSON Pointer.
    #[must_use]
    pub fn property(mut self, pointer: &str, expected: impl Into<Expected>) -> Self {
        self.properties
            .get_or_insert_with(|| AssertionValidator::new(Target::ResponseBody, Vec::new()))
            .push(Assertion::new(pointer, expected.into()));
        self
    }

    /// Attach an arbitrary validator (list checks, custom rules).
    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.custom.push(Arc::new(validator));
        self
    }

    /// Active validators, in evaluation order.
    #[must_use]
    pub fn expectations(&self) -> Vec<&dyn Validator> {
        let mut out: Vec<&dyn Validator> = Vec::new();
        if let Some(v) = &self.status {
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

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expectations().is_empty()
    }

    /// Run every validator; one result per validator.
    #[must_use]
    pub fn validate(&self, exchange: &CapturedExchange) -> Vec<AssertionResult> {
        self.expectations()
            .into_iter()
            .map(|v| v.validate(exchange))
            .collect()
    }

    /// Total assertions across validators (used for skip counts).
    #[must_use]
    pub fn assertion_count(&self) -> usize {
        self.expectations()
            .iter()
            .map(|v| v.assertions().len().max(1))
            .sum()
    }
}

impl std::fmt::Debug for ResponseExpectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.expectations().iter().map(|v| v.key()).collect();
        f.debug_struct("ResponseExpectation")
            .field("validators", &keys)
            .finish()
    }
}
