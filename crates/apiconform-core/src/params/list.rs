//! Validator checking a list response against its expected window

use serde_json::Value;

use crate::assertion::{Assertion, AssertionResult, DiffEntry, Expected, lookup, pointer_push};
use crate::exchange::CapturedExchange;
use crate::expectation::{Target, Validator};

/// Exact, ordered id check of a list in the response body.
///
/// Every expected position must carry the expected id and the list must
/// not be longer than expected.
#[derive(Debug, Clone, PartialEq)]
pub struct ListValidator {
    pointer: String,
    id_field: String,
    ids: Vec<Value>,
}

impl ListValidator {
    #[must_use]
    pub fn new(pointer: &str, id_field: &str, ids: Vec<Value>) -> Self {
        Self {
            pointer: pointer.to_string(),
            id_field: id_field.to_string(),
            ids,
        }
    }

    fn id_assertions(&self) -> Vec<Assertion> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let item = pointer_push(&self.pointer, &i.to_string());
                Assertion::new(pointer_push(&item, &self.id_field), Expected::Exact(id.clone()))
            })
            .collect()
    }
}

impl Validator for ListValidator {
    fn key(&self) -> String {
        "list".to_string()
    }

    fn assertions(&self) -> Vec<Assertion> {
        self.id_assertions()
    }

    fn validate(&self, exchange: &CapturedExchange) -> AssertionResult {
        let body = Target::ResponseBody.extract(exchange);
        let assertions = self.id_assertions();

        let Some(Value::Array(items)) = lookup(&body, &self.pointer) else {
            let current = lookup(&body, &self.pointer).cloned().unwrap_or(Value::Null);
            let entry = DiffEntry::replace(&self.pointer, Value::Array(Vec::new()), current)
                .with_message("expected a list");
            let failed = assertions.clone();
            return AssertionResult::from_parts(self.key(), assertions, failed, vec![entry]);
        };

        let mut failed = Vec::new();
        let mut diff = Vec::new();
        for assertion in &assertions {
            if let Some(entry) = assertion.check(&body) {
                failed.push(assertion.clone());
                diff.push(entry);
            }
        }
        for (i, extra) in items.iter().enumerate().skip(self.ids.len()) {
            diff.push(
                DiffEntry::remove(&pointer_push(&self.pointer, &i.to_string()), extra.clone())
                    .with_message(format!("expected {} items, got {}", self.ids.len(), items.len())),
            );
        }
        AssertionResult::from_parts(self.key(), assertions, failed, diff)
    }
}
