//! JSON-Schema validator over a request or response body

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{Target, Validator};
use crate::assertion::{Assertion, AssertionResult, DiffEntry};
use crate::exchange::CapturedExchange;
use crate::registry::{RegistryError, SchemaRegistry};
use crate::schema_diff::SchemaWalker;

const MAX_INLINE_DEPTH: u32 = 20;

/// Checks a body against a named schema.
///
/// The structural diff comes first; when it finds nothing but full
/// JSON-Schema validation still rejects the body (formats, enums, bounds),
/// one root `replace` entry carries the validator messages.
pub struct SchemaValidator {
    name: String,
    target: Target,
    schema: Value,
    registry: Option<Arc<SchemaRegistry>>,
    required: Vec<Assertion>,
    compiled: Option<jsonschema::Validator>,
}

impl SchemaValidator {
    /// Standalone schema, `$ref`s resolved against itself only.
    #[must_use]
    pub fn new(name: impl Into<String>, target: Target, schema: Value) -> Self {
        Self::build(name.into(), target, schema, None)
    }

    /// Look `name` up in the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when the registry has no such schema.
    pub fn from_registry(
        registry: &Arc<SchemaRegistry>,
        name: &str,
        target: Target,
    ) -> Result<Self, RegistryError> {
        let schema = registry.get(name)?.clone();
        Ok(Self::build(
            name.to_string(),
            target,
            schema,
            Some(Arc::clone(registry)),
        ))
    }

    fn build(
        name: String,
        target: Target,
        schema: Value,
        registry: Option<Arc<SchemaRegistry>>,
    ) -> Self {
        let walker = match registry.as_deref() {
            Some(reg) => SchemaWalker::new(&schema).with_registry(reg),
            None => SchemaWalker::new(&schema),
        };
        let required = walker.required_assertions();
        let inlined = inline_refs(&schema, None, registry.as_deref(), 0);
        let compiled = jsonschema::validator_for(&inlined).ok();
        Self {
            name,
            target,
            schema,
            registry,
            required,
            compiled,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn walker(&self) -> SchemaWalker<'_> {
        match self.registry.as_deref() {
            Some(reg) => SchemaWalker::new(&self.schema).with_registry(reg),
            None => SchemaWalker::new(&self.schema),
        }
    }
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("required", &self.required.len())
            .finish_non_exhaustive()
    }
}

impl Validator for SchemaValidator {
    fn key(&self) -> String {
        format!("schema:{}", self.name)
    }

    fn assertions(&self) -> Vec<Assertion> {
        self.required.clone()
    }

    fn validate(&self, exchange: &CapturedExchange) -> AssertionResult {
        let document = self.target.extract(exchange);
        let mut diff = self.walker().diff(&document);

        let failed: Vec<Assertion> = self
            .required
            .iter()
            .filter(|a| a.check(&document).is_some())
            .cloned()
            .collect();
        // Every failed presence check shows up in the diff
        for assertion in &failed {
            if !diff.iter().any(|d| covers(&d.path, &assertion.path)) {
                diff.extend(assertion.check(&document));
            }
        }

        if diff.is_empty() {
            if let Some(validator) = &self.compiled {
                let errors: Vec<String> = validator
                    .iter_errors(&document)
                    .take(5)
                    .map(|e| e.to_string())
                    .collect();
                if !errors.is_empty() {
                    diff.push(
                        DiffEntry::replace("", Value::Null, document.clone())
                            .with_message(errors.join("; ")),
                    );
                }
            }
        }

        AssertionResult::from_parts(self.key(), self.required.clone(), failed, diff)
    }
}

/// `parent` is `path` itself or one of its ancestors.
fn covers(parent: &str, path: &str) -> bool {
    path == parent
        || path
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Replace registry references with the referenced documents so the
/// compiled validator never resolves anything remotely.
///
/// Local `#...` references stay untouched at the top level; inside an
/// inlined document they are resolved against that document.
fn inline_refs(
    schema: &Value,
    base: Option<&Value>,
    registry: Option<&SchemaRegistry>,
    depth: u32,
) -> Value {
    if depth > MAX_INLINE_DEPTH {
        return schema.clone();
    }
    match schema {
        Value::Object(obj) => {
            if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
                if let Some(pointer) = reference.strip_prefix('#') {
                    return match base.and_then(|b| b.pointer(pointer)) {
                        Some(target) => inline_refs(target, base, registry, depth + 1),
                        None => schema.clone(),
                    };
                }
                let (name, pointer) = reference.split_once('#').unwrap_or((reference, ""));
                let Some(doc) = registry.and_then(|r| r.get(name).ok()) else {
                    return schema.clone();
                };
                let target = if pointer.is_empty() {
                    Some(doc)
                } else {
                    doc.pointer(pointer)
                };
                return match target {
                    Some(t) => inline_refs(t, Some(doc), registry, depth + 1),
                    None => schema.clone(),
                };
            }
            let inlined: Map<String, Value> = obj
                .iter()
                .map(|(k, v)| (k.clone(), inline_refs(v, base, registry, depth + 1)))
                .collect();
            Value::Object(inlined)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| inline_refs(v, base, registry, depth + 1))
                .collect(),
        ),
        _ => schema.clone(),
    }
}
