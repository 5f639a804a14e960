//! JSON-Schema structural diff
//!
//! Walks an actual document against a schema and describes, as patch
//! operations, what would make it conform:
//!
//! - property not declared by the schema → `remove`
//! - runtime type differs from the declared type → `replace` with a
//!   placeholder of the declared type
//! - required property missing → `add` with the same placeholder
//!
//! Also derives presence assertions from `required` lists.

use std::borrow::Cow;

use serde_json::{Map, Value};

use crate::assertion::{Assertion, DiffEntry, Expected, JsonType, pointer_push};
use crate::registry::SchemaRegistry;

/// Maximum recursion depth (guards against circular `$ref`).
const MAX_DEPTH: u32 = 20;

/// Diff `document` against a self-contained `schema`.
#[must_use]
pub fn schema_diff(schema: &Value, document: &Value) -> Vec<DiffEntry> {
    SchemaWalker::new(schema).diff(document)
}

/// Schema traversal with `$ref` resolution against the root schema and,
/// optionally, a registry of named schemas.
pub struct SchemaWalker<'a> {
    root: &'a Value,
    registry: Option<&'a SchemaRegistry>,
}

impl<'a> SchemaWalker<'a> {
    #[must_use]
    pub fn new(root: &'a Value) -> Self {
        Self {
            root,
            registry: None,
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: &'a SchemaRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Ordered diff of `document` against the root schema.
    #[must_use]
    pub fn diff(&self, document: &Value) -> Vec<DiffEntry> {
        let mut out = Vec::new();
        self.walk(self.root, document, "", 0, &mut out);
        out
    }

    /// Presence/type assertions for every required property, recursing into
    /// required nested objects.
    #[must_use]
    pub fn required_assertions(&self) -> Vec<Assertion> {
        let mut out = Vec::new();
        self.collect_required(self.root, "", 0, &mut out);
        out
    }

    fn collect_required(&self, schema: &Value, path: &str, depth: u32, out: &mut Vec<Assertion>) {
        if depth > MAX_DEPTH {
            return;
        }
        let schema = self.effective(schema, depth);
        let props = schema.get("properties").and_then(Value::as_object);
        for name in required_names(&schema) {
            let child_path = pointer_push(path, name);
            let prop = props
                .and_then(|p| p.get(name))
                .map(|p| self.effective(p, depth + 1));
            let assertion = match prop.as_deref().and_then(single_type) {
                Some(ty) => Assertion::typed(
                    child_path.clone(),
                    ty,
                    prop.as_deref()
                        .and_then(|p| p.get("format"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                ),
                None => Assertion::new(child_path.clone(), Expected::Present),
            };
            out.push(assertion);
            if let Some(p) = prop {
                self.collect_required(&p, &child_path, depth + 1, out);
            }
        }
    }

    fn walk(&self, schema: &Value, doc: &Value, path: &str, depth: u32, out: &mut Vec<DiffEntry>) {
        if depth > MAX_DEPTH {
            return;
        }
        let schema = self.effective(schema, depth);

        if let Some(variants) = schema
            .get("anyOf")
            .or_else(|| schema.get("oneOf"))
            .and_then(Value::as_array)
        {
            if let Some(best) = self.best_variant(variants, doc, path, depth) {
                out.extend(best);
                return;
            }
        }

        let declared = declared_types(&schema);
        if !declared.is_empty() && !declared.iter().any(|t| t.accepts(doc)) {
            let placeholder = declared
                .iter()
                .find(|t| **t != JsonType::Null)
                .unwrap_or(&declared[0])
                .placeholder();
            let expected = declared
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(" or ");
            out.push(
                DiffEntry::replace(path, placeholder, doc.clone()).with_message(format!(
                    "expected type {expected}, got {}",
                    JsonType::of(doc)
                )),
            );
            return;
        }

        match doc {
            Value::Object(obj) => self.walk_object(&schema, obj, path, depth, out),
            Value::Array(items) => {
                if let Some(item_schema) = schema.get("items").filter(|s| s.is_object()) {
                    for (i, item) in items.iter().enumerate() {
                        let child = pointer_push(path, &i.to_string());
                        self.walk(item_schema, item, &child, depth + 1, out);
                    }
                }
            }
            _ => {}
        }
    }

    fn walk_object(
        &self,
        schema: &Value,
        obj: &Map<String, Value>,
        path: &str,
        depth: u32,
        out: &mut Vec<DiffEntry>,
    ) {
        let props = schema.get("properties").and_then(Value::as_object);
        let additional = schema.get("additionalProperties");

        for (key, value) in obj {
            let child = pointer_push(path, key);
            match (props.and_then(|p| p.get(key)), additional) {
                (Some(prop_schema), _) => self.walk(prop_schema, value, &child, depth + 1, out),
                (None, Some(extra @ Value::Object(_))) => {
                    self.walk(extra, value, &child, depth + 1, out);
                }
                (None, Some(Value::Bool(true))) => {}
                (None, _) if props.is_some() => {
                    out.push(
                        DiffEntry::remove(&child, value.clone())
                            .with_message("property not declared by schema"),
                    );
                }
                (None, _) => {}
            }
        }

        for name in required_names(schema) {
            if obj.contains_key(name) {
                continue;
            }
            let placeholder = props
                .and_then(|p| p.get(name))
                .map(|p| self.effective(p, depth + 1))
                .and_then(|p| declared_types(&p).into_iter().find(|t| *t != JsonType::Null))
                .map_or(Value::Null, JsonType::placeholder);
            out.push(
                DiffEntry::add(&pointer_push(path, name), placeholder)
                    .with_message("missing required property"),
            );
        }
    }

    /// Variant with an empty diff, or else the one with the fewest entries.
    fn best_variant(
        &self,
        variants: &[Value],
        doc: &Value,
        path: &str,
        depth: u32,
    ) -> Option<Vec<DiffEntry>> {
        variants
            .iter()
            .map(|v| {
                let mut d = Vec::new();
                self.walk(v, doc, path, depth + 1, &mut d);
                d
            })
            .min_by_key(Vec::len)
    }

    /// Follow `$ref` chains and fold `allOf` into one object schema.
    fn effective<'s>(&'s self, schema: &'s Value, depth: u32) -> Cow<'s, Value> {
        let mut current = Cow::Borrowed(schema);
        let mut hops = depth;
        while let Some(reference) = current.get("$ref").and_then(Value::as_str) {
            if hops > MAX_DEPTH {
                break;
            }
            hops += 1;
            match self.resolve_ref(reference) {
                Some(target) => current = Cow::Borrowed(target),
                None => break,
            }
        }

        let Some(parts) = current.get("allOf").and_then(Value::as_array) else {
            return current;
        };
        let mut merged = current.as_object().cloned().unwrap_or_default();
        merged.remove("allOf");
        let mut props = merged
            .remove("properties")
            .and_then(|p| p.as_object().cloned())
            .unwrap_or_default();
        let mut required: Vec<Value> = merged
            .remove("required")
            .and_then(|r| r.as_array().cloned())
            .unwrap_or_default();
        for part in parts {
            let part = self.effective(part, hops + 1);
            if let Some(p) = part.get("properties").and_then(Value::as_object) {
                props.extend(p.clone());
            }
            if let Some(r) = part.get("required").and_then(Value::as_array) {
                required.extend(r.iter().cloned());
            }
            if let Some(t) = part.get("type") {
                merged.entry("type").or_insert_with(|| t.clone());
            }
        }
        if !props.is_empty() {
            merged.insert("properties".into(), Value::Object(props));
        }
        if !required.is_empty() {
            merged.insert("required".into(), Value::Array(required));
        }
        Cow::Owned(Value::Object(merged))
    }

    fn resolve_ref(&self, reference: &str) -> Option<&Value> {
        if let Some(pointer) = reference.strip_prefix('#') {
            return self.root.pointer(pointer);
        }
        let (name, pointer) = reference.split_once('#').unwrap_or((reference, ""));
        let target = self.registry?.get(name).ok()?;
        if pointer.is_empty() {
            Some(target)
        } else {
            target.pointer(pointer)
        }
    }
}

fn required_names(schema: &Value) -> impl Iterator<Item = &str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn declared_types(schema: &Value) -> Vec<JsonType> {
    match schema.get("type") {
        Some(Value::String(t)) => JsonType::parse(t).into_iter().collect(),
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .filter_map(JsonType::parse)
            .collect(),
        _ => Vec::new(),
    }
}

fn single_type(schema: &Value) -> Option<JsonType> {
    match declared_types(schema).as_slice() {
        [ty] => Some(*ty),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::DiffOp;
    use serde_json::json;

    fn post_schema() -> Value {
        json!({
            "type": "object",
            "required": ["id", "content"],
            "properties": {
                "id": {"type": "string"},
                "published_at": {"type": "integer"},
                "content": {
                    "type": "object",
                    "required": ["text"],
                    "properties": {"text": {"type": "string", "format": "markdown"}}
                },
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    #[test]
    fn conforming_document_has_empty_diff() {
        let doc = json!({
            "id": "p1",
            "published_at": 1_700_000_000,
            "content": {"text": "hi"},
            "tags": ["a", "b"]
        });
        assert!(schema_diff(&post_schema(), &doc).is_empty());
    }

    #[test]
    fn undeclared_property_is_removed() {
        let doc = json!({"id": "p1", "content": {"text": "x"}, "bogus": 1});
        let d = schema_diff(&post_schema(), &doc);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].op, DiffOp::Remove);
        assert_eq!(d[0].path, "/bogus");
        assert_eq!(d[0].current_value, Some(json!(1)));
    }

    #[test]
    fn type_mismatch_is_replaced_with_placeholder() {
        let doc = json!({"id": 5, "content": {"text": "x"}, "published_at": "yesterday"});
        let d = schema_diff(&post_schema(), &doc);
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].path, "/id");
        assert_eq!(d[0].value, Some(json!("")));
        assert_eq!(d[0].message.as_deref(), Some("expected type string, got integer"));
        assert_eq!(d[1].path, "/published_at");
        assert_eq!(d[1].value, Some(json!(0)));
    }

    #[test]
    fn missing_required_is_added() {
        let doc = json!({"id": "p1", "content": {}});
        let d = schema_diff(&post_schema(), &doc);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].op, DiffOp::Add);
        assert_eq!(d[0].path, "/content/text");
        assert_eq!(d[0].value, Some(json!("")));
    }

    #[test]
    fn array_items_are_walked() {
        let doc = json!({"id": "p1", "content": {"text": "x"}, "tags": ["a", 2]});
        let d = schema_diff(&post_schema(), &doc);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "/tags/1");
    }

    #[test]
    fn additional_properties_true_allows_extras() {
        let schema = json!({"type": "object", "properties": {}, "additionalProperties": true});
        assert!(schema_diff(&schema, &json!({"x": 1})).is_empty());
    }

    #[test]
    fn local_refs_are_resolved() {
        let schema = json!({
            "definitions": {"mention": {"type": "object", "required": ["entity"],
                "properties": {"entity": {"type": "string"}}}},
            "type": "object",
            "properties": {"mentions": {"type": "array", "items": {"$ref": "#/definitions/mention"}}}
        });
        let d = schema_diff(&schema, &json!({"mentions": [{"entity": 1}]}));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "/mentions/0/entity");
    }

    #[test]
    fn all_of_parts_are_merged() {
        let schema = json!({
            "allOf": [
                {"type": "object", "properties": {"a": {"type": "string"}}, "required": ["a"]},
                {"properties": {"b": {"type": "integer"}}}
            ]
        });
        assert!(schema_diff(&schema, &json!({"a": "x", "b": 1})).is_empty());
        let d = schema_diff(&schema, &json!({"b": 1}));
        assert_eq!(d[0].path, "/a");
    }

    #[test]
    fn nullable_types_accept_null() {
        let schema = json!({"type": "object", "properties": {"x": {"type": ["string", "null"]}}});
        assert!(schema_diff(&schema, &json!({"x": null})).is_empty());
        let d = schema_diff(&schema, &json!({"x": 1}));
        assert_eq!(d[0].message.as_deref(), Some("expected type string or null, got integer"));
    }

    #[test]
    fn required_assertions_recurse_into_required_objects() {
        let schema = post_schema();
        let assertions = SchemaWalker::new(&schema).required_assertions();
        let paths: Vec<_> = assertions.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["/id", "/content", "/content/text"]);
        assert_eq!(assertions[0].ty, Some(JsonType::String));
        assert_eq!(assertions[2].format.as_deref(), Some("markdown"));
    }
}
