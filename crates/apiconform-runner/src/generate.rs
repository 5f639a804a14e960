//! Schema-driven payload generators
//!
//! Produces request bodies for the server under test: schema-valid samples
//! for setup steps, and deliberately wrong payloads for negative tests.
//! Handles a JSON Schema subset: string, integer, number, boolean, array,
//! object, enum, `$ref`, anyOf, oneOf, allOf.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use apiconform_core::SchemaRegistry;

use crate::transport::{OutgoingRequest, RequestHook};

/// Maximum recursion depth (circular `$ref`).
const MAX_DEPTH: u32 = 20;

/// Upper bound on generated string length.
const MAX_STRING_LEN: usize = 1_000;

pub trait ValueGenerators: Send + Sync {
    /// A value the schema accepts.
    fn sample(&self, schema: &Value) -> Value;

    /// A value of the wrong JSON type for `schema`; for object schemas every
    /// declared property gets a wrong-type value instead.
    fn wrong_type(&self, schema: &Value) -> Value;

    /// A valid sample with every required property removed.
    fn missing_required(&self, schema: &Value) -> Value;
}

/// How an invalid body is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidBody {
    WrongType,
    MissingRequired,
    /// Not JSON at all
    Malformed,
    Empty,
}

/// Hook replacing the request body with an invalid payload for `schema`.
#[must_use]
pub fn invalid_body_hook(
    generators: Arc<dyn ValueGenerators>,
    schema: Value,
    kind: InvalidBody,
) -> RequestHook {
    Arc::new(move |request: &mut OutgoingRequest| {
        let body = match kind {
            InvalidBody::WrongType => generators.wrong_type(&schema).to_string(),
            InvalidBody::MissingRequired => generators.missing_required(&schema).to_string(),
            InvalidBody::Malformed => "{\"unterminated\": ".to_string(),
            InvalidBody::Empty => String::new(),
        };
        request.body = Some(body);
    })
}

/// Default generators: random but seedable, `$ref`s resolved against the
/// schema registry.
pub struct SchemaGenerators {
    registry: Arc<SchemaRegistry>,
    rng: Mutex<SmallRng>,
}

impl SchemaGenerators {
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Deterministic output for a given seed.
    #[must_use]
    pub fn seeded(registry: Arc<SchemaRegistry>, seed: u64) -> Self {
        Self {
            registry,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    fn walker<'a>(&'a self, root: &'a Value) -> Walker<'a> {
        Walker {
            root,
            registry: &self.registry,
        }
    }
}

impl ValueGenerators for SchemaGenerators {
    fn sample(&self, schema: &Value) -> Value {
        let mut rng = self.rng.lock();
        self.walker(schema).generate(schema, &mut *rng, 0)
    }

    fn wrong_type(&self, schema: &Value) -> Value {
        let walker = self.walker(schema);
        let resolved = walker.resolve(schema, 0);
        match resolved.get("properties").and_then(Value::as_object) {
            Some(props) => {
                let obj: Map<String, Value> = props
                    .iter()
                    .map(|(k, s)| (k.clone(), wrong_type_value(&walker.resolve(s, 1))))
                    .collect();
                Value::Object(obj)
            }
            None => wrong_type_value(&resolved),
        }
    }

    fn missing_required(&self, schema: &Value) -> Value {
        let resolved = self.walker(schema).resolve(schema, 0);
        let mut value = self.sample(&resolved);
        if let (Value::Object(obj), Some(required)) = (
            &mut value,
            resolved.get("required").and_then(Value::as_array),
        ) {
            for name in required.iter().filter_map(Value::as_str) {
                obj.remove(name);
            }
        }
        value
    }
}

struct Walker<'a> {
    root: &'a Value,
    registry: &'a SchemaRegistry,
}

impl Walker<'_> {
    /// Follow `$ref` chains to a concrete schema.
    fn resolve(&self, schema: &Value, depth: u32) -> Value {
        let mut current = schema.clone();
        let mut depth = depth;
        while let Some(reference) = current.get("$ref").and_then(Value::as_str) {
            if depth > MAX_DEPTH {
                return Value::Null;
            }
            let target = if let Some(pointer) = reference.strip_prefix('#') {
                self.root.pointer(pointer).cloned()
            } else {
                let (name, pointer) = reference.split_once('#').unwrap_or((reference, ""));
                self.registry.get(name).ok().and_then(|doc| {
                    if pointer.is_empty() {
                        Some(doc.clone())
                    } else {
                        doc.pointer(pointer).cloned()
                    }
                })
            };
            let Some(target) = target else {
                return Value::Null;
            };
            current = target;
            depth += 1;
        }
        current
    }

    fn generate(&self, schema: &Value, rng: &mut impl Rng, depth: u32) -> Value {
        if depth > MAX_DEPTH {
            return Value::Null;
        }
        let schema = self.resolve(schema, depth);

        if let Some(values) = schema.get("enum").and_then(Value::as_array) {
            if !values.is_empty() {
                return values[rng.gen_range(0..values.len())].clone();
            }
        }
        if let Some(value) = schema.get("const") {
            return value.clone();
        }

        for key in ["anyOf", "oneOf"] {
            if let Some(variants) = schema.get(key).and_then(Value::as_array) {
                let non_null: Vec<&Value> = variants
                    .iter()
                    .filter(|s| s.get("type").and_then(Value::as_str) != Some("null"))
                    .collect();
                if non_null.is_empty() {
                    return Value::Null;
                }
                return self.generate(non_null[rng.gen_range(0..non_null.len())], rng, depth + 1);
            }
        }

        if let Some(all_of) = schema.get("allOf").and_then(Value::as_array) {
            let mut merged = Map::new();
            for sub in all_of {
                if let Value::Object(obj) = self.generate(sub, rng, depth + 1) {
                    merged.extend(obj);
                }
            }
            return Value::Object(merged);
        }

        match declared_type(&schema) {
            "string" => gen_string(&schema, rng),
            "integer" => gen_integer(&schema, rng),
            "number" => gen_number(&schema, rng),
            "boolean" => Value::Bool(rng.gen_bool(0.5)),
            "array" => self.gen_array(&schema, rng, depth + 1),
            "object" => self.gen_object(&schema, rng, depth + 1),
            "null" => Value::Null,
            _ if schema.get("properties").is_some() => self.gen_object(&schema, rng, depth + 1),
            _ if schema.get("items").is_some() => self.gen_array(&schema, rng, depth + 1),
            _ => Value::String(random_alnum(rng, 8)),
        }
    }

    fn gen_array(&self, schema: &Value, rng: &mut impl Rng, depth: u32) -> Value {
        let min = schema.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize;
        let max = schema.get("maxItems").and_then(Value::as_u64).unwrap_or(3) as usize;
        let count = rng.gen_range(min..=max.max(min));
        let items = schema
            .get("items")
            .cloned()
            .unwrap_or_else(|| json!({"type": "string"}));
        Value::Array((0..count).map(|_| self.generate(&items, rng, depth)).collect())
    }

    /// Required properties always, optional ones at random.
    fn gen_object(&self, schema: &Value, rng: &mut impl Rng, depth: u32) -> Value {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut obj = Map::new();
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (key, prop) in props {
                if required.contains(&key.as_str()) || rng.gen_bool(0.5) {
                    obj.insert(key.clone(), self.generate(prop, rng, depth));
                }
            }
        }
        Value::Object(obj)
    }
}

fn declared_type(schema: &Value) -> &str {
    match schema.get("type") {
        Some(Value::String(t)) => t,
        // ["string", "null"]: first non-null member
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("null"),
        _ => "",
    }
}

/// One value whose JSON type the schema rejects.
fn wrong_type_value(schema: &Value) -> Value {
    match declared_type(schema) {
        "string" => json!(0),
        "integer" => json!(3.5),
        "number" | "boolean" => json!("123"),
        "array" => json!({}),
        "object" => json!([]),
        _ => Value::Null,
    }
}

fn gen_string(schema: &Value, rng: &mut impl Rng) -> Value {
    match schema.get("format").and_then(Value::as_str) {
        Some("email") => Value::String(format!("user{}@example.com", rng.gen_range(1..9999_u32))),
        Some("uri" | "url") => Value::String(format!("https://example.com/{}", random_alnum(rng, 6))),
        Some("date") => Value::String("2024-01-15".into()),
        Some("date-time") => Value::String("2024-01-15T12:00:00Z".into()),
        Some("uuid") => Value::String(format!(
            "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
            rng.r#gen::<u32>(),
            rng.r#gen::<u16>(),
            rng.r#gen::<u16>() & 0x0FFF,
            (rng.r#gen::<u16>() & 0x3FFF) | 0x8000,
            rng.r#gen::<u64>() & 0xFFFF_FFFF_FFFF,
        )),
        _ => {
            let min = schema
                .get("minLength")
                .and_then(Value::as_u64)
                .map_or(1, |v| (v as usize).min(MAX_STRING_LEN));
            let max = schema
                .get("maxLength")
                .and_then(Value::as_u64)
                .map_or(20, |v| (v as usize).min(MAX_STRING_LEN));
            let len = rng.gen_range(min..=max.max(min));
            Value::String(random_alnum(rng, len))
        }
    }
}

fn gen_integer(schema: &Value, rng: &mut impl Rng) -> Value {
    let min = schema.get("minimum").and_then(Value::as_i64).unwrap_or(0);
    let max = schema.get("maximum").and_then(Value::as_i64).unwrap_or(1000);
    Value::Number(rng.gen_range(min..=max.max(min)).into())
}

fn gen_number(schema: &Value, rng: &mut impl Rng) -> Value {
    let min = schema.get("minimum").and_then(Value::as_f64).unwrap_or(0.0);
    let max = schema.get("maximum").and_then(Value::as_f64).unwrap_or(1000.0);
    json!(rng.gen_range(min..=max.max(min)))
}

fn random_alnum(rng: &mut impl Rng, len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}
