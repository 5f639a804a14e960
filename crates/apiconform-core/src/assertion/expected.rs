//! Expected values and JSON runtime types

use std::fmt;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

/// Marker keys recognised by [`Expected::from_value`].
const PATTERN_KEY: &str = "$pattern";
const RANGE_KEY: &str = "$range";
const ONE_OF_KEY: &str = "$oneOf";
const PRESENT_KEY: &str = "$present";
const INCLUDES_KEY: &str = "$includes";

/// What an assertion compares the actual value against.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    /// Exact equality; numbers compare numerically (`1 == 1.0`)
    Exact(Value),
    /// Regular expression; the actual value must be a string or a scalar
    Pattern(Pattern),
    /// Inclusive numeric range
    Range { min: f64, max: f64 },
    /// Any of the listed values
    OneOf(Vec<Value>),
    /// Every listed value appears in the actual array (or comma-separated list)
    Includes(Vec<Value>),
    /// Only presence is required
    Present,
}

impl Expected {
    /// Build from a JSON value, recognising marker objects.
    ///
    /// `{"$pattern": "^a"}`, `{"$range": [1, 5]}`, `{"$oneOf": [..]}`,
    /// `{"$includes": [..]}` and `{"$present": true}` map to the non-exact
    /// kinds; everything else is [`Expected::Exact`].
    ///
    /// # Errors
    ///
    /// Returns an error for invalid regular expressions or malformed ranges.
    pub fn from_value(value: &Value) -> Result<Self, ExpectedError> {
        let Some(obj) = value.as_object().filter(|o| o.len() == 1) else {
            return Ok(Self::Exact(value.clone()));
        };
        if let Some(p) = obj.get(PATTERN_KEY) {
            let src = p
                .as_str()
                .ok_or_else(|| ExpectedError::Marker(PATTERN_KEY, "expected a string"))?;
            return Ok(Self::Pattern(Pattern::new(src)?));
        }
        if let Some(r) = obj.get(RANGE_KEY) {
            let bounds = r
                .as_array()
                .filter(|a| a.len() == 2)
                .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)))
                .ok_or_else(|| ExpectedError::Marker(RANGE_KEY, "expected [min, max]"))?;
            return Ok(Self::Range {
                min: bounds.0,
                max: bounds.1,
            });
        }
        if let Some(o) = obj.get(ONE_OF_KEY) {
            let options = o
                .as_array()
                .ok_or_else(|| ExpectedError::Marker(ONE_OF_KEY, "expected an array"))?;
            return Ok(Self::OneOf(options.clone()));
        }
        if let Some(i) = obj.get(INCLUDES_KEY) {
            let members = i
                .as_array()
                .ok_or_else(|| ExpectedError::Marker(INCLUDES_KEY, "expected an array"))?;
            return Ok(Self::Includes(members.clone()));
        }
        if obj.contains_key(PRESENT_KEY) {
            return Ok(Self::Present);
        }
        Ok(Self::Exact(value.clone()))
    }

    /// Whether `value` is a marker object rather than a literal.
    #[must_use]
    pub fn is_marker(value: &Value) -> bool {
        value.as_object().is_some_and(|o| {
            o.len() == 1
                && [PATTERN_KEY, RANGE_KEY, ONE_OF_KEY, INCLUDES_KEY, PRESENT_KEY]
                    .iter()
                    .any(|k| o.contains_key(*k))
        })
    }

    /// Inverse of [`Expected::from_value`].
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Exact(v) => v.clone(),
            Self::Pattern(p) => json!({ PATTERN_KEY: p.as_str() }),
            Self::Range { min, max } => json!({ RANGE_KEY: [min, max] }),
            Self::OneOf(options) => json!({ ONE_OF_KEY: options }),
            Self::Includes(members) => json!({ INCLUDES_KEY: members }),
            Self::Present => json!({ PRESENT_KEY: true }),
        }
    }

    #[must_use]
    pub fn matches(&self, actual: &Value) -> bool {
        match self {
            Self::Exact(expected) => values_equal(expected, actual),
            Self::Pattern(p) => match actual {
                Value::String(s) => p.is_match(s),
                Value::Number(n) => p.is_match(&n.to_string()),
                Value::Bool(b) => p.is_match(if *b { "true" } else { "false" }),
                _ => false,
            },
            Self::Range { min, max } => actual.as_f64().is_some_and(|n| n >= *min && n <= *max),
            Self::OneOf(options) => options.iter().any(|o| values_equal(o, actual)),
            Self::Includes(members) => match actual {
                Value::Array(items) => members
                    .iter()
                    .all(|m| items.iter().any(|i| values_equal(m, i))),
                Value::String(list) => {
                    let tokens: Vec<&str> = list.split(',').map(str::trim).collect();
                    members
                        .iter()
                        .all(|m| m.as_str().is_some_and(|m| tokens.contains(&m)))
                }
                _ => false,
            },
            Self::Present => true,
        }
    }
}

impl Serialize for Expected {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expected {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl From<Value> for Expected {
    fn from(value: Value) -> Self {
        Self::Exact(value)
    }
}

impl From<&str> for Expected {
    fn from(value: &str) -> Self {
        Self::Exact(Value::String(value.to_string()))
    }
}

impl From<String> for Expected {
    fn from(value: String) -> Self {
        Self::Exact(Value::String(value))
    }
}

impl From<Pattern> for Expected {
    fn from(pattern: Pattern) -> Self {
        Self::Pattern(pattern)
    }
}

/// Numeric-aware structural equality.
fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => match (integer(e), integer(a)) {
            (Some(x), Some(y)) => x == y,
            _ => e.as_f64() == a.as_f64(),
        },
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len() && e.iter().zip(a).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(e), Value::Object(a)) => {
            e.len() == a.len()
                && e
                    .iter()
                    .all(|(k, v)| a.get(k).is_some_and(|av| values_equal(v, av)))
        }
        _ => expected == actual,
    }
}

/// Integer value of `n`, covering the whole `i64` and `u64` ranges.
fn integer(n: &serde_json::Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// Compiled regular expression compared by source text.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    /// # Errors
    ///
    /// Returns an error if `src` is not a valid regular expression.
    pub fn new(src: &str) -> Result<Self, ExpectedError> {
        Regex::new(src)
            .map(Self)
            .map_err(|e| ExpectedError::Pattern(src.to_string(), e.to_string()))
    }

    #[must_use]
    pub fn is_match(&self, s: &str) -> bool {
        self.0.is_match(s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpectedError {
    #[error("invalid pattern {0:?}: {1}")]
    Pattern(String, String),
    #[error("malformed {0} marker: {1}")]
    Marker(&'static str, &'static str),
}

/// Runtime JSON type, as named by JSON Schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "null" => Some(Self::Null),
            "boolean" => Some(Self::Boolean),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "string" => Some(Self::String),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    /// `number` accepts integers; `integer` accepts floats with no fraction.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => Self::of(value) == self,
        }
    }

    /// Zero value of this type, used as the proposed value in diffs.
    #[must_use]
    pub fn placeholder(self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean => Value::Bool(false),
            Self::Integer | Self::Number => json!(0),
            Self::String => Value::String(String::new()),
            Self::Array => Value::Array(Vec::new()),
            Self::Object => Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_ignores_representation() {
        let e = Expected::Exact(json!(1));
        assert!(e.matches(&json!(1.0)));
        assert!(!e.matches(&json!("1")));
        assert!(!e.matches(&json!(2)));
    }

    #[test]
    fn large_unsigned_integers_compare_exactly() {
        let e = Expected::Exact(json!(u64::MAX));
        assert!(e.matches(&json!(u64::MAX)));
        assert!(!e.matches(&json!(u64::MAX - 1)));
        assert!(!Expected::Exact(json!(-1)).matches(&json!(u64::MAX)));
    }

    #[test]
    fn nested_numeric_equality() {
        let e = Expected::Exact(json!({"a": [1, 2.5]}));
        assert!(e.matches(&json!({"a": [1.0, 2.5]})));
        assert!(!e.matches(&json!({"a": [1.0, 2.5], "b": 1})));
    }

    #[test]
    fn pattern_matches_strings_and_scalars() {
        let e = Expected::Pattern(Pattern::new(r"^\d{3}$").unwrap());
        assert!(e.matches(&json!("200")));
        assert!(e.matches(&json!(404)));
        assert!(!e.matches(&json!("20x")));
        assert!(!e.matches(&json!(null)));
    }

    #[test]
    fn range_requires_number() {
        let e = Expected::Range {
            min: 200.0,
            max: 299.0,
        };
        assert!(e.matches(&json!(204)));
        assert!(!e.matches(&json!(300)));
        assert!(!e.matches(&json!("204")));
    }

    #[test]
    fn markers_roundtrip_through_values() {
        for raw in [
            json!({"$pattern": "^a"}),
            json!({"$range": [1.0, 5.0]}),
            json!({"$oneOf": [1, "x"]}),
            json!({"$includes": ["GET"]}),
            json!({"$present": true}),
            json!({"plain": 1}),
        ] {
            let e = Expected::from_value(&raw).unwrap();
            assert_eq!(e.to_value(), raw);
        }
    }

    #[test]
    fn bad_markers_are_rejected() {
        assert!(matches!(
            Expected::from_value(&json!({"$pattern": "("})),
            Err(ExpectedError::Pattern(..))
        ));
        assert!(matches!(
            Expected::from_value(&json!({"$range": [1]})),
            Err(ExpectedError::Marker(..))
        ));
    }

    #[test]
    fn includes_checks_subset_of_list_values() {
        let e = Expected::Includes(vec![json!("GET"), json!("PUT")]);
        assert!(e.matches(&json!("GET, POST, PUT")));
        assert!(!e.matches(&json!("GET, POST")));
        assert!(e.matches(&json!(["PUT", "GET", "HEAD"])));
        assert!(!e.matches(&json!(3)));
    }

    #[test]
    fn integer_type_accepts_whole_floats() {
        assert!(JsonType::Integer.accepts(&json!(3.0)));
        assert!(!JsonType::Integer.accepts(&json!(3.5)));
        assert!(JsonType::Number.accepts(&json!(3)));
        assert_eq!(JsonType::of(&json!(3.5)), JsonType::Number);
    }
}
