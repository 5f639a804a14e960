//! Patch-style diff entries

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-Patch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Add,
    Replace,
    Remove,
}

/// One step of the patch that would turn the actual value into an
/// acceptable one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DiffEntry {
    pub op: DiffOp,
    pub path: String,
    /// Proposed value (absent for `remove`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DiffEntry {
    #[must_use]
    pub fn add(path: &str, value: Value) -> Self {
        Self {
            op: DiffOp::Add,
            path: path.to_string(),
            value: Some(value),
            current_value: None,
            message: None,
        }
    }

    #[must_use]
    pub fn replace(path: &str, value: Value, current: Value) -> Self {
        Self {
            op: DiffOp::Replace,
            path: path.to_string(),
            value: Some(value),
            current_value: Some(current),
            message: None,
        }
    }

    #[must_use]
    pub fn remove(path: &str, current: Value) -> Self {
        Self {
            op: DiffOp::Remove,
            path: path.to_string(),
            value: None,
            current_value: Some(current),
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_like_json_patch() {
        let d = DiffEntry::replace("/id", json!("Tent!"), json!("Foo Bar"));
        assert_eq!(
            serde_json::to_value(&d).unwrap(),
            json!({"op": "replace", "path": "/id", "value": "Tent!", "current_value": "Foo Bar"})
        );
        let r = DiffEntry::remove("/extra", json!(1));
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({"op": "remove", "path": "/extra", "current_value": 1})
        );
    }
}
