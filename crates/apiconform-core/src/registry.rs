//! Named JSON-Schema registry
//!
//! Schemas are looked up by name (file stem when loaded from a directory).
//! An unknown name is a configuration error, never an assertion failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Value>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.json`, `.yaml` and `.yml` file in `dir`, keyed by file stem.
    ///
    /// # Errors
    ///
    /// Returns error if the directory or a file cannot be read or parsed.
    pub fn load_dir(dir: &Path) -> Result<Self, RegistryError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| RegistryError::Io(dir.to_path_buf(), e.to_string()))?;

        let mut registry = Self::new();
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e, "json" | "yaml" | "yml"))
            })
            .collect();
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| RegistryError::Io(path.clone(), e.to_string()))?;
            let schema = parse_document(&path, &content)?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            registry.insert(name, schema);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, schema: Value) {
        self.schemas.insert(name.into(), schema);
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.insert(name, schema);
        self
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<&Value, RegistryError> {
        self.schemas
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Parse a JSON or YAML document, by extension first and content second.
///
/// # Errors
///
/// Returns [`RegistryError::Parse`] when the content is not valid.
pub fn parse_document(path: &Path, content: &str) -> Result<Value, RegistryError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let parse_err = |kind: &str, e: String| {
        RegistryError::Parse(path.to_path_buf(), format!("Invalid {kind}: {e}"))
    };

    match ext.as_str() {
        "yaml" | "yml" => serde_yml::from_str(content).map_err(|e| parse_err("YAML", e.to_string())),
        "json" => serde_json::from_str(content).map_err(|e| parse_err("JSON", e.to_string())),
        _ => {
            if content.trim_start().starts_with('{') {
                serde_json::from_str(content).map_err(|e| parse_err("JSON", e.to_string()))
            } else {
                serde_yml::from_str(content).map_err(|e| parse_err("YAML", e.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("schema not found: {0}")]
    NotFound(String),
    #[error("Cannot read {0}: {1}")]
    Io(PathBuf, String),
    #[error("Parse error in {0}: {1}")]
    Parse(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_name_is_not_found() {
        let reg = SchemaRegistry::new().with("post", json!({"type": "object"}));
        assert!(reg.get("post").is_ok());
        assert_eq!(
            reg.get("profile"),
            Err(RegistryError::NotFound("profile".into()))
        );
    }

    #[test]
    fn loads_json_and_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("post.json"), r#"{"type": "object"}"#).unwrap();
        std::fs::write(
            dir.path().join("mention.yaml"),
            "type: object\nrequired: [entity]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let reg = SchemaRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(
            reg.get("mention").unwrap(),
            &json!({"type": "object", "required": ["entity"]})
        );
    }

    #[test]
    fn invalid_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{nope").unwrap();
        assert!(matches!(
            SchemaRegistry::load_dir(dir.path()),
            Err(RegistryError::Parse(..))
        ));
    }

    #[test]
    fn missing_dir_is_io_error() {
        let err = SchemaRegistry::load_dir(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, RegistryError::Io(..)));
    }
}
