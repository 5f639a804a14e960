//! Project configuration for conformance runs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the server under test
    pub base_url: String,

    /// HTTP headers sent with every request (auth, API keys, ...)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Entity under test; default value of the `entity` group state key
    #[serde(default)]
    pub target_entity: Option<String>,

    /// Directory of named JSON-Schema documents (`.json`, `.yaml`, `.yml`)
    #[serde(default)]
    pub schemas: Option<PathBuf>,

    /// Transport strategy name (`network` or `in-process`)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Regex resolving the caller identity from an inbound URL path;
    /// the first capture group is the identity
    #[serde(default = "default_identity_pattern")]
    pub identity_pattern: String,

    /// Timeouts of the async correlation loop
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Per-request transport timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Mask sensitive headers in reports (default: true)
    #[serde(default = "default_true")]
    pub mask_headers: bool,

    /// Local listener receiving async callbacks
    #[serde(default)]
    pub listener: ListenerConfig,
}

/// Where the callback listener binds and what it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// `host:port`; port 0 picks a free one. No listener when unset.
    #[serde(default)]
    pub address: Option<String>,
    /// Status returned to every inbound call
    #[serde(default = "default_listener_status")]
    pub status: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: None,
            status: default_listener_status(),
        }
    }
}

/// Poll interval and drain ceiling, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_correlation_timeout")]
    pub timeout_ms: u64,
}

impl CorrelationConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            timeout_ms: default_correlation_timeout(),
        }
    }
}

fn default_transport() -> String {
    "network".to_string()
}

fn default_identity_pattern() -> String {
    "^/([^/]+)".to_string()
}

const fn default_poll_interval() -> u64 {
    1000
}

const fn default_correlation_timeout() -> u64 {
    10_000
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_listener_status() -> u16 {
    200
}

const fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            headers: HashMap::new(),
            target_entity: None,
            schemas: None,
            transport: default_transport(),
            identity_pattern: default_identity_pattern(),
            correlation: CorrelationConfig::default(),
            request_timeout_secs: default_request_timeout(),
            mask_headers: true,
            listener: ListenerConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;

        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }

    /// Load from default location (.apiconform.toml)
    ///
    /// # Errors
    ///
    /// Returns error if a candidate file exists but cannot be loaded
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_dir(Path::new("."))
    }

    /// Load the first config candidate found in `dir`, or the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a candidate file exists but cannot be loaded
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let candidates = [".apiconform.toml", ".apiconform.json", "apiconform.toml"];

        for name in candidates {
            let path = dir.join(name);
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Self::default())
    }

    /// Validate values serde cannot check.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a bad identity pattern, a zero
    /// poll interval or a listener status outside 100..=599.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pattern = regex::Regex::new(&self.identity_pattern).map_err(|e| {
            ConfigError::Invalid(format!("identity_pattern {:?}: {e}", self.identity_pattern))
        })?;
        if pattern.captures_len() < 2 {
            return Err(ConfigError::Invalid(
                "identity_pattern needs a capture group".to_string(),
            ));
        }
        if self.correlation.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "correlation.poll_interval_ms must be positive".to_string(),
            ));
        }
        if !(100..=599).contains(&self.listener.status) {
            return Err(ConfigError::Invalid(format!(
                "listener.status {} is not an HTTP status",
                self.listener.status
            )));
        }
        Ok(())
    }

    /// Create example config file
    #[must_use]
    pub fn example() -> &'static str {
        r#"# apiconform configuration

# Server under test
base_url = "http://localhost:8080"

# Entity under test (default for the `entity` state key)
# target_entity = "http://localhost:8080/alice"

# Directory of named JSON schemas (post.json, mention.yaml, ...)
# schemas = "schemas"

# Transport: "network" (default) or "in-process"
# transport = "network"

# Caller identity from inbound URL paths (first capture group)
# identity_pattern = "^/([^/]+)"

# Per-request timeout in seconds
# request_timeout_secs = 30

# HTTP headers (auth, api keys)
[headers]
# Authorization = "Bearer your-token-here"

# Async callback correlation
[correlation]
poll_interval_ms = 1000
timeout_ms = 10000

# Listener for async callbacks; suites reach it as {listener_url}
[listener]
# address = "127.0.0.1:0"
status = 200
"#
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {0}: {1}")]
    Io(PathBuf, String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
