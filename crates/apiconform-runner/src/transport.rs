//! HTTP transports
//!
//! The engine never talks HTTP directly: every request goes through a named
//! [`Transport`]. `network` uses a blocking reqwest client; `in-process`
//! hands the request to a closure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use url::form_urlencoded;

use apiconform_core::{CapturedRequest, CapturedResponse};

/// Request about to be sent; hooks may still change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl OutgoingRequest {
    #[must_use]
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body with `Content-Type: application/json`.
    #[must_use]
    pub fn with_json(self, body: &Value) -> Self {
        self.with_header("Content-Type", "application/json")
            .with_body(body.to_string())
    }

    /// Append `name=value` to the query string.
    #[must_use]
    pub fn with_query(mut self, params: &BTreeMap<String, String>) -> Self {
        if params.is_empty() {
            return self;
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        let sep = if self.url.contains('?') { '&' } else { '?' };
        self.url = format!("{}{sep}{query}", self.url);
        self
    }

    /// Apply a hook, e.g. one injecting an invalid body.
    #[must_use]
    pub fn with_hook(mut self, hook: &RequestHook) -> Self {
        hook(&mut self);
        self
    }

    /// Snapshot as it will be sent.
    #[must_use]
    pub fn capture(&self) -> CapturedRequest {
        let mut request = CapturedRequest::new(&self.method, &self.url);
        for (k, v) in &self.headers {
            request.insert_header(k, v);
        }
        request.body.clone_from(&self.body);
        request
    }
}

/// Mutates a request just before it is sent.
pub type RequestHook = Arc<dyn Fn(&mut OutgoingRequest) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TransportError`] when no response could be obtained.
    fn send(&self, request: &OutgoingRequest) -> Result<CapturedResponse, TransportError>;
}

/// Real HTTP over a blocking reqwest client.
pub struct NetworkTransport {
    client: reqwest::blocking::Client,
}

impl NetworkTransport {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for NetworkTransport {
    fn send(&self, request: &OutgoingRequest) -> Result<CapturedResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::InvalidMethod(request.method.clone()))?;

        let mut req = self.client.request(method, &request.url);
        for (k, v) in &request.headers {
            // Values reqwest rejects (control characters) cannot reach the server.
            if reqwest::header::HeaderValue::from_str(v).is_ok() {
                req = req.header(k, v);
            }
        }
        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }

        let resp = req
            .send()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut captured = CapturedResponse::new(resp.status().as_u16());
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                captured = captured.with_header(name.as_str(), v);
            }
        }
        let body = resp
            .text()
            .map_err(|e| TransportError::Body(e.to_string()))?;
        if !body.is_empty() {
            captured = captured.with_body(body);
        }
        Ok(captured)
    }
}

/// Direct dispatch to an in-process handler.
pub struct InProcessTransport {
    handler: Box<dyn Fn(&CapturedRequest) -> CapturedResponse + Send + Sync>,
}

impl InProcessTransport {
    #[must_use]
    pub fn new(handler: impl Fn(&CapturedRequest) -> CapturedResponse + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }
}

impl Transport for InProcessTransport {
    fn send(&self, request: &OutgoingRequest) -> Result<CapturedResponse, TransportError> {
        Ok((self.handler)(&request.capture()))
    }
}

/// Named transport strategies with one default.
#[derive(Clone)]
pub struct Transports {
    named: BTreeMap<String, Arc<dyn Transport>>,
    default: String,
}

impl Transports {
    #[must_use]
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            named: BTreeMap::new(),
            default: default.into(),
        }
    }

    /// Registry with a single in-process transport as default.
    #[must_use]
    pub fn in_process(
        handler: impl Fn(&CapturedRequest) -> CapturedResponse + Send + Sync + 'static,
    ) -> Self {
        Self::new("in-process").with("in-process", InProcessTransport::new(handler))
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        self.named.insert(name.into(), Arc::new(transport));
        self
    }

    /// # Errors
    ///
    /// Returns [`TransportError::Unknown`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::Unknown(name.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`TransportError::Unknown`] when the default is unregistered.
    pub fn default_transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.get(&self.default)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.named.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transports")
            .field("named", &self.names())
            .field("default", &self.default)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("unknown transport: {0}")]
    Unknown(String),
    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("cannot read response body: {0}")]
    Body(String),
    #[error("cannot build HTTP client: {0}")]
    Client(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_is_encoded_and_appended() {
        let params = BTreeMap::from([
            ("limit".to_string(), "2".to_string()),
            ("before".to_string(), "999+p1".to_string()),
        ]);
        let req = OutgoingRequest::new("get", "http://x/posts?a=1").with_query(&params);
        assert_eq!(req.url, "http://x/posts?a=1&before=999%2Bp1&limit=2");
        assert_eq!(req.method, "GET");
        let captured = req.capture();
        assert_eq!(captured.params["before"], "999+p1");
    }

    #[test]
    fn hooks_mutate_before_send() {
        let hook: RequestHook = Arc::new(|r: &mut OutgoingRequest| {
            r.body = Some("{not json".to_string());
        });
        let req = OutgoingRequest::new("POST", "http://x/posts")
            .with_json(&json!({"a": 1}))
            .with_hook(&hook);
        assert_eq!(req.body.as_deref(), Some("{not json"));
    }

    #[test]
    fn in_process_dispatches_to_handler() {
        let transports = Transports::in_process(|req| {
            CapturedResponse::new(200).with_json(&json!({"path": req.path}))
        });
        let t = transports.default_transport().unwrap();
        let resp = t
            .send(&OutgoingRequest::new("GET", "http://local/posts/1"))
            .unwrap();
        assert_eq!(resp.json(), json!({"path": "/posts/1"}));
    }

    #[test]
    fn unknown_transport_is_an_error() {
        let transports = Transports::new("network");
        assert_eq!(
            transports.default_transport().err(),
            Some(TransportError::Unknown("network".into()))
        );
    }
}
