//! Captured HTTP exchanges
//!
//! A request/response pair is captured once per HTTP call and never mutated
//! afterwards. Header names are stored lowercased so lookups are
//! case-insensitive.

use std::collections::BTreeMap;
use std::io::Read;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Snapshot of an HTTP request, outgoing or inbound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CapturedRequest {
    pub method: String,
    /// Path without query string
    pub path: String,
    /// Full URL as sent or received
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Decoded query parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl CapturedRequest {
    /// Build a request snapshot from method and URL; path and query are split out.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let (path, params) = split_url(&url);
        Self {
            method: method.into().to_ascii_uppercase(),
            path,
            url,
            headers: BTreeMap::new(),
            body: None,
            params,
        }
    }

    /// Capture a request whose body is still an unread stream.
    ///
    /// The stream is drained once and kept, so later validators can read the
    /// body as often as they like.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the body cannot be read.
    pub fn from_reader(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: impl IntoIterator<Item = (String, String)>,
        mut body: impl Read,
    ) -> std::io::Result<Self> {
        let mut raw = String::new();
        body.read_to_string(&mut raw)?;
        let mut req = Self::new(method, url);
        for (name, value) in headers {
            req.insert_header(&name, &value);
        }
        if !raw.is_empty() {
            req.body = Some(raw);
        }
        Ok(req)
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.insert_header(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Insert a header; repeated names are joined with `", "`.
    pub fn insert_header(&mut self, name: &str, value: &str) {
        insert_header(&mut self.headers, name, value);
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body parsed as JSON; missing or malformed bodies become `{}`.
    #[must_use]
    pub fn json(&self) -> Value {
        parse_json_body(self.body.as_deref())
    }

    /// Operation label, e.g. `"PUT /webhook"`
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Snapshot of an HTTP response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CapturedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl CapturedResponse {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        insert_header(&mut self.headers, name, value);
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

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body parsed as JSON; missing or malformed bodies become `{}`.
    #[must_use]
    pub fn json(&self) -> Value {
        parse_json_body(self.body.as_deref())
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One request plus the response it produced (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CapturedExchange {
    /// Unique identifier for this exchange
    pub id: String,
    pub request: CapturedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
}

impl CapturedExchange {
    #[must_use]
    pub fn new(id: impl Into<String>, request: CapturedRequest) -> Self {
        Self {
            id: id.into(),
            request,
            response: None,
        }
    }

    #[must_use]
    pub fn with_response(mut self, response: CapturedResponse) -> Self {
        self.response = Some(response);
        self
    }
}

fn insert_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    let key = name.to_ascii_lowercase();
    match headers.get_mut(&key) {
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(value);
        }
        None => {
            headers.insert(key, value.to_string());
        }
    }
}

fn parse_json_body(body: Option<&str>) -> Value {
    body.and_then(|b| serde_json::from_str(b).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

/// `"http://host:1/a/b?x=1&y=%20"` → (`"/a/b"`, `{x: "1", y: " "}`)
///
/// Relative URLs resolve against a placeholder origin.
fn split_url(url: &str) -> (String, BTreeMap<String, String>) {
    let parsed = Url::parse(url).or_else(|_| Url::parse("http://localhost/")?.join(url));
    match parsed {
        Ok(parsed) => {
            let params = parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            (parsed.path().to_string(), params)
        }
        Err(_) => (url.to_string(), BTreeMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_path_and_query() {
        let req = CapturedRequest::new("get", "http://localhost:8080/posts?limit=2&before=a%2Bb");
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/posts");
        assert_eq!(req.params.get("limit").map(String::as_str), Some("2"));
        assert_eq!(req.params.get("before").map(String::as_str), Some("a+b"));
    }

    #[test]
    fn relative_url_keeps_path() {
        let req = CapturedRequest::new("PUT", "/alice/webhook");
        assert_eq!(req.path, "/alice/webhook");
        assert!(req.params.is_empty());
    }

    #[test]
    fn host_only_url_maps_to_root() {
        let req = CapturedRequest::new("GET", "https://example.com");
        assert_eq!(req.path, "/");
    }

    #[test]
    fn host_only_url_keeps_query() {
        let req = CapturedRequest::new("GET", "http://example.com?limit=2&q=a+b");
        assert_eq!(req.path, "/");
        assert_eq!(req.params.get("limit").map(String::as_str), Some("2"));
        assert_eq!(req.params.get("q").map(String::as_str), Some("a b"));
    }

    #[test]
    fn relative_url_decodes_query() {
        let req = CapturedRequest::new("GET", "/posts?before=999%2Bp1#frag");
        assert_eq!(req.path, "/posts");
        assert_eq!(req.params.get("before").map(String::as_str), Some("999+p1"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = CapturedRequest::new("GET", "/x")
            .with_header("Content-Type", "application/json")
            .with_header("Accept", "a")
            .with_header("accept", "b");
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("ACCEPT"), Some("a, b"));
    }

    #[test]
    fn malformed_body_becomes_empty_object() {
        let resp = CapturedResponse::new(200).with_body("not json");
        assert_eq!(resp.json(), json!({}));
        assert_eq!(CapturedResponse::new(204).json(), json!({}));
    }

    #[test]
    fn from_reader_materializes_body_once() {
        let body = std::io::Cursor::new(br#"{"id":"Tent!"}"#.to_vec());
        let req = CapturedRequest::from_reader(
            "PUT",
            "/alice/webhook",
            vec![("X-Sig".to_string(), "abc".to_string())],
            body,
        )
        .unwrap();
        assert_eq!(req.json(), json!({"id": "Tent!"}));
        assert_eq!(req.json(), json!({"id": "Tent!"}));
        assert_eq!(req.header("x-sig"), Some("abc"));
    }

    #[test]
    fn exchange_serialization_roundtrip() {
        let ex = CapturedExchange::new("ab12", CapturedRequest::new("GET", "/a?b=c"))
            .with_response(CapturedResponse::new(200).with_json(&json!({"ok": true})));
        let text = serde_json::to_string(&ex).unwrap();
        let parsed: CapturedExchange = serde_json::from_str(&text).unwrap();
        assert_eq!(ex, parsed);
    }
}
