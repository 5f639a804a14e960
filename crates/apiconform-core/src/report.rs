//! Verdict policy and report rendering

use std::collections::BTreeMap;
use std::fmt::Write as _;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assertion::{AssertionResult, Expected};
use crate::exchange::CapturedExchange;
use crate::expectation::Target;
use crate::results::{EntryKind, ResultEntry, ResultNode, Summary};

/// Headers masked in rendered reports.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "x-auth-token",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

const MASK: &str = "***";

/// Longest body excerpt printed in terminal output.
const BODY_EXCERPT: usize = 200;

/// How a finished run is judged.
#[derive(Debug, Clone)]
pub struct ReportPolicy {
    /// Inconclusive results and unmatched requests fail the run
    pub strict: bool,
    /// Replace sensitive header values with `***`
    pub mask_headers: bool,
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self {
            strict: false,
            mask_headers: true,
        }
    }
}

impl ReportPolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Default::default()
        }
    }

    /// 0 when everything passed, 1 on failures (and, when strict, on
    /// inconclusive results or unmatched requests).
    #[must_use]
    pub fn exit_code(&self, summary: &Summary) -> i32 {
        if summary.failed > 0 {
            return 1;
        }
        if self.strict && (summary.inconclusive > 0 || summary.unmatched > 0) {
            return 1;
        }
        0
    }

    #[must_use]
    pub fn verdict(&self, summary: &Summary) -> Verdict {
        let exit_code = self.exit_code(summary);
        let status = if exit_code == 0 && summary.total() > 0 {
            VerdictStatus::Pass
        } else {
            VerdictStatus::Fail
        };

        let reason = if summary.total() == 0 {
            "No expectations were checked".to_string()
        } else if status == VerdictStatus::Pass && summary.inconclusive == 0 {
            "All expectations passed".to_string()
        } else {
            let mut parts = Vec::new();
            if summary.failed > 0 {
                parts.push(format!("{} failed", summary.failed));
            }
            if summary.inconclusive > 0 {
                parts.push(format!("{} inconclusive", summary.inconclusive));
            }
            if summary.skipped > 0 {
                parts.push(format!("{} skipped", summary.skipped));
            }
            if summary.unmatched > 0 {
                parts.push(format!("{} unmatched requests", summary.unmatched));
            }
            parts.join("; ")
        };

        Verdict {
            status,
            exit_code,
            reason,
        }
    }
}

/// Final verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub exit_code: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

impl std::fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// Everything a finished run produced, ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Report {
    pub verdict: Verdict,
    pub summary: Summary,
    pub results: ResultNode,
}

impl Report {
    #[must_use]
    pub fn new(mut results: ResultNode, policy: &ReportPolicy) -> Self {
        if policy.mask_headers {
            mask_tree(&mut results);
        }
        let summary = results.summary();
        Self {
            verdict: policy.verdict(&summary),
            summary,
            results,
        }
    }

    /// Human-readable report: failing and inconclusive entries with their
    /// diff and exchange, then the summary.
    #[must_use]
    pub fn render_terminal(&self) -> String {
        let mut out = String::new();
        let mut flagged = Vec::new();
        visit_groups(&self.results, &mut Vec::new(), &mut flagged);

        for (path, entry) in &flagged {
            render_entry(&mut out, &path.join(" > "), entry);
        }

        let s = &self.summary;
        let _ = writeln!(out, "{}: {}", self.verdict.status, self.verdict.reason);
        let _ = write!(
            out,
            "  {} passed, {} failed, {} inconclusive, {} skipped, {} unmatched",
            s.passed, s.failed, s.inconclusive, s.skipped, s.unmatched
        );
        out
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Entries worth printing (anything not plainly passing), with group path.
fn visit_groups<'a>(
    node: &'a ResultNode,
    path: &mut Vec<String>,
    out: &mut Vec<(Vec<String>, &'a ResultEntry)>,
) {
    let ResultNode::Branch(groups) = node else {
        return;
    };
    for (name, group) in groups {
        let ResultNode::Branch(children) = group else {
            continue;
        };
        path.push(name.clone());
        if let Some(ResultNode::Leaves(entries)) = children.get("results") {
            out.extend(
                entries
                    .iter()
                    .filter(|e| e.valid() != Some(true) || e.kind == EntryKind::UnmatchedRequest)
                    .map(|e| (path.clone(), e)),
            );
        }
        if let Some(nested) = children.get("groups") {
            visit_groups(nested, path, out);
        }
        path.pop();
    }
}

fn render_entry(out: &mut String, group: &str, entry: &ResultEntry) {
    let label = match (&entry.kind, entry.valid()) {
        (EntryKind::UnmatchedRequest, _) => "UNMATCHED",
        (EntryKind::SetupFailure { .. }, _) => "SETUP",
        (_, None) => "INCONCLUSIVE",
        _ => "FAIL",
    };
    let _ = writeln!(out, "{label} {group} > {}", entry.name);
    if let EntryKind::SetupFailure { message, skipped } = &entry.kind {
        let _ = writeln!(out, "  {message} ({skipped} skipped)");
    }
    for result in &entry.expected {
        if result.is_inconclusive() {
            let _ = writeln!(out, "  [{}] no matching request observed", result.key);
        }
        for d in &result.diff {
            let _ = write!(out, "  [{}] {:?} {}", result.key, d.op, display_path(&d.path));
            if let Some(v) = &d.value {
                let _ = write!(out, " expected {v}");
            }
            if let Some(c) = &d.current_value {
                let _ = write!(out, " got {c}");
            }
            if let Some(m) = &d.message {
                let _ = write!(out, " ({m})");
            }
            out.push('\n');
        }
    }
    if let Some(ex) = &entry.actual {
        render_exchange(out, ex);
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}

fn render_exchange(out: &mut String, ex: &CapturedExchange) {
    let _ = writeln!(out, "  > {} {}", ex.request.method, ex.request.url);
    if let Some(body) = &ex.request.body {
        let _ = writeln!(out, "    {}", excerpt(body));
    }
    if let Some(resp) = &ex.response {
        let _ = writeln!(out, "  < {}", resp.status);
        if let Some(body) = &resp.body {
            let _ = writeln!(out, "    {}", excerpt(body));
        }
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(BODY_EXCERPT) {
        Some((i, _)) => &body[..i],
        None => body,
    }
}

/// Returns true if the header name matches a known sensitive header (case-insensitive).
fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|&h| name.eq_ignore_ascii_case(h))
}

fn mask_headers(headers: &mut BTreeMap<String, String>) {
    for (key, value) in headers.iter_mut() {
        if is_sensitive_header(key) {
            *value = MASK.to_string();
        }
    }
}

/// `/authorization` style pointer naming a sensitive header.
fn is_sensitive_pointer(path: &str) -> bool {
    path.strip_prefix('/')
        .is_some_and(|name| !name.contains('/') && is_sensitive_header(name))
}

/// Header checks copy expected and actual header values into the result.
fn mask_results(results: &mut [AssertionResult]) {
    let header_keys = [Target::RequestHeaders.key(), Target::ResponseHeaders.key()];
    for result in results
        .iter_mut()
        .filter(|r| header_keys.contains(&r.key.as_str()))
    {
        for entry in result.diff.iter_mut().filter(|d| is_sensitive_pointer(&d.path)) {
            for value in [&mut entry.value, &mut entry.current_value].into_iter().flatten() {
                *value = Value::String(MASK.to_string());
            }
        }
        for assertion in result
            .assertions
            .iter_mut()
            .chain(result.failed_assertions.iter_mut())
            .filter(|a| is_sensitive_pointer(&a.path))
        {
            if !matches!(assertion.expected, Expected::Present) {
                assertion.expected = Expected::Exact(Value::String(MASK.to_string()));
            }
        }
    }
}

fn mask_tree(node: &mut ResultNode) {
    match node {
        ResultNode::Branch(children) => children.values_mut().for_each(mask_tree),
        ResultNode::Leaves(entries) => {
            for entry in entries.iter_mut() {
                mask_results(&mut entry.expected);
                if let Some(ex) = entry.actual.as_mut() {
                    mask_headers(&mut ex.request.headers);
                    if let Some(resp) = ex.response.as_mut() {
                        mask_headers(&mut resp.headers);
                    }
                }
            }
        }
        ResultNode::Flag(_) => {}
    }
}

/// JSON Schema of the JSON report.
#[must_use]
pub fn generate_schema() -> String {
    let schema = schemars::schema_for!(Report);
    serde_json::to_string_pretty(&schema).expect("schema serialization should not fail")
}
