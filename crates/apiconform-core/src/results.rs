//! Hierarchical results tree
//!
//! ```text
//! {
//!   "posts": {
//!     "results": [ {name, kind, expected: {key: result}, actual}, ... ],
//!     "valid": false,
//!     "groups": { "replies": { ... } }
//!   }
//! }
//! ```
//!
//! Merging deep-merges branches, concatenates result lists and lets `false`
//! win on flag collisions, so an invalid child marks every merged summary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use schemars::JsonSchema;
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::assertion::AssertionResult;
use crate::exchange::CapturedExchange;

const RESULTS_KEY: &str = "results";
const VALID_KEY: &str = "valid";
const GROUPS_KEY: &str = "groups";

/// What produced a result entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// Direct request/response check
    Check,
    /// Expectation matched (or not) against an inbound call
    Async { negative: bool },
    /// Group aborted; `skipped` expectations never ran
    SetupFailure { message: String, skipped: usize },
    /// Inbound call no expectation claimed
    UnmatchedRequest,
}

/// One leaf: the results of checking one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResultEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Results keyed by validator key
    #[serde(
        serialize_with = "serialize_keyed",
        deserialize_with = "deserialize_keyed",
        default
    )]
    #[schemars(with = "BTreeMap<String, AssertionResult>")]
    pub expected: Vec<AssertionResult>,
    /// The exchange the results were computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<CapturedExchange>,
}

impl ResultEntry {
    #[must_use]
    pub fn check(
        name: impl Into<String>,
        expected: Vec<AssertionResult>,
        actual: CapturedExchange,
    ) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Check,
            expected,
            actual: Some(actual),
        }
    }

    #[must_use]
    pub fn setup_failure(
        name: impl Into<String>,
        message: impl Into<String>,
        skipped: usize,
        partial: Vec<AssertionResult>,
        actual: Option<CapturedExchange>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::SetupFailure {
                message: message.into(),
                skipped,
            },
            expected: partial,
            actual,
        }
    }

    #[must_use]
    pub fn unmatched(actual: CapturedExchange) -> Self {
        Self {
            name: format!("unmatched request {}", actual.request.label()),
            kind: EntryKind::UnmatchedRequest,
            expected: Vec::new(),
            actual: Some(actual),
        }
    }

    /// `Some(false)` when anything failed, `None` when nothing failed but
    /// something was inconclusive, `Some(true)` otherwise.
    #[must_use]
    pub fn valid(&self) -> Option<bool> {
        if matches!(self.kind, EntryKind::SetupFailure { .. }) {
            return Some(false);
        }
        if self.expected.iter().any(AssertionResult::is_invalid) {
            Some(false)
        } else if self.expected.iter().any(AssertionResult::is_inconclusive) {
            None
        } else {
            Some(true)
        }
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        match self.kind {
            EntryKind::SetupFailure { skipped, .. } => skipped,
            _ => 0,
        }
    }
}

/// Serialize results as a map keyed by validator key, in validator order;
/// repeated keys get a `#n` suffix.
fn serialize_keyed<S: Serializer>(results: &[AssertionResult], s: S) -> Result<S::Ok, S::Error> {
    let mut used = BTreeSet::new();
    let mut map = s.serialize_map(Some(results.len()))?;
    for r in results {
        let mut key = r.key.clone();
        let mut n = 2;
        while used.contains(&key) {
            key = format!("{}#{n}", r.key);
            n += 1;
        }
        map.serialize_entry(&key, r)?;
        used.insert(key);
    }
    map.end()
}

/// Results in document order; the map keys are only labels.
fn deserialize_keyed<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<AssertionResult>, D::Error> {
    struct Keyed;

    impl<'de> Visitor<'de> for Keyed {
        type Value = Vec<AssertionResult>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of assertion results")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((IgnoredAny, result)) = map.next_entry::<IgnoredAny, AssertionResult>()? {
                out.push(result);
            }
            Ok(out)
        }
    }

    d.deserialize_map(Keyed)
}

/// A node of the results tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ResultNode {
    Flag(bool),
    Leaves(Vec<ResultEntry>),
    Branch(BTreeMap<String, ResultNode>),
}

impl Default for ResultNode {
    fn default() -> Self {
        Self::Branch(BTreeMap::new())
    }
}

impl ResultNode {
    /// Summary node for one group: its entries and validity flag.
    #[must_use]
    pub fn group(entries: Vec<ResultEntry>) -> Self {
        let valid = entries.iter().all(|e| e.valid() != Some(false));
        Self::Branch(BTreeMap::from([
            (RESULTS_KEY.to_string(), Self::Leaves(entries)),
            (VALID_KEY.to_string(), Self::Flag(valid)),
        ]))
    }

    /// Place `node` under a group path; nested groups live under `groups`.
    #[must_use]
    pub fn at_path(path: &[String], node: Self) -> Self {
        let Some((last, parents)) = path.split_last() else {
            return node;
        };
        let mut current = Self::Branch(BTreeMap::from([(last.clone(), node)]));
        for name in parents.iter().rev() {
            current = Self::Branch(BTreeMap::from([(
                name.clone(),
                Self::Branch(BTreeMap::from([(GROUPS_KEY.to_string(), current)])),
            )]));
        }
        current
    }

    /// Merge `other` into `self`.
    ///
    /// Branches merge key by key, leaf lists concatenate and a `false` flag
    /// on either side wins. Otherwise mismatched kinds keep `other`.
    pub fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::Branch(mine), Self::Branch(theirs)) => {
                for (key, node) in theirs {
                    match mine.get_mut(&key) {
                        Some(existing) => existing.merge(node),
                        None => {
                            mine.insert(key, node);
                        }
                    }
                }
            }
            (Self::Leaves(mine), Self::Leaves(theirs)) => mine.extend(theirs),
            (Self::Flag(false), _) => {}
            (mine, theirs) => *mine = theirs,
        }
    }

    #[must_use]
    pub fn merged(mut self, other: Self) -> Self {
        self.merge(other);
        self
    }

    /// Every entry, depth first in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<&ResultEntry> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a ResultEntry>) {
        match self {
            Self::Leaves(entries) => out.extend(entries),
            Self::Branch(children) => children.values().for_each(|c| c.collect(out)),
            Self::Flag(_) => {}
        }
    }

    /// Child by group path, following `groups` below the top level.
    #[must_use]
    pub fn find(&self, path: &[&str]) -> Option<&Self> {
        let mut current = self;
        for (i, name) in path.iter().enumerate() {
            let Self::Branch(children) = current else {
                return None;
            };
            current = if i == 0 {
                children.get(*name)?
            } else {
                match children.get(GROUPS_KEY)? {
                    Self::Branch(groups) => groups.get(*name)?,
                    _ => return None,
                }
            };
        }
        Some(current)
    }

    /// The `valid` flag of a group node.
    #[must_use]
    pub fn flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            Self::Branch(children) => match children.get(VALID_KEY) {
                Some(Self::Flag(b)) => Some(*b),
                _ => None,
            },
            Self::Leaves(_) => None,
        }
    }

    #[must_use]
    pub fn summary(&self) -> Summary {
        Summary::of(self.entries())
    }
}

/// Counts shown by the reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub inconclusive: usize,
    pub skipped: usize,
    pub unmatched: usize,
}

impl Summary {
    /// Results are counted individually; a setup failure counts as one
    /// failure plus its partial results and skip count.
    #[must_use]
    pub fn of<'a>(entries: impl IntoIterator<Item = &'a ResultEntry>) -> Self {
        let mut s = Self::default();
        for entry in entries {
            match entry.kind {
                EntryKind::UnmatchedRequest => {
                    s.unmatched += 1;
                    continue;
                }
                EntryKind::SetupFailure { skipped, .. } => {
                    s.failed += 1;
                    s.skipped += skipped;
                }
                EntryKind::Check | EntryKind::Async { .. } => {}
            }
            for r in &entry.expected {
                match r.valid {
                    Some(true) => s.passed += 1,
                    Some(false) => s.failed += 1,
                    None => s.inconclusive += 1,
                }
            }
        }
        s
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.inconclusive + self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::{Assertion, Expected};
    use crate::exchange::CapturedRequest;
    use serde_json::json;

    fn result(key: &str, actual: i64) -> AssertionResult {
        AssertionResult::evaluate(
            key,
            vec![Assertion::new("", Expected::Exact(json!(1)))],
            &json!(actual),
        )
    }

    fn entry(name: &str, valid: bool) -> ResultEntry {
        ResultEntry::check(
            name,
            vec![result("status", if valid { 1 } else { 2 })],
            CapturedExchange::new("x", CapturedRequest::new("GET", "/")),
        )
    }

    #[test]
    fn merge_concatenates_and_false_wins() {
        let a = ResultNode::at_path(&["posts".into()], ResultNode::group(vec![entry("a", true)]));
        let b = ResultNode::at_path(&["posts".into()], ResultNode::group(vec![entry("b", false)]));
        let merged = a.clone().merged(b.clone());
        let posts = merged.find(&["posts"]).unwrap();
        assert_eq!(posts.flag(), Some(false));
        assert_eq!(merged.entries().len(), 2);

        let reversed = b.merged(a);
        assert_eq!(reversed.find(&["posts"]).unwrap().flag(), Some(false));
    }

    #[test]
    fn nested_groups_live_under_groups_key() {
        let tree = ResultNode::at_path(
            &["posts".into(), "replies".into()],
            ResultNode::group(vec![entry("r", true)]),
        );
        let value = serde_json::to_value(&tree).unwrap();
        assert!(value["posts"]["groups"]["replies"]["results"].is_array());
        assert_eq!(value["posts"]["groups"]["replies"]["valid"], json!(true));
        assert!(tree.find(&["posts", "replies"]).is_some());
    }

    #[test]
    fn entries_serialize_as_expected_and_actual() {
        let e = entry("get", false);
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["expected"]["status"]["valid"], json!(false));
        assert_eq!(value["actual"]["request"]["method"], json!("GET"));
        assert_eq!(value["kind"]["type"], json!("check"));

        let back: ResultEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn repeated_keys_get_suffixes() {
        let e = ResultEntry::check(
            "two",
            vec![result("list", 1), result("list", 1)],
            CapturedExchange::new("x", CapturedRequest::new("GET", "/")),
        );
        let value = serde_json::to_value(&e).unwrap();
        assert!(value["expected"]["list#2"].is_object());
    }

    #[test]
    fn keyed_results_keep_validator_order() {
        let e = ResultEntry::check(
            "ordered",
            vec![result("status", 1), result("headers", 2), result("body", 1)],
            CapturedExchange::new("x", CapturedRequest::new("GET", "/")),
        );
        let text = serde_json::to_string(&e).unwrap();
        let status = text.find("\"status\"").unwrap();
        let headers = text.find("\"headers\"").unwrap();
        assert!(status < headers);

        let back: ResultEntry = serde_json::from_str(&text).unwrap();
        let keys: Vec<&str> = back.expected.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["status", "headers", "body"]);
    }

    #[test]
    fn summary_counts_every_outcome() {
        let mut entries = vec![entry("ok", true), entry("bad", false)];
        entries.push(ResultEntry::setup_failure("setup", "no post", 4, vec![], None));
        entries.push(ResultEntry {
            name: "async".into(),
            kind: EntryKind::Async { negative: false },
            expected: vec![AssertionResult::inconclusive("PUT /webhook", vec![])],
            actual: None,
        });
        entries.push(ResultEntry::unmatched(CapturedExchange::new(
            "u",
            CapturedRequest::new("POST", "/hook"),
        )));
        let s = ResultNode::group(entries).summary();
        assert_eq!(
            s,
            Summary {
                passed: 1,
                failed: 2,
                inconclusive: 1,
                skipped: 4,
                unmatched: 1
            }
        );
    }

    #[test]
    fn mismatched_kinds_keep_incoming_unless_false() {
        let mut flag = ResultNode::Flag(true);
        flag.merge(ResultNode::Leaves(vec![]));
        assert_eq!(flag, ResultNode::Leaves(vec![]));

        let mut falsy = ResultNode::Flag(false);
        falsy.merge(ResultNode::Flag(true));
        assert_eq!(falsy, ResultNode::Flag(false));
    }
}
