//! Pagination parameter combinator
//!
//! Each [`ParamValidator`] knows, for a newest-first resource list, which
//! query value to send and which slice of the list the server must answer
//! with. [`MergedParamValidator`] combines several of them.

mod list;
mod merge;

pub use list::ListValidator;
pub use merge::{MergeRule, MergeRules, MergedParamValidator, ParamError};

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::expectation::ResponseExpectation;

/// The resource list a set of parameters is checked against, with the
/// fields used to build cursors and identify items.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSpec {
    /// Items, newest first
    pub resources: Vec<Value>,
    pub id_field: String,
    pub cursor_fields: Vec<String>,
    pub separator: String,
    /// JSON Pointer to the array in the response body (`""` = body root)
    pub list_pointer: String,
}

impl ListSpec {
    #[must_use]
    pub fn new(resources: Vec<Value>) -> Self {
        Self {
            resources,
            id_field: "id".to_string(),
            cursor_fields: vec!["id".to_string()],
            separator: "+".to_string(),
            list_pointer: String::new(),
        }
    }

    #[must_use]
    pub fn with_id_field(mut self, field: &str) -> Self {
        self.id_field = field.to_string();
        self
    }

    /// Cursor text is each field's value joined by `separator`.
    #[must_use]
    pub fn with_cursor(mut self, fields: &[&str], separator: &str) -> Self {
        self.cursor_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self.separator = separator.to_string();
        self
    }

    #[must_use]
    pub fn with_list_pointer(mut self, pointer: &str) -> Self {
        self.list_pointer = pointer.to_string();
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Cursor for item `index`; empty when out of range.
    #[must_use]
    pub fn cursor(&self, index: usize) -> String {
        let Some(item) = self.resources.get(index) else {
            return String::new();
        };
        self.cursor_fields
            .iter()
            .map(|f| match item.get(f) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    /// Ids of the items inside `window`, in list order.
    #[must_use]
    pub fn ids(&self, window: ListWindow) -> Vec<Value> {
        window
            .clamp(self.len())
            .range()
            .filter_map(|i| self.resources.get(i))
            .map(|item| item.get(&self.id_field).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Shorthands producing one validator each.
pub trait ListSpecExt {
    fn limit(&self, n: usize) -> ParamValidator;
    fn before(&self, index: usize) -> ParamValidator;
    fn since(&self, index: usize) -> ParamValidator;
    fn until(&self, index: usize) -> ParamValidator;
}

impl ListSpecExt for Arc<ListSpec> {
    fn limit(&self, n: usize) -> ParamValidator {
        ParamValidator::new(ParamKind::Limit(n), Arc::clone(self))
    }

    fn before(&self, index: usize) -> ParamValidator {
        ParamValidator::new(ParamKind::Before(index), Arc::clone(self))
    }

    fn since(&self, index: usize) -> ParamValidator {
        ParamValidator::new(ParamKind::Since(index), Arc::clone(self))
    }

    fn until(&self, index: usize) -> ParamValidator {
        ParamValidator::new(ParamKind::Until(index), Arc::clone(self))
    }
}

/// Built-in parameter kinds; indices point into the resource list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `limit=n`, window `[0, n)`
    Limit(usize),
    /// `before=<cursor of i>`, window `[i+1, len)`
    Before(usize),
    /// `since=<cursor of i>`, window `[0, i)`
    Since(usize),
    /// `until=<cursor of i>`, window `[0, i)`
    Until(usize),
}

impl ParamKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Limit(_) => "limit",
            Self::Before(_) => "before",
            Self::Since(_) => "since",
            Self::Until(_) => "until",
        }
    }

    /// The index or count this kind carries.
    #[must_use]
    pub const fn arg(self) -> usize {
        match self {
            Self::Limit(n) | Self::Before(n) | Self::Since(n) | Self::Until(n) => n,
        }
    }
}

/// Half-open index range `[start, end)` into the resource list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListWindow {
    pub start: usize,
    pub end: usize,
}

impl ListWindow {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn full(len: usize) -> Self {
        Self::new(0, len)
    }

    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end).max(start);
        Self::new(start, end)
    }

    #[must_use]
    pub fn clamp(self, len: usize) -> Self {
        self.intersect(Self::full(len))
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn range(self) -> std::ops::Range<usize> {
        self.start..self.end.max(self.start)
    }
}

/// What the response to a parameterised list request must contain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOptions {
    pub window: ListWindow,
    /// Expected item ids, in order
    pub ids: Vec<Value>,
}

impl ResponseOptions {
    fn for_window(spec: &ListSpec, window: ListWindow) -> Self {
        let window = window.clamp(spec.len());
        Self {
            window,
            ids: spec.ids(window),
        }
    }

    /// `200` plus an exact, ordered id check of the list.
    #[must_use]
    pub fn response_expectation(&self, spec: &ListSpec) -> ResponseExpectation {
        ResponseExpectation::new().status(200).validator(ListValidator::new(
            &spec.list_pointer,
            &spec.id_field,
            self.ids.clone(),
        ))
    }
}

/// One pagination parameter over a shared resource list.
///
/// Client params and response options are computed once on first use.
#[derive(Debug)]
pub struct ParamValidator {
    kind: ParamKind,
    spec: Arc<ListSpec>,
    client_params: OnceLock<BTreeMap<String, String>>,
    response_options: OnceLock<ResponseOptions>,
}

impl Clone for ParamValidator {
    fn clone(&self) -> Self {
        Self::new(self.kind, Arc::clone(&self.spec))
    }
}

impl ParamValidator {
    #[must_use]
    pub fn new(kind: ParamKind, spec: Arc<ListSpec>) -> Self {
        Self {
            kind,
            spec,
            client_params: OnceLock::new(),
            response_options: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    #[must_use]
    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    #[must_use]
    pub fn spec(&self) -> &Arc<ListSpec> {
        &self.spec
    }

    /// Query parameters to send.
    pub fn client_params(&self) -> &BTreeMap<String, String> {
        self.client_params.get_or_init(|| {
            let value = match self.kind {
                ParamKind::Limit(n) => n.to_string(),
                ParamKind::Before(i) | ParamKind::Since(i) | ParamKind::Until(i) => {
                    self.spec.cursor(i)
                }
            };
            BTreeMap::from([(self.name().to_string(), value)])
        })
    }

    /// Window this parameter alone selects.
    #[must_use]
    pub fn window(&self) -> ListWindow {
        let len = self.spec.len();
        match self.kind {
            ParamKind::Limit(n) => ListWindow::new(0, n),
            ParamKind::Before(i) => ListWindow::new(i.saturating_add(1), len),
            ParamKind::Since(i) | ParamKind::Until(i) => ListWindow::new(0, i),
        }
        .clamp(len)
    }

    pub fn response_options(&self) -> &ResponseOptions {
        self.response_options
            .get_or_init(|| ResponseOptions::for_window(&self.spec, self.window()))
    }

    #[must_use]
    pub fn response_expectation(&self) -> ResponseExpectation {
        self.response_options().response_expectation(&self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn posts(n: usize) -> Arc<ListSpec> {
        let resources = (0..n)
            .map(|i| json!({"id": format!("p{i}"), "published_at": 1000 - i}))
            .collect();
        Arc::new(ListSpec::new(resources).with_cursor(&["published_at", "id"], "+"))
    }

    #[test]
    fn cursor_joins_configured_fields() {
        let spec = posts(3);
        assert_eq!(spec.cursor(1), "999+p1");
        assert_eq!(spec.cursor(7), "");
    }

    #[test]
    fn single_param_windows() {
        let spec = posts(5);
        assert_eq!(spec.limit(2).window(), ListWindow::new(0, 2));
        assert_eq!(spec.before(1).window(), ListWindow::new(2, 5));
        assert_eq!(spec.since(3).window(), ListWindow::new(0, 3));
        assert_eq!(spec.until(3).window(), ListWindow::new(0, 3));
        assert_eq!(spec.limit(9).window(), ListWindow::new(0, 5));
        assert!(spec.before(4).window().is_empty());
    }

    #[test]
    fn client_params_are_memoized_per_validator() {
        let spec = posts(3);
        let v = spec.before(0);
        let first = v.client_params() as *const _;
        assert_eq!(v.client_params().get("before").map(String::as_str), Some("1000+p0"));
        assert_eq!(first, v.client_params() as *const _);
    }

    #[test]
    fn response_options_list_ids_in_order() {
        let spec = posts(4);
        let opts = spec.before(0).response_options().clone();
        assert_eq!(opts.ids, vec![json!("p1"), json!("p2"), json!("p3")]);
    }

    #[test]
    fn window_intersection() {
        let a = ListWindow::new(1, 5);
        assert_eq!(a.intersect(ListWindow::new(3, 9)), ListWindow::new(3, 5));
        assert!(a.intersect(ListWindow::new(6, 9)).is_empty());
    }
}
