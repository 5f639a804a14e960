//! Order-independent merging of parameter validators

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use url::form_urlencoded;

use super::{ListSpec, ListWindow, ParamKind, ParamValidator, ResponseOptions};
use crate::expectation::ResponseExpectation;

/// Windows keyed by parameter name.
pub type Windows = BTreeMap<String, ListWindow>;

/// Adjustment applied when exactly `names` are merged together.
#[derive(Debug, Clone)]
pub struct MergeRule {
    pub names: BTreeSet<String>,
    /// The rule is skipped when any of these names is part of the merge
    pub not_with: BTreeSet<String>,
    pub apply: fn(&mut Windows, &BTreeMap<String, ParamKind>),
}

impl MergeRule {
    #[must_use]
    pub fn new(names: &[&str], apply: fn(&mut Windows, &BTreeMap<String, ParamKind>)) -> Self {
        Self {
            names: names.iter().map(|n| (*n).to_string()).collect(),
            not_with: BTreeSet::new(),
            apply,
        }
    }

    #[must_use]
    pub fn not_with(mut self, names: &[&str]) -> Self {
        self.not_with.extend(names.iter().map(|n| (*n).to_string()));
        self
    }
}

/// Registered rules, looked up by exact name set.
#[derive(Debug, Clone)]
pub struct MergeRules {
    rules: Vec<MergeRule>,
}

impl Default for MergeRules {
    /// `{before, limit}` (not with `since`) re-slices the before window to
    /// the limit; `{since, limit}` keeps the items nearest the since cursor.
    fn default() -> Self {
        Self::empty()
            .with(MergeRule::new(&["before", "limit"], before_with_limit).not_with(&["since"]))
            .with(MergeRule::new(&["since", "limit"], since_with_limit))
    }
}

impl MergeRules {
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    #[must_use]
    pub fn with(mut self, rule: MergeRule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn find(&self, names: &BTreeSet<String>) -> Option<&MergeRule> {
        self.rules.iter().find(|r| &r.names == names)
    }
}

fn before_with_limit(windows: &mut Windows, kinds: &BTreeMap<String, ParamKind>) {
    let Some(ParamKind::Limit(n)) = kinds.get("limit").copied() else {
        return;
    };
    if let Some(before) = windows.get_mut("before") {
        *before = ListWindow::new(before.start, before.start.saturating_add(n)).intersect(*before);
        windows.remove("limit");
    }
}

fn since_with_limit(windows: &mut Windows, kinds: &BTreeMap<String, ParamKind>) {
    let Some(ParamKind::Limit(n)) = kinds.get("limit").copied() else {
        return;
    };
    if let Some(since) = windows.get_mut("since") {
        *since = ListWindow::new(since.end.saturating_sub(n), since.end).intersect(*since);
        windows.remove("limit");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("nothing to merge")]
    Empty,
    #[error("parameter {0} given more than once")]
    Duplicate(String),
    #[error("parameters are defined over different resource lists")]
    MixedLists,
}

/// Several parameters sent together, with the window their combination
/// selects.
#[derive(Debug, Clone)]
pub struct MergedParamValidator {
    members: Vec<ParamValidator>,
    spec: Arc<ListSpec>,
    applied: Vec<BTreeSet<String>>,
    options: ResponseOptions,
    client_params: BTreeMap<String, String>,
}

impl MergedParamValidator {
    /// Merge `validators` in any order.
    ///
    /// Rules are looked up for the full name set first, then for smaller
    /// subsets (largest first, sorted order within a size). An applied rule
    /// consumes its names. The remaining windows are intersected.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError`] for an empty merge, a repeated parameter name,
    /// or validators over different lists.
    pub fn new(mut validators: Vec<ParamValidator>, rules: &MergeRules) -> Result<Self, ParamError> {
        let Some(first) = validators.first() else {
            return Err(ParamError::Empty);
        };
        let spec = Arc::clone(first.spec());
        if validators
            .iter()
            .any(|v| !Arc::ptr_eq(v.spec(), &spec) && **v.spec() != *spec)
        {
            return Err(ParamError::MixedLists);
        }

        validators.sort_by_key(ParamValidator::name);
        let mut kinds = BTreeMap::new();
        for v in &validators {
            if kinds.insert(v.name().to_string(), v.kind()).is_some() {
                return Err(ParamError::Duplicate(v.name().to_string()));
            }
        }

        let mut windows: Windows = validators
            .iter()
            .map(|v| (v.name().to_string(), v.window()))
            .collect();
        let names: Vec<String> = kinds.keys().cloned().collect();
        let all: BTreeSet<String> = names.iter().cloned().collect();
        let mut remaining = all.clone();
        let mut applied = Vec::new();

        for size in (2..=names.len()).rev() {
            for subset in combinations(&names, size) {
                let subset: BTreeSet<String> = subset.into_iter().collect();
                if !subset.is_subset(&remaining) {
                    continue;
                }
                let Some(rule) = rules.find(&subset) else {
                    continue;
                };
                if !rule.not_with.is_disjoint(&all) {
                    continue;
                }
                (rule.apply)(&mut windows, &kinds);
                remaining.retain(|n| !subset.contains(n));
                applied.push(subset);
            }
        }

        let window = windows
            .values()
            .fold(ListWindow::full(spec.len()), |acc, w| acc.intersect(*w));
        let client_params = validators
            .iter()
            .flat_map(|v| v.client_params().clone())
            .collect();

        Ok(Self {
            options: ResponseOptions::for_window(&spec, window),
            members: validators,
            spec,
            applied,
            client_params,
        })
    }

    /// Constituent names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.members.iter().map(ParamValidator::name).collect()
    }

    #[must_use]
    pub fn members(&self) -> &[ParamValidator] {
        &self.members
    }

    /// Name sets of the rules that were applied, in application order.
    #[must_use]
    pub fn applied_rules(&self) -> &[BTreeSet<String>] {
        &self.applied
    }

    #[must_use]
    pub fn client_params(&self) -> &BTreeMap<String, String> {
        &self.client_params
    }

    #[must_use]
    pub fn response_options(&self) -> &ResponseOptions {
        &self.options
    }

    #[must_use]
    pub fn response_expectation(&self) -> ResponseExpectation {
        self.options.response_expectation(&self.spec)
    }

    /// `limit=2&since=...` style query string, sorted by name.
    #[must_use]
    pub fn query_string(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.client_params)
            .finish()
    }
}

/// All `k`-element combinations of `items`, in lexicographic index order.
fn combinations(items: &[String], k: usize) -> Vec<Vec<String>> {
    if k == 0 {
        return vec![Vec::new()];
    }
    if items.len() < k {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (i, head) in items.iter().enumerate() {
        for mut tail in combinations(&items[i + 1..], k - 1) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}
