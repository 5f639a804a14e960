//! Async correlation
//!
//! Groups register [`AsyncExpectation`]s for calls the server will make back
//! to us. A [`Correlator`] polls the inbound log and pairs each expectation
//! with its best candidate:
//!
//! 1. keep entries from the expected identity whose method/path match
//! 2. score each by the number of assertions that hold
//! 3. take the highest score; ties go to the earliest arrival
//!
//! A claimed entry is removed from the log so no two expectations share it.
//! The loop goes `Collecting -> Draining -> Settled`; the drain ceiling is
//! re-armed whenever new expectations arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use apiconform_core::{
    AssertionResult, CapturedExchange, EntryKind, RequestExpectation, ResponseExpectation,
    ResultEntry, Validator,
};

use crate::context::{RequestLogEntry, RunContext};

/// Group path under which unmatched inbound calls are reported.
pub const UNMATCHED_GROUP: &str = "unmatched requests";

/// An expectation about a call the server under test will make to us.
#[derive(Debug, Clone)]
pub struct AsyncExpectation {
    pub name: String,
    pub request: RequestExpectation,
    /// Only consider calls from this identity
    pub identity: Option<String>,
    /// Checks on the response we sent back
    pub response: Option<ResponseExpectation>,
    /// Group path of the registering group
    pub group: Vec<String>,
}

impl AsyncExpectation {
    #[must_use]
    pub fn new(name: impl Into<String>, request: RequestExpectation) -> Self {
        Self {
            name: name.into(),
            request,
            identity: None,
            response: None,
            group: Vec::new(),
        }
    }

    #[must_use]
    pub fn for_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: ResponseExpectation) -> Self {
        self.response = Some(response);
        self
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.request.is_negative()
    }

    /// Number of results this expectation contributes.
    #[must_use]
    pub fn assertion_count(&self) -> usize {
        self.request.assertion_count()
            + self
                .response
                .as_ref()
                .map_or(0, ResponseExpectation::assertion_count)
    }

    fn accepts(&self, entry: &RequestLogEntry) -> bool {
        if let Some(id) = &self.identity {
            if entry.identity.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        self.request.matches_identity(&entry.exchange)
    }

    /// Assertions holding against `exchange`, inversion ignored.
    fn score(&self, exchange: &CapturedExchange) -> usize {
        let request: usize = self
            .request
            .evaluate(exchange)
            .iter()
            .map(AssertionResult::passing_count)
            .sum();
        let response: usize = self.response.as_ref().map_or(0, |r| {
            r.validate(exchange)
                .iter()
                .map(AssertionResult::passing_count)
                .sum()
        });
        request + response
    }

    /// A negative expectation only claims calls it fully describes.
    fn claims(&self, exchange: &CapturedExchange) -> bool {
        !self.is_negative()
            || self
                .request
                .evaluate(exchange)
                .iter()
                .all(AssertionResult::is_valid)
    }

    fn resolve(&self, exchange: CapturedExchange) -> ResultEntry {
        let mut expected = self.request.validate(&exchange);
        if let Some(response) = &self.response {
            expected.extend(response.validate(&exchange));
        }
        ResultEntry {
            name: self.name.clone(),
            kind: EntryKind::Async {
                negative: self.is_negative(),
            },
            expected,
            actual: Some(exchange),
        }
    }

    fn inconclusive(&self) -> ResultEntry {
        let assertions = self
            .request
            .expectations()
            .iter()
            .flat_map(|v| v.assertions())
            .collect();
        ResultEntry {
            name: self.name.clone(),
            kind: EntryKind::Async { negative: false },
            expected: vec![AssertionResult::inconclusive(
                self.request.label(),
                assertions,
            )],
            actual: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    /// No outstanding expectations
    Collecting,
    /// Waiting for calls until the ceiling
    Draining,
    /// Finished; no further matching
    Settled,
}

/// Pairs async expectations with inbound calls.
pub struct Correlator<'a> {
    ctx: &'a RunContext,
    poll: Duration,
    ceiling: Duration,
    outstanding: Vec<AsyncExpectation>,
    deadline: Option<Instant>,
    state: CorrelatorState,
    results: Vec<(Vec<String>, ResultEntry)>,
}

impl<'a> Correlator<'a> {
    #[must_use]
    pub fn new(ctx: &'a RunContext) -> Self {
        let correlation = ctx.config().correlation;
        Self {
            ctx,
            poll: correlation.poll_interval(),
            ceiling: correlation.timeout(),
            outstanding: Vec::new(),
            deadline: None,
            state: CorrelatorState::Collecting,
            results: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> CorrelatorState {
        self.state
    }

    /// Poll until every group is done and nothing is outstanding.
    ///
    /// Returns async and unmatched results with their group paths.
    pub fn run(mut self, groups_done: &AtomicBool) -> Vec<(Vec<String>, ResultEntry)> {
        loop {
            self.tick(Instant::now());
            if groups_done.load(Ordering::Acquire)
                && self.outstanding.is_empty()
                && !self.ctx.has_pending()
            {
                break;
            }
            std::thread::sleep(self.next_sleep());
        }
        self.settle()
    }

    /// One polling step: pick up registrations, match, expire.
    pub fn tick(&mut self, now: Instant) {
        let new = self.ctx.take_pending();
        if !new.is_empty() {
            debug!(count = new.len(), "async expectations registered");
            self.outstanding.extend(new);
            self.deadline = Some(now + self.ceiling);
            self.state = CorrelatorState::Draining;
        }
        if self.outstanding.is_empty() {
            return;
        }

        self.match_log();

        if self.outstanding.is_empty() {
            self.deadline = None;
            self.state = CorrelatorState::Collecting;
        } else if self.deadline.is_some_and(|d| now >= d) {
            info!(
                outstanding = self.outstanding.len(),
                "correlation ceiling reached"
            );
            self.expire();
            self.deadline = None;
            self.state = CorrelatorState::Collecting;
        }
    }

    fn match_log(&mut self) {
        let log = self.ctx.request_log();
        let mut remaining = Vec::with_capacity(self.outstanding.len());
        let mut taken: Vec<u64> = Vec::new();

        for expectation in std::mem::take(&mut self.outstanding) {
            let best = log
                .iter()
                .filter(|e| !taken.contains(&e.seq))
                .filter(|e| expectation.accepts(e) && expectation.claims(&e.exchange))
                .map(|e| (expectation.score(&e.exchange), e.seq))
                // highest score, then lowest seq
                .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

            let claimed = best.and_then(|(_, seq)| {
                taken.push(seq);
                self.ctx.claim(seq)
            });
            match claimed {
                Some(entry) => {
                    debug!(
                        expectation = %expectation.name,
                        seq = entry.seq,
                        "async expectation matched"
                    );
                    self.ctx.release_interest(expectation.identity.as_deref());
                    let result = expectation.resolve(entry.exchange);
                    self.results.push((expectation.group.clone(), result));
                }
                None => remaining.push(expectation),
            }
        }
        self.outstanding = remaining;
    }

    /// Ceiling elapsed: positives become inconclusive, negatives pass.
    fn expire(&mut self) {
        for expectation in std::mem::take(&mut self.outstanding) {
            self.ctx.release_interest(expectation.identity.as_deref());
            if expectation.is_negative() {
                debug!(expectation = %expectation.name, "negative expectation held");
                continue;
            }
            warn!(
                expectation = %expectation.name,
                request = %expectation.request.label(),
                "no matching request observed"
            );
            let result = expectation.inconclusive();
            self.results.push((expectation.group.clone(), result));
        }
    }

    fn next_sleep(&self) -> Duration {
        self.deadline.map_or(self.poll, |d| {
            d.saturating_duration_since(Instant::now())
                .min(self.poll)
                .max(Duration::from_millis(1))
        })
    }

    /// Final settlement: leftover inbound calls become unmatched results.
    fn settle(mut self) -> Vec<(Vec<String>, ResultEntry)> {
        self.expire();
        for entry in self.ctx.drain_log() {
            warn!(request = %entry.exchange.request.label(), "unmatched inbound request");
            self.results.push((
                vec![UNMATCHED_GROUP.to_string()],
                ResultEntry::unmatched(entry.exchange),
            ));
        }
        self.state = CorrelatorState::Settled;
        info!(results = self.results.len(), "correlation settled");
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use apiconform_core::{CapturedRequest, Config, CorrelationConfig, SchemaRegistry};
    use serde_json::json;

    use crate::transport::Transports;

    fn ctx(timeout_ms: u64) -> RunContext {
        let config = Config {
            correlation: CorrelationConfig {
                poll_interval_ms: 5,
                timeout_ms,
            },
            ..Config::default()
        };
        RunContext::new(
            config,
            Arc::new(SchemaRegistry::new()),
            Transports::new("network"),
        )
        .unwrap()
    }

    fn webhook(body: &str) -> CapturedRequest {
        CapturedRequest::new("PUT", "/bob/webhook").with_body(body)
    }

    fn mention(group: &str) -> AsyncExpectation {
        let mut e = AsyncExpectation::new(
            "mention delivered",
            RequestExpectation::to("PUT", "/bob/webhook")
                .properties(&json!({"content": "Tent!"}))
                .unwrap(),
        )
        .for_identity("bob");
        e.group = vec![group.to_string()];
        e
    }

    #[test]
    fn best_scoring_candidate_wins() {
        let ctx = ctx(1000);
        ctx.register_async(mention("a"));
        ctx.record_inbound(webhook(r#"{"content": "Foo Bar"}"#), None);
        ctx.record_inbound(webhook(r#"{"content": "Tent!"}"#), None);

        let mut c = Correlator::new(&ctx);
        c.tick(Instant::now());
        assert_eq!(c.state(), CorrelatorState::Collecting);
        assert_eq!(c.results.len(), 1);
        assert_eq!(c.results[0].1.valid(), Some(true));
        // the losing call stays in the log
        assert_eq!(ctx.request_log().len(), 1);
    }

    #[test]
    fn ties_go_to_earliest_arrival() {
        let ctx = ctx(1000);
        ctx.register_async(mention("a"));
        ctx.record_inbound(webhook(r#"{"content": "first"}"#), None);
        ctx.record_inbound(webhook(r#"{"content": "second"}"#), None);

        let mut c = Correlator::new(&ctx);
        c.tick(Instant::now());
        let actual = c.results[0].1.actual.as_ref().unwrap();
        assert_eq!(actual.request.body.as_deref(), Some(r#"{"content": "first"}"#));
        assert_eq!(c.results[0].1.valid(), Some(false));
    }

    #[test]
    fn two_expectations_never_share_a_call() {
        let ctx = ctx(1000);
        ctx.register_async(mention("a"));
        ctx.register_async(mention("b"));
        ctx.record_inbound(webhook(r#"{"content": "Tent!"}"#), None);

        let mut c = Correlator::new(&ctx);
        c.tick(Instant::now());
        assert_eq!(c.results.len(), 1);
        assert_eq!(c.outstanding.len(), 1);
        assert_eq!(c.state(), CorrelatorState::Draining);
    }

    #[test]
    fn expired_positive_is_inconclusive() {
        let ctx = ctx(0);
        ctx.register_async(mention("a"));
        let done = AtomicBool::new(true);
        let results = Correlator::new(&ctx).run(&done);
        assert_eq!(results.len(), 1);
        let (group, entry) = &results[0];
        assert_eq!(group, &vec!["a".to_string()]);
        assert_eq!(entry.valid(), None);
        assert!(entry.expected[0].diff.is_empty());
        assert!(entry.actual.is_none());
    }

    #[test]
    fn negative_passes_silently_when_nothing_arrives() {
        let ctx = ctx(0);
        ctx.register_async(AsyncExpectation::new(
            "no delete",
            RequestExpectation::to("DELETE", "/bob/webhook").negative(),
        ));
        let results = Correlator::new(&ctx).run(&AtomicBool::new(true));
        assert!(results.is_empty());
    }

    #[test]
    fn negative_fails_when_described_call_arrives() {
        let ctx = ctx(1000);
        ctx.register_async(AsyncExpectation::new(
            "no delete",
            RequestExpectation::to("DELETE", "/bob/webhook").negative(),
        ));
        ctx.record_inbound(CapturedRequest::new("DELETE", "/bob/webhook"), None);
        let mut c = Correlator::new(&ctx);
        c.tick(Instant::now());
        assert_eq!(c.results[0].1.valid(), Some(false));
        assert_eq!(c.results[0].1.kind, EntryKind::Async { negative: true });
    }

    #[test]
    fn leftover_calls_are_unmatched() {
        let ctx = ctx(0);
        let _guard = ctx.watch("bob");
        ctx.record_inbound(webhook("{}"), None);
        let results = Correlator::new(&ctx).run(&AtomicBool::new(true));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, vec![UNMATCHED_GROUP.to_string()]);
        assert_eq!(results[0].1.kind, EntryKind::UnmatchedRequest);
    }

    #[test]
    fn new_registration_rearms_ceiling() {
        let ctx = ctx(50);
        ctx.register_async(mention("a"));
        let mut c = Correlator::new(&ctx);
        let start = Instant::now();
        c.tick(start);
        ctx.register_async(mention("b"));
        c.tick(start + Duration::from_millis(40));
        // 60ms after start is past the first ceiling but not the re-armed one
        c.tick(start + Duration::from_millis(60));
        assert_eq!(c.outstanding.len(), 2);
        c.tick(start + Duration::from_millis(100));
        assert!(c.outstanding.is_empty());
        assert_eq!(c.results.len(), 2);
    }
}
