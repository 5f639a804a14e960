//! Test groups and the context their bodies run in

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use apiconform_core::{CapturedExchange, ResponseExpectation, ResultEntry};

use crate::context::{RunContext, WatchGuard, exchange_id};
use crate::correlate::AsyncExpectation;
use crate::error::{GroupError, SetupFailure};
use crate::transport::{OutgoingRequest, Transport, TransportError};

/// State key defaulting to the configured target entity.
pub const ENTITY_KEY: &str = "entity";

/// State key defaulting to the base URL of the callback listener.
pub const LISTENER_KEY: &str = "listener_url";

type GroupBody = Box<dyn Fn(&mut GroupContext<'_>) -> Result<(), GroupError> + Send + Sync>;

/// A named unit of steps, optionally depending on another group.
pub struct TestGroup {
    pub(crate) name: String,
    pub(crate) depends_on: Option<String>,
    /// Expectations the body would check; reported as skipped when a
    /// dependency fails setup
    pub(crate) planned: usize,
    body: GroupBody,
}

impl TestGroup {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&mut GroupContext<'_>) -> Result<(), GroupError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            depends_on: None,
            planned: 0,
            body: Box::new(body),
        }
    }

    /// Run after `group` completes, sharing its state.
    #[must_use]
    pub fn depends_on(mut self, group: impl Into<String>) -> Self {
        self.depends_on = Some(group.into());
        self
    }

    #[must_use]
    pub fn planned(mut self, expectations: usize) -> Self {
        self.planned = expectations;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(&self, cx: &mut GroupContext<'_>) -> Result<(), GroupError> {
        (self.body)(cx)
    }
}

impl std::fmt::Debug for TestGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestGroup")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("planned", &self.planned)
            .finish_non_exhaustive()
    }
}

/// Key/value store of one group.
///
/// Reads fall back to the parent group; writes to a key the parent already
/// holds go through to the parent.
#[derive(Debug, Default)]
pub struct GroupState {
    values: Mutex<BTreeMap<String, Value>>,
    parent: Option<Arc<GroupState>>,
}

impl GroupState {
    #[must_use]
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn child(parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::default(),
            parent: Some(Arc::clone(parent)),
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.values.lock().get(key) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(key))
    }

    fn holds(&self, key: &str) -> bool {
        self.values.lock().contains_key(key) || self.parent.as_ref().is_some_and(|p| p.holds(key))
    }

    pub fn set(&self, key: &str, value: Value) {
        if !self.values.lock().contains_key(key) {
            if let Some(parent) = &self.parent {
                if parent.holds(key) {
                    parent.set(key, value);
                    return;
                }
            }
        }
        self.values.lock().insert(key.to_string(), value);
    }
}

/// Handle a group body uses to talk to the server and record results.
pub struct GroupContext<'a> {
    ctx: &'a RunContext,
    transport: &'a dyn Transport,
    path: Vec<String>,
    state: Arc<GroupState>,
    entries: Vec<ResultEntry>,
}

impl<'a> GroupContext<'a> {
    #[must_use]
    pub fn new(
        ctx: &'a RunContext,
        transport: &'a dyn Transport,
        path: Vec<String>,
        state: Arc<GroupState>,
    ) -> Self {
        Self {
            ctx,
            transport,
            path,
            state,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn run_context(&self) -> &'a RunContext {
        self.ctx
    }

    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    #[must_use]
    pub fn state(&self) -> &Arc<GroupState> {
        &self.state
    }

    /// State lookup; `entity` defaults to the run's target entity and
    /// `listener_url` to the running listener.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.get(key).or_else(|| {
            let fallback = match key {
                ENTITY_KEY => self.ctx.target_entity(),
                LISTENER_KEY => self.ctx.listener_url(),
                _ => None,
            };
            fallback.map(Value::String)
        })
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.state.set(key, value.into());
    }

    /// Replace `{key}` placeholders with state values; unknown keys stay.
    #[must_use]
    pub fn substitute(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let key = &after[..end];
            match self.get(key) {
                Some(Value::String(s)) if is_key(key) => out.push_str(&s),
                Some(v) if is_key(key) => out.push_str(&v.to_string()),
                _ => out.push_str(&rest[start..start + end + 2]),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Request to `path` on the server under test, with default headers.
    ///
    /// Absolute URLs are used as given.
    #[must_use]
    pub fn request(&self, method: &str, path: &str) -> OutgoingRequest {
        let config = self.ctx.config();
        let path = self.substitute(path);
        let url = if path.contains("://") {
            path
        } else {
            format!("{}{path}", config.base_url.trim_end_matches('/'))
        };
        let mut request = OutgoingRequest::new(method, url);
        for (k, v) in &config.headers {
            request = request.with_header(k, v);
        }
        request
    }

    /// Attach the cached credentials of `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupFailure`] when no credentials are cached.
    pub fn authenticated(
        &self,
        request: OutgoingRequest,
        identity: &str,
    ) -> Result<OutgoingRequest, SetupFailure> {
        let credentials = self
            .ctx
            .credentials(identity)
            .ok_or_else(|| SetupFailure::new(format!("no credentials for {identity}")))?;
        Ok(request.with_header(&credentials.header, &credentials.value))
    }

    /// Send without checking anything.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when no response was received.
    pub fn send(&self, request: &OutgoingRequest) -> Result<CapturedExchange, TransportError> {
        let captured = request.capture();
        debug!(request = %captured.label(), "sending");
        let response = self.transport.send(request)?;
        debug!(status = response.status, "received");
        Ok(CapturedExchange::new(exchange_id(), captured).with_response(response))
    }

    /// Send, check the response and record the results.
    ///
    /// # Errors
    ///
    /// Transport failures become a [`SetupFailure`] for the group.
    pub fn exchange(
        &mut self,
        name: &str,
        request: &OutgoingRequest,
        expectation: &ResponseExpectation,
    ) -> Result<CapturedExchange, GroupError> {
        let exchange = self.send(request).map_err(|e| {
            SetupFailure::new(format!("{name}: {e}")).skipping(expectation.assertion_count())
        })?;
        let results = expectation.validate(&exchange);
        self.entries.push(ResultEntry::check(name, results, exchange.clone()));
        Ok(exchange)
    }

    /// Send a precondition request; any failed check aborts the group.
    ///
    /// # Errors
    ///
    /// Returns [`SetupFailure`] carrying the results and the exchange.
    pub fn setup(
        &self,
        name: &str,
        request: &OutgoingRequest,
        expectation: &ResponseExpectation,
    ) -> Result<CapturedExchange, SetupFailure> {
        let exchange = self
            .send(request)
            .map_err(|e| SetupFailure::new(format!("{name}: {e}")))?;
        let results = expectation.validate(&exchange);
        if results.iter().any(|r| r.is_invalid()) {
            return Err(SetupFailure::new(format!("{name}: unexpected response"))
                .with_results(results)
                .with_exchange(exchange));
        }
        Ok(exchange)
    }

    /// Await a call the server will make to us.
    pub fn expect_async(&self, mut expectation: AsyncExpectation) {
        expectation.group.clone_from(&self.path);
        debug!(expectation = %expectation.name, "async expectation registered");
        self.ctx.register_async(expectation);
    }

    /// Log inbound calls for `identity` while the guard lives.
    #[must_use]
    pub fn watch(&self, identity: &str) -> WatchGuard<'a> {
        self.ctx.watch(identity)
    }

    pub fn record(&mut self, entry: ResultEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn into_entries(self) -> Vec<ResultEntry> {
        self.entries
    }
}

fn is_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
