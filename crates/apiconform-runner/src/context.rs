//! Run-scoped shared state
//!
//! Everything mutable that groups and the correlator share lives in one
//! [`SharedState`] behind a single lock. Accessors copy values out so the
//! lock is never held across a request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, trace};

use apiconform_core::{CapturedExchange, CapturedRequest, CapturedResponse, Config, SchemaRegistry};

use crate::correlate::AsyncExpectation;
use crate::error::RunError;
use crate::transport::{NetworkTransport, Transport, Transports};

/// Credentials for one identity, sent as a single header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub header: String,
    pub value: String,
}

impl Credentials {
    #[must_use]
    pub fn bearer(token: &str) -> Self {
        Self {
            header: "Authorization".to_string(),
            value: format!("Bearer {token}"),
        }
    }
}

/// An inbound call waiting to be claimed by an async expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogEntry {
    /// Arrival order
    pub seq: u64,
    pub identity: Option<String>,
    pub exchange: CapturedExchange,
}

#[derive(Debug, Default)]
struct SharedState {
    target_entity: Option<String>,
    /// Base URL of the running callback listener
    listener_url: Option<String>,
    credentials: HashMap<String, Credentials>,
    request_log: Vec<RequestLogEntry>,
    next_seq: u64,
    /// Watch counts per identity
    watching: HashMap<String, usize>,
    /// Unresolved async expectations per identity
    interest: HashMap<String, usize>,
    /// Unresolved async expectations without identity filter
    wildcard_interest: usize,
    /// Registered, not yet picked up by the correlator
    pending: Vec<AsyncExpectation>,
}

impl SharedState {
    fn is_relevant(&self, identity: Option<&str>) -> bool {
        if self.wildcard_interest > 0 {
            return true;
        }
        identity.is_some_and(|id| {
            self.watching.get(id).is_some_and(|n| *n > 0)
                || self.interest.get(id).is_some_and(|n| *n > 0)
        })
    }
}

/// Context shared by every group of one run.
pub struct RunContext {
    config: Config,
    registry: Arc<SchemaRegistry>,
    transports: Transports,
    identity: Regex,
    state: Mutex<SharedState>,
}

impl RunContext {
    /// # Errors
    ///
    /// Returns [`RunError::Config`] when the configuration is invalid.
    pub fn new(
        config: Config,
        registry: Arc<SchemaRegistry>,
        transports: Transports,
    ) -> Result<Self, RunError> {
        config
            .validate()
            .map_err(|e| RunError::Config(e.to_string()))?;
        let identity = Regex::new(&config.identity_pattern)
            .map_err(|e| RunError::Config(e.to_string()))?;
        let state = SharedState {
            target_entity: config.target_entity.clone(),
            ..SharedState::default()
        };
        Ok(Self {
            config,
            registry,
            transports,
            identity,
            state: Mutex::new(state),
        })
    }

    /// Build a context that sends over the network, loading schemas from
    /// the configured directory.
    ///
    /// # Errors
    ///
    /// Returns error if the schema directory cannot be loaded or the HTTP
    /// client cannot be built.
    pub fn from_config(config: Config) -> Result<Self, RunError> {
        let registry = match &config.schemas {
            Some(dir) => SchemaRegistry::load_dir(dir)?,
            None => SchemaRegistry::new(),
        };
        let network = NetworkTransport::new(std::time::Duration::from_secs(
            config.request_timeout_secs,
        ))
        .map_err(|e| RunError::Transport(e.to_string()))?;
        let transports = Transports::new(config.transport.clone()).with("network", network);
        Self::new(config, Arc::new(registry), transports)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// # Errors
    ///
    /// Returns [`RunError::Transport`] when the configured transport is not
    /// registered.
    pub fn transport(&self) -> Result<Arc<dyn Transport>, RunError> {
        self.transports
            .get(&self.config.transport)
            .map_err(|e| RunError::Transport(e.to_string()))
    }

    /// Identity of the caller of an inbound path: first capture group of
    /// the identity pattern.
    #[must_use]
    pub fn resolve_identity(&self, path: &str) -> Option<String> {
        self.identity
            .captures(path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    #[must_use]
    pub fn target_entity(&self) -> Option<String> {
        self.state.lock().target_entity.clone()
    }

    pub fn set_target_entity(&self, entity: impl Into<String>) {
        self.state.lock().target_entity = Some(entity.into());
    }

    #[must_use]
    pub fn listener_url(&self) -> Option<String> {
        self.state.lock().listener_url.clone()
    }

    pub fn set_listener_url(&self, url: impl Into<String>) {
        self.state.lock().listener_url = Some(url.into());
    }

    #[must_use]
    pub fn credentials(&self, identity: &str) -> Option<Credentials> {
        self.state.lock().credentials.get(identity).cloned()
    }

    pub fn set_credentials(&self, identity: impl Into<String>, credentials: Credentials) {
        self.state
            .lock()
            .credentials
            .insert(identity.into(), credentials);
    }

    /// Record an inbound call from the listener.
    ///
    /// The call is logged only when its identity is watched or awaited by
    /// an async expectation; returns its sequence number if it was.
    pub fn record_inbound(
        &self,
        request: CapturedRequest,
        response: Option<CapturedResponse>,
    ) -> Option<u64> {
        let identity = self.resolve_identity(&request.path);
        let mut state = self.state.lock();
        if !state.is_relevant(identity.as_deref()) {
            trace!(path = %request.path, "ignoring inbound request");
            return None;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let mut exchange = CapturedExchange::new(exchange_id(), request);
        exchange.response = response;
        debug!(seq, identity = ?identity, request = %exchange.request.label(), "inbound request logged");
        state.request_log.push(RequestLogEntry {
            seq,
            identity,
            exchange,
        });
        Some(seq)
    }

    /// Log inbound calls for `identity` until the guard drops.
    #[must_use]
    pub fn watch(&self, identity: &str) -> WatchGuard<'_> {
        *self
            .state
            .lock()
            .watching
            .entry(identity.to_string())
            .or_default() += 1;
        WatchGuard {
            ctx: self,
            identity: identity.to_string(),
        }
    }

    pub(crate) fn register_async(&self, expectation: AsyncExpectation) {
        let mut state = self.state.lock();
        match &expectation.identity {
            Some(id) => *state.interest.entry(id.clone()).or_default() += 1,
            None => state.wildcard_interest += 1,
        }
        state.pending.push(expectation);
    }

    pub(crate) fn take_pending(&self) -> Vec<AsyncExpectation> {
        std::mem::take(&mut self.state.lock().pending)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    pub(crate) fn release_interest(&self, identity: Option<&str>) {
        let mut state = self.state.lock();
        match identity {
            Some(id) => {
                if let Some(n) = state.interest.get_mut(id) {
                    *n = n.saturating_sub(1);
                }
            }
            None => state.wildcard_interest = state.wildcard_interest.saturating_sub(1),
        }
    }

    /// Copy of the unclaimed inbound log, in arrival order.
    #[must_use]
    pub fn request_log(&self) -> Vec<RequestLogEntry> {
        self.state.lock().request_log.clone()
    }

    /// Remove an entry from the log; `None` if another claim won.
    pub(crate) fn claim(&self, seq: u64) -> Option<RequestLogEntry> {
        let mut state = self.state.lock();
        let idx = state.request_log.iter().position(|e| e.seq == seq)?;
        Some(state.request_log.remove(idx))
    }

    pub(crate) fn drain_log(&self) -> Vec<RequestLogEntry> {
        std::mem::take(&mut self.state.lock().request_log)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("base_url", &self.config.base_url)
            .field("transports", &self.transports)
            .finish_non_exhaustive()
    }
}

/// Stops watching an identity when dropped.
#[derive(Debug)]
pub struct WatchGuard<'a> {
    ctx: &'a RunContext,
    identity: String,
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.ctx.state.lock();
        if let Some(n) = state.watching.get_mut(&self.identity) {
            *n = n.saturating_sub(1);
        }
    }
}

pub(crate) fn exchange_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiconform_core::RequestExpectation;

    fn ctx() -> RunContext {
        let config = Config {
            target_entity: Some("http://local/alice".into()),
            ..Config::default()
        };
        RunContext::new(
            config,
            Arc::new(SchemaRegistry::new()),
            Transports::new("network"),
        )
        .unwrap()
    }

    #[test]
    fn identity_is_first_capture_group() {
        let ctx = ctx();
        assert_eq!(ctx.resolve_identity("/alice/inbox"), Some("alice".into()));
        assert_eq!(ctx.resolve_identity("/"), None);
    }

    #[test]
    fn unwatched_requests_are_dropped() {
        let ctx = ctx();
        assert_eq!(
            ctx.record_inbound(CapturedRequest::new("POST", "/alice/inbox"), None),
            None
        );
        assert!(ctx.request_log().is_empty());
    }

    #[test]
    fn watch_guard_scopes_logging() {
        let ctx = ctx();
        {
            let _guard = ctx.watch("alice");
            assert_eq!(
                ctx.record_inbound(CapturedRequest::new("POST", "/alice/inbox"), None),
                Some(0)
            );
            assert_eq!(
                ctx.record_inbound(CapturedRequest::new("POST", "/bob/inbox"), None),
                None
            );
        }
        assert_eq!(
            ctx.record_inbound(CapturedRequest::new("POST", "/alice/inbox"), None),
            None
        );
        let log = ctx.request_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].identity.as_deref(), Some("alice"));
        assert_eq!(log[0].exchange.id.len(), 16);
    }

    #[test]
    fn async_interest_enables_logging_until_released() {
        let ctx = ctx();
        ctx.register_async(
            AsyncExpectation::new("webhook", RequestExpectation::to("PUT", "/bob/webhook"))
                .for_identity("bob"),
        );
        assert!(ctx.record_inbound(CapturedRequest::new("PUT", "/bob/webhook"), None).is_some());
        assert_eq!(ctx.take_pending().len(), 1);
        ctx.release_interest(Some("bob"));
        assert!(ctx.record_inbound(CapturedRequest::new("PUT", "/bob/webhook"), None).is_none());
    }

    #[test]
    fn claim_removes_once() {
        let ctx = ctx();
        let _guard = ctx.watch("alice");
        let seq = ctx
            .record_inbound(CapturedRequest::new("POST", "/alice/inbox"), None)
            .unwrap();
        assert!(ctx.claim(seq).is_some());
        assert!(ctx.claim(seq).is_none());
    }

    #[test]
    fn target_entity_defaults_from_config() {
        let ctx = ctx();
        assert_eq!(ctx.target_entity().as_deref(), Some("http://local/alice"));
        ctx.set_credentials("alice", Credentials::bearer("t0k"));
        assert_eq!(
            ctx.credentials("alice").map(|c| c.value),
            Some("Bearer t0k".to_string())
        );
    }
}
