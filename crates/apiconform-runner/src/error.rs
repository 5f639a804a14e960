//! Run errors
//!
//! A [`SetupFailure`] stops one group and is reported; a [`RunError`] is a
//! misconfiguration that fails the whole run.

use apiconform_core::{AssertionResult, CapturedExchange, RegistryError};

use crate::transport::TransportError;

/// Fatal errors; the first one is returned after every started group joins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("schema not found: {0}")]
    SchemaNotFound(String),
    #[error("duplicate group name: {0}")]
    DuplicateGroup(String),
    #[error("group {group:?} depends on unknown group {dependency:?}")]
    UnknownDependency { group: String, dependency: String },
    #[error("dependency cycle among groups: {0}")]
    DependencyCycle(String),
    #[error("group {0:?} panicked")]
    Panicked(String),
    #[error("Invalid config: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("listener error: {0}")]
    Listener(String),
}

impl From<RegistryError> for RunError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(name) => Self::SchemaNotFound(name),
            other => Self::Config(other.to_string()),
        }
    }
}

/// A group precondition could not be established.
///
/// Carries whatever was learned before giving up so the report can show it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("setup failed: {message}")]
pub struct SetupFailure {
    pub message: String,
    /// Results computed before the failure
    pub partial: Vec<AssertionResult>,
    /// The exchange that failed, when one was captured
    pub exchange: Option<CapturedExchange>,
    /// Expectations that will not run because of this failure
    pub skipped: usize,
}

impl SetupFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: Vec::new(),
            exchange: None,
            skipped: 0,
        }
    }

    #[must_use]
    pub fn with_results(mut self, results: Vec<AssertionResult>) -> Self {
        self.partial = results;
        self
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: CapturedExchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    #[must_use]
    pub fn skipping(mut self, count: usize) -> Self {
        self.skipped = count;
        self
    }
}

impl From<TransportError> for SetupFailure {
    fn from(e: TransportError) -> Self {
        Self::new(e.to_string())
    }
}

/// Error returned by a group body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GroupError {
    #[error(transparent)]
    Setup(#[from] SetupFailure),
    #[error(transparent)]
    Fatal(#[from] RunError),
}

impl From<TransportError> for GroupError {
    fn from(e: TransportError) -> Self {
        Self::Setup(e.into())
    }
}

impl From<RegistryError> for GroupError {
    fn from(e: RegistryError) -> Self {
        Self::Fatal(e.into())
    }
}
