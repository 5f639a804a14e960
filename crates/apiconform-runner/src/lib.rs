//! apiconform-runner: execution and async correlation schedulers
//!
//! Runs [`TestGroup`]s against a server through a named [`Transport`],
//! correlates inbound calls received by the [`Listener`] with
//! [`AsyncExpectation`]s and returns a
//! [`ResultNode`](apiconform_core::ResultNode) tree.

pub mod context;
pub mod correlate;
pub mod error;
pub mod generate;
pub mod group;
pub mod listener;
pub mod scheduler;
pub mod suite;
pub mod transport;

pub use context::{Credentials, RequestLogEntry, RunContext, WatchGuard};
pub use correlate::{AsyncExpectation, Correlator, CorrelatorState, UNMATCHED_GROUP};
pub use error::{GroupError, RunError, SetupFailure};
pub use generate::{InvalidBody, SchemaGenerators, ValueGenerators, invalid_body_hook};
pub use group::{ENTITY_KEY, GroupContext, GroupState, LISTENER_KEY, TestGroup};
pub use listener::Listener;
pub use scheduler::Scheduler;
pub use suite::{Suite, SuiteError};
pub use transport::{
    InProcessTransport, NetworkTransport, OutgoingRequest, RequestHook, Transport, TransportError,
    Transports,
};
