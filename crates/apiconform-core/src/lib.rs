//! apiconform-core: assertion engine, expectations and results for API
//! conformance testing
//!
//! This crate turns declarative expectations into verdicts with a
//! machine-readable diff. It performs no I/O besides loading schemas and
//! configuration; running requests lives in `apiconform-runner`.

pub mod assertion;
pub mod config;
pub mod exchange;
pub mod expectation;
pub mod params;
pub mod registry;
pub mod report;
pub mod results;
pub mod schema_diff;

pub use assertion::{
    Assertion, AssertionResult, DiffEntry, DiffOp, Expected, ExpectedError, JsonType, Pattern,
};
pub use config::{Config, ConfigError, CorrelationConfig, ListenerConfig};
pub use exchange::{CapturedExchange, CapturedRequest, CapturedResponse};
pub use expectation::{
    AssertionValidator, RequestExpectation, ResponseExpectation, SchemaValidator, Target,
    Validator,
};
pub use params::{
    ListSpec, ListSpecExt, ListValidator, ListWindow, MergeRule, MergeRules, MergedParamValidator,
    ParamError, ParamKind, ParamValidator,
};
pub use registry::{RegistryError, SchemaRegistry};
pub use report::{Report, ReportPolicy, Verdict, VerdictStatus};
pub use results::{EntryKind, ResultEntry, ResultNode, Summary};
pub use schema_diff::schema_diff;
