//! Declarative suites
//!
//! A suite file (YAML, TOML or JSON) lists groups of request steps and the
//! async calls each group expects:
//!
//! ```yaml
//! groups:
//!   - name: posts
//!     steps:
//!       - name: create post
//!         setup: true
//!         request: { method: POST, path: /posts, body: { content: "Tent!" } }
//!         expect: { status: 201, schema: post }
//!         save: { post_id: /id }
//!     async:
//!       - name: mention delivered
//!         identity: bob
//!         request: { method: PUT, path: /bob/webhook, properties: { id: "{post_id}" } }
//!   - name: replies
//!     depends_on: posts
//!     steps:
//!       - request: { method: GET, path: "/posts/{post_id}/replies" }
//!         expect: { status: 200 }
//! ```
//!
//! `{key}` placeholders in paths, query values and bodies are filled from
//! group state. Async expectations are filled from group state and
//! registered once the steps finish; calls from their identities are watched
//! meanwhile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use apiconform_core::{
    Expected, ExpectedError, RegistryError, RequestExpectation, ResponseExpectation, SchemaRegistry,
};

use crate::correlate::AsyncExpectation;
use crate::error::{GroupError, SetupFailure};
use crate::generate::{InvalidBody, ValueGenerators, invalid_body_hook};
use crate::group::{GroupContext, TestGroup};
use crate::transport::{OutgoingRequest, RequestHook};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    pub name: String,
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Identities to watch while the steps run
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default, rename = "async")]
    pub async_expectations: Vec<AsyncSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// A failed check aborts the group instead of being reported
    #[serde(default)]
    pub setup: bool,
    pub request: RequestSpec,
    #[serde(default)]
    pub expect: ExpectSpec,
    /// State key -> JSON pointer into the response body
    #[serde(default)]
    pub save: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSpec {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Identity whose cached credentials are attached
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub invalid_body: Option<InvalidBodySpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidBodySpec {
    pub schema: String,
    pub kind: InvalidBody,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectSpec {
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncSpec {
    pub name: String,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub negative: bool,
    pub request: InboundSpec,
    /// Checks on the response our listener sent
    #[serde(default)]
    pub respond: Option<ExpectSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundSpec {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub properties: Option<Value>,
}

impl Suite {
    /// Load a suite; format chosen by extension (`.yaml`/`.yml`, `.json`,
    /// otherwise TOML).
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, SuiteError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SuiteError::Io(path.to_path_buf(), e.to_string()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&content),
            Some("json") => serde_json::from_str(&content).map_err(|e| SuiteError::Parse(e.to_string())),
            _ => toml::from_str(&content).map_err(|e| SuiteError::Parse(e.to_string())),
        }
    }

    /// # Errors
    ///
    /// Returns [`SuiteError::Parse`] for malformed YAML.
    pub fn from_yaml(content: &str) -> Result<Self, SuiteError> {
        serde_yml::from_str(content).map_err(|e| SuiteError::Parse(e.to_string()))
    }

    /// Compile every group; schemas and markers are checked here, before
    /// anything runs.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::SchemaNotFound`] for unknown schema names and
    /// [`SuiteError::Expectation`] for malformed markers.
    pub fn into_groups(
        self,
        registry: &Arc<SchemaRegistry>,
        generators: &Arc<dyn ValueGenerators>,
    ) -> Result<Vec<TestGroup>, SuiteError> {
        self.groups
            .into_iter()
            .map(|g| compile_group(g, registry, generators))
            .collect()
    }
}

struct Step {
    name: String,
    setup: bool,
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, String>,
    body: Option<Value>,
    auth: Option<String>,
    hook: Option<RequestHook>,
    expect: ResponseExpectation,
    save: BTreeMap<String, String>,
}

fn compile_group(
    spec: GroupSpec,
    registry: &Arc<SchemaRegistry>,
    generators: &Arc<dyn ValueGenerators>,
) -> Result<TestGroup, SuiteError> {
    let steps = spec
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| compile_step(i, s, registry, generators))
        .collect::<Result<Vec<_>, _>>()?;
    // Compiled here to catch errors early; registered after substitution at run time
    let async_assertions = spec
        .async_expectations
        .iter()
        .map(|a| compile_async(a.clone(), registry).map(|e| e.assertion_count()))
        .sum::<Result<usize, _>>()?;

    let mut watch = spec.watch;
    watch.extend(spec.async_expectations.iter().filter_map(|a| a.identity.clone()));
    watch.sort();
    watch.dedup();

    let planned = steps.iter().map(|s| s.expect.assertion_count()).sum::<usize>() + async_assertions;

    let plan = GroupPlan {
        steps,
        asyncs: spec.async_expectations,
        async_assertions,
        watch,
        registry: Arc::clone(registry),
    };
    let group = TestGroup::new(spec.name, move |cx| run_steps(cx, &plan)).planned(planned);
    Ok(match spec.depends_on {
        Some(dep) => group.depends_on(dep),
        None => group,
    })
}

struct GroupPlan {
    steps: Vec<Step>,
    asyncs: Vec<AsyncSpec>,
    async_assertions: usize,
    watch: Vec<String>,
    registry: Arc<SchemaRegistry>,
}

fn run_steps(cx: &mut GroupContext<'_>, plan: &GroupPlan) -> Result<(), GroupError> {
    let _guards: Vec<_> = plan.watch.iter().map(|id| cx.watch(id)).collect();
    let steps = &plan.steps;

    for (i, step) in steps.iter().enumerate() {
        let remaining = steps[i + 1..]
            .iter()
            .map(|s| s.expect.assertion_count())
            .sum::<usize>()
            + plan.async_assertions;

        let request = build_request(cx, step).map_err(|f| f.skipping(remaining))?;
        let exchange = if step.setup {
            cx.setup(&step.name, &request, &step.expect)
                .map_err(|f| f.skipping(remaining))?
        } else {
            cx.exchange(&step.name, &request, &step.expect)
                .map_err(|e| match e {
                    GroupError::Setup(f) => {
                        let skipped = f.skipped + remaining;
                        GroupError::Setup(f.skipping(skipped))
                    }
                    fatal @ GroupError::Fatal(_) => fatal,
                })?
        };

        let body = exchange
            .response
            .as_ref()
            .map(apiconform_core::CapturedResponse::json)
            .unwrap_or_default();
        for (key, pointer) in &step.save {
            let value = body.pointer(pointer).cloned().ok_or_else(|| {
                SetupFailure::new(format!("{}: response has no {pointer}", step.name))
                    .with_exchange(exchange.clone())
                    .skipping(remaining)
            })?;
            cx.set(key, value);
        }
    }

    let expectations = plan
        .asyncs
        .iter()
        .map(|spec| compile_async(substitute_async(cx, spec), &plan.registry))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SetupFailure::new(e.to_string()).skipping(plan.async_assertions))?;
    for expectation in expectations {
        cx.expect_async(expectation);
    }
    Ok(())
}

/// Fill placeholders of an async expectation from group state.
fn substitute_async(cx: &GroupContext<'_>, spec: &AsyncSpec) -> AsyncSpec {
    let values = |map: &BTreeMap<String, Value>| -> BTreeMap<String, Value> {
        map.iter()
            .map(|(k, v)| (k.clone(), substitute_value(cx, v)))
            .collect()
    };
    let inbound = &spec.request;
    AsyncSpec {
        name: spec.name.clone(),
        identity: spec.identity.as_deref().map(|id| cx.substitute(id)),
        negative: spec.negative,
        request: InboundSpec {
            method: inbound.method.clone(),
            path: inbound.path.as_ref().map(|p| substitute_value(cx, p)),
            headers: values(&inbound.headers),
            params: values(&inbound.params),
            schema: inbound.schema.clone(),
            properties: inbound.properties.as_ref().map(|p| substitute_value(cx, p)),
        },
        respond: spec.respond.clone(),
    }
}

fn build_request(cx: &GroupContext<'_>, step: &Step) -> Result<OutgoingRequest, SetupFailure> {
    let mut request = cx.request(&step.method, &step.path);
    for (k, v) in &step.headers {
        request = request.with_header(k, &cx.substitute(v));
    }
    let query = step
        .query
        .iter()
        .map(|(k, v)| (k.clone(), cx.substitute(v)))
        .collect();
    request = request.with_query(&query);
    if let Some(body) = &step.body {
        request = request.with_json(&substitute_value(cx, body));
    }
    if let Some(identity) = &step.auth {
        request = cx.authenticated(request, identity)?;
    }
    if let Some(hook) = &step.hook {
        request = request.with_hook(hook);
    }
    Ok(request)
}

/// Substitute placeholders in every string; a string that is exactly one
/// placeholder takes the state value with its JSON type.
fn substitute_value(cx: &GroupContext<'_>, value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let whole = s
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .filter(|key| !key.contains(['{', '}']))
                .and_then(|key| cx.get(key));
            whole.unwrap_or_else(|| Value::String(cx.substitute(s)))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(cx, v)).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), substitute_value(cx, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn compile_step(
    index: usize,
    spec: StepSpec,
    registry: &Arc<SchemaRegistry>,
    generators: &Arc<dyn ValueGenerators>,
) -> Result<Step, SuiteError> {
    let hook = spec
        .request
        .invalid_body
        .as_ref()
        .map(|inv| {
            let schema = registry.get(&inv.schema)?.clone();
            Ok::<_, RegistryError>(invalid_body_hook(Arc::clone(generators), schema, inv.kind))
        })
        .transpose()?;
    let name = spec.name.unwrap_or_else(|| {
        format!(
            "step {} {} {}",
            index + 1,
            spec.request.method.to_ascii_uppercase(),
            spec.request.path
        )
    });
    Ok(Step {
        name,
        setup: spec.setup,
        method: spec.request.method,
        path: spec.request.path,
        headers: spec.request.headers,
        query: spec.request.query,
        body: spec.request.body,
        auth: spec.request.auth,
        hook,
        expect: compile_expect(&spec.expect, registry)?,
        save: spec.save,
    })
}

fn compile_expect(
    spec: &ExpectSpec,
    registry: &Arc<SchemaRegistry>,
) -> Result<ResponseExpectation, SuiteError> {
    let mut expect = ResponseExpectation::new();
    if let Some(status) = &spec.status {
        expect = expect.status_matching(Expected::from_value(status)?);
    }
    for (name, value) in &spec.headers {
        expect = expect.header(name, Expected::from_value(value)?);
    }
    if let Some(schema) = &spec.schema {
        expect = expect.schema(registry, schema)?;
    }
    if let Some(properties) = &spec.properties {
        expect = expect.properties(properties)?;
    }
    Ok(expect)
}

fn compile_async(
    spec: AsyncSpec,
    registry: &Arc<SchemaRegistry>,
) -> Result<AsyncExpectation, SuiteError> {
    let inbound = spec.request;
    let mut request = RequestExpectation::new();
    if let Some(method) = &inbound.method {
        request = request.method(method);
    }
    if let Some(path) = &inbound.path {
        request = request.path(Expected::from_value(path)?);
    }
    for (name, value) in &inbound.headers {
        request = request.header(name, Expected::from_value(value)?);
    }
    for (name, value) in &inbound.params {
        request = request.param(name, Expected::from_value(value)?);
    }
    if let Some(schema) = &inbound.schema {
        request = request.schema(registry, schema)?;
    }
    if let Some(properties) = &inbound.properties {
        request = request.properties(properties)?;
    }
    if spec.negative {
        request = request.negative();
    }

    let mut expectation = AsyncExpectation::new(spec.name, request);
    if let Some(identity) = spec.identity {
        expectation = expectation.for_identity(identity);
    }
    if let Some(respond) = &spec.respond {
        expectation = expectation.with_response(compile_expect(respond, registry)?);
    }
    Ok(expectation)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SuiteError {
    #[error("Cannot read {0}: {1}")]
    Io(PathBuf, String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("schema not found: {0}")]
    SchemaNotFound(String),
    #[error("Invalid expectation: {0}")]
    Expectation(String),
}

impl From<RegistryError> for SuiteError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(name) => Self::SchemaNotFound(name),
            other => Self::Parse(other.to_string()),
        }
    }
}

impl From<ExpectedError> for SuiteError {
    fn from(e: ExpectedError) -> Self {
        Self::Expectation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::generate::SchemaGenerators;

    const SUITE: &str = r#"
groups:
  - name: posts
    steps:
      - name: create post
        setup: true
        request:
          method: POST
          path: /posts
          body: { content: "Tent!" }
        expect:
          status: 201
          schema: post
        save: { post_id: /id }
    async:
      - name: mention delivered
        identity: bob
        request:
          method: PUT
          path: { $pattern: "^/bob/" }
          properties: { content: "Tent!" }
  - name: replies
    depends_on: posts
    steps:
      - request: { method: get, path: "/posts/{post_id}/replies", query: { limit: "2" } }
        expect: { status: { $oneOf: [200, 204] } }
"#;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::new().with(
            "post",
            json!({"type": "object", "required": ["id"], "properties": {"id": {"type": "string"}}}),
        ))
    }

    fn generators() -> Arc<dyn ValueGenerators> {
        Arc::new(SchemaGenerators::seeded(registry(), 1))
    }

    #[test]
    fn parses_yaml_suite() {
        let suite = Suite::from_yaml(SUITE).unwrap();
        assert_eq!(suite.groups.len(), 2);
        assert_eq!(suite.groups[0].async_expectations[0].identity.as_deref(), Some("bob"));
        assert_eq!(suite.groups[1].depends_on.as_deref(), Some("posts"));
        assert!(suite.groups[0].steps[0].setup);
    }

    #[test]
    fn compiles_groups_with_planned_counts() {
        let groups = Suite::from_yaml(SUITE)
            .unwrap()
            .into_groups(&registry(), &generators())
            .unwrap();
        assert_eq!(groups[0].name(), "posts");
        assert!(groups[0].planned >= 3);
        assert_eq!(groups[1].depends_on.as_deref(), Some("posts"));
    }

    #[test]
    fn unknown_schema_fails_compilation() {
        let suite = Suite::from_yaml(
            r"
groups:
  - name: g
    steps:
      - request: { method: GET, path: / }
        expect: { schema: nope }
",
        )
        .unwrap();
        assert_eq!(
            suite.into_groups(&registry(), &generators()).err(),
            Some(SuiteError::SchemaNotFound("nope".into()))
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Suite::from_yaml("groups:\n  - name: g\n    stepz: []\n").unwrap_err();
        assert!(matches!(err, SuiteError::Parse(_)));
    }

    #[test]
    fn toml_suites_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.toml");
        std::fs::write(
            &path,
            r#"
[[groups]]
name = "health"

[[groups.steps]]
request = { method = "GET", path = "/health" }
expect = { status = 200 }
"#,
        )
        .unwrap();
        let suite = Suite::load(&path).unwrap();
        assert_eq!(suite.groups[0].steps[0].expect.status, Some(json!(200)));
    }
}
