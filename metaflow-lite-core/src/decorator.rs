use crate::cards::CardSpec;
use crate::config::ConfigExpr;
use crate::error::Result;
use crate::scope::{FlowScope, Inputs};
use crate::types::{ArtifactMap, ExceptionInfo, Pathspec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

// ─── Deferred attributes ──────────────────────────────────────

/// A decorator attribute: a literal value, or a deferred config
/// reference resolved just before the decorator's hooks run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AttrValue {
    Lit(Value),
    Expr(ConfigExpr),
}

impl AttrValue {
    pub fn lit(v: Value) -> Self {
        AttrValue::Lit(v)
    }

    pub fn expr(path: &str) -> Result<Self> {
        Ok(AttrValue::Expr(ConfigExpr::parse(path)?))
    }

    pub fn resolve(&self, configs: &ArtifactMap) -> Value {
        match self {
            AttrValue::Lit(v) => v.clone(),
            AttrValue::Expr(e) => e.resolve(configs).unwrap_or(Value::Null),
        }
    }
}

fn resolve_attr_map(attrs: &BTreeMap<String, AttrValue>, configs: &ArtifactMap) -> BTreeMap<String, Value> {
    attrs
        .iter()
        .map(|(k, v)| (k.clone(), v.resolve(configs)))
        .collect()
}

// ─── Body call pipeline ───────────────────────────────────────

/// The step body and its state, threaded through `task_decorate` hooks.
pub struct CallState {
    pub scope: FlowScope,
    pub inputs: Option<Inputs>,
}

/// What came back from a (possibly wrapped) body call. `scope` is `None`
/// when the body was abandoned (timeout) and its state lost with it.
pub struct CallOutcome {
    pub scope: Option<FlowScope>,
    pub result: std::result::Result<(), ExceptionInfo>,
}

pub type StepBodyCall = Box<dyn FnOnce(CallState) -> CallOutcome + Send + 'static>;

/// Context handed to every lifecycle hook.
pub struct HookEnv<'a> {
    pub pathspec: &'a Pathspec,
    pub attempt: u32,
    pub max_retries: u32,
    pub configs: &'a ArtifactMap,
}

// ─── Lifecycle trait ──────────────────────────────────────────

/// Ordered lifecycle contributions around the user step body.
///
/// Invocation order: `step_init` once per step; then per attempt
/// `task_pre_step` (registration order), `task_decorate` (wrapping,
/// registration order), the body, `task_post_step` (reverse order), and
/// on failure `task_exception` (reverse order, first suppression wins).
pub trait StepDecorator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declarative attributes, resolved against configs, for graph info
    /// and remote-execution backends.
    fn attributes(&self, _configs: &ArtifactMap) -> Value {
        json!({})
    }

    fn step_init(&self, _flow_name: &str, _step_name: &str) -> Result<()> {
        Ok(())
    }

    fn task_pre_step(&self, _env: &HookEnv<'_>, _scope: &mut FlowScope) -> Result<()> {
        Ok(())
    }

    fn task_decorate(&self, body: StepBodyCall, _env: &HookEnv<'_>) -> StepBodyCall {
        body
    }

    fn task_post_step(&self, _env: &HookEnv<'_>, _scope: &mut FlowScope) -> Result<()> {
        Ok(())
    }

    /// Return true to suppress the exception; the first suppressing hook
    /// (in reverse registration order) stops propagation.
    fn task_exception(
        &self,
        _exc: &ExceptionInfo,
        _env: &HookEnv<'_>,
        _scope: &mut FlowScope,
    ) -> bool {
        false
    }

    /// Maximum retry count contributed by this decorator.
    fn retry_times(&self) -> Option<u32> {
        None
    }

    fn minutes_between_retries(&self) -> Option<u32> {
        None
    }

    /// Whether a `@catch` is present (governs the signal-kill path).
    fn is_catch(&self) -> bool {
        false
    }

    fn card_spec(&self) -> Option<&CardSpec> {
        None
    }
}

// ─── retry ────────────────────────────────────────────────────

/// Sets the attempt budget; the executor resets artifacts from the
/// pre-execution snapshot between attempts.
pub struct Retry {
    times: u32,
    minutes_between_retries: u32,
}

impl Retry {
    pub fn new(times: u32, minutes_between_retries: u32) -> Self {
        Self {
            times,
            minutes_between_retries,
        }
    }
}

impl StepDecorator for Retry {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn attributes(&self, _configs: &ArtifactMap) -> Value {
        json!({
            "times": self.times,
            "minutes_between_retries": self.minutes_between_retries,
        })
    }

    fn retry_times(&self) -> Option<u32> {
        Some(self.times)
    }

    fn minutes_between_retries(&self) -> Option<u32> {
        Some(self.minutes_between_retries)
    }
}

// ─── catch ────────────────────────────────────────────────────

/// On the final failed attempt, stores the wrapped exception under `var`
/// and suppresses propagation.
pub struct Catch {
    var: Option<String>,
    print_exception: bool,
}

impl Catch {
    pub fn var(var: &str) -> Self {
        Self {
            var: Some(var.to_string()),
            print_exception: true,
        }
    }

    pub fn silent(var: &str) -> Self {
        Self {
            var: Some(var.to_string()),
            print_exception: false,
        }
    }
}

impl StepDecorator for Catch {
    fn name(&self) -> &'static str {
        "catch"
    }

    fn attributes(&self, _configs: &ArtifactMap) -> Value {
        json!({ "var": self.var, "print_exception": self.print_exception })
    }

    fn is_catch(&self) -> bool {
        true
    }

    fn task_exception(
        &self,
        exc: &ExceptionInfo,
        env: &HookEnv<'_>,
        scope: &mut FlowScope,
    ) -> bool {
        if self.print_exception {
            tracing::error!(pathspec = %env.pathspec, exception = %exc, "caught step failure");
        }
        if let Some(var) = &self.var {
            scope.set_raw(var, exc.to_value());
        }
        true
    }
}

// ─── timeout ──────────────────────────────────────────────────

/// Fails the body with a timeout once the wall-clock budget elapses.
/// A zero budget applies no timeout.
pub struct Timeout {
    seconds: u64,
    minutes: u64,
    hours: u64,
}

impl Timeout {
    pub fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            minutes: 0,
            hours: 0,
        }
    }

    pub fn new(hours: u64, minutes: u64, seconds: u64) -> Self {
        Self {
            seconds,
            minutes,
            hours,
        }
    }

    fn budget(&self) -> Duration {
        Duration::from_secs(self.seconds + self.minutes * 60 + self.hours * 3600)
    }
}

impl StepDecorator for Timeout {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn attributes(&self, _configs: &ArtifactMap) -> Value {
        json!({ "seconds": self.seconds, "minutes": self.minutes, "hours": self.hours })
    }

    fn task_decorate(&self, body: StepBodyCall, _env: &HookEnv<'_>) -> StepBodyCall {
        let budget = self.budget();
        if budget.is_zero() {
            return body;
        }
        Box::new(move |state: CallState| {
            // The body runs on its own thread; on expiry the attempt
            // fails immediately and the stray thread dies with the child
            // process.
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let outcome = body(state);
                let _ = tx.send(outcome);
            });
            match rx.recv_timeout(budget) {
                Ok(outcome) => outcome,
                Err(_) => CallOutcome {
                    scope: None,
                    result: Err(ExceptionInfo::new(
                        "TimeoutException",
                        format!("step timed out after {} seconds", budget.as_secs()),
                    )),
                },
            }
        })
    }
}

// ─── environment ──────────────────────────────────────────────

/// Sets environment variables before the body runs (in the child
/// process, so they never leak into the orchestrator).
pub struct Environment {
    vars: BTreeMap<String, AttrValue>,
}

impl Environment {
    pub fn new(vars: &[(&str, &str)]) -> Self {
        Self {
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), AttrValue::Lit(json!(v))))
                .collect(),
        }
    }

    pub fn with_values(vars: BTreeMap<String, AttrValue>) -> Self {
        Self { vars }
    }
}

impl StepDecorator for Environment {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn attributes(&self, configs: &ArtifactMap) -> Value {
        json!({ "vars": resolve_attr_map(&self.vars, configs) })
    }

    fn task_pre_step(&self, env: &HookEnv<'_>, _scope: &mut FlowScope) -> Result<()> {
        for (key, attr) in &self.vars {
            let value = attr.resolve(env.configs);
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            std::env::set_var(key, rendered);
        }
        Ok(())
    }
}

// ─── secrets ──────────────────────────────────────────────────

/// A pluggable secrets backend: fetch a named bundle of env vars.
pub trait SecretsBackend: Send + Sync {
    fn fetch(&self, secret_id: &str, options: &Value) -> anyhow::Result<BTreeMap<String, String>>;
}

/// One secret source: a backend type plus the secret id within it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretSource {
    pub backend: String,
    pub secret_id: String,
    #[serde(default)]
    pub options: Value,
}

/// Fetches named secret bundles and exposes them as environment
/// variables, after validating names and collisions.
pub struct Secrets {
    sources: Vec<SecretSource>,
    inline: BTreeMap<String, AttrValue>,
    backends: BTreeMap<String, Arc<dyn SecretsBackend>>,
}

impl Secrets {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            inline: BTreeMap::new(),
            backends: BTreeMap::new(),
        }
    }

    pub fn inline(mut self, key: &str, value: &str) -> Self {
        self.inline
            .insert(key.to_string(), AttrValue::Lit(json!(value)));
        self
    }

    pub fn source(mut self, source: SecretSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn backend(mut self, name: &str, backend: Arc<dyn SecretsBackend>) -> Self {
        self.backends.insert(name.to_string(), backend);
        self
    }

    fn validate_name(key: &str) -> Result<()> {
        let valid = !key.is_empty()
            && key
                .chars()
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false)
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(crate::error::CoreError::Internal(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        if key.starts_with("METAFLOW_") {
            return Err(crate::error::CoreError::Internal(format!(
                "environment variable '{key}' must not start with METAFLOW_"
            )));
        }
        Ok(())
    }

    /// Gather all bundles, validating names, cross-source collisions and
    /// shadowing of pre-existing environment variables.
    fn collect(&self, configs: &ArtifactMap) -> Result<BTreeMap<String, String>> {
        let mut bundles: Vec<(String, BTreeMap<String, String>)> = Vec::new();

        if !self.inline.is_empty() {
            let vars = resolve_attr_map(&self.inline, configs)
                .into_iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, rendered)
                })
                .collect();
            bundles.push(("inline".to_string(), vars));
        }

        for source in &self.sources {
            let backend = self.backends.get(&source.backend).ok_or_else(|| {
                crate::error::CoreError::Internal(format!(
                    "unknown secrets backend '{}'",
                    source.backend
                ))
            })?;
            let vars = backend.fetch(&source.secret_id, &source.options).map_err(|e| {
                crate::error::CoreError::Internal(format!(
                    "secret '{}' fetch failed: {e}",
                    source.secret_id
                ))
            })?;
            bundles.push((source.secret_id.clone(), vars));
        }

        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        let mut owner: BTreeMap<String, String> = BTreeMap::new();
        for (bundle_name, vars) in bundles {
            for (key, value) in vars {
                Self::validate_name(&key)?;
                if let Some(prev) = owner.get(&key) {
                    return Err(crate::error::CoreError::Internal(format!(
                        "environment variable '{key}' is defined by both '{prev}' and '{bundle_name}'"
                    )));
                }
                if std::env::var_os(&key).is_some() {
                    return Err(crate::error::CoreError::Internal(format!(
                        "secret '{bundle_name}' would shadow existing environment variable '{key}'"
                    )));
                }
                owner.insert(key.clone(), bundle_name.clone());
                merged.insert(key, value);
            }
        }
        Ok(merged)
    }
}

impl Default for Secrets {
    fn default() -> Self {
        Self::new()
    }
}

impl StepDecorator for Secrets {
    fn name(&self) -> &'static str {
        "secrets"
    }

    fn attributes(&self, _configs: &ArtifactMap) -> Value {
        json!({ "sources": self.sources, "inline_keys": self.inline.keys().collect::<Vec<_>>() })
    }

    fn task_pre_step(&self, env: &HookEnv<'_>, _scope: &mut FlowScope) -> Result<()> {
        for (key, value) in self.collect(env.configs)? {
            std::env::set_var(key, value);
        }
        Ok(())
    }
}

// ─── card ─────────────────────────────────────────────────────

/// Declares a report rendered after each successful attempt of the step.
pub struct Card {
    spec: CardSpec,
}

impl Card {
    pub fn new(spec: CardSpec) -> Self {
        Self { spec }
    }
}

impl StepDecorator for Card {
    fn name(&self) -> &'static str {
        "card"
    }

    fn attributes(&self, _configs: &ArtifactMap) -> Value {
        json!({
            "type": self.spec.card_type,
            "id": self.spec.id,
            "save_errors": self.spec.save_errors,
        })
    }

    fn card_spec(&self) -> Option<&CardSpec> {
        Some(&self.spec)
    }
}

// ─── Declarative-only decorators ──────────────────────────────

macro_rules! declarative_decorator {
    ($(#[$doc:meta])* $name:ident, $tag:literal) => {
        $(#[$doc])*
        #[derive(Default)]
        pub struct $name {
            attrs: BTreeMap<String, AttrValue>,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn attr(mut self, key: &str, value: AttrValue) -> Self {
                self.attrs.insert(key.to_string(), value);
                self
            }
        }

        impl StepDecorator for $name {
            fn name(&self) -> &'static str {
                $tag
            }

            fn attributes(&self, configs: &ArtifactMap) -> Value {
                json!(resolve_attr_map(&self.attrs, configs))
            }
        }
    };
}

declarative_decorator!(
    /// Marks the step as a parallel group member; the scheduler creates
    /// the worker tasks.
    Parallel,
    "parallel"
);
declarative_decorator!(
    /// Resource requests consumed by remote-execution backends.
    Resources,
    "resources"
);
declarative_decorator!(
    /// Conda package metadata, declarative only.
    Conda,
    "conda"
);
declarative_decorator!(
    /// PyPI package metadata, declarative only.
    Pypi,
    "pypi"
);
declarative_decorator!(
    /// Kubernetes execution attributes, declarative only.
    Kubernetes,
    "kubernetes"
);

// ─── Flow-level decorators ────────────────────────────────────

/// Project naming computed at run start.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project_name: String,
    pub branch_name: String,
    pub project_flow_name: String,
    pub is_production: bool,
}

/// What a flow-level decorator contributes at run start.
#[derive(Default)]
pub struct FlowInit {
    pub sys_tags: Vec<String>,
    pub project: Option<ProjectInfo>,
}

/// Flow-level decorators run once at run start to augment system tags
/// and project naming; they never run during task execution.
pub trait FlowDecorator: Send + Sync {
    fn name(&self) -> &'static str;

    fn flow_init(&self, _flow_name: &str, _configs: &ArtifactMap) -> FlowInit {
        FlowInit::default()
    }
}

/// Namespaces the flow under a project with a branch derived from
/// `METAFLOW_PRODUCTION` / `METAFLOW_BRANCH` / the invoking user.
pub struct Project {
    name: AttrValue,
}

impl Project {
    pub fn named(name: &str) -> Self {
        Self {
            name: AttrValue::Lit(json!(name)),
        }
    }

    pub fn from_attr(name: AttrValue) -> Self {
        Self { name }
    }
}

impl FlowDecorator for Project {
    fn name(&self) -> &'static str {
        "project"
    }

    fn flow_init(&self, flow_name: &str, configs: &ArtifactMap) -> FlowInit {
        let project = match self.name.resolve(configs) {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let username = crate::types::username();
        let (branch, is_production) = if std::env::var_os("METAFLOW_PRODUCTION").is_some() {
            ("prod".to_string(), true)
        } else if let Ok(branch) = std::env::var("METAFLOW_BRANCH") {
            (format!("test.{branch}"), false)
        } else {
            (format!("user.{username}"), false)
        };

        let mut sys_tags = vec![
            format!("project:{project}"),
            format!("project_branch:{branch}"),
        ];
        if is_production {
            sys_tags.push("production:true".to_string());
        }

        FlowInit {
            sys_tags,
            project: Some(ProjectInfo {
                project_flow_name: format!("{project}.{branch}.{flow_name}"),
                project_name: project,
                branch_name: branch,
                is_production,
            }),
        }
    }
}

macro_rules! declarative_flow_decorator {
    ($(#[$doc:meta])* $name:ident, $tag:literal) => {
        $(#[$doc])*
        #[derive(Default)]
        pub struct $name {
            pub attrs: BTreeMap<String, Value>,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn attr(mut self, key: &str, value: Value) -> Self {
                self.attrs.insert(key.to_string(), value);
                self
            }
        }

        impl FlowDecorator for $name {
            fn name(&self) -> &'static str {
                $tag
            }
        }
    };
}

declarative_flow_decorator!(
    /// Cron-style schedule metadata for orchestrator backends.
    Schedule,
    "schedule"
);
declarative_flow_decorator!(
    /// Event-trigger metadata for orchestrator backends.
    Trigger,
    "trigger"
);
declarative_flow_decorator!(
    /// Run-completion trigger metadata for orchestrator backends.
    TriggerOnFinish,
    "trigger_on_finish"
);

// ─── Pipeline helpers ─────────────────────────────────────────

/// The attempt budget: the largest `retry.times` among the decorators.
pub fn max_retries(decorators: &[Arc<dyn StepDecorator>]) -> u32 {
    decorators
        .iter()
        .filter_map(|d| d.retry_times())
        .max()
        .unwrap_or(0)
}

pub fn has_catch(decorators: &[Arc<dyn StepDecorator>]) -> bool {
    decorators.iter().any(|d| d.is_catch())
}

pub fn card_specs(decorators: &[Arc<dyn StepDecorator>]) -> Vec<CardSpec> {
    decorators
        .iter()
        .filter_map(|d| d.card_spec())
        .cloned()
        .collect()
}

/// Run `task_exception` hooks in reverse registration order; the first
/// suppression wins.
pub fn run_exception_hooks(
    decorators: &[Arc<dyn StepDecorator>],
    exc: &ExceptionInfo,
    env: &HookEnv<'_>,
    scope: &mut FlowScope,
) -> bool {
    for deco in decorators.iter().rev() {
        if deco.task_exception(exc, env, scope) {
            tracing::debug!(decorator = deco.name(), "exception suppressed");
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(ps: &'a Pathspec, configs: &'a ArtifactMap) -> HookEnv<'a> {
        HookEnv {
            pathspec: ps,
            attempt: 0,
            max_retries: 0,
            configs,
        }
    }

    #[test]
    fn test_retry_budget() {
        let decos: Vec<Arc<dyn StepDecorator>> =
            vec![Arc::new(Catch::var("err")), Arc::new(Retry::new(2, 0))];
        assert_eq!(max_retries(&decos), 2);
        assert!(has_catch(&decos));

        let none: Vec<Arc<dyn StepDecorator>> = vec![];
        assert_eq!(max_retries(&none), 0);
        assert!(!has_catch(&none));
    }

    #[test]
    fn test_catch_stores_wrapper() {
        let ps = Pathspec::new("F", "1", "s", "1");
        let configs = ArtifactMap::new();
        let mut scope = FlowScope::for_step("s", None, false);
        let exc = ExceptionInfo::new("UserStepException", "boom");

        let catch = Catch::var("err");
        assert!(catch.task_exception(&exc, &env(&ps, &configs), &mut scope));
        let stored = scope.get("err").unwrap();
        assert_eq!(stored.get("type").unwrap(), "UserStepException");
        assert_eq!(stored.get("message").unwrap(), "boom");
    }

    /// First suppressing hook in reverse order wins
    #[test]
    fn test_exception_hook_order() {
        let ps = Pathspec::new("F", "1", "s", "1");
        let configs = ArtifactMap::new();
        let mut scope = FlowScope::for_step("s", None, false);
        let decos: Vec<Arc<dyn StepDecorator>> =
            vec![Arc::new(Retry::new(1, 0)), Arc::new(Catch::var("err"))];
        let exc = ExceptionInfo::new("UserStepException", "boom");
        assert!(run_exception_hooks(
            &decos,
            &exc,
            &env(&ps, &configs),
            &mut scope
        ));
        assert!(scope.has("err"));
    }

    #[test]
    fn test_timeout_zero_budget_is_noop() {
        let ps = Pathspec::new("F", "1", "s", "1");
        let configs = ArtifactMap::new();
        let timeout = Timeout::seconds(0);
        let body: StepBodyCall = Box::new(|state| CallOutcome {
            scope: Some(state.scope),
            result: Ok(()),
        });
        let wrapped = timeout.task_decorate(body, &env(&ps, &configs));
        let outcome = wrapped(CallState {
            scope: FlowScope::for_step("s", None, false),
            inputs: None,
        });
        assert!(outcome.result.is_ok());
        assert!(outcome.scope.is_some());
    }

    #[test]
    fn test_timeout_expires() {
        let ps = Pathspec::new("F", "1", "s", "1");
        let configs = ArtifactMap::new();
        let timeout = Timeout::seconds(1);
        let body: StepBodyCall = Box::new(|state| {
            std::thread::sleep(Duration::from_secs(30));
            CallOutcome {
                scope: Some(state.scope),
                result: Ok(()),
            }
        });
        let wrapped = timeout.task_decorate(body, &env(&ps, &configs));
        let outcome = wrapped(CallState {
            scope: FlowScope::for_step("s", None, false),
            inputs: None,
        });
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind, "TimeoutException");
        assert!(outcome.scope.is_none());
    }

    #[test]
    fn test_secrets_validation() {
        assert!(Secrets::validate_name("API_KEY").is_ok());
        assert!(Secrets::validate_name("_private").is_ok());
        assert!(Secrets::validate_name("9bad").is_err());
        assert!(Secrets::validate_name("has-dash").is_err());
        assert!(Secrets::validate_name("METAFLOW_SECRET").is_err());
        assert!(Secrets::validate_name("").is_err());
    }

    struct MapBackend(BTreeMap<String, String>);

    impl SecretsBackend for MapBackend {
        fn fetch(&self, _id: &str, _options: &Value) -> anyhow::Result<BTreeMap<String, String>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_secrets_collision_detection() {
        let configs = ArtifactMap::new();
        let backend = Arc::new(MapBackend(BTreeMap::from([(
            "TOKEN".to_string(),
            "abc".to_string(),
        )])));
        let secrets = Secrets::new()
            .inline("TOKEN", "xyz")
            .backend("vault", backend)
            .source(SecretSource {
                backend: "vault".to_string(),
                secret_id: "svc".to_string(),
                options: Value::Null,
            });
        let err = secrets.collect(&configs).unwrap_err();
        assert!(err.to_string().contains("TOKEN"));
    }

    #[test]
    fn test_project_flow_init() {
        let configs = ArtifactMap::new();
        let project = Project::named("fraud");
        let init = project.flow_init("ScoreFlow", &configs);
        let info = init.project.unwrap();
        assert_eq!(info.project_name, "fraud");
        assert!(info.project_flow_name.starts_with("fraud."));
        assert!(info.project_flow_name.ends_with(".ScoreFlow"));
        assert!(init.sys_tags.iter().any(|t| t == "project:fraud"));
        assert!(init
            .sys_tags
            .iter()
            .any(|t| t.starts_with("project_branch:")));
    }

    #[test]
    fn test_attr_value_resolution() {
        let configs = ArtifactMap::from([(
            "settings".to_string(),
            json!({ "gpu": 2 }),
        )]);
        let resources = Resources::new()
            .attr("cpu", AttrValue::lit(json!(4)))
            .attr("gpu", AttrValue::expr("settings.gpu").unwrap());
        let attrs = resources.attributes(&configs);
        assert_eq!(attrs.get("cpu").unwrap(), &json!(4));
        assert_eq!(attrs.get("gpu").unwrap(), &json!(2));
    }
}
