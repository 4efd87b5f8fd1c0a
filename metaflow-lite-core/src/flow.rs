use crate::config::Config;
use crate::decorator::{Catch, FlowDecorator, Retry, StepDecorator, Timeout};
use crate::error::{CoreError, Result};
use crate::graph::{FlowGraph, StepDecl};
use crate::params::Parameter;
use crate::scope::{FlowScope, Inputs};
use crate::types::{ArtifactMap, Transition};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// ─── Step bodies ──────────────────────────────────────────────

pub type StepBodyFn = Arc<dyn Fn(&mut FlowScope) -> anyhow::Result<()> + Send + Sync>;
pub type JoinBodyFn = Arc<dyn Fn(&mut FlowScope, &Inputs) -> anyhow::Result<()> + Send + Sync>;

/// User code for one step. A join body takes the `Inputs` view as its
/// second parameter, which is what classifies the step as a join.
#[derive(Clone)]
pub enum StepBody {
    Linear(StepBodyFn),
    Join(JoinBodyFn),
}

impl StepBody {
    pub fn takes_inputs(&self) -> bool {
        matches!(self, StepBody::Join(_))
    }
}

// ─── Transition declarations ──────────────────────────────────

/// Registration-time transition declaration. The step body re-declares
/// the same transition at runtime via `FlowScope::next_*`.
#[derive(Clone, Debug)]
pub struct Next(Transition);

impl Next {
    /// No successor; only legal on the `end` step.
    pub fn end() -> Self {
        Next(Transition::default())
    }

    pub fn linear(target: &str) -> Self {
        Next(Transition {
            targets: vec![target.to_string()],
            ..Default::default()
        })
    }

    pub fn split(targets: &[&str]) -> Self {
        Next(Transition {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn foreach(target: &str, var: &str) -> Self {
        Next(Transition {
            targets: vec![target.to_string()],
            foreach_var: Some(var.to_string()),
            ..Default::default()
        })
    }

    /// Foreach whose source size is only known at runtime; the scheduler
    /// synthesises control tasks for such splits.
    pub fn foreach_unbounded(target: &str, var: &str) -> Self {
        Next(Transition {
            targets: vec![target.to_string()],
            foreach_var: Some(var.to_string()),
            unbounded: true,
            ..Default::default()
        })
    }

    pub fn parallel(target: &str, num_parallel: usize) -> Self {
        Next(Transition {
            targets: vec![target.to_string()],
            num_parallel: Some(num_parallel),
            ..Default::default()
        })
    }

    pub fn switch(targets: &[&str], condition_var: &str) -> Self {
        Next(Transition {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            condition_var: Some(condition_var.to_string()),
            ..Default::default()
        })
    }

    /// Dict-style switch: condition values map to target steps.
    pub fn switch_map(condition_var: &str, map: &[(&str, &str)]) -> Self {
        let mut targets: Vec<String> = Vec::new();
        for (_, v) in map {
            if !targets.contains(&v.to_string()) {
                targets.push(v.to_string());
            }
        }
        Next(Transition {
            targets,
            condition_var: Some(condition_var.to_string()),
            switch_map: Some(
                map.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        })
    }

    pub fn into_transition(self) -> Transition {
        self.0
    }
}

// ─── Step definitions ─────────────────────────────────────────

/// One registered step: name, body, declared transition, decorators.
#[derive(Clone)]
pub struct StepDef {
    pub name: String,
    pub body: StepBody,
    pub next: Transition,
    pub decorators: Vec<Arc<dyn StepDecorator>>,
}

impl StepDef {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&mut FlowScope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            body: StepBody::Linear(Arc::new(body)),
            next: Transition::default(),
            decorators: Vec::new(),
        }
    }

    /// Register a join step; the second parameter carries one entry per
    /// contributing predecessor task.
    pub fn join<F>(name: &str, body: F) -> Self
    where
        F: Fn(&mut FlowScope, &Inputs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            body: StepBody::Join(Arc::new(body)),
            next: Transition::default(),
            decorators: Vec::new(),
        }
    }

    pub fn next(mut self, next: Next) -> Self {
        self.next = next.into_transition();
        self
    }

    pub fn with(mut self, decorator: Arc<dyn StepDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    pub fn retry(self, times: u32, minutes_between_retries: u32) -> Self {
        self.with(Arc::new(Retry::new(times, minutes_between_retries)))
    }

    pub fn catch(self, var: &str) -> Self {
        self.with(Arc::new(Catch::var(var)))
    }

    pub fn timeout_secs(self, seconds: u64) -> Self {
        self.with(Arc::new(Timeout::seconds(seconds)))
    }

    pub fn decorator_names(&self) -> Vec<&'static str> {
        self.decorators.iter().map(|d| d.name()).collect()
    }
}

// ─── Flow-level mutators ──────────────────────────────────────

/// Mutable view of a flow under construction, handed to `FlowMutator`s
/// before graph analysis.
pub struct MutableFlow<'a> {
    steps: &'a mut Vec<StepDef>,
    params: &'a mut Vec<Parameter>,
}

impl<'a> MutableFlow<'a> {
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    pub fn step_mut(&mut self, name: &str) -> Option<MutableStep<'_>> {
        self.steps
            .iter_mut()
            .find(|s| s.name == name)
            .map(|def| MutableStep { def })
    }

    pub fn start(&mut self) -> Option<MutableStep<'_>> {
        self.step_mut("start")
    }

    pub fn add_parameter(&mut self, param: Parameter) {
        self.params.push(param);
    }
}

/// Mutable view of one step for decorator surgery.
pub struct MutableStep<'a> {
    def: &'a mut StepDef,
}

impl<'a> MutableStep<'a> {
    pub fn decorator_names(&self) -> Vec<&'static str> {
        self.def.decorator_names()
    }

    pub fn add_decorator(&mut self, decorator: Arc<dyn StepDecorator>) {
        self.def.decorators.push(decorator);
    }

    pub fn remove_decorator(&mut self, name: &str) {
        self.def.decorators.retain(|d| d.name() != name);
    }
}

/// Flow-level rewriting applied at registration time, before the graph is
/// analysed.
pub trait FlowMutator: Send + Sync {
    fn mutate(&self, flow: &mut MutableFlow<'_>);
}

// ─── Flow definition & builder ────────────────────────────────

/// An analysed, immutable flow definition.
pub struct FlowDef {
    name: String,
    steps: Vec<StepDef>,
    step_index: BTreeMap<String, usize>,
    pub params: Vec<Parameter>,
    pub configs: Vec<Config>,
    pub class_vars: ArtifactMap,
    pub flow_decorators: Vec<Arc<dyn FlowDecorator>>,
    graph: FlowGraph,
}

impl std::fmt::Debug for FlowDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDef")
            .field("name", &self.name)
            .field("graph", &self.graph)
            .finish()
    }
}

impl FlowDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.step_index.get(name).map(|i| &self.steps[*i])
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepDef> {
        self.steps.iter()
    }
}

pub struct FlowBuilder {
    name: String,
    steps: Vec<StepDef>,
    params: Vec<Parameter>,
    configs: Vec<Config>,
    class_vars: ArtifactMap,
    flow_decorators: Vec<Arc<dyn FlowDecorator>>,
    mutators: Vec<Arc<dyn FlowMutator>>,
}

impl FlowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
            params: Vec::new(),
            configs: Vec::new(),
            class_vars: ArtifactMap::new(),
            flow_decorators: Vec::new(),
            mutators: Vec::new(),
        }
    }

    pub fn step(mut self, def: StepDef) -> Self {
        self.steps.push(def);
        self
    }

    pub fn param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.configs.push(config);
        self
    }

    /// A class-level constant, bound immutably on every task scope.
    pub fn constant(mut self, name: &str, value: Value) -> Self {
        self.class_vars.insert(name.to_string(), value);
        self
    }

    pub fn flow_decorator(mut self, deco: Arc<dyn FlowDecorator>) -> Self {
        self.flow_decorators.push(deco);
        self
    }

    pub fn mutate(mut self, mutator: Arc<dyn FlowMutator>) -> Self {
        self.mutators.push(mutator);
        self
    }

    /// Apply mutators, analyse the graph, and freeze the definition.
    pub fn build(mut self) -> Result<FlowDef> {
        for mutator in &self.mutators {
            let mut view = MutableFlow {
                steps: &mut self.steps,
                params: &mut self.params,
            };
            mutator.mutate(&mut view);
        }

        let decls: Vec<StepDecl> = self
            .steps
            .iter()
            .map(|s| StepDecl {
                name: s.name.clone(),
                next: s.next.clone(),
                takes_inputs: s.body.takes_inputs(),
            })
            .collect();
        let graph = FlowGraph::analyse(&self.name, &decls)?;

        let mut step_index = BTreeMap::new();
        for (i, s) in self.steps.iter().enumerate() {
            step_index.insert(s.name.clone(), i);
        }

        let mut seen = std::collections::BTreeSet::new();
        for p in &self.params {
            if !seen.insert(p.name.clone()) {
                return Err(CoreError::GraphInvariant(format!(
                    "duplicate parameter '{}'",
                    p.name
                )));
            }
        }

        Ok(FlowDef {
            name: self.name,
            steps: self.steps,
            step_index,
            params: self.params,
            configs: self.configs,
            class_vars: self.class_vars,
            flow_decorators: self.flow_decorators,
            graph,
        })
    }
}

// ─── Registry ─────────────────────────────────────────────────

/// Explicit flow registry, populated at program start. Worker
/// subprocesses use it to reconstruct the flow definition by name.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, Arc<FlowDef>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, flow: FlowDef) -> Self {
        self.flows.insert(flow.name().to_string(), Arc::new(flow));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<FlowDef>> {
        self.flows
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("flow '{name}' is not registered")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StepKind;
    use serde_json::json;

    fn hello_flow() -> FlowDef {
        FlowBuilder::new("HelloFlow")
            .step(
                StepDef::new("start", |f| {
                    f.set("x", json!(1))?;
                    f.next("end")?;
                    Ok(())
                })
                .next(Next::linear("end")),
            )
            .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_analyses_graph() {
        let flow = hello_flow();
        assert_eq!(flow.name(), "HelloFlow");
        assert_eq!(flow.graph().node("start").unwrap().kind, StepKind::Start);
        assert_eq!(flow.graph().topo_order(), &["start", "end"]);
    }

    #[test]
    fn test_registry_lookup() {
        let reg = FlowRegistry::new().register(hello_flow());
        assert!(reg.get("HelloFlow").is_ok());
        assert!(matches!(
            reg.get("Nope").unwrap_err(),
            CoreError::NotFound(_)
        ));
    }

    struct ForceRetries;

    impl FlowMutator for ForceRetries {
        fn mutate(&self, flow: &mut MutableFlow<'_>) {
            for name in flow.step_names() {
                if let Some(mut step) = flow.step_mut(&name) {
                    if !step.decorator_names().contains(&"retry") {
                        step.add_decorator(Arc::new(Retry::new(2, 0)));
                    }
                }
            }
        }
    }

    /// Mutators rewrite decorators before the graph is frozen
    #[test]
    fn test_flow_mutator_adds_decorators() {
        let flow = FlowBuilder::new("Mutated")
            .step(
                StepDef::new("start", |f| {
                    f.next("end")?;
                    Ok(())
                })
                .next(Next::linear("end")),
            )
            .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
            .mutate(Arc::new(ForceRetries))
            .build()
            .unwrap();
        assert!(flow.step("start").unwrap().decorator_names().contains(&"retry"));
        assert!(flow.step("end").unwrap().decorator_names().contains(&"retry"));
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let err = FlowBuilder::new("Dup")
            .param(Parameter::new("alpha"))
            .param(Parameter::new("alpha"))
            .step(
                StepDef::new("start", |f| {
                    f.next("end")?;
                    Ok(())
                })
                .next(Next::linear("end")),
            )
            .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::GraphInvariant(_)));
    }
}
