use crate::config::{resolve_configs, ConfigInputs};
use crate::current;
use crate::datastore::{Datastore, DatastoreConfig};
use crate::decorator::ProjectInfo;
use crate::error::{CoreError, Result};
use crate::executor::{RunEnv, TaskExecutor, TaskRequest};
use crate::flow::FlowDef;
use crate::graph::{FlowGraph, FlowNode, StepKind};
use crate::metadata::{MetadataConfig, MetadataProvider};
use crate::params::resolve_params;
use crate::scope::{InputSlot, Inputs};
use crate::types::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Run-level knobs handed to the scheduler by the runner or CLI.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub tags: Vec<String>,
    pub param_overrides: BTreeMap<String, String>,
    pub config_inputs: ConfigInputs,
    pub origin_run_id: Option<String>,
    /// Budget for remote fan-out; the local scheduler runs children one
    /// at a time regardless.
    pub max_workers: usize,
    /// Executable re-invoked as the task worker; the current binary when
    /// unset.
    pub worker_exe: Option<PathBuf>,
}

/// The runtime scheduler: walks the analysed graph in topological order,
/// materialises tasks, routes artifacts between them, drives foreach and
/// switch structures, and applies resume.
pub struct Scheduler {
    flow: Arc<FlowDef>,
    datastore: Arc<dyn Datastore>,
    metadata: Arc<dyn MetadataProvider>,
    datastore_cfg: DatastoreConfig,
    metadata_cfg: MetadataConfig,
    run_id: String,
    options: RunOptions,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow: Arc<FlowDef>,
        datastore: Arc<dyn Datastore>,
        metadata: Arc<dyn MetadataProvider>,
        datastore_cfg: DatastoreConfig,
        metadata_cfg: MetadataConfig,
        run_id: String,
        options: RunOptions,
    ) -> Self {
        Self {
            flow,
            datastore,
            metadata,
            datastore_cfg,
            metadata_cfg,
            run_id,
            options,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute the flow to completion. With `resume_step`, replay the
    /// origin run up to that step and re-execute from there.
    ///
    /// The run is stamped done in metadata whether or not it succeeded.
    pub async fn execute(&mut self, resume_step: Option<&str>) -> Result<()> {
        let flow_name = self.flow.name().to_string();

        let configs = resolve_configs(&self.flow.configs, &self.options.config_inputs)?;
        let params = resolve_params(
            &self.flow.params,
            &self.options.param_overrides,
            &configs,
            &flow_name,
        )?;

        // System tags: the invoking user, the runtime marker, and
        // whatever flow-level decorators contribute at run start.
        let user = username();
        let mut sys_tags = vec![format!("user:{user}"), "runtime:local".to_string()];
        let mut project: Option<ProjectInfo> = None;
        for deco in &self.flow.flow_decorators {
            let init = deco.flow_init(&flow_name, &configs);
            for tag in init.sys_tags {
                if !sys_tags.contains(&tag) {
                    sys_tags.push(tag);
                }
            }
            if init.project.is_some() {
                project = init.project;
            }
        }

        // User tags must be valid; collisions with system tags drop
        // silently.
        let mut tags = Vec::new();
        for tag in &self.options.tags {
            validate_tag(tag)?;
            if !sys_tags.contains(tag) && !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        self.metadata
            .new_run(&flow_name, &self.run_id, &tags, &sys_tags)
            .await?;

        let worker_exe = match &self.options.worker_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()?,
        };
        let env = RunEnv {
            flow: self.flow.clone(),
            run_id: self.run_id.clone(),
            tags,
            sys_tags,
            resolved_params: params,
            resolved_configs: configs,
            project,
            origin_run_id: self.options.origin_run_id.clone(),
            datastore: self.datastore.clone(),
            metadata: self.metadata.clone(),
            datastore_cfg: self.datastore_cfg.clone(),
            metadata_cfg: self.metadata_cfg.clone(),
            worker_exe,
        };

        current::bind(env.task_context("", "", None));

        // Resume runs allocate task ids beyond the origin run's highest,
        // so every id in the new run is distinct from the origin's.
        let mut task_counter = 0u64;
        if let Some(origin) = &self.options.origin_run_id {
            for step in self.metadata.get_step_names(&flow_name, origin).await? {
                for tid in self
                    .metadata
                    .get_task_ids(&flow_name, origin, &step)
                    .await?
                {
                    if let Ok(n) = tid.parse::<u64>() {
                        task_counter = task_counter.max(n);
                    }
                }
            }
        }

        let mut walk = Walk {
            env: &env,
            task_counter,
            step_results: BTreeMap::new(),
            executed: BTreeSet::new(),
            reused: BTreeSet::new(),
        };

        let result = walk.run(resume_step).await;

        // The DAG shape goes on the start task so tooling can rebuild it
        // without the flow definition.
        if let Some((start_tid, _)) = walk
            .step_results
            .get("start")
            .and_then(|r| r.first())
        {
            let ps = Pathspec::new(&flow_name, &self.run_id, "start", start_tid);
            let blob = value_to_blob(&self.flow.graph().info_value())?;
            let mut arts = BlobMap::new();
            arts.insert(ART_GRAPH_INFO.to_string(), blob);
            self.datastore.save_artifacts(&ps, &arts).await?;
        }

        // A failing run still gets its done stamp.
        self.metadata.done_run(&flow_name, &self.run_id).await?;
        current::clear();

        match &result {
            Ok(()) => tracing::info!(run_id = %self.run_id, "run done"),
            Err(e) => tracing::error!(run_id = %self.run_id, error = %e, "run failed"),
        }
        result
    }
}

// ─── The walk ─────────────────────────────────────────────────

/// Per-run mutable state threaded through the graph walk.
struct Walk<'a> {
    env: &'a RunEnv,
    task_counter: u64,
    /// step name → (task id, persisted artifacts) in creation order.
    step_results: BTreeMap<String, Vec<(String, ArtifactMap)>>,
    executed: BTreeSet<String>,
    reused: BTreeSet<String>,
}

/// Overrides for foreach splits launched from inside another chain.
#[derive(Default)]
struct ForeachOverrides {
    parent_arts: Option<ArtifactMap>,
    parent_pathspecs: Option<Vec<String>>,
    reuse_split: bool,
}

impl<'a> Walk<'a> {
    fn graph(&self) -> &FlowGraph {
        self.env.flow.graph()
    }

    fn node(&self, name: &str) -> Result<&FlowNode> {
        self.graph()
            .node(name)
            .ok_or_else(|| CoreError::Internal(format!("unknown step '{name}'")))
    }

    fn next_task_id(&mut self) -> String {
        self.task_counter += 1;
        self.task_counter.to_string()
    }

    fn task_pathspec(&self, step: &str, task: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.env.flow.name(),
            self.env.run_id,
            step,
            task
        )
    }

    async fn run(&mut self, resume_step: Option<&str>) -> Result<()> {
        let topo: Vec<String> = self.graph().topo_order().to_vec();

        if let (Some(_), Some(resume)) = (&self.env.origin_run_id, resume_step) {
            self.reused = find_reusable_steps(&topo, resume);
        }

        for step_name in topo {
            if self.executed.contains(&step_name) {
                continue;
            }

            self.env
                .metadata
                .new_step(self.env.flow.name(), &self.env.run_id, &step_name)
                .await?;

            if let Some(step) = self.env.flow.step(&step_name) {
                for deco in &step.decorators {
                    deco.step_init(self.env.flow.name(), &step_name)?;
                }
            }

            if self.reused.contains(&step_name) {
                self.dispatch_reused(&step_name).await?;
                continue;
            }

            let node = self.node(&step_name)?.clone();
            match node.kind {
                StepKind::Foreach if node.foreach_var.is_some() => {
                    self.execute_foreach(&step_name, ForeachOverrides::default())
                        .await?;
                }
                StepKind::SplitOr => {
                    // Checked before the join arm: recursive switches have
                    // several in-edges (self plus parent).
                    self.execute_switch_step(&step_name, &node).await?;
                }
                _ if node.kind == StepKind::Join || node.in_steps.len() > 1 => {
                    let executed_parents = node
                        .in_steps
                        .iter()
                        .filter(|p| {
                            self.step_results
                                .get(*p)
                                .map(|r| !r.is_empty())
                                .unwrap_or(false)
                        })
                        .count();
                    if executed_parents == 1 && !node.takes_inputs {
                        // Post-switch merge: a single live parent and no
                        // inputs parameter means a plain linear step.
                        self.execute_linear_step(&step_name, &node).await?;
                    } else {
                        self.execute_join_step(&step_name, &node).await?;
                    }
                }
                _ if node.parallel_step && node.num_parallel > 0 => {
                    self.execute_parallel_step(&step_name, &node).await?;
                }
                _ => {
                    self.execute_linear_step(&step_name, &node).await?;
                }
            }

            self.executed.insert(step_name);
        }

        Ok(())
    }

    // ── Parent routing ──

    /// Artifacts from the unique predecessor whose results are present.
    /// The last task wins: for recursive switches that is the final
    /// iteration's state.
    fn parent_artifacts(&self, step_name: &str, node: &FlowNode) -> ArtifactMap {
        if step_name == "start" || node.in_steps.is_empty() {
            return ArtifactMap::new();
        }
        for parent in &node.in_steps {
            if let Some(results) = self.step_results.get(parent) {
                if let Some((_, arts)) = results.last() {
                    return arts.clone();
                }
            }
        }
        ArtifactMap::new()
    }

    fn parent_pathspecs(&self, step_name: &str, node: &FlowNode) -> Vec<String> {
        if step_name == "start" || node.in_steps.is_empty() {
            return Vec::new();
        }
        for parent in &node.in_steps {
            if let Some(results) = self.step_results.get(parent) {
                if let Some((tid, _)) = results.last() {
                    return vec![self.task_pathspec(parent, tid)];
                }
            }
        }
        Vec::new()
    }

    /// Execute one task and record its results. Returns the taken switch
    /// branch, if the step resolved one.
    async fn run_task(&mut self, req: TaskRequest) -> Result<Option<String>> {
        let step = req.step_name.clone();
        let task_id = req.task_id.clone();
        let outcome = TaskExecutor::new(self.env).execute(req).await?;
        self.step_results
            .entry(step)
            .or_default()
            .push((task_id, outcome.artifacts));
        Ok(outcome.taken_branch)
    }

    // ── Linear ──

    async fn execute_linear_step(&mut self, step_name: &str, node: &FlowNode) -> Result<()> {
        let task_id = self.next_task_id();
        let mut req = TaskRequest::new(step_name, &task_id);
        req.parent_artifacts = self.parent_artifacts(step_name, node);
        req.parent_task_pathspecs = self.parent_pathspecs(step_name, node);
        self.run_task(req).await?;
        Ok(())
    }

    // ── Foreach split + inner chain + join ──

    fn execute_foreach<'s>(
        &'s mut self,
        step_name: &str,
        ov: ForeachOverrides,
    ) -> BoxFut<'s, Result<()>> {
        let step_name = step_name.to_string();
        Box::pin(async move {
            let node = self.node(&step_name)?.clone();

            // 1. Execute (or adopt a reused) split task.
            let already_reused = ov.reuse_split
                && self
                    .step_results
                    .get(&step_name)
                    .map(|r| !r.is_empty())
                    .unwrap_or(false);
            if !already_reused {
                let task_id = self.next_task_id();
                let mut req = TaskRequest::new(&step_name, &task_id);
                req.parent_artifacts = ov
                    .parent_arts
                    .clone()
                    .unwrap_or_else(|| self.parent_artifacts(&step_name, &node));
                req.parent_task_pathspecs = ov
                    .parent_pathspecs
                    .clone()
                    .unwrap_or_else(|| self.parent_pathspecs(&step_name, &node));
                self.run_task(req).await?;
            }
            self.executed.insert(step_name.clone());

            // 2. The foreach items live under the declared variable.
            let (split_tid, split_arts) = self
                .step_results
                .get(&step_name)
                .and_then(|r| r.last())
                .cloned()
                .ok_or_else(|| {
                    CoreError::Internal(format!("foreach split '{step_name}' has no results"))
                })?;
            let var = node.foreach_var.clone().ok_or_else(|| {
                CoreError::Internal(format!("foreach split '{step_name}' has no variable"))
            })?;
            let items: Vec<Value> = match split_arts.get(&var) {
                Some(Value::Array(items)) => items.clone(),
                Some(other) => {
                    return Err(CoreError::UserStep {
                        type_name: "UserStepException".to_string(),
                        message: format!(
                            "foreach variable '{var}' of step '{step_name}' is not a list: {other}"
                        ),
                    })
                }
                None => Vec::new(),
            };

            let join_name = node.matching_join.clone().ok_or_else(|| {
                CoreError::UnreachableJoin(step_name.clone())
            })?;
            let first_out = match node.out_steps.first() {
                Some(out) => out.clone(),
                None => return Ok(()),
            };
            let inner_steps = self.collect_inner_steps(&first_out, &join_name);

            // Empty source: no inner tasks at all; the matching join runs
            // with zero inputs.
            if items.is_empty() {
                for inner in &inner_steps {
                    self.env
                        .metadata
                        .new_step(self.env.flow.name(), &self.env.run_id, inner)
                        .await?;
                    self.executed.insert(inner.clone());
                    self.step_results.entry(inner.clone()).or_default();
                }
                let join_node = self.node(&join_name)?.clone();
                self.env
                    .metadata
                    .new_step(self.env.flow.name(), &self.env.run_id, &join_name)
                    .await?;
                self.execute_join_step(&join_name, &join_node).await?;
                self.executed.insert(join_name);
                return Ok(());
            }

            // 3. Register inner steps and isolate their result scope.
            for inner in &inner_steps {
                if !self.step_results.contains_key(inner) {
                    self.env
                        .metadata
                        .new_step(self.env.flow.name(), &self.env.run_id, inner)
                        .await?;
                    self.step_results.insert(inner.clone(), Vec::new());
                }
            }

            let num_splits = if node.unbounded_foreach {
                None
            } else {
                Some(items.len())
            };
            let split_pathspec = self.task_pathspec(&step_name, &split_tid);

            let mut saved_inner: BTreeMap<String, Vec<(String, ArtifactMap)>> = BTreeMap::new();
            for inner in &inner_steps {
                saved_inner.insert(
                    inner.clone(),
                    std::mem::take(self.step_results.entry(inner.clone()).or_default()),
                );
            }

            // 4. One inner chain per item, serially, with the frame pushed
            // onto the parent's stack.
            let base_stack: Vec<ForeachFrame> = split_arts
                .get(ART_FOREACH_STACK)
                .map(foreach_stack_from_value)
                .unwrap_or_default();
            for (idx, item) in items.iter().enumerate() {
                let mut stack = base_stack.clone();
                stack.push(ForeachFrame {
                    step: step_name.clone(),
                    var: var.clone(),
                    index: idx,
                    value: item.clone(),
                    num_splits,
                });
                let mut parent_arts = split_arts.clone();
                parent_arts.insert(ART_FOREACH_STACK.to_string(), foreach_stack_to_value(&stack));

                self.execute_inner_chain(
                    &inner_steps,
                    parent_arts,
                    item.clone(),
                    idx,
                    stack,
                    split_pathspec.clone(),
                )
                .await?;
            }

            for inner in &inner_steps {
                self.executed.insert(inner.clone());
            }

            // 5. The matching join collects this scope's inner results.
            let join_node = self.node(&join_name)?.clone();
            if !self.step_results.contains_key(&join_name) {
                self.env
                    .metadata
                    .new_step(self.env.flow.name(), &self.env.run_id, &join_name)
                    .await?;
                self.step_results.insert(join_name.clone(), Vec::new());
            }
            self.execute_join_step(&join_name, &join_node).await?;
            self.executed.insert(join_name.clone());

            // 5b. Unbounded sources additionally materialise one control
            // task per inner step carrying the split's outgoing state.
            if node.unbounded_foreach {
                for inner in &inner_steps {
                    self.create_control_task(inner, &split_arts, &split_pathspec, num_splits)
                        .await?;
                }
            }

            // 6. Restore outer-scope results, appending this scope's.
            for inner in &inner_steps {
                let current = self.step_results.remove(inner).unwrap_or_default();
                let mut combined = saved_inner.remove(inner).unwrap_or_default();
                combined.extend(current);
                self.step_results.insert(inner.clone(), combined);
            }

            Ok(())
        })
    }

    /// Steps strictly between a split's first out-edge and its matching
    /// join, discovered by BFS (switch branches and self-loops included).
    fn collect_inner_steps(&self, start_name: &str, join_name: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start_name.to_string()]);
        while let Some(name) = queue.pop_front() {
            if visited.contains(&name) || name == join_name {
                continue;
            }
            visited.insert(name.clone());
            result.push(name.clone());
            if let Some(node) = self.graph().node(&name) {
                for out in &node.out_steps {
                    if !visited.contains(out) && out != join_name {
                        queue.push_back(out.clone());
                    }
                }
            }
        }
        result
    }

    /// Walk one foreach iteration through the inner set, dispatching to
    /// nested foreach, switch and branch structures as they appear.
    #[allow(clippy::too_many_arguments)]
    async fn execute_inner_chain(
        &mut self,
        inner_steps: &[String],
        mut parent_arts: ArtifactMap,
        foreach_input: Value,
        foreach_index: usize,
        foreach_stack: Vec<ForeachFrame>,
        mut prev_pathspec: String,
    ) -> Result<()> {
        let inner_set: BTreeSet<String> = inner_steps.iter().cloned().collect();
        let mut done_in_chain: BTreeSet<String> = BTreeSet::new();

        for chain_step in inner_steps {
            if done_in_chain.contains(chain_step) {
                continue;
            }
            let chain_node = self.node(chain_step)?.clone();

            match chain_node.kind {
                StepKind::Foreach if chain_node.foreach_var.is_some() => {
                    // Nested foreach: recurse, then skip past its inner
                    // set and adopt the nested join's state.
                    self.execute_foreach(
                        chain_step,
                        ForeachOverrides {
                            parent_arts: Some(parent_arts.clone()),
                            parent_pathspecs: Some(vec![prev_pathspec.clone()]),
                            reuse_split: false,
                        },
                    )
                    .await?;
                    done_in_chain.insert(chain_step.clone());

                    let nested_join = chain_node.matching_join.clone();
                    if let Some(join) = &nested_join {
                        let mut passed = false;
                        for s in inner_steps {
                            if s == chain_step {
                                passed = true;
                                continue;
                            }
                            if !passed {
                                continue;
                            }
                            if s == join {
                                break;
                            }
                            done_in_chain.insert(s.clone());
                        }
                        done_in_chain.insert(join.clone());
                        if let Some((jtid, jarts)) =
                            self.step_results.get(join).and_then(|r| r.last())
                        {
                            parent_arts = jarts.clone();
                            prev_pathspec = self.task_pathspec(join, jtid);
                        }
                    }
                }

                StepKind::SplitOr => {
                    let (arts, ps) = self
                        .execute_inner_switch(
                            chain_step,
                            &chain_node,
                            &inner_set,
                            &mut done_in_chain,
                            parent_arts.clone(),
                            &foreach_input,
                            foreach_index,
                            &foreach_stack,
                            prev_pathspec.clone(),
                        )
                        .await?;
                    parent_arts = arts;
                    prev_pathspec = ps;
                }

                StepKind::SplitAnd => {
                    let (arts, ps) = self
                        .execute_inner_branch(
                            chain_step,
                            &chain_node,
                            &mut done_in_chain,
                            parent_arts.clone(),
                            &foreach_input,
                            foreach_index,
                            &foreach_stack,
                            prev_pathspec.clone(),
                        )
                        .await?;
                    parent_arts = arts;
                    prev_pathspec = ps;
                }

                StepKind::Join => {
                    // Inner join from a nested split-and.
                    self.execute_join_step(chain_step, &chain_node).await?;
                    done_in_chain.insert(chain_step.clone());
                    if let Some((jtid, jarts)) =
                        self.step_results.get(chain_step).and_then(|r| r.last())
                    {
                        parent_arts = jarts.clone();
                        prev_pathspec = self.task_pathspec(chain_step, jtid);
                    }
                }

                _ => {
                    let task_id = self.next_task_id();
                    let mut req = TaskRequest::new(chain_step, &task_id);
                    req.parent_artifacts = parent_arts.clone();
                    req.foreach_input = Some(foreach_input.clone());
                    req.foreach_index = Some(foreach_index);
                    req.foreach_stack = foreach_stack.clone();
                    req.parent_task_pathspecs = vec![prev_pathspec.clone()];
                    self.run_task(req).await?;
                    done_in_chain.insert(chain_step.clone());

                    prev_pathspec = self.task_pathspec(chain_step, &task_id);
                    if let Some(results) = self.step_results.get(chain_step) {
                        if let Some((_, arts)) =
                            results.iter().find(|(tid, _)| tid == &task_id)
                        {
                            parent_arts = arts.clone();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// A switch inside a foreach iteration: spin on the recursive case,
    /// then mark the non-taken branches' exclusive descendants done.
    #[allow(clippy::too_many_arguments)]
    async fn execute_inner_switch(
        &mut self,
        step_name: &str,
        node: &FlowNode,
        inner_set: &BTreeSet<String>,
        done_in_chain: &mut BTreeSet<String>,
        mut parent_arts: ArtifactMap,
        foreach_input: &Value,
        foreach_index: usize,
        foreach_stack: &[ForeachFrame],
        mut prev_pathspec: String,
    ) -> Result<(ArtifactMap, String)> {
        let mut taken_branch: Option<String> = None;
        loop {
            let task_id = self.next_task_id();
            let mut req = TaskRequest::new(step_name, &task_id);
            req.parent_artifacts = parent_arts.clone();
            req.foreach_input = Some(foreach_input.clone());
            req.foreach_index = Some(foreach_index);
            req.foreach_stack = foreach_stack.to_vec();
            req.parent_task_pathspecs = vec![prev_pathspec.clone()];
            let branch = self.run_task(req).await?;
            prev_pathspec = self.task_pathspec(step_name, &task_id);

            match branch {
                Some(b) if b == step_name => {
                    if let Some((_, arts)) =
                        self.step_results.get(step_name).and_then(|r| r.last())
                    {
                        parent_arts = arts.clone();
                    }
                    continue;
                }
                other => {
                    taken_branch = other;
                    break;
                }
            }
        }

        done_in_chain.insert(step_name.to_string());
        if let Some((_, arts)) = self.step_results.get(step_name).and_then(|r| r.last()) {
            parent_arts = arts.clone();
        }

        if let Some(taken) = &taken_branch {
            let protected = self.reachable_from(taken);
            for branch in &node.out_steps {
                if branch != taken && branch != step_name {
                    self.mark_inner_descendants(branch, inner_set, done_in_chain, &protected);
                }
            }
        }

        Ok((parent_arts, prev_pathspec))
    }

    /// Mark a branch and its descendants (within the inner set) done,
    /// never touching steps also reachable through the taken branch.
    fn mark_inner_descendants(
        &self,
        start_name: &str,
        inner_set: &BTreeSet<String>,
        done_in_chain: &mut BTreeSet<String>,
        protected: &BTreeSet<String>,
    ) {
        let mut queue = VecDeque::from([start_name.to_string()]);
        while let Some(name) = queue.pop_front() {
            if done_in_chain.contains(&name) || protected.contains(&name) {
                continue;
            }
            done_in_chain.insert(name.clone());
            if let Some(node) = self.graph().node(&name) {
                for out in &node.out_steps {
                    if inner_set.contains(out) && !done_in_chain.contains(out) {
                        queue.push_back(out.clone());
                    }
                }
            }
        }
    }

    /// A branch split inside a foreach iteration: the split, then each
    /// branch as a linear step; the downstream join collects them.
    #[allow(clippy::too_many_arguments)]
    async fn execute_inner_branch(
        &mut self,
        step_name: &str,
        node: &FlowNode,
        done_in_chain: &mut BTreeSet<String>,
        parent_arts: ArtifactMap,
        foreach_input: &Value,
        foreach_index: usize,
        foreach_stack: &[ForeachFrame],
        prev_pathspec: String,
    ) -> Result<(ArtifactMap, String)> {
        let task_id = self.next_task_id();
        let mut req = TaskRequest::new(step_name, &task_id);
        req.parent_artifacts = parent_arts.clone();
        req.foreach_input = Some(foreach_input.clone());
        req.foreach_index = Some(foreach_index);
        req.foreach_stack = foreach_stack.to_vec();
        req.parent_task_pathspecs = vec![prev_pathspec];
        self.run_task(req).await?;
        done_in_chain.insert(step_name.to_string());

        let split_pathspec = self.task_pathspec(step_name, &task_id);
        let split_arts = self
            .step_results
            .get(step_name)
            .and_then(|r| r.last())
            .map(|(_, arts)| arts.clone())
            .unwrap_or(parent_arts);

        for branch in &node.out_steps {
            if done_in_chain.contains(branch) {
                continue;
            }
            let btask_id = self.next_task_id();
            let mut req = TaskRequest::new(branch, &btask_id);
            req.parent_artifacts = split_arts.clone();
            req.foreach_input = Some(foreach_input.clone());
            req.foreach_index = Some(foreach_index);
            req.foreach_stack = foreach_stack.to_vec();
            req.parent_task_pathspecs = vec![split_pathspec.clone()];
            self.run_task(req).await?;
            done_in_chain.insert(branch.clone());
        }

        // The join runs when the chain reaches it.
        Ok((split_arts, split_pathspec))
    }

    // ── Switch (top level) ──

    async fn execute_switch_step(&mut self, step_name: &str, node: &FlowNode) -> Result<()> {
        let mut parent_arts = self.parent_artifacts(step_name, node);
        let mut parent_pathspecs = self.parent_pathspecs(step_name, node);

        // Resume: successful loop iterations clone over; execution picks
        // up at the first failure.
        let is_recursive = node.out_steps.iter().any(|t| t == step_name);
        if is_recursive && self.env.origin_run_id.is_some() {
            let (arts, pathspecs) = self
                .clone_recursive_switch_tasks(step_name, parent_arts, parent_pathspecs)
                .await?;
            parent_arts = arts;
            parent_pathspecs = pathspecs;
        }

        let taken_branch;
        loop {
            let task_id = self.next_task_id();
            let mut req = TaskRequest::new(step_name, &task_id);
            req.parent_artifacts = parent_arts.clone();
            req.parent_task_pathspecs = parent_pathspecs.clone();
            let branch = self.run_task(req).await?;

            match branch {
                None => return Ok(()),
                Some(b) if b == step_name => {
                    if let Some((tid, arts)) =
                        self.step_results.get(step_name).and_then(|r| r.last())
                    {
                        parent_arts = arts.clone();
                        parent_pathspecs = vec![self.task_pathspec(step_name, tid)];
                    }
                    continue;
                }
                Some(b) => {
                    taken_branch = b;
                    break;
                }
            }
        }

        self.mark_skipped_branches(step_name, node, &taken_branch)
            .await
    }

    /// Mark every non-taken branch, and the descendants reachable only
    /// through it, as executed so the walk skips them.
    async fn mark_skipped_branches(
        &mut self,
        switch_step: &str,
        node: &FlowNode,
        taken_branch: &str,
    ) -> Result<()> {
        let protected = self.reachable_from(taken_branch);
        for branch in node.out_steps.clone() {
            if branch != taken_branch && branch != switch_step {
                self.mark_descendant_steps(&branch, &protected).await?;
            }
        }
        Ok(())
    }

    async fn mark_descendant_steps(
        &mut self,
        start_name: &str,
        protected: &BTreeSet<String>,
    ) -> Result<()> {
        let mut queue = VecDeque::from([start_name.to_string()]);
        let mut visited = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if visited.contains(&name)
                || self.executed.contains(&name)
                || protected.contains(&name)
            {
                continue;
            }
            visited.insert(name.clone());
            self.executed.insert(name.clone());
            self.env
                .metadata
                .new_step(self.env.flow.name(), &self.env.run_id, &name)
                .await?;
            if let Some(node) = self.graph().node(&name) {
                for out in &node.out_steps {
                    if !visited.contains(out) {
                        queue.push_back(out.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Everything reachable from a step, itself included.
    fn reachable_from(&self, start: &str) -> BTreeSet<String> {
        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(name) = queue.pop_front() {
            if reachable.contains(&name) {
                continue;
            }
            reachable.insert(name.clone());
            if let Some(node) = self.graph().node(&name) {
                for out in &node.out_steps {
                    if !reachable.contains(out) {
                        queue.push_back(out.clone());
                    }
                }
            }
        }
        reachable
    }

    // ── Join ──

    /// Build the ordered `Inputs` view, one entry per contributing
    /// predecessor task, and run the join body with it.
    async fn execute_join_step(&mut self, step_name: &str, node: &FlowNode) -> Result<()> {
        let task_id = self.next_task_id();

        let mut slots = Vec::new();
        let mut parent_pathspecs = Vec::new();
        for parent in &node.in_steps {
            if let Some(results) = self.step_results.get(parent) {
                for (tid, arts) in results {
                    slots.push(InputSlot::new(parent.clone(), tid.clone(), arts.clone()));
                    parent_pathspecs.push(self.task_pathspec(parent, tid));
                }
            }
        }

        let mut req = TaskRequest::new(step_name, &task_id);
        req.inputs = Some(Inputs::new(slots));
        req.parent_task_pathspecs = parent_pathspecs;
        self.run_task(req).await?;
        Ok(())
    }

    // ── Parallel ──

    /// `num_parallel` tasks with identical parent state; index 0 is the
    /// control task.
    async fn execute_parallel_step(&mut self, step_name: &str, node: &FlowNode) -> Result<()> {
        let parent_arts = self.parent_artifacts(step_name, node);
        let parent_pathspecs = self.parent_pathspecs(step_name, node);
        self.step_results.insert(step_name.to_string(), Vec::new());

        for idx in 0..node.num_parallel {
            let task_id = self.next_task_id();
            let mut req = TaskRequest::new(step_name, &task_id);
            req.parent_artifacts = parent_arts.clone();
            req.parallel_index = Some(idx);
            req.parallel_total = Some(node.num_parallel);
            req.parent_task_pathspecs = parent_pathspecs.clone();
            self.run_task(req).await?;
        }
        Ok(())
    }

    /// Synthetic control task for an unbounded foreach inner step:
    /// carries the split's outgoing artifacts, stamped as a parallel
    /// control node.
    async fn create_control_task(
        &mut self,
        step_name: &str,
        parent_artifacts: &ArtifactMap,
        parent_pathspec: &str,
        num_splits: Option<usize>,
    ) -> Result<()> {
        let task_id = self.next_task_id();
        let ps = Pathspec::new(
            self.env.flow.name(),
            &self.env.run_id,
            step_name,
            &task_id,
        );
        self.env.metadata.new_task(&ps).await?;
        self.env
            .metadata
            .register_metadata(
                &ps,
                &[
                    MetadataEntry::new(META_ATTEMPT, "0"),
                    MetadataEntry::new(META_PARALLEL_NODE_INDEX, "0"),
                    MetadataEntry::new(
                        META_PARALLEL_NUM_NODES,
                        (num_splits.unwrap_or(0) + 1).to_string(),
                    ),
                    MetadataEntry::new(META_INTERNAL_TASK_TYPE, "control"),
                    MetadataEntry::new(
                        META_PARENT_TASK_IDS,
                        serde_json::to_string(&[parent_pathspec]).unwrap_or_default(),
                    ),
                ],
            )
            .await?;

        let mut arts = parent_artifacts.clone();
        arts.insert(ART_TASK_OK.to_string(), Value::Bool(true));
        self.env
            .datastore
            .save_artifacts(&ps, &artifacts_to_blobs(&arts)?)
            .await?;
        self.env
            .datastore
            .save_log(&ps, LogStream::Stdout, "")
            .await?;
        self.env
            .datastore
            .save_log(&ps, LogStream::Stderr, "")
            .await?;
        self.env.metadata.done_task(&ps).await?;

        self.step_results
            .entry(step_name.to_string())
            .or_default()
            .push((task_id, arts));
        Ok(())
    }

    // ── Resume ──

    async fn dispatch_reused(&mut self, step_name: &str) -> Result<()> {
        let node = self.node(step_name)?.clone();

        if node.kind == StepKind::Foreach && node.foreach_var.is_some() {
            if let (Some(first_out), Some(join)) =
                (node.out_steps.first().cloned(), node.matching_join.clone())
            {
                let inner = self.collect_inner_steps(&first_out, &join);
                let mut block = vec![step_name.to_string()];
                block.extend(inner);
                block.push(join);
                let all_reusable = block.iter().all(|s| self.reused.contains(s));

                if all_reusable {
                    // The whole [split, inner..., join] block is intact:
                    // clone it wholesale.
                    for bs in block {
                        if !self.executed.contains(&bs) {
                            if !self.step_results.contains_key(&bs) {
                                self.env
                                    .metadata
                                    .new_step(self.env.flow.name(), &self.env.run_id, &bs)
                                    .await?;
                            }
                            self.reuse_step(&bs).await?;
                            self.executed.insert(bs);
                        }
                    }
                    return Ok(());
                }

                // Only the split survives; the chain re-executes.
                self.reuse_step(step_name).await?;
                self.execute_foreach(
                    step_name,
                    ForeachOverrides {
                        reuse_split: true,
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(());
            }
        }

        self.reuse_step(step_name).await?;
        self.executed.insert(step_name.to_string());
        Ok(())
    }

    /// Clone every origin task of a reusable step: fresh task ids,
    /// original metadata verbatim plus resume markers, artifact and log
    /// copies, and a done stamp.
    async fn reuse_step(&mut self, step_name: &str) -> Result<()> {
        let origin_run = self
            .env
            .origin_run_id
            .clone()
            .ok_or_else(|| CoreError::Internal("reuse without origin run".to_string()))?;
        let flow_name = self.env.flow.name().to_string();
        let origin_tasks = self
            .env
            .metadata
            .get_task_ids(&flow_name, &origin_run, step_name)
            .await?;

        self.step_results
            .entry(step_name.to_string())
            .or_default();

        for orig_tid in origin_tasks {
            let origin_ps = Pathspec::new(&flow_name, &origin_run, step_name, &orig_tid);
            let artifacts =
                blobs_to_artifacts(&self.env.datastore.load_artifacts(&origin_ps).await?)?;

            let task_id = self.next_task_id();
            let new_ps = Pathspec::new(&flow_name, &self.env.run_id, step_name, &task_id);
            self.env.metadata.new_task(&new_ps).await?;

            let orig_meta = self.env.metadata.get_task_metadata(&origin_ps).await?;
            if !orig_meta.is_empty() {
                self.env
                    .metadata
                    .register_metadata(&new_ps, &orig_meta)
                    .await?;
            }
            self.env
                .metadata
                .register_metadata(
                    &new_ps,
                    &[
                        MetadataEntry::new(META_ORIGIN_TASK_ID, &orig_tid),
                        MetadataEntry::new(META_ORIGIN_RUN_ID, &origin_run),
                        MetadataEntry::new(META_RUNTIME_VERSION, env!("CARGO_PKG_VERSION")),
                    ],
                )
                .await?;

            self.env
                .datastore
                .save_artifacts(&new_ps, &artifacts_to_blobs(&artifacts)?)
                .await?;
            for stream in [LogStream::Stdout, LogStream::Stderr] {
                let log = self.env.datastore.load_log(&origin_ps, stream).await?;
                self.env
                    .datastore
                    .save_log(&new_ps, stream, &log)
                    .await?;
            }
            self.env.metadata.done_task(&new_ps).await?;

            self.step_results
                .entry(step_name.to_string())
                .or_default()
                .push((task_id, artifacts));
        }
        Ok(())
    }

    /// Clone successful iterations of a recursive switch from the origin
    /// run, one by one, stopping at the first failure. Returns the parent
    /// state for the re-execution that follows.
    async fn clone_recursive_switch_tasks(
        &mut self,
        step_name: &str,
        mut parent_arts: ArtifactMap,
        mut parent_pathspecs: Vec<String>,
    ) -> Result<(ArtifactMap, Vec<String>)> {
        let origin_run = match self.env.origin_run_id.clone() {
            Some(run) => run,
            None => return Ok((parent_arts, parent_pathspecs)),
        };
        let flow_name = self.env.flow.name().to_string();
        let origin_tasks = self
            .env
            .metadata
            .get_task_ids(&flow_name, &origin_run, step_name)
            .await?;
        if origin_tasks.is_empty() {
            return Ok((parent_arts, parent_pathspecs));
        }

        self.step_results
            .entry(step_name.to_string())
            .or_default();

        for orig_tid in origin_tasks {
            let origin_ps = Pathspec::new(&flow_name, &origin_run, step_name, &orig_tid);
            let artifacts =
                blobs_to_artifacts(&self.env.datastore.load_artifacts(&origin_ps).await?)?;
            let ok = artifacts
                .get(ART_TASK_OK)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !ok {
                // Re-execute from the first failed iteration.
                break;
            }

            let task_id = self.next_task_id();
            let new_ps = Pathspec::new(&flow_name, &self.env.run_id, step_name, &task_id);
            self.env.metadata.new_task(&new_ps).await?;

            let orig_meta = self.env.metadata.get_task_metadata(&origin_ps).await?;
            if !orig_meta.is_empty() {
                self.env
                    .metadata
                    .register_metadata(&new_ps, &orig_meta)
                    .await?;
            }
            self.env
                .metadata
                .register_metadata(
                    &new_ps,
                    &[
                        MetadataEntry::new(META_ORIGIN_TASK_ID, &orig_tid),
                        MetadataEntry::new(META_ORIGIN_RUN_ID, &origin_run),
                        MetadataEntry::new(META_RUNTIME_VERSION, env!("CARGO_PKG_VERSION")),
                    ],
                )
                .await?;

            self.env
                .datastore
                .save_artifacts(&new_ps, &artifacts_to_blobs(&artifacts)?)
                .await?;
            for stream in [LogStream::Stdout, LogStream::Stderr] {
                let log = self.env.datastore.load_log(&origin_ps, stream).await?;
                self.env
                    .datastore
                    .save_log(&new_ps, stream, &log)
                    .await?;
            }
            self.env.metadata.done_task(&new_ps).await?;

            parent_arts = artifacts.clone();
            parent_pathspecs = vec![self.task_pathspec(step_name, &task_id)];
            self.step_results
                .entry(step_name.to_string())
                .or_default()
                .push((task_id, artifacts));
        }

        Ok((parent_arts, parent_pathspecs))
    }
}

/// Everything strictly before `resume_step` in topological order can be
/// reused from the origin run.
fn find_reusable_steps(topo: &[String], resume_step: &str) -> BTreeSet<String> {
    let mut reusable = BTreeSet::new();
    for name in topo {
        if name == resume_step {
            break;
        }
        reusable.insert(name.clone());
    }
    reusable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_reusable_steps() {
        let topo = vec![
            "start".to_string(),
            "middle".to_string(),
            "end".to_string(),
        ];
        let reusable = find_reusable_steps(&topo, "middle");
        assert!(reusable.contains("start"));
        assert!(!reusable.contains("middle"));
        assert!(!reusable.contains("end"));

        // Resuming from an unknown step reuses everything before... which
        // is the whole topo order.
        let all = find_reusable_steps(&topo, "nope");
        assert_eq!(all.len(), 3);
    }
}
