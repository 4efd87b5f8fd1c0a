use crate::current::{self, TaskContext};
use crate::datastore::{Datastore, DatastoreConfig};
use crate::decorator::{has_catch, max_retries, run_exception_hooks, HookEnv, ProjectInfo};
use crate::error::{CoreError, Result};
use crate::flow::FlowDef;
use crate::metadata::{MetadataConfig, MetadataProvider};
use crate::scope::{FlowScope, Inputs};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

/// Env var carrying the task-spec path into a worker subprocess.
pub const TASK_SPEC_ENV: &str = "METAFLOW_INTERNAL_TASK_SPEC";

const SIGSEGV: i32 = 11;
const SEGFAULT_NOTE: &str = "\nStep failure could be a segmentation fault.\n";

// ─── Worker IPC ───────────────────────────────────────────────

/// Everything a worker subprocess needs to run one attempt of one step:
/// task identity, inherited state, and provider configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub flow_name: String,
    pub run_id: String,
    pub step_name: String,
    pub task_id: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub parent_artifacts: ArtifactMap,
    pub inputs: Option<Inputs>,
    pub foreach_input: Option<Value>,
    pub foreach_index: Option<usize>,
    pub foreach_stack: Vec<ForeachFrame>,
    pub parallel_index: Option<usize>,
    pub parallel_total: Option<usize>,
    pub origin_run_id: Option<String>,
    pub tags: Vec<String>,
    pub sys_tags: Vec<String>,
    pub resolved_params: ArtifactMap,
    pub resolved_configs: ArtifactMap,
    pub project: Option<ProjectInfo>,
    pub datastore: DatastoreConfig,
    /// Where the child serialises its `TaskResult`.
    pub res_path: String,
}

impl TaskSpec {
    pub fn pathspec(&self) -> Pathspec {
        Pathspec::new(&self.flow_name, &self.run_id, &self.step_name, &self.task_id)
    }
}

// ─── Run-wide execution environment ───────────────────────────

/// Scheduler-constant state shared by every task of a run.
pub struct RunEnv {
    pub flow: Arc<FlowDef>,
    pub run_id: String,
    pub tags: Vec<String>,
    pub sys_tags: Vec<String>,
    pub resolved_params: ArtifactMap,
    pub resolved_configs: ArtifactMap,
    pub project: Option<ProjectInfo>,
    pub origin_run_id: Option<String>,
    pub datastore: Arc<dyn Datastore>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub datastore_cfg: DatastoreConfig,
    pub metadata_cfg: MetadataConfig,
    /// The executable re-invoked as the worker (the flow binary itself).
    pub worker_exe: PathBuf,
}

impl RunEnv {
    pub fn task_context(&self, step: &str, task: &str, parallel: Option<(usize, usize)>) -> TaskContext {
        TaskContext {
            flow_name: self.flow.name().to_string(),
            run_id: self.run_id.clone(),
            step_name: step.to_string(),
            task_id: task.to_string(),
            retry_count: 0,
            origin_run_id: self.origin_run_id.clone(),
            namespace: Some(format!("user:{}", username())),
            username: username(),
            user_tags: self.tags.clone(),
            sys_tags: self.sys_tags.clone(),
            parallel_num_nodes: parallel.map(|(_, n)| n).unwrap_or(1),
            parallel_node_index: parallel.map(|(i, _)| i).unwrap_or(0),
            project_name: self.project.as_ref().map(|p| p.project_name.clone()),
            branch_name: self.project.as_ref().map(|p| p.branch_name.clone()),
            project_flow_name: self.project.as_ref().map(|p| p.project_flow_name.clone()),
            is_production: self.project.as_ref().map(|p| p.is_production).unwrap_or(false),
        }
    }
}

// ─── Per-task request & outcome ───────────────────────────────

/// One task to execute: identity plus inherited state.
pub struct TaskRequest {
    pub step_name: String,
    pub task_id: String,
    pub parent_artifacts: ArtifactMap,
    pub inputs: Option<Inputs>,
    pub foreach_input: Option<Value>,
    pub foreach_index: Option<usize>,
    pub foreach_stack: Vec<ForeachFrame>,
    pub parallel_index: Option<usize>,
    pub parallel_total: Option<usize>,
    pub parent_task_pathspecs: Vec<String>,
}

impl TaskRequest {
    pub fn new(step_name: &str, task_id: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            task_id: task_id.to_string(),
            parent_artifacts: ArtifactMap::new(),
            inputs: None,
            foreach_input: None,
            foreach_index: None,
            foreach_stack: Vec::new(),
            parallel_index: None,
            parallel_total: None,
            parent_task_pathspecs: Vec::new(),
        }
    }
}

/// What one completed task produced, as the scheduler records it.
pub struct TaskOutcome {
    pub success: bool,
    /// Final persisted artifact set, internals included.
    pub artifacts: ArtifactMap,
    pub taken_branch: Option<String>,
}

/// How one attempt's child process ended.
enum AttemptEnd {
    Ok(TaskResult),
    Failed(ExceptionInfo),
    Signalled(i32),
}

// ─── The executor ─────────────────────────────────────────────

/// Runs one task to completion: an attempt loop where every attempt is a
/// child process, so segmentation faults and signal kills never reach
/// the orchestrator. Retries, `@catch` and `@timeout` compose around the
/// isolation boundary.
pub struct TaskExecutor<'a> {
    pub env: &'a RunEnv,
}

impl<'a> TaskExecutor<'a> {
    pub fn new(env: &'a RunEnv) -> Self {
        Self { env }
    }

    pub async fn execute(&self, req: TaskRequest) -> Result<TaskOutcome> {
        let env = self.env;
        let pathspec = Pathspec::new(
            env.flow.name(),
            &env.run_id,
            &req.step_name,
            &req.task_id,
        );
        env.metadata.new_task(&pathspec).await?;

        let step = env
            .flow
            .step(&req.step_name)
            .ok_or_else(|| CoreError::NotFound(format!("step '{}'", req.step_name)))?;
        let decorators = step.decorators.clone();
        let retries = max_retries(&decorators);

        self.register_task_metadata(&pathspec, &req).await?;

        // The parent keeps its own scope replica for exception hooks and
        // the final persist; the child rebuilds the same state from the
        // task spec.
        let mut scope = self.build_scope(step, &req);
        let base_artifacts = scope.snapshot();

        current::bind(env.task_context(
            &req.step_name,
            &req.task_id,
            req.parallel_index.zip(req.parallel_total),
        ));

        let mut success = false;
        let mut taken_branch: Option<String> = None;
        let mut killed_by_signal: Option<i32> = None;
        let mut last_stdout = String::new();
        let mut last_stderr = String::new();

        for attempt in 0..=retries {
            current::bind_retry(attempt);
            env.metadata
                .register_metadata(
                    &pathspec,
                    &[MetadataEntry::new(META_ATTEMPT, attempt.to_string())],
                )
                .await?;

            if attempt > 0 {
                scope.reset_for_retry(&base_artifacts);
            }

            let (end, stdout, stderr) = self.run_attempt(&req, &pathspec, attempt, retries).await?;
            last_stdout = stdout;
            last_stderr = stderr;

            match end {
                AttemptEnd::Ok(result) => {
                    // The child persisted artifacts; it is the source of
                    // truth for the final state.
                    let saved = blobs_to_artifacts(&env.datastore.load_artifacts(&pathspec).await?)?;
                    scope = self.build_scope(step, &req);
                    scope.load_parent_state(&saved);
                    taken_branch = result.taken_branch;
                    killed_by_signal = None;
                    success = true;
                    break;
                }
                AttemptEnd::Failed(exc) => {
                    if attempt < retries {
                        tracing::warn!(pathspec = %pathspec, attempt, exception = %exc, "attempt failed, retrying");
                        continue;
                    }
                    // Final attempt: adopt whatever the child persisted,
                    // then consult the exception hooks.
                    if let Ok(blobs) = env.datastore.load_artifacts(&pathspec).await {
                        if let Ok(saved) = blobs_to_artifacts(&blobs) {
                            scope = self.build_scope(step, &req);
                            scope.load_parent_state(&saved);
                        }
                    }
                    let hook_env = HookEnv {
                        pathspec: &pathspec,
                        attempt,
                        max_retries: retries,
                        configs: &env.resolved_configs,
                    };
                    if run_exception_hooks(&decorators, &exc, &hook_env, &mut scope) {
                        success = true;
                        break;
                    }
                    scope.set_exception(&exc);
                    self.save_results(&pathspec, &scope, &last_stdout, &last_stderr, false)
                        .await?;
                    current::clear();
                    return Err(CoreError::UserStep {
                        type_name: exc.kind.clone(),
                        message: exc.message.clone(),
                    });
                }
                AttemptEnd::Signalled(sig) => {
                    killed_by_signal = Some(sig);
                    if sig == SIGSEGV {
                        last_stderr.push_str(SEGFAULT_NOTE);
                    }
                    if attempt < retries {
                        tracing::warn!(pathspec = %pathspec, attempt, signal = sig, "worker killed by signal, retrying");
                        continue;
                    }
                    break;
                }
            }
        }

        // Signal-kill fallback once every attempt is spent.
        if !success {
            if let Some(sig) = killed_by_signal {
                let is_parallel_non_control =
                    matches!(req.parallel_index, Some(idx) if idx != 0);

                if has_catch(&decorators) && !is_parallel_non_control {
                    let fallback = retries + 1;
                    current::bind_retry(fallback);
                    env.metadata
                        .register_metadata(
                            &pathspec,
                            &[MetadataEntry::new(META_ATTEMPT, fallback.to_string())],
                        )
                        .await?;
                    let exc = ExceptionInfo::new(
                        "FailureHandledByCatch",
                        format!("Step '{}' failed due to signal {sig}.", req.step_name),
                    );
                    let hook_env = HookEnv {
                        pathspec: &pathspec,
                        attempt: fallback,
                        max_retries: retries,
                        configs: &env.resolved_configs,
                    };
                    if run_exception_hooks(&decorators, &exc, &hook_env, &mut scope) {
                        success = true;
                    } else {
                        scope.set_exception(&exc);
                        self.save_results(&pathspec, &scope, &last_stdout, &last_stderr, false)
                            .await?;
                        current::clear();
                        return Err(CoreError::FailureHandledByCatch(exc.message));
                    }
                } else if is_parallel_non_control {
                    // A worker death is recorded but never propagates;
                    // the control task's @catch governs the group.
                    self.save_results(&pathspec, &scope, &last_stdout, &last_stderr, false)
                        .await?;
                    current::clear();
                    return Ok(TaskOutcome {
                        success: false,
                        artifacts: scope.persistable_state(false),
                        taken_branch: None,
                    });
                } else {
                    let message = if sig == SIGSEGV {
                        format!("Step '{}' failed with a segmentation fault.", req.step_name)
                    } else {
                        format!("Step '{}' was killed by signal {sig}.", req.step_name)
                    };
                    let exc = ExceptionInfo::new("UserStepException", &message);
                    scope.set_exception(&exc);
                    self.save_results(&pathspec, &scope, &last_stdout, &last_stderr, false)
                        .await?;
                    current::clear();
                    return Err(CoreError::UserStep {
                        type_name: "UserStepException".to_string(),
                        message,
                    });
                }
            }
        }

        self.save_results(&pathspec, &scope, &last_stdout, &last_stderr, success)
            .await?;
        current::clear();

        Ok(TaskOutcome {
            success,
            artifacts: scope.persistable_state(success),
            taken_branch,
        })
    }

    // ── One forked attempt ──

    async fn run_attempt(
        &self,
        req: &TaskRequest,
        pathspec: &Pathspec,
        attempt: u32,
        retries: u32,
    ) -> Result<(AttemptEnd, String, String)> {
        let env = self.env;

        let res_file = tempfile::NamedTempFile::new()?;
        let out_file = tempfile::NamedTempFile::new()?;
        let err_file = tempfile::NamedTempFile::new()?;
        let spec_file = tempfile::NamedTempFile::new()?;

        let spec = TaskSpec {
            flow_name: env.flow.name().to_string(),
            run_id: env.run_id.clone(),
            step_name: req.step_name.clone(),
            task_id: req.task_id.clone(),
            attempt,
            max_retries: retries,
            parent_artifacts: req.parent_artifacts.clone(),
            inputs: req.inputs.clone(),
            foreach_input: req.foreach_input.clone(),
            foreach_index: req.foreach_index,
            foreach_stack: req.foreach_stack.clone(),
            parallel_index: req.parallel_index,
            parallel_total: req.parallel_total,
            origin_run_id: env.origin_run_id.clone(),
            tags: env.tags.clone(),
            sys_tags: env.sys_tags.clone(),
            resolved_params: env.resolved_params.clone(),
            resolved_configs: env.resolved_configs.clone(),
            project: env.project.clone(),
            datastore: env.datastore_cfg.clone(),
            res_path: res_file.path().to_string_lossy().to_string(),
        };
        let spec_bytes = serde_json::to_vec(&spec)
            .map_err(|e| CoreError::Internal(format!("task spec encode: {e}")))?;
        tokio::fs::write(spec_file.path(), spec_bytes).await?;

        tracing::debug!(pathspec = %pathspec, attempt, "spawning worker");
        let status = tokio::process::Command::new(&env.worker_exe)
            .env(TASK_SPEC_ENV, spec_file.path())
            .env_remove(crate::worker::RUNNER_SPEC_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out_file.reopen()?))
            .stderr(Stdio::from(err_file.reopen()?))
            .status()
            .await?;

        let stdout = tokio::fs::read_to_string(out_file.path())
            .await
            .unwrap_or_default();
        let stderr = tokio::fs::read_to_string(err_file.path())
            .await
            .unwrap_or_default();

        let end = classify_exit(
            exit_signal(&status),
            status.code(),
            tokio::fs::read(res_file.path()).await.ok().as_deref(),
            &req.step_name,
        );
        Ok((end, stdout, stderr))
    }

    // ── Bookkeeping ──

    fn build_scope(&self, step: &crate::flow::StepDef, req: &TaskRequest) -> FlowScope {
        let mut scope = FlowScope::for_step(
            &req.step_name,
            Some(step.next.clone()),
            req.inputs.is_some(),
        );
        scope.bind_params(&self.env.resolved_params);
        scope.bind_configs(&self.env.resolved_configs);
        scope.bind_class_vars(&self.env.flow.class_vars);
        scope.load_parent_state(&req.parent_artifacts);
        if let Some(input) = &req.foreach_input {
            scope.set_input_context(input.clone(), req.foreach_index.unwrap_or(0));
        } else {
            scope.adopt_innermost_frame();
        }
        if let Some(idx) = req.parallel_index {
            if req.foreach_input.is_none() {
                scope.set_input_context(Value::from(idx), idx);
            }
        }
        if !req.foreach_stack.is_empty() {
            let input = scope.input().cloned().unwrap_or(Value::Null);
            let index = scope.index().unwrap_or(0);
            scope.set_foreach_context(input, index, req.foreach_stack.clone());
        }
        scope
    }

    async fn register_task_metadata(&self, pathspec: &Pathspec, req: &TaskRequest) -> Result<()> {
        let mut entries = Vec::new();
        if let Some(origin) = &self.env.origin_run_id {
            entries.push(MetadataEntry::new(META_ORIGIN_RUN_ID, origin));
        }
        if !req.foreach_stack.is_empty() {
            let indices: Vec<(String, String, usize)> = req
                .foreach_stack
                .iter()
                .map(|f| (f.step.clone(), f.var.clone(), f.index))
                .collect();
            entries.push(MetadataEntry::new(
                META_FOREACH_INDICES,
                serde_json::to_string(&indices)
                    .map_err(|e| CoreError::Internal(format!("foreach indices encode: {e}")))?,
            ));
        }
        if !req.parent_task_pathspecs.is_empty() {
            entries.push(MetadataEntry::new(
                META_PARENT_TASK_IDS,
                serde_json::to_string(&req.parent_task_pathspecs)
                    .map_err(|e| CoreError::Internal(format!("parent pathspecs encode: {e}")))?,
            ));
        }
        if let Some(idx) = req.parallel_index {
            entries.push(MetadataEntry::new(
                META_PARALLEL_NODE_INDEX,
                idx.to_string(),
            ));
            entries.push(MetadataEntry::new(
                META_PARALLEL_NUM_NODES,
                req.parallel_total.unwrap_or(1).to_string(),
            ));
            if idx == 0 {
                entries.push(MetadataEntry::new(META_INTERNAL_TASK_TYPE, "control"));
            }
        }
        if !entries.is_empty() {
            self.env.metadata.register_metadata(pathspec, &entries).await?;
        }
        Ok(())
    }

    async fn save_results(
        &self,
        pathspec: &Pathspec,
        scope: &FlowScope,
        stdout: &str,
        stderr: &str,
        success: bool,
    ) -> Result<()> {
        let env = self.env;
        let arts = scope.persistable_state(success);
        env.datastore.clear_task_artifacts(pathspec).await?;
        env.datastore
            .save_artifacts(pathspec, &artifacts_to_blobs(&arts)?)
            .await?;
        env.datastore
            .save_log(pathspec, LogStream::Stdout, stdout)
            .await?;
        env.datastore
            .save_log(pathspec, LogStream::Stderr, stderr)
            .await?;
        env.metadata.done_task(pathspec).await?;
        Ok(())
    }
}

/// Portable view of how the child ended.
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

/// Map a child's exit status and `res` file onto an attempt ending.
fn classify_exit(
    signal: Option<i32>,
    code: Option<i32>,
    res_bytes: Option<&[u8]>,
    step_name: &str,
) -> AttemptEnd {
    if let Some(sig) = signal {
        return AttemptEnd::Signalled(sig);
    }
    let result: Option<TaskResult> =
        res_bytes.and_then(|bytes| serde_json::from_slice(bytes).ok());
    match (code, result) {
        (Some(0), Some(r)) if r.success => AttemptEnd::Ok(r),
        (Some(1), Some(r)) => AttemptEnd::Failed(r.exception.unwrap_or_else(|| {
            ExceptionInfo::new(
                "UserStepException",
                format!("Unknown error in step '{step_name}'"),
            )
        })),
        (Some(1), None) => AttemptEnd::Failed(ExceptionInfo::new(
            "UserStepException",
            format!("Unknown error in step '{step_name}'"),
        )),
        // Exit 2 or anything else unexplained: treated like a signal kill.
        _ => AttemptEnd::Signalled(-1),
    }
}
