use crate::cards::render_cards;
use crate::config::ConfigInputs;
use crate::current::{self, TaskContext};
use crate::datastore::DatastoreConfig;
use crate::decorator::{card_specs, CallOutcome, CallState, HookEnv, StepBodyCall};
use crate::error::CoreError;
use crate::executor::{TaskSpec, TASK_SPEC_ENV};
use crate::flow::{FlowRegistry, StepBody};
use crate::metadata::MetadataConfig;
use crate::scheduler::{RunOptions, Scheduler};
use crate::scope::FlowScope;
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Env var carrying the runner-spec path into a flow subprocess.
pub const RUNNER_SPEC_ENV: &str = "METAFLOW_INTERNAL_RUNNER_SPEC";

// ─── Runner IPC ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Run,
    Resume,
}

/// What a `Runner` asks a flow subprocess to do: launch a whole run (or
/// resume) of a registered flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerSpec {
    pub mode: RunnerMode,
    pub flow_name: String,
    pub run_id: Option<String>,
    pub run_id_file: Option<String>,
    pub tags: Vec<String>,
    pub param_overrides: BTreeMap<String, String>,
    pub config_inputs: ConfigInputs,
    pub origin_run_id: Option<String>,
    pub resume_step: Option<String>,
    pub max_workers: usize,
    pub datastore: DatastoreConfig,
    pub metadata: MetadataConfig,
}

// ─── Bootstrap ────────────────────────────────────────────────

/// Route internal re-executions of the flow binary.
///
/// Call this early in `main`, after registering flows. When the process
/// was spawned as a task worker or a runner child it executes that work
/// and exits; otherwise it returns and `main` continues normally.
pub fn bootstrap(registry: &FlowRegistry) {
    if let Ok(spec_path) = std::env::var(TASK_SPEC_ENV) {
        let code = run_worker(registry, &spec_path);
        std::process::exit(code);
    }
    if let Ok(spec_path) = std::env::var(RUNNER_SPEC_ENV) {
        let code = run_scheduler_child(registry, &spec_path);
        std::process::exit(code);
    }
}

// ─── Task worker (one attempt of one step) ────────────────────

fn run_worker(registry: &FlowRegistry, spec_path: &str) -> i32 {
    let spec: TaskSpec = match std::fs::read(spec_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    {
        Some(spec) => spec,
        None => {
            eprintln!("worker: unreadable task spec at {spec_path}");
            return 2;
        }
    };
    let flow = match registry.get(&spec.flow_name) {
        Ok(flow) => flow,
        Err(e) => {
            eprintln!("worker: {e}");
            return 2;
        }
    };
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("worker: runtime: {e}");
            return 2;
        }
    };
    runtime.block_on(run_attempt(&flow, &spec))
}

async fn run_attempt(flow: &crate::flow::FlowDef, spec: &TaskSpec) -> i32 {
    let pathspec = spec.pathspec();
    // Lifecycle metadata stays with the parent; the child needs only the
    // datastore.
    let datastore = match spec.datastore.build() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("worker: datastore construction failed: {e}");
            return 2;
        }
    };

    let step = match flow.step(&spec.step_name) {
        Some(step) => step,
        None => {
            eprintln!("worker: unknown step '{}'", spec.step_name);
            return 2;
        }
    };
    let decorators = step.decorators.clone();

    // Rebuild the scope exactly as the parent's replica.
    let mut scope = FlowScope::for_step(
        &spec.step_name,
        Some(step.next.clone()),
        spec.inputs.is_some(),
    );
    scope.bind_params(&spec.resolved_params);
    scope.bind_configs(&spec.resolved_configs);
    scope.bind_class_vars(&flow.class_vars);
    scope.load_parent_state(&spec.parent_artifacts);
    if let Some(input) = &spec.foreach_input {
        scope.set_input_context(input.clone(), spec.foreach_index.unwrap_or(0));
    } else {
        scope.adopt_innermost_frame();
    }
    if let Some(idx) = spec.parallel_index {
        if spec.foreach_input.is_none() {
            scope.set_input_context(Value::from(idx), idx);
        }
    }
    if !spec.foreach_stack.is_empty() {
        let input = scope.input().cloned().unwrap_or(Value::Null);
        let index = scope.index().unwrap_or(0);
        scope.set_foreach_context(input, index, spec.foreach_stack.clone());
    }

    current::bind(TaskContext {
        flow_name: spec.flow_name.clone(),
        run_id: spec.run_id.clone(),
        step_name: spec.step_name.clone(),
        task_id: spec.task_id.clone(),
        retry_count: spec.attempt,
        origin_run_id: spec.origin_run_id.clone(),
        namespace: Some(format!("user:{}", username())),
        username: username(),
        user_tags: spec.tags.clone(),
        sys_tags: spec.sys_tags.clone(),
        parallel_num_nodes: spec.parallel_total.unwrap_or(1),
        parallel_node_index: spec.parallel_index.unwrap_or(0),
        project_name: spec.project.as_ref().map(|p| p.project_name.clone()),
        branch_name: spec.project.as_ref().map(|p| p.branch_name.clone()),
        project_flow_name: spec.project.as_ref().map(|p| p.project_flow_name.clone()),
        is_production: spec.project.as_ref().map(|p| p.is_production).unwrap_or(false),
    });

    let hook_env = HookEnv {
        pathspec: &pathspec,
        attempt: spec.attempt,
        max_retries: spec.max_retries,
        configs: &spec.resolved_configs,
    };

    // Failure snapshot taken before user code: if a timeout abandons the
    // body thread, this is what gets persisted.
    let pre_execution = scope.clone();

    for deco in &decorators {
        if let Err(e) = deco.task_pre_step(&hook_env, &mut scope) {
            let exc = ExceptionInfo::from_error(&e);
            return fail_attempt(&datastore, &pathspec, pre_execution, exc, &spec.res_path).await;
        }
    }

    // Base callable, wrapped through the decorator pipeline in
    // registration order.
    let body = step.body.clone();
    let base: StepBodyCall = Box::new(move |mut state: CallState| {
        let caught = catch_unwind(AssertUnwindSafe(|| match &body {
            StepBody::Linear(f) => f(&mut state.scope),
            StepBody::Join(f) => match state.inputs.as_ref() {
                Some(inputs) => f(&mut state.scope, inputs),
                None => Err(anyhow::anyhow!("join step invoked without inputs")),
            },
        }));
        match caught {
            Ok(Ok(())) => CallOutcome {
                scope: Some(state.scope),
                result: Ok(()),
            },
            Ok(Err(e)) => CallOutcome {
                scope: Some(state.scope),
                result: Err(exception_from_anyhow(&e)),
            },
            Err(panic) => CallOutcome {
                scope: None,
                result: Err(ExceptionInfo::new(
                    "UserStepException",
                    format!("step panicked: {}", panic_message(panic.as_ref())),
                )),
            },
        }
    });
    let mut wrapped = base;
    for deco in &decorators {
        wrapped = deco.task_decorate(wrapped, &hook_env);
    }

    let outcome = wrapped(CallState {
        scope,
        inputs: spec.inputs.clone(),
    });

    match outcome.result {
        Ok(()) => {
            let mut scope = match outcome.scope {
                Some(scope) => scope,
                None => {
                    let exc = ExceptionInfo::new(
                        "UserStepException",
                        "step body returned no state".to_string(),
                    );
                    return fail_attempt(&datastore, &pathspec, pre_execution, exc, &spec.res_path)
                        .await;
                }
            };

            for deco in decorators.iter().rev() {
                if let Err(e) = deco.task_post_step(&hook_env, &mut scope) {
                    let exc = ExceptionInfo::from_error(&e);
                    return fail_attempt(&datastore, &pathspec, scope, exc, &spec.res_path).await;
                }
            }

            let cards = card_specs(&decorators);
            if !cards.is_empty() {
                if let Err(e) = render_cards(&cards, &scope, &pathspec, &datastore).await {
                    tracing::warn!(pathspec = %pathspec, error = %e, "card persistence failed");
                }
            }

            // Persist before reporting: the parent reads the datastore as
            // the source of truth. Stale artifacts from a previous attempt
            // are cleared first.
            let arts = scope.persistable_state(true);
            let persisted = async {
                datastore.clear_task_artifacts(&pathspec).await?;
                datastore
                    .save_artifacts(&pathspec, &artifacts_to_blobs(&arts)?)
                    .await
            }
            .await;
            if let Err(e) = persisted {
                let exc = ExceptionInfo::from_error(&e);
                return fail_attempt(&datastore, &pathspec, scope, exc, &spec.res_path).await;
            }

            // Switch routing is computed here, from the recorded
            // transition, and carried home in the result.
            let taken_branch = scope.transition().and_then(|t| {
                let var = t.condition_var.as_ref()?;
                let value = scope.get(var).ok()?;
                t.resolve_switch_target(value)
            });

            write_result(&spec.res_path, &TaskResult::ok(taken_branch));
            0
        }
        Err(exc) => {
            let scope = outcome.scope.unwrap_or(pre_execution);
            fail_attempt(&datastore, &pathspec, scope, exc, &spec.res_path).await
        }
    }
}

/// Exception epilogue: persist the failure-stamped snapshot, report the
/// exception over the result channel, exit 1.
async fn fail_attempt(
    datastore: &std::sync::Arc<dyn crate::datastore::Datastore>,
    pathspec: &Pathspec,
    mut scope: FlowScope,
    exc: ExceptionInfo,
    res_path: &str,
) -> i32 {
    scope.set_exception(&exc);
    let arts = scope.persistable_state(false);
    let persisted = async {
        datastore.clear_task_artifacts(pathspec).await?;
        datastore
            .save_artifacts(pathspec, &artifacts_to_blobs(&arts)?)
            .await
    }
    .await;
    if let Err(e) = persisted {
        tracing::warn!(pathspec = %pathspec, error = %e, "failure snapshot persist failed");
    }
    write_result(res_path, &TaskResult::failed(exc));
    1
}

fn write_result(res_path: &str, result: &TaskResult) {
    let encoded = serde_json::to_vec(result).unwrap_or_else(|_| {
        // Fall back to a minimal wrapper when the payload will not encode.
        let minimal = TaskResult {
            success: result.success,
            taken_branch: result.taken_branch.clone(),
            exception: result.exception.as_ref().map(|e| ExceptionInfo::new(
                e.kind.clone(),
                e.message.clone(),
            )),
        };
        serde_json::to_vec(&minimal).unwrap_or_default()
    });
    if let Err(e) = std::fs::write(res_path, encoded) {
        eprintln!("worker: result write failed: {e}");
    }
}

fn exception_from_anyhow(err: &anyhow::Error) -> ExceptionInfo {
    if let Some(core) = err.downcast_ref::<CoreError>() {
        return ExceptionInfo::from_error(core);
    }
    ExceptionInfo {
        kind: "UserStepException".to_string(),
        message: err.to_string(),
        traceback: format!("{err:?}"),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Runner child (whole run in this process) ─────────────────

fn run_scheduler_child(registry: &FlowRegistry, spec_path: &str) -> i32 {
    let spec: RunnerSpec = match std::fs::read(spec_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    {
        Some(spec) => spec,
        None => {
            eprintln!("runner child: unreadable runner spec at {spec_path}");
            return 2;
        }
    };
    let flow = match registry.get(&spec.flow_name) {
        Ok(flow) => flow,
        Err(e) => {
            eprintln!("runner child: {e}");
            return 2;
        }
    };

    let run_id = spec.run_id.clone().unwrap_or_else(gen_run_id);
    if let Some(path) = &spec.run_id_file {
        if let Err(e) = std::fs::write(path, &run_id) {
            eprintln!("runner child: run id file write failed: {e}");
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runner child: runtime: {e}");
            return 2;
        }
    };

    let result = runtime.block_on(async {
        let datastore = spec.datastore.build()?;
        let metadata = spec.metadata.build()?;
        let options = RunOptions {
            tags: spec.tags.clone(),
            param_overrides: spec.param_overrides.clone(),
            config_inputs: spec.config_inputs.clone(),
            origin_run_id: spec.origin_run_id.clone(),
            max_workers: spec.max_workers,
            ..Default::default()
        };
        let mut scheduler = Scheduler::new(
            flow,
            datastore,
            metadata,
            spec.datastore.clone(),
            spec.metadata.clone(),
            run_id.clone(),
            options,
        );
        scheduler.execute(spec.resume_step.as_deref()).await
    });

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("run failed: {e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_from_anyhow_downcasts_core_errors() {
        let core: anyhow::Error = CoreError::Timeout(5).into();
        let exc = exception_from_anyhow(&core);
        assert_eq!(exc.kind, "TimeoutException");

        let plain = anyhow::anyhow!("user boom");
        let exc = exception_from_anyhow(&plain);
        assert_eq!(exc.kind, "UserStepException");
        assert_eq!(exc.message, "user boom");
    }

    #[test]
    fn test_runner_spec_round_trip() {
        let spec = RunnerSpec {
            mode: RunnerMode::Resume,
            flow_name: "F".to_string(),
            run_id: None,
            run_id_file: Some("/tmp/rid".to_string()),
            tags: vec!["exp:1".to_string()],
            param_overrides: BTreeMap::from([("alpha".to_string(), "0.5".to_string())]),
            config_inputs: ConfigInputs::default(),
            origin_run_id: Some("123".to_string()),
            resume_step: Some("middle".to_string()),
            max_workers: 16,
            datastore: DatastoreConfig::Local {
                root: ".metaflow".to_string(),
            },
            metadata: MetadataConfig::Local {
                root: ".metaflow".to_string(),
            },
        };
        let bytes = serde_json::to_vec(&spec).unwrap();
        let decoded: RunnerSpec = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.mode, RunnerMode::Resume);
        assert_eq!(decoded.resume_step.as_deref(), Some("middle"));
    }
}
