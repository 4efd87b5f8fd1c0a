use crate::config::ConfigInputs;
use crate::datastore::{Datastore, DatastoreConfig};
use crate::decorator::HookEnv;
use crate::error::{CoreError, Result};
use crate::flow::{FlowDef, StepBody};
use crate::metadata::{MetadataConfig, MetadataProvider};
use crate::scope::{FlowScope, InputSlot, Inputs};
use crate::types::*;
use crate::worker::{RunnerMode, RunnerSpec, RUNNER_SPEC_ENV};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

// ─── Launch state ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Successful,
    Failed,
}

/// A run launched in a subprocess of the flow binary. Poll with
/// [`ExecutingRun::state`], or block on [`ExecutingRun::wait`].
pub struct ExecutingRun {
    child: tokio::process::Child,
    run_id_file: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    // Keep the IPC files alive for the child's lifetime.
    _spec_file: tempfile::NamedTempFile,
    _log_files: (tempfile::NamedTempFile, tempfile::NamedTempFile),
    _run_id_tmp: tempfile::NamedTempFile,
}

impl ExecutingRun {
    /// Non-blocking status check.
    pub fn state(&mut self) -> Result<RunState> {
        match self.child.try_wait()? {
            None => Ok(RunState::Running),
            Some(status) if status.success() => Ok(RunState::Successful),
            Some(_) => Ok(RunState::Failed),
        }
    }

    /// Wait for the subprocess and report the final state.
    pub async fn wait(&mut self) -> Result<RunState> {
        let status = self.child.wait().await?;
        Ok(if status.success() {
            RunState::Successful
        } else {
            RunState::Failed
        })
    }

    /// The run id written by the child, once available.
    pub async fn run_id(&self) -> Option<String> {
        tokio::fs::read_to_string(&self.run_id_file)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub async fn stdout(&self) -> String {
        tokio::fs::read_to_string(&self.stdout_path)
            .await
            .unwrap_or_default()
    }

    pub async fn stderr(&self) -> String {
        tokio::fs::read_to_string(&self.stderr_path)
            .await
            .unwrap_or_default()
    }
}

// ─── Runner ───────────────────────────────────────────────────

/// Programmatic launcher: runs (or resumes) a registered flow in a
/// subprocess of the flow binary, which must call `worker::bootstrap`
/// early in `main`.
pub struct Runner {
    flow_name: String,
    exe: PathBuf,
    datastore_cfg: DatastoreConfig,
    metadata_cfg: MetadataConfig,
    tags: Vec<String>,
    param_overrides: BTreeMap<String, String>,
    config_inputs: ConfigInputs,
    max_workers: usize,
}

impl Runner {
    pub fn new(flow_name: &str) -> Result<Self> {
        Ok(Self {
            flow_name: flow_name.to_string(),
            exe: std::env::current_exe()?,
            datastore_cfg: DatastoreConfig::from_env()?,
            metadata_cfg: MetadataConfig::from_env()?,
            tags: Vec::new(),
            param_overrides: BTreeMap::new(),
            config_inputs: ConfigInputs::default(),
            max_workers: 16,
        })
    }

    /// Launch a different executable than the current binary.
    pub fn exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = exe.into();
        self
    }

    pub fn datastore(mut self, cfg: DatastoreConfig) -> Self {
        self.datastore_cfg = cfg;
        self
    }

    pub fn metadata(mut self, cfg: MetadataConfig) -> Self {
        self.metadata_cfg = cfg;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.param_overrides
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn config_value(mut self, name: &str, value: &str) -> Self {
        self.config_inputs
            .values
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn config_file(mut self, name: &str, path: &str) -> Self {
        self.config_inputs
            .files
            .insert(name.to_string(), path.to_string());
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    /// Launch a fresh run.
    pub async fn run(&self) -> Result<ExecutingRun> {
        self.launch(RunnerMode::Run, None, None).await
    }

    /// Resume a failed origin run, optionally from a named step.
    pub async fn resume(
        &self,
        origin_run_id: &str,
        resume_step: Option<&str>,
    ) -> Result<ExecutingRun> {
        self.launch(
            RunnerMode::Resume,
            Some(origin_run_id.to_string()),
            resume_step.map(|s| s.to_string()),
        )
        .await
    }

    async fn launch(
        &self,
        mode: RunnerMode,
        origin_run_id: Option<String>,
        resume_step: Option<String>,
    ) -> Result<ExecutingRun> {
        let run_id_tmp = tempfile::NamedTempFile::new()?;
        let stdout_file = tempfile::NamedTempFile::new()?;
        let stderr_file = tempfile::NamedTempFile::new()?;
        let spec_file = tempfile::NamedTempFile::new()?;

        let spec = RunnerSpec {
            mode,
            flow_name: self.flow_name.clone(),
            run_id: None,
            run_id_file: Some(run_id_tmp.path().to_string_lossy().to_string()),
            tags: self.tags.clone(),
            param_overrides: self.param_overrides.clone(),
            config_inputs: self.config_inputs.clone(),
            origin_run_id,
            resume_step,
            max_workers: self.max_workers,
            datastore: self.datastore_cfg.clone(),
            metadata: self.metadata_cfg.clone(),
        };
        let bytes = serde_json::to_vec(&spec)
            .map_err(|e| CoreError::Internal(format!("runner spec encode: {e}")))?;
        tokio::fs::write(spec_file.path(), bytes).await?;

        tracing::info!(flow = %self.flow_name, exe = %self.exe.display(), "launching run subprocess");
        let child = tokio::process::Command::new(&self.exe)
            .env(RUNNER_SPEC_ENV, spec_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file.reopen()?))
            .stderr(Stdio::from(stderr_file.reopen()?))
            .spawn()?;

        Ok(ExecutingRun {
            child,
            run_id_file: run_id_tmp.path().to_path_buf(),
            stdout_path: stdout_file.path().to_path_buf(),
            stderr_path: stderr_file.path().to_path_buf(),
            _spec_file: spec_file,
            _log_files: (stdout_file, stderr_file),
            _run_id_tmp: run_id_tmp,
        })
    }
}

// ─── Spin ─────────────────────────────────────────────────────

/// The in-memory result of a spin: the artifacts the step produced.
pub struct SpinTask {
    pub pathspec: String,
    pub artifacts: ArtifactMap,
}

impl SpinTask {
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.artifacts.get(name)
    }
}

/// Re-execute a single step in-process for rapid iteration.
///
/// Parent state comes from the origin task's recorded parents; the
/// overrides replace individual artifacts before the body runs. Nothing
/// is persisted and no subprocess is forked.
pub async fn spin(
    flow: &FlowDef,
    datastore: &Arc<dyn Datastore>,
    metadata: &Arc<dyn MetadataProvider>,
    pathspec: &str,
    overrides: ArtifactMap,
    skip_decorators: bool,
) -> Result<SpinTask> {
    let ps: Pathspec = pathspec.parse()?;
    let step = flow
        .step(&ps.step)
        .ok_or_else(|| CoreError::NotFound(format!("step '{}'", ps.step)))?;

    // Reconstruct the origin task's parent state from its metadata.
    let mut parent_pathspecs: Vec<String> = Vec::new();
    for entry in metadata.get_task_metadata(&ps).await? {
        if entry.kind == META_PARENT_TASK_IDS {
            parent_pathspecs = serde_json::from_str(&entry.value).unwrap_or_default();
        }
    }

    let is_join = step.body.takes_inputs();
    let mut slots = Vec::new();
    let mut parent_arts = ArtifactMap::new();
    for (i, parent_ps) in parent_pathspecs.iter().enumerate() {
        let parent: Pathspec = parent_ps.parse()?;
        let arts = blobs_to_artifacts(&datastore.load_artifacts(&parent).await?)?;
        if i == 0 {
            parent_arts = arts.clone();
        }
        slots.push(InputSlot::new(parent.step.clone(), parent.task.clone(), arts));
    }
    let inputs = is_join.then(|| Inputs::new(slots));

    let mut scope = FlowScope::for_step(&ps.step, Some(step.next.clone()), is_join);
    scope.bind_class_vars(&flow.class_vars);
    scope.load_parent_state(&parent_arts);
    scope.adopt_innermost_frame();
    for (name, value) in overrides {
        scope.set_raw(&name, value);
    }

    let configs = ArtifactMap::new();
    let hook_env = HookEnv {
        pathspec: &ps,
        attempt: 0,
        max_retries: 0,
        configs: &configs,
    };
    if !skip_decorators {
        for deco in &step.decorators {
            deco.task_pre_step(&hook_env, &mut scope)?;
        }
    }

    let body_result = match &step.body {
        StepBody::Linear(f) => f(&mut scope),
        StepBody::Join(f) => {
            let inputs = inputs.as_ref().ok_or_else(|| {
                CoreError::Internal(format!(
                    "join step '{}' has no recorded parents to spin from",
                    ps.step
                ))
            })?;
            f(&mut scope, inputs)
        }
    };
    body_result.map_err(|e| CoreError::UserStep {
        type_name: "UserStepException".to_string(),
        message: e.to_string(),
    })?;

    if !skip_decorators {
        for deco in step.decorators.iter().rev() {
            deco.task_post_step(&hook_env, &mut scope)?;
        }
    }

    Ok(SpinTask {
        pathspec: ps.to_string(),
        artifacts: scope.user_artifacts(),
    })
}
