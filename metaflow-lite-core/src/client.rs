use crate::datastore::{Datastore, DatastoreConfig};
use crate::error::{CoreError, Result};
use crate::metadata::{MetadataConfig, MetadataProvider, RunInfo, RunStatus};
use crate::types::*;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

// ─── Client root ──────────────────────────────────────────────

struct ClientInner {
    datastore: Arc<dyn Datastore>,
    metadata: Arc<dyn MetadataProvider>,
    /// Lookups are restricted to runs carrying this tag; `None` means
    /// the global namespace.
    namespace: Option<String>,
}

/// Read-only mirror of past runs: an immutable
/// `Flow → Run → Step → Task → DataArtifact` hierarchy reconstructed
/// from the datastore and metadata providers.
#[derive(Clone)]
pub struct MetaflowClient {
    inner: Arc<ClientInner>,
}

impl MetaflowClient {
    /// Client in the invoking user's namespace (`user:<name>`).
    pub fn new(datastore: Arc<dyn Datastore>, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                datastore,
                metadata,
                namespace: Some(format!("user:{}", username())),
            }),
        }
    }

    pub fn from_env() -> Result<Self> {
        let datastore = DatastoreConfig::from_env()?.build()?;
        let metadata = MetadataConfig::from_env()?.build()?;
        Ok(Self::new(datastore, metadata))
    }

    /// Switch namespace; `None` removes all filtering.
    pub fn with_namespace(self, namespace: Option<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                datastore: self.inner.datastore.clone(),
                metadata: self.inner.metadata.clone(),
                namespace,
            }),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.inner.namespace.as_deref()
    }

    pub fn flow(&self, name: &str) -> Flow {
        Flow {
            inner: self.inner.clone(),
            name: name.to_string(),
        }
    }

    /// Look up a `Flow/Run` pathspec, enforcing the namespace.
    pub async fn run(&self, pathspec: &str) -> Result<Run> {
        let parts = split_pathspec(pathspec)?;
        if parts.len() != 2 {
            return Err(CoreError::NotFound(format!(
                "invalid run pathspec '{pathspec}'"
            )));
        }
        self.flow(parts[0]).run(parts[1]).await
    }

    /// Look up a `Flow/Run/Step` pathspec, enforcing the namespace.
    pub async fn step(&self, pathspec: &str) -> Result<Step> {
        let parts = split_pathspec(pathspec)?;
        if parts.len() != 3 {
            return Err(CoreError::NotFound(format!(
                "invalid step pathspec '{pathspec}'"
            )));
        }
        let run = self.flow(parts[0]).run(parts[1]).await?;
        Ok(run.step(parts[2]))
    }

    /// Look up a full task pathspec, enforcing the namespace.
    pub async fn task(&self, pathspec: &str) -> Result<Task> {
        let ps: Pathspec = pathspec.parse()?;
        check_namespace(&self.inner, &ps.flow, &ps.run).await?;
        Ok(Task {
            inner: self.inner.clone(),
            pathspec: ps,
        })
    }

    /// Look up one artifact of a task by pathspec and name.
    pub async fn artifact(&self, pathspec: &str, name: &str) -> Result<DataArtifact> {
        let task = self.task(pathspec).await?;
        Ok(DataArtifact {
            inner: task.inner.clone(),
            pathspec: task.pathspec.clone(),
            name: name.to_string(),
        })
    }
}

async fn check_namespace(inner: &ClientInner, flow: &str, run: &str) -> Result<()> {
    let Some(ns) = &inner.namespace else {
        return Ok(());
    };
    let meta = inner
        .metadata
        .get_run_meta(flow, run)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("run {flow}/{run}")))?;
    if !meta.all_tags().iter().any(|t| t == ns) {
        return Err(CoreError::NamespaceMismatch(format!(
            "{flow}/{run} is not in namespace '{ns}'"
        )));
    }
    Ok(())
}

// ─── Flow ─────────────────────────────────────────────────────

/// A named flow: the root of the read hierarchy.
pub struct Flow {
    inner: Arc<ClientInner>,
    name: String,
}

impl Flow {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs in reverse chronological order, namespace- and tag-filtered.
    pub async fn runs(&self, tags: &[&str]) -> Result<Vec<Run>> {
        let run_ids = self.inner.metadata.get_run_ids(&self.name).await?;
        let mut result = Vec::new();
        for run_id in run_ids {
            let Some(meta) = self.inner.metadata.get_run_meta(&self.name, &run_id).await? else {
                continue;
            };
            let all = meta.all_tags();
            if let Some(ns) = &self.inner.namespace {
                if !all.iter().any(|t| t == ns) {
                    continue;
                }
            }
            if !tags.iter().all(|t| all.iter().any(|a| a == t)) {
                continue;
            }
            result.push(Run {
                inner: self.inner.clone(),
                flow_name: self.name.clone(),
                run_id,
            });
        }
        Ok(result)
    }

    pub async fn run(&self, run_id: &str) -> Result<Run> {
        check_namespace(&self.inner, &self.name, run_id).await?;
        Ok(Run {
            inner: self.inner.clone(),
            flow_name: self.name.clone(),
            run_id: run_id.to_string(),
        })
    }

    pub async fn latest_run(&self) -> Result<Option<Run>> {
        Ok(self.runs(&[]).await?.into_iter().next())
    }

    pub async fn latest_successful_run(&self) -> Result<Option<Run>> {
        for run in self.runs(&[]).await? {
            if run.successful().await? {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }
}

// ─── Run ──────────────────────────────────────────────────────

/// One execution of a flow.
pub struct Run {
    inner: Arc<ClientInner>,
    flow_name: String,
    run_id: String,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("flow_name", &self.flow_name)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl Run {
    pub fn id(&self) -> &str {
        &self.run_id
    }

    pub fn pathspec(&self) -> String {
        format!("{}/{}", self.flow_name, self.run_id)
    }

    pub fn step(&self, step_name: &str) -> Step {
        Step {
            inner: self.inner.clone(),
            flow_name: self.flow_name.clone(),
            run_id: self.run_id.clone(),
            step_name: step_name.to_string(),
        }
    }

    pub async fn steps(&self) -> Result<Vec<Step>> {
        let names = self
            .inner
            .metadata
            .get_step_names(&self.flow_name, &self.run_id)
            .await?;
        Ok(names.into_iter().map(|n| self.step(&n)).collect())
    }

    async fn meta(&self) -> Result<RunInfo> {
        self.inner
            .metadata
            .get_run_meta(&self.flow_name, &self.run_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("run {}/{}", self.flow_name, self.run_id))
            })
    }

    pub async fn finished(&self) -> Result<bool> {
        self.inner
            .metadata
            .is_run_done(&self.flow_name, &self.run_id)
            .await
    }

    /// Done, with a successful end task.
    pub async fn successful(&self) -> Result<bool> {
        let meta = match self
            .inner
            .metadata
            .get_run_meta(&self.flow_name, &self.run_id)
            .await?
        {
            Some(meta) => meta,
            None => return Ok(false),
        };
        if meta.status != RunStatus::Done {
            return Ok(false);
        }
        for task in self.step("end").tasks().await? {
            if task.successful().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn end_task(&self) -> Result<Option<Task>> {
        Ok(self.step("end").tasks().await?.into_iter().last())
    }

    /// The end task's user artifacts; the run's "result".
    pub async fn data(&self) -> Result<Option<ArtifactMap>> {
        match self.end_task().await? {
            Some(task) => Ok(Some(task.data().await?)),
            None => Ok(None),
        }
    }

    /// The origin run this one was resumed from, if any task carries a
    /// resume marker.
    pub async fn origin_run_id(&self) -> Result<Option<String>> {
        for step in self.steps().await? {
            for task in step.tasks().await? {
                for entry in task.metadata_entries().await? {
                    if entry.kind == META_ORIGIN_RUN_ID {
                        return Ok(Some(entry.value));
                    }
                }
            }
        }
        Ok(None)
    }

    // ── Tags ──

    pub async fn tags(&self) -> Result<BTreeSet<String>> {
        Ok(self.meta().await?.all_tags().into_iter().collect())
    }

    pub async fn user_tags(&self) -> Result<BTreeSet<String>> {
        Ok(self.meta().await?.tags.into_iter().collect())
    }

    pub async fn system_tags(&self) -> Result<BTreeSet<String>> {
        Ok(self.meta().await?.sys_tags.into_iter().collect())
    }

    pub async fn add_tag(&self, tag: &str) -> Result<()> {
        self.add_tags(&[tag]).await
    }

    /// Add user tags. Adding a tag equal to a system tag is a silent
    /// no-op; adding an existing tag is idempotent.
    pub async fn add_tags(&self, tags: &[&str]) -> Result<()> {
        let meta = self.meta().await?;
        let sys: BTreeSet<&String> = meta.sys_tags.iter().collect();
        let mut user: BTreeSet<String> = meta.tags.iter().cloned().collect();
        for tag in tags {
            validate_tag(tag)?;
            if !sys.contains(&tag.to_string()) {
                user.insert(tag.to_string());
            }
        }
        let user: Vec<String> = user.into_iter().collect();
        self.inner
            .metadata
            .update_run_tags(&self.flow_name, &self.run_id, &user)
            .await
    }

    pub async fn remove_tag(&self, tag: &str) -> Result<()> {
        self.remove_tags(&[tag]).await
    }

    /// Remove user tags. Removing a system tag is an error.
    pub async fn remove_tags(&self, tags: &[&str]) -> Result<()> {
        let meta = self.meta().await?;
        let sys: BTreeSet<&String> = meta.sys_tags.iter().collect();
        for tag in tags {
            if sys.contains(&tag.to_string()) {
                return Err(CoreError::InvalidTag(format!(
                    "cannot remove system tag '{tag}'"
                )));
            }
        }
        let mut user: BTreeSet<String> = meta.tags.iter().cloned().collect();
        for tag in tags {
            user.remove(*tag);
        }
        let user: Vec<String> = user.into_iter().collect();
        self.inner
            .metadata
            .update_run_tags(&self.flow_name, &self.run_id, &user)
            .await
    }

    pub async fn replace_tags(&self, remove: &[&str], add: &[&str]) -> Result<()> {
        let meta = self.meta().await?;
        let sys: BTreeSet<&String> = meta.sys_tags.iter().collect();
        for tag in remove {
            if sys.contains(&tag.to_string()) {
                return Err(CoreError::InvalidTag(format!(
                    "cannot remove system tag '{tag}'"
                )));
            }
        }
        let mut user: BTreeSet<String> = meta.tags.iter().cloned().collect();
        for tag in remove {
            user.remove(*tag);
        }
        for tag in add {
            validate_tag(tag)?;
            if !sys.contains(&tag.to_string()) {
                user.insert(tag.to_string());
            }
        }
        let user: Vec<String> = user.into_iter().collect();
        self.inner
            .metadata
            .update_run_tags(&self.flow_name, &self.run_id, &user)
            .await
    }
}

// ─── Step ─────────────────────────────────────────────────────

/// A step of a run: a name plus its tasks.
pub struct Step {
    inner: Arc<ClientInner>,
    flow_name: String,
    run_id: String,
    step_name: String,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.step_name
    }

    pub fn pathspec(&self) -> String {
        format!("{}/{}/{}", self.flow_name, self.run_id, self.step_name)
    }

    pub fn task_handle(&self, task_id: &str) -> Task {
        Task {
            inner: self.inner.clone(),
            pathspec: Pathspec::new(&self.flow_name, &self.run_id, &self.step_name, task_id),
        }
    }

    /// Tasks in creation order.
    pub async fn tasks(&self) -> Result<Vec<Task>> {
        let ids = self
            .inner
            .metadata
            .get_task_ids(&self.flow_name, &self.run_id, &self.step_name)
            .await?;
        Ok(ids.into_iter().map(|id| self.task_handle(&id)).collect())
    }

    /// The latest task (highest task id).
    pub async fn task(&self) -> Result<Task> {
        self.tasks().await?.into_iter().last().ok_or_else(|| {
            CoreError::NotFound(format!("no tasks in step {}", self.pathspec()))
        })
    }

    /// Tasks stamped as parallel control nodes.
    pub async fn control_tasks(&self) -> Result<Vec<Task>> {
        let mut result = Vec::new();
        for task in self.tasks().await? {
            for entry in task.metadata_entries().await? {
                if entry.kind == META_PARALLEL_NODE_INDEX {
                    if entry.value == "0" {
                        result.push(task);
                    }
                    break;
                }
            }
        }
        Ok(result)
    }
}

// ─── Task ─────────────────────────────────────────────────────

/// One dynamic instantiation of a step.
pub struct Task {
    inner: Arc<ClientInner>,
    pathspec: Pathspec,
}

impl Task {
    pub fn id(&self) -> &str {
        &self.pathspec.task
    }

    pub fn pathspec(&self) -> String {
        self.pathspec.to_string()
    }

    async fn load_artifacts(&self) -> Result<ArtifactMap> {
        let blobs = self.inner.datastore.load_artifacts(&self.pathspec).await?;
        blobs_to_artifacts(&blobs)
    }

    /// User artifacts only; underscore-prefixed names are private.
    pub async fn data(&self) -> Result<ArtifactMap> {
        Ok(self
            .load_artifacts()
            .await?
            .into_iter()
            .filter(|(k, _)| !is_internal_artifact(k))
            .collect())
    }

    pub async fn artifact_names(&self) -> Result<Vec<String>> {
        self.inner.datastore.artifact_names(&self.pathspec).await
    }

    pub fn artifact(&self, name: &str) -> DataArtifact {
        DataArtifact {
            inner: self.inner.clone(),
            pathspec: self.pathspec.clone(),
            name: name.to_string(),
        }
    }

    pub async fn stdout(&self) -> Result<String> {
        self.inner
            .datastore
            .load_log(&self.pathspec, LogStream::Stdout)
            .await
    }

    pub async fn stderr(&self) -> Result<String> {
        self.inner
            .datastore
            .load_log(&self.pathspec, LogStream::Stderr)
            .await
    }

    /// The recorded exception wrapper, when the task failed (or a
    /// `@catch` stored one).
    pub async fn exception(&self) -> Result<Option<ExceptionInfo>> {
        let arts = self.load_artifacts().await?;
        Ok(arts
            .get(ART_EXCEPTION)
            .and_then(|v| serde_json::from_value(v.clone()).ok()))
    }

    pub async fn finished(&self) -> Result<bool> {
        self.inner.metadata.is_task_done(&self.pathspec).await
    }

    /// `_task_ok == true`: the body returned without exception (or a
    /// catch suppressed the failure).
    pub async fn successful(&self) -> Result<bool> {
        let arts = self.load_artifacts().await?;
        Ok(arts
            .get(ART_TASK_OK)
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn metadata_entries(&self) -> Result<Vec<MetadataEntry>> {
        self.inner.metadata.get_task_metadata(&self.pathspec).await
    }

    /// Metadata as a map keyed by entry type; later entries win.
    pub async fn metadata_dict(&self) -> Result<std::collections::BTreeMap<String, String>> {
        Ok(self
            .metadata_entries()
            .await?
            .into_iter()
            .map(|e| (e.kind, e.value))
            .collect())
    }

    /// Pathspec of the origin task this one was cloned from.
    pub async fn origin_pathspec(&self) -> Result<Option<String>> {
        let meta = self.metadata_dict().await?;
        match (meta.get(META_ORIGIN_TASK_ID), meta.get(META_ORIGIN_RUN_ID)) {
            (Some(task), Some(run)) => Ok(Some(format!(
                "{}/{}/{}/{}",
                self.pathspec.flow, run, self.pathspec.step, task
            ))),
            _ => Ok(None),
        }
    }

    pub async fn parent_task_pathspecs(&self) -> Result<Vec<String>> {
        for entry in self.metadata_entries().await? {
            if entry.kind == META_PARENT_TASK_IDS {
                return Ok(serde_json::from_str(&entry.value).unwrap_or_default());
            }
        }
        Ok(Vec::new())
    }

    /// Tasks this one received its inputs from, via parent-ids metadata.
    pub async fn parent_tasks(&self) -> Result<Vec<Task>> {
        let mut result = Vec::new();
        for ps in self.parent_task_pathspecs().await? {
            result.push(Task {
                inner: self.inner.clone(),
                pathspec: ps.parse()?,
            });
        }
        Ok(result)
    }

    /// Tasks in later steps that list this one as a parent.
    pub async fn child_tasks(&self) -> Result<Vec<Task>> {
        let me = self.pathspec();
        let mut result = Vec::new();
        let steps = self
            .inner
            .metadata
            .get_step_names(&self.pathspec.flow, &self.pathspec.run)
            .await?;
        for step in steps {
            let ids = self
                .inner
                .metadata
                .get_task_ids(&self.pathspec.flow, &self.pathspec.run, &step)
                .await?;
            for id in ids {
                let candidate = Task {
                    inner: self.inner.clone(),
                    pathspec: Pathspec::new(
                        &self.pathspec.flow,
                        &self.pathspec.run,
                        &step,
                        &id,
                    ),
                };
                if candidate
                    .parent_task_pathspecs()
                    .await?
                    .iter()
                    .any(|p| p == &me)
                {
                    result.push(candidate);
                }
            }
        }
        Ok(result)
    }
}

// ─── DataArtifact ─────────────────────────────────────────────

/// One named artifact of one task, loaded lazily.
pub struct DataArtifact {
    inner: Arc<ClientInner>,
    pathspec: Pathspec,
    name: String,
}

impl DataArtifact {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pathspec(&self) -> String {
        format!("{}/{}", self.pathspec, self.name)
    }

    pub async fn data(&self) -> Result<Value> {
        let blob = self
            .inner
            .datastore
            .load_artifact(&self.pathspec, &self.name)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "artifact '{}' of {}",
                    self.name, self.pathspec
                ))
            })?;
        blob_to_value(&blob)
    }

    pub async fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data().await?)
            .map_err(|e| CoreError::Internal(format!("artifact '{}' decode: {e}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore_local::LocalDatastore;
    use crate::metadata_local::LocalMetadataProvider;
    use serde_json::json;

    async fn seeded_client(ns: Option<String>) -> (tempfile::TempDir, MetaflowClient) {
        let dir = tempfile::tempdir().unwrap();
        let datastore: Arc<dyn Datastore> = Arc::new(LocalDatastore::new(dir.path()));
        let metadata: Arc<dyn MetadataProvider> =
            Arc::new(LocalMetadataProvider::new(dir.path()));

        metadata
            .new_run(
                "F",
                "100",
                &["exp:1".to_string()],
                &["user:ada".to_string(), "runtime:local".to_string()],
            )
            .await
            .unwrap();
        metadata.new_step("F", "100", "start").await.unwrap();
        let ps = Pathspec::new("F", "100", "start", "1");
        metadata.new_task(&ps).await.unwrap();
        metadata
            .register_metadata(&ps, &[MetadataEntry::new(META_ATTEMPT, "0")])
            .await
            .unwrap();
        let arts = ArtifactMap::from([
            ("x".to_string(), json!(1)),
            (ART_TASK_OK.to_string(), json!(true)),
        ]);
        datastore
            .save_artifacts(&ps, &artifacts_to_blobs(&arts).unwrap())
            .await
            .unwrap();
        metadata.done_task(&ps).await.unwrap();

        let client = MetaflowClient::new(datastore, metadata).with_namespace(ns);
        (dir, client)
    }

    /// Namespace enforcement: mismatching tag sets fail lookups
    #[tokio::test]
    async fn test_namespace_mismatch() {
        let (_dir, client) = seeded_client(Some("user:someone-else".to_string())).await;
        let err = client.flow("F").run("100").await.unwrap_err();
        assert!(matches!(err, CoreError::NamespaceMismatch(_)));

        let open = client.with_namespace(None);
        assert!(open.flow("F").run("100").await.is_ok());

        let matching = open.with_namespace(Some("user:ada".to_string()));
        assert!(matching.flow("F").run("100").await.is_ok());
    }

    /// Task data hides underscore-prefixed artifacts
    #[tokio::test]
    async fn test_task_data_filters_internals() {
        let (_dir, client) = seeded_client(None).await;
        let task = client.task("F/100/start/1").await.unwrap();
        let data = task.data().await.unwrap();
        assert_eq!(data.get("x"), Some(&json!(1)));
        assert!(!data.contains_key(ART_TASK_OK));
        assert!(task.successful().await.unwrap());
        assert_eq!(
            task.artifact("x").data().await.unwrap(),
            json!(1)
        );
    }

    /// Tag mutation: silent no-op on system tags, error on removal
    #[tokio::test]
    async fn test_tag_invariants() {
        let (_dir, client) = seeded_client(None).await;
        let run = client.flow("F").run("100").await.unwrap();

        // Adding a system tag is silently skipped.
        run.add_tag("user:ada").await.unwrap();
        assert!(!run.user_tags().await.unwrap().contains("user:ada"));

        // Adding twice is idempotent.
        run.add_tag("golden").await.unwrap();
        run.add_tag("golden").await.unwrap();
        let tags = run.user_tags().await.unwrap();
        assert_eq!(tags.iter().filter(|t| *t == "golden").count(), 1);

        let err = run.remove_tag("user:ada").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTag(_)));

        run.replace_tags(&["golden"], &["silver"]).await.unwrap();
        let tags = run.user_tags().await.unwrap();
        assert!(tags.contains("silver"));
        assert!(!tags.contains("golden"));

        assert!(run.add_tag("").await.is_err());
    }

    #[tokio::test]
    async fn test_flow_runs_filtering() {
        let (_dir, client) = seeded_client(None).await;
        let runs = client.flow("F").runs(&[]).await.unwrap();
        assert_eq!(runs.len(), 1);

        let filtered = client.flow("F").runs(&["exp:1"]).await.unwrap();
        assert_eq!(filtered.len(), 1);
        let none = client.flow("F").runs(&["exp:2"]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pathspec_shapes() {
        let (_dir, client) = seeded_client(None).await;
        assert!(client.task("F/100/start").await.is_err());
        assert!(client.run("F").await.is_err());
        assert!(client.step("F/100/start/1").await.is_err());
    }
}
