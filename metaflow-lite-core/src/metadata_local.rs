use crate::error::{CoreError, Result};
use crate::metadata::{sort_task_ids, MetadataProvider, RunInfo, RunStatus};
use crate::types::{now_ms, MetadataEntry, Pathspec};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Filesystem metadata provider: a `_meta/` directory of JSON sidecars at
/// each level of the datastore layout (`run_info.json`, `step_info.json`,
/// `task_info.json`, `metadata.json`).
pub struct LocalMetadataProvider {
    root: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StepInfo {
    step_name: String,
    created_at: i64,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TaskInfo {
    task_id: String,
    created_at: i64,
    status: String,
    #[serde(default)]
    finished_at: Option<i64>,
}

impl LocalMetadataProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        Self::new(crate::datastore_local::local_sysroot())
    }

    fn run_meta_dir(&self, flow: &str, run: &str) -> PathBuf {
        self.root.join(flow).join(run).join("_meta")
    }

    fn step_meta_dir(&self, flow: &str, run: &str, step: &str) -> PathBuf {
        self.root.join(flow).join(run).join(step).join("_meta")
    }

    fn task_meta_dir(&self, ps: &Pathspec) -> PathBuf {
        self.root
            .join(&ps.flow)
            .join(&ps.run)
            .join(&ps.step)
            .join(&ps.task)
            .join("_meta")
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CoreError::Internal(format!("metadata encode: {e}")))?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::Internal(format!("metadata decode at {}: {e}", path.display()))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Child directories that carry a `_meta/` marker.
    async fn list_meta_children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut result = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('_') || name.starts_with('.') {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join("_meta")).await? {
                result.push(name);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl MetadataProvider for LocalMetadataProvider {
    async fn new_run(
        &self,
        flow: &str,
        run: &str,
        tags: &[String],
        sys_tags: &[String],
    ) -> Result<()> {
        let info = RunInfo {
            tags: tags.to_vec(),
            sys_tags: sys_tags.to_vec(),
            status: RunStatus::Running,
            created_at: now_ms(),
            finished_at: None,
        };
        let dir = self.run_meta_dir(flow, run);
        Self::write_json(&dir.join("run_info.json"), &info).await?;
        // Flow-level marker so the flow shows up in listings.
        tokio::fs::create_dir_all(self.root.join(flow).join("_meta")).await?;
        Ok(())
    }

    async fn new_step(&self, flow: &str, run: &str, step: &str) -> Result<()> {
        let dir = self.step_meta_dir(flow, run, step);
        let info = StepInfo {
            step_name: step.to_string(),
            created_at: now_ms(),
        };
        Self::write_json(&dir.join("step_info.json"), &info).await
    }

    async fn new_task(&self, pathspec: &Pathspec) -> Result<()> {
        let dir = self.task_meta_dir(pathspec);
        let info = TaskInfo {
            task_id: pathspec.task.clone(),
            created_at: now_ms(),
            status: "running".to_string(),
            finished_at: None,
        };
        Self::write_json(&dir.join("task_info.json"), &info).await
    }

    async fn register_metadata(
        &self,
        pathspec: &Pathspec,
        entries: &[MetadataEntry],
    ) -> Result<()> {
        let path = self.task_meta_dir(pathspec).join("metadata.json");
        let mut existing: Vec<MetadataEntry> =
            Self::read_json(&path).await?.unwrap_or_default();
        existing.extend(entries.iter().cloned());
        Self::write_json(&path, &existing).await
    }

    async fn done_task(&self, pathspec: &Pathspec) -> Result<()> {
        let path = self.task_meta_dir(pathspec).join("task_info.json");
        if let Some(mut info) = Self::read_json::<TaskInfo>(&path).await? {
            info.status = "done".to_string();
            info.finished_at = Some(now_ms());
            Self::write_json(&path, &info).await?;
        }
        Ok(())
    }

    async fn done_run(&self, flow: &str, run: &str) -> Result<()> {
        let path = self.run_meta_dir(flow, run).join("run_info.json");
        if let Some(mut info) = Self::read_json::<RunInfo>(&path).await? {
            info.status = RunStatus::Done;
            info.finished_at = Some(now_ms());
            Self::write_json(&path, &info).await?;
        }
        Ok(())
    }

    async fn is_task_done(&self, pathspec: &Pathspec) -> Result<bool> {
        let path = self.task_meta_dir(pathspec).join("task_info.json");
        Ok(Self::read_json::<TaskInfo>(&path)
            .await?
            .map(|i| i.status == "done")
            .unwrap_or(false))
    }

    async fn is_run_done(&self, flow: &str, run: &str) -> Result<bool> {
        let path = self.run_meta_dir(flow, run).join("run_info.json");
        Ok(Self::read_json::<RunInfo>(&path)
            .await?
            .map(|i| i.status == RunStatus::Done)
            .unwrap_or(false))
    }

    async fn get_run_ids(&self, flow: &str) -> Result<Vec<String>> {
        let mut runs = self.list_meta_children(&self.root.join(flow)).await?;
        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    async fn get_step_names(&self, flow: &str, run: &str) -> Result<Vec<String>> {
        self.list_meta_children(&self.root.join(flow).join(run))
            .await
    }

    async fn get_task_ids(&self, flow: &str, run: &str, step: &str) -> Result<Vec<String>> {
        let mut ids = self
            .list_meta_children(&self.root.join(flow).join(run).join(step))
            .await?;
        sort_task_ids(&mut ids);
        Ok(ids)
    }

    async fn get_task_metadata(&self, pathspec: &Pathspec) -> Result<Vec<MetadataEntry>> {
        let path = self.task_meta_dir(pathspec).join("metadata.json");
        Ok(Self::read_json(&path).await?.unwrap_or_default())
    }

    async fn get_run_meta(&self, flow: &str, run: &str) -> Result<Option<RunInfo>> {
        let path = self.run_meta_dir(flow, run).join("run_info.json");
        Self::read_json(&path).await
    }

    async fn update_run_tags(&self, flow: &str, run: &str, tags: &[String]) -> Result<()> {
        let path = self.run_meta_dir(flow, run).join("run_info.json");
        match Self::read_json::<RunInfo>(&path).await? {
            Some(mut info) => {
                info.tags = tags.to_vec();
                Self::write_json(&path, &info).await
            }
            None => Err(CoreError::NotFound(format!("run {flow}/{run}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> (tempfile::TempDir, LocalMetadataProvider) {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalMetadataProvider::new(dir.path());
        (dir, p)
    }

    fn ps(run: &str, step: &str, task: &str) -> Pathspec {
        Pathspec::new("F", run, step, task)
    }

    /// Run lifecycle: running → done with a finished_at stamp
    #[tokio::test]
    async fn test_run_lifecycle() {
        let (_d, p) = provider();
        p.new_run("F", "100", &["exp:1".into()], &["user:ada".into()])
            .await
            .unwrap();
        assert!(!p.is_run_done("F", "100").await.unwrap());

        let info = p.get_run_meta("F", "100").await.unwrap().unwrap();
        assert_eq!(info.status, RunStatus::Running);
        assert_eq!(info.tags, vec!["exp:1"]);
        assert_eq!(info.sys_tags, vec!["user:ada"]);
        assert!(info.finished_at.is_none());

        p.done_run("F", "100").await.unwrap();
        assert!(p.is_run_done("F", "100").await.unwrap());
        let info = p.get_run_meta("F", "100").await.unwrap().unwrap();
        assert_eq!(info.status, RunStatus::Done);
        assert!(info.finished_at.is_some());
    }

    /// Metadata entries append in order and never rewrite
    #[tokio::test]
    async fn test_metadata_append_only() {
        let (_d, p) = provider();
        let t = ps("100", "start", "1");
        p.new_task(&t).await.unwrap();
        p.register_metadata(&t, &[MetadataEntry::new("attempt", "0")])
            .await
            .unwrap();
        p.register_metadata(&t, &[MetadataEntry::new("attempt", "1")])
            .await
            .unwrap();
        let entries = p.get_task_metadata(&t).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, "0");
        assert_eq!(entries[1].value, "1");
    }

    #[tokio::test]
    async fn test_task_lifecycle_and_listing() {
        let (_d, p) = provider();
        p.new_run("F", "100", &[], &[]).await.unwrap();
        p.new_step("F", "100", "start").await.unwrap();
        for id in ["1", "2", "10"] {
            p.new_task(&ps("100", "start", id)).await.unwrap();
        }
        p.done_task(&ps("100", "start", "1")).await.unwrap();

        assert!(p.is_task_done(&ps("100", "start", "1")).await.unwrap());
        assert!(!p.is_task_done(&ps("100", "start", "2")).await.unwrap());
        assert_eq!(
            p.get_task_ids("F", "100", "start").await.unwrap(),
            vec!["1", "2", "10"]
        );
        assert_eq!(p.get_step_names("F", "100").await.unwrap(), vec!["start"]);
    }

    /// Run ids come back newest first
    #[tokio::test]
    async fn test_run_ids_reverse_chronological() {
        let (_d, p) = provider();
        p.new_run("F", "100", &[], &[]).await.unwrap();
        p.new_run("F", "200", &[], &[]).await.unwrap();
        p.new_run("F", "150", &[], &[]).await.unwrap();
        assert_eq!(
            p.get_run_ids("F").await.unwrap(),
            vec!["200", "150", "100"]
        );
    }

    /// update_run_tags then get_run_meta round-trips the tag set
    #[tokio::test]
    async fn test_update_run_tags() {
        let (_d, p) = provider();
        p.new_run("F", "100", &["a".into()], &["user:ada".into()])
            .await
            .unwrap();
        p.update_run_tags("F", "100", &["b".into(), "c".into()])
            .await
            .unwrap();
        let info = p.get_run_meta("F", "100").await.unwrap().unwrap();
        assert_eq!(info.tags, vec!["b", "c"]);
        assert_eq!(info.sys_tags, vec!["user:ada"]);

        let err = p.update_run_tags("F", "999", &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_run_meta_is_none() {
        let (_d, p) = provider();
        assert!(p.get_run_meta("F", "nope").await.unwrap().is_none());
        assert!(p.get_task_metadata(&ps("1", "s", "1")).await.unwrap().is_empty());
    }
}
