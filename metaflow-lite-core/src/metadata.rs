use crate::error::{CoreError, Result};
use crate::types::{MetadataEntry, Pathspec, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ─── Run lifecycle records ────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Done,
}

/// Lifecycle record for one run: tags, status, timestamps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunInfo {
    pub tags: Vec<String>,
    pub sys_tags: Vec<String>,
    pub status: RunStatus,
    pub created_at: Timestamp,
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
}

impl RunInfo {
    /// User tags united with system tags, for namespace checks.
    pub fn all_tags(&self) -> Vec<String> {
        let mut all = self.tags.clone();
        all.extend(self.sys_tags.iter().cloned());
        all
    }
}

// ─── Provider trait ───────────────────────────────────────────

/// Lifecycle and metadata persistence for runs, steps and tasks.
///
/// All operations are idempotent where semantics allow; `register_metadata`
/// is append-only. Providers signal *not found* and *access denied* as
/// distinct error kinds and retry transient network errors internally.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn new_run(
        &self,
        flow: &str,
        run: &str,
        tags: &[String],
        sys_tags: &[String],
    ) -> Result<()>;

    async fn new_step(&self, flow: &str, run: &str, step: &str) -> Result<()>;

    async fn new_task(&self, pathspec: &Pathspec) -> Result<()>;

    async fn register_metadata(
        &self,
        pathspec: &Pathspec,
        entries: &[MetadataEntry],
    ) -> Result<()>;

    async fn done_task(&self, pathspec: &Pathspec) -> Result<()>;

    async fn done_run(&self, flow: &str, run: &str) -> Result<()>;

    async fn is_task_done(&self, pathspec: &Pathspec) -> Result<bool>;

    async fn is_run_done(&self, flow: &str, run: &str) -> Result<bool>;

    /// Run ids in reverse chronological order.
    async fn get_run_ids(&self, flow: &str) -> Result<Vec<String>>;

    async fn get_step_names(&self, flow: &str, run: &str) -> Result<Vec<String>>;

    /// Task ids in creation order.
    async fn get_task_ids(&self, flow: &str, run: &str, step: &str) -> Result<Vec<String>>;

    async fn get_task_metadata(&self, pathspec: &Pathspec) -> Result<Vec<MetadataEntry>>;

    async fn get_run_meta(&self, flow: &str, run: &str) -> Result<Option<RunInfo>>;

    /// Replace the user tag set. System tags are untouched.
    async fn update_run_tags(&self, flow: &str, run: &str, tags: &[String]) -> Result<()>;
}

// ─── Provider selection ───────────────────────────────────────

/// Serialisable metadata provider selection for worker task specs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetadataConfig {
    Local { root: String },
    Service { url: String },
}

impl MetadataConfig {
    /// Resolve from `METAFLOW_DEFAULT_METADATA` and the service/root vars.
    pub fn from_env() -> Result<Self> {
        match std::env::var("METAFLOW_DEFAULT_METADATA").as_deref() {
            Ok("service") => {
                let url = std::env::var("METAFLOW_SERVICE_URL").map_err(|_| {
                    CoreError::Internal(
                        "service metadata selected but METAFLOW_SERVICE_URL unset".to_string(),
                    )
                })?;
                Ok(MetadataConfig::Service { url })
            }
            _ => Ok(MetadataConfig::Local {
                root: crate::datastore_local::local_sysroot(),
            }),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn MetadataProvider>> {
        match self {
            MetadataConfig::Local { root } => Ok(Arc::new(
                crate::metadata_local::LocalMetadataProvider::new(root.clone()),
            )),
            MetadataConfig::Service { url } => Ok(Arc::new(
                crate::metadata_service::ServiceMetadataProvider::new(url.clone()),
            )),
        }
    }
}

/// Order task ids numerically when they are counters, lexicographically
/// otherwise, so `"10"` sorts after `"2"`.
pub fn sort_task_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_ordering() {
        let mut ids = vec!["10".to_string(), "2".to_string(), "1".to_string()];
        sort_task_ids(&mut ids);
        assert_eq!(ids, vec!["1", "2", "10"]);
    }

    #[test]
    fn test_run_info_all_tags() {
        let info = RunInfo {
            tags: vec!["exp:1".into()],
            sys_tags: vec!["user:ada".into()],
            status: RunStatus::Running,
            created_at: 0,
            finished_at: None,
        };
        assert_eq!(info.all_tags(), vec!["exp:1", "user:ada"]);
    }
}
