use crate::cards::CardMeta;
use crate::error::{CoreError, Result};
use crate::types::{BlobMap, LogStream, Pathspec};
use async_trait::async_trait;
use std::sync::Arc;

/// Persistence seam for per-task artifact blobs, log streams and card
/// files. Values are opaque bytes; serialisation is the caller's concern.
///
/// The scheduler and the client operate exclusively through this trait,
/// enabling pluggable backends (local filesystem, object storage).
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Persist a task's artifact group. Callers clear prior contents
    /// first; the post-attempt set must be visible in full or not at all.
    async fn save_artifacts(&self, pathspec: &Pathspec, artifacts: &BlobMap) -> Result<()>;

    async fn load_artifact(&self, pathspec: &Pathspec, name: &str) -> Result<Option<Vec<u8>>>;

    async fn load_artifacts(&self, pathspec: &Pathspec) -> Result<BlobMap>;

    async fn has_artifact(&self, pathspec: &Pathspec, name: &str) -> Result<bool>;

    async fn artifact_names(&self, pathspec: &Pathspec) -> Result<Vec<String>>;

    /// Remove every artifact of a task. Idempotent; called before each
    /// retry attempt writes.
    async fn clear_task_artifacts(&self, pathspec: &Pathspec) -> Result<()>;

    async fn save_log(&self, pathspec: &Pathspec, stream: LogStream, content: &str) -> Result<()>;

    /// Absent logs read back as the empty string.
    async fn load_log(&self, pathspec: &Pathspec, stream: LogStream) -> Result<String>;

    // ── Cards ──

    async fn save_card(
        &self,
        pathspec: &Pathspec,
        index: usize,
        html: &str,
        meta: &CardMeta,
    ) -> Result<()>;

    async fn load_card(&self, pathspec: &Pathspec, index: usize)
        -> Result<Option<(String, CardMeta)>>;

    async fn list_cards(&self, pathspec: &Pathspec) -> Result<Vec<(usize, CardMeta)>>;
}

/// Artifact names become path/key components; keep them to one segment.
pub fn validate_artifact_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(CoreError::Internal(format!(
            "invalid artifact name '{name}'"
        )));
    }
    Ok(())
}

// ─── Provider selection ───────────────────────────────────────

/// Serialisable datastore selection, carried in worker task specs so the
/// child process reconstructs the same backend.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatastoreConfig {
    Local { root: String },
    S3 { root: String },
}

impl DatastoreConfig {
    /// Resolve from `METAFLOW_DEFAULT_DATASTORE` and the sysroot vars.
    pub fn from_env() -> Result<Self> {
        match std::env::var("METAFLOW_DEFAULT_DATASTORE").as_deref() {
            Ok("s3") => {
                let root = std::env::var("METAFLOW_DATASTORE_SYSROOT_S3").map_err(|_| {
                    CoreError::Internal(
                        "S3 datastore selected but METAFLOW_DATASTORE_SYSROOT_S3 unset".to_string(),
                    )
                })?;
                Ok(DatastoreConfig::S3 { root })
            }
            _ => Ok(DatastoreConfig::Local {
                root: crate::datastore_local::local_sysroot(),
            }),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn Datastore>> {
        match self {
            DatastoreConfig::Local { root } => Ok(Arc::new(
                crate::datastore_local::LocalDatastore::new(root.clone()),
            )),
            DatastoreConfig::S3 { root } => Ok(Arc::new(crate::datastore_s3::S3Datastore::new(
                root.clone(),
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_name_validation() {
        assert!(validate_artifact_name("x").is_ok());
        assert!(validate_artifact_name("_task_ok").is_ok());
        assert!(validate_artifact_name("").is_err());
        assert!(validate_artifact_name("a/b").is_err());
        assert!(validate_artifact_name("..").is_err());
    }
}
