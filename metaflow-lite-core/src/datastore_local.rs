use crate::cards::CardMeta;
use crate::datastore::{validate_artifact_name, Datastore};
use crate::error::{CoreError, Result};
use crate::types::{BlobMap, LogStream, Pathspec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const BLOB_EXT: &str = "blob";

/// Resolve the local datastore root: `METAFLOW_DATASTORE_SYSROOT_LOCAL`
/// or `.metaflow`.
pub fn local_sysroot() -> String {
    std::env::var("METAFLOW_DATASTORE_SYSROOT_LOCAL").unwrap_or_else(|_| ".metaflow".to_string())
}

/// Filesystem datastore:
/// `<root>/<flow>/<run>/<step>/<task>/artifacts/<name>.blob` and
/// `<root>/.../logs/<stream>.txt`.
pub struct LocalDatastore {
    root: PathBuf,
}

impl LocalDatastore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        Self::new(local_sysroot())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, ps: &Pathspec) -> PathBuf {
        self.root
            .join(&ps.flow)
            .join(&ps.run)
            .join(&ps.step)
            .join(&ps.task)
    }

    fn artifact_dir(&self, ps: &Pathspec) -> PathBuf {
        self.task_dir(ps).join("artifacts")
    }

    fn artifact_path(&self, ps: &Pathspec, name: &str) -> PathBuf {
        self.artifact_dir(ps).join(format!("{name}.{BLOB_EXT}"))
    }

    fn log_path(&self, ps: &Pathspec, stream: LogStream) -> PathBuf {
        self.task_dir(ps).join("logs").join(format!("{stream}.txt"))
    }

    fn card_dir(&self, ps: &Pathspec) -> PathBuf {
        self.task_dir(ps).join("cards")
    }
}

#[async_trait]
impl Datastore for LocalDatastore {
    async fn save_artifacts(&self, pathspec: &Pathspec, artifacts: &BlobMap) -> Result<()> {
        let dir = self.artifact_dir(pathspec);
        tokio::fs::create_dir_all(&dir).await?;
        for (name, blob) in artifacts {
            validate_artifact_name(name)?;
            tokio::fs::write(dir.join(format!("{name}.{BLOB_EXT}")), blob).await?;
        }
        tracing::debug!(pathspec = %pathspec, count = artifacts.len(), "saved artifacts");
        Ok(())
    }

    async fn load_artifact(&self, pathspec: &Pathspec, name: &str) -> Result<Option<Vec<u8>>> {
        validate_artifact_name(name)?;
        match tokio::fs::read(self.artifact_path(pathspec, name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_artifacts(&self, pathspec: &Pathspec) -> Result<BlobMap> {
        let dir = self.artifact_dir(pathspec);
        let mut result = BlobMap::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let fname = entry.file_name().to_string_lossy().to_string();
            if let Some(name) = fname.strip_suffix(&format!(".{BLOB_EXT}")) {
                let bytes = tokio::fs::read(entry.path()).await?;
                result.insert(name.to_string(), bytes);
            }
        }
        Ok(result)
    }

    async fn has_artifact(&self, pathspec: &Pathspec, name: &str) -> Result<bool> {
        validate_artifact_name(name)?;
        Ok(tokio::fs::try_exists(self.artifact_path(pathspec, name)).await?)
    }

    async fn artifact_names(&self, pathspec: &Pathspec) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .load_artifacts(pathspec)
            .await?
            .into_keys()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn clear_task_artifacts(&self, pathspec: &Pathspec) -> Result<()> {
        let dir = self.artifact_dir(pathspec);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let fname = entry.file_name().to_string_lossy().to_string();
            if fname.ends_with(&format!(".{BLOB_EXT}")) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn save_log(&self, pathspec: &Pathspec, stream: LogStream, content: &str) -> Result<()> {
        let path = self.log_path(pathspec, stream);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn load_log(&self, pathspec: &Pathspec, stream: LogStream) -> Result<String> {
        match tokio::fs::read_to_string(self.log_path(pathspec, stream)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_card(
        &self,
        pathspec: &Pathspec,
        index: usize,
        html: &str,
        meta: &CardMeta,
    ) -> Result<()> {
        let dir = self.card_dir(pathspec);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(format!("{index}.html")), html).await?;
        let meta_json = serde_json::to_vec(meta)
            .map_err(|e| CoreError::Internal(format!("card meta encode: {e}")))?;
        tokio::fs::write(dir.join(format!("{index}.json")), meta_json).await?;
        Ok(())
    }

    async fn load_card(
        &self,
        pathspec: &Pathspec,
        index: usize,
    ) -> Result<Option<(String, CardMeta)>> {
        let dir = self.card_dir(pathspec);
        let html = match tokio::fs::read_to_string(dir.join(format!("{index}.html"))).await {
            Ok(html) => html,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta_bytes = tokio::fs::read(dir.join(format!("{index}.json"))).await?;
        let meta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| CoreError::Internal(format!("card meta decode: {e}")))?;
        Ok(Some((html, meta)))
    }

    async fn list_cards(&self, pathspec: &Pathspec) -> Result<Vec<(usize, CardMeta)>> {
        let dir = self.card_dir(pathspec);
        let mut result = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let fname = entry.file_name().to_string_lossy().to_string();
            if let Some(idx) = fname.strip_suffix(".json").and_then(|s| s.parse::<usize>().ok()) {
                let meta_bytes = tokio::fs::read(entry.path()).await?;
                let meta = serde_json::from_slice(&meta_bytes)
                    .map_err(|e| CoreError::Internal(format!("card meta decode: {e}")))?;
                result.push((idx, meta));
            }
        }
        result.sort_by_key(|(idx, _)| *idx);
        Ok(result)
    }
}
