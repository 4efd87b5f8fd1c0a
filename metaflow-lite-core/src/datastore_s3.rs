use crate::cards::CardMeta;
use crate::datastore::{validate_artifact_name, Datastore};
use crate::error::{CoreError, Result};
use crate::types::{BlobMap, LogStream, Pathspec};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::future::Future;
use std::time::Duration;

/// Retry budget for transient object-store errors.
const MAX_ATTEMPTS: u32 = 7;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 10_000;

/// S3-compatible object-store datastore.
///
/// Keys mirror the local layout under the configured root
/// (`METAFLOW_DATASTORE_SYSROOT_S3`, e.g. `s3://bucket/prefix`).
/// `METAFLOW_S3_ENDPOINT_URL` selects a custom endpoint, addressed
/// path-style; request signing, when needed, is the endpoint's concern.
/// Transient error classes retry with exponential backoff; access-denied
/// fails fast.
pub struct S3Datastore {
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl S3Datastore {
    pub fn new(root: String) -> Result<Self> {
        let stripped = root.strip_prefix("s3://").ok_or_else(|| {
            CoreError::Internal(format!("S3 root must start with s3://, got '{root}'"))
        })?;
        let (bucket, prefix) = match stripped.split_once('/') {
            Some((b, p)) => (b.to_string(), p.trim_matches('/').to_string()),
            None => (stripped.to_string(), String::new()),
        };
        if bucket.is_empty() {
            return Err(CoreError::Internal(format!("S3 root '{root}' has no bucket")));
        }
        Ok(Self {
            bucket,
            prefix,
            endpoint: std::env::var("METAFLOW_S3_ENDPOINT_URL").ok(),
            client: reqwest::Client::new(),
        })
    }

    // ── Key & URL construction ──

    fn task_prefix(&self, ps: &Pathspec) -> String {
        let base = format!("{}/{}/{}/{}", ps.flow, ps.run, ps.step, ps.task);
        if self.prefix.is_empty() {
            base
        } else {
            format!("{}/{}", self.prefix, base)
        }
    }

    fn artifact_key(&self, ps: &Pathspec, name: &str) -> String {
        format!("{}/artifacts/{}.blob", self.task_prefix(ps), name)
    }

    fn log_key(&self, ps: &Pathspec, stream: LogStream) -> String {
        format!("{}/logs/{}.txt", self.task_prefix(ps), stream)
    }

    fn card_key(&self, ps: &Pathspec, index: usize, ext: &str) -> String {
        format!("{}/cards/{}.{}", self.task_prefix(ps), index, ext)
    }

    fn object_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(ep) => format!("{}/{}/{}", ep.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
        }
    }

    fn list_url(&self, prefix: &str, continuation: Option<&str>) -> String {
        let base = match &self.endpoint {
            Some(ep) => format!("{}/{}", ep.trim_end_matches('/'), self.bucket),
            None => format!("https://{}.s3.amazonaws.com", self.bucket),
        };
        let mut url = format!(
            "{base}?list-type=2&prefix={}",
            urlencode(prefix)
        );
        if let Some(token) = continuation {
            url.push_str(&format!("&continuation-token={}", urlencode(token)));
        }
        url
    }

    // ── Error classification & backoff ──

    fn classify(status: reqwest::StatusCode, body: &str) -> CoreError {
        let code = status.as_u16();
        if code == 401 || code == 403 {
            return CoreError::AccessDenied(format!("object store returned {code}"));
        }
        if code == 404 {
            return CoreError::NotFound("object not found".to_string());
        }
        let transient_code = matches!(code, 429 | 500 | 502 | 503 | 504);
        let transient_body = ["SlowDown", "RequestTimeout", "ServiceUnavailable", "InternalError"]
            .iter()
            .any(|c| body.contains(c));
        if transient_code || transient_body {
            return CoreError::TransientBackend(format!("object store returned {code}"));
        }
        CoreError::Internal(format!("object store returned {code}: {body}"))
    }

    async fn with_backoff<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = (BACKOFF_BASE_MS << attempt).min(BACKOFF_CAP_MS);
                    tracing::warn!(what, attempt, delay_ms = delay, "transient object store error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Raw object operations ──

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.object_url(key);
        self.with_backoff("put", || {
            let url = url.clone();
            let bytes = bytes.clone();
            async move {
                let resp = self
                    .client
                    .put(&url)
                    .body(bytes)
                    .send()
                    .await
                    .map_err(|e| CoreError::TransientBackend(e.to_string()))?;
                if resp.status().is_success() {
                    return Ok(());
                }
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(Self::classify(status, &body))
            }
        })
        .await
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.object_url(key);
        self.with_backoff("get", || {
            let url = url.clone();
            async move {
                let resp = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| CoreError::TransientBackend(e.to_string()))?;
                if resp.status().is_success() {
                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| CoreError::TransientBackend(e.to_string()))?;
                    return Ok(Some(bytes.to_vec()));
                }
                if resp.status().as_u16() == 404 {
                    return Ok(None);
                }
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(Self::classify(status, &body))
            }
        })
        .await
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let url = self.object_url(key);
        self.with_backoff("delete", || {
            let url = url.clone();
            async move {
                let resp = self
                    .client
                    .delete(&url)
                    .send()
                    .await
                    .map_err(|e| CoreError::TransientBackend(e.to_string()))?;
                // Deleting a missing object is a success for idempotence.
                if resp.status().is_success() || resp.status().as_u16() == 404 {
                    return Ok(());
                }
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(Self::classify(status, &body))
            }
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let url = self.list_url(prefix, continuation.as_deref());
            let body = self
                .with_backoff("list", || {
                    let url = url.clone();
                    async move {
                        let resp = self
                            .client
                            .get(&url)
                            .send()
                            .await
                            .map_err(|e| CoreError::TransientBackend(e.to_string()))?;
                        if resp.status().is_success() {
                            return resp
                                .text()
                                .await
                                .map_err(|e| CoreError::TransientBackend(e.to_string()));
                        }
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        Err(Self::classify(status, &body))
                    }
                })
                .await?;
            let page = parse_list_response(&body)?;
            keys.extend(page.keys);
            match page.next_continuation {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
            }
        }
        Ok(keys)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

struct ListPage {
    keys: Vec<String>,
    truncated: bool,
    next_continuation: Option<String>,
}

/// Parse an S3 `ListObjectsV2` XML response: `<Key>` entries plus the
/// truncation marker and continuation token.
fn parse_list_response(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut keys = Vec::new();
    let mut truncated = false;
    let mut next_continuation = None;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if matches!(name.as_str(), "Key" | "IsTruncated" | "NextContinuationToken") {
                    current = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(tag) = &current {
                    let text = t
                        .unescape()
                        .map_err(|e| CoreError::Internal(format!("list response parse: {e}")))?
                        .to_string();
                    match tag.as_str() {
                        "Key" => keys.push(text),
                        "IsTruncated" => truncated = text == "true",
                        "NextContinuationToken" => next_continuation = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CoreError::Internal(format!("list response parse: {e}")));
            }
            _ => {}
        }
    }

    Ok(ListPage {
        keys,
        truncated,
        next_continuation,
    })
}

#[async_trait]
impl Datastore for S3Datastore {
    async fn save_artifacts(&self, pathspec: &Pathspec, artifacts: &BlobMap) -> Result<()> {
        for (name, blob) in artifacts {
            validate_artifact_name(name)?;
            self.put_object(&self.artifact_key(pathspec, name), blob.clone())
                .await?;
        }
        Ok(())
    }

    async fn load_artifact(&self, pathspec: &Pathspec, name: &str) -> Result<Option<Vec<u8>>> {
        validate_artifact_name(name)?;
        self.get_object(&self.artifact_key(pathspec, name)).await
    }

    async fn load_artifacts(&self, pathspec: &Pathspec) -> Result<BlobMap> {
        let prefix = format!("{}/artifacts/", self.task_prefix(pathspec));
        let mut result = BlobMap::new();
        for key in self.list_keys(&prefix).await? {
            if let Some(name) = key
                .rsplit('/')
                .next()
                .and_then(|f| f.strip_suffix(".blob"))
            {
                if let Some(bytes) = self.get_object(&key).await? {
                    result.insert(name.to_string(), bytes);
                }
            }
        }
        Ok(result)
    }

    async fn has_artifact(&self, pathspec: &Pathspec, name: &str) -> Result<bool> {
        Ok(self.load_artifact(pathspec, name).await?.is_some())
    }

    async fn artifact_names(&self, pathspec: &Pathspec) -> Result<Vec<String>> {
        let prefix = format!("{}/artifacts/", self.task_prefix(pathspec));
        let mut names: Vec<String> = self
            .list_keys(&prefix)
            .await?
            .iter()
            .filter_map(|k| {
                k.rsplit('/')
                    .next()
                    .and_then(|f| f.strip_suffix(".blob"))
                    .map(|s| s.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// List-then-delete; returns only after every delete is acknowledged.
    async fn clear_task_artifacts(&self, pathspec: &Pathspec) -> Result<()> {
        let prefix = format!("{}/artifacts/", self.task_prefix(pathspec));
        for key in self.list_keys(&prefix).await? {
            if key.ends_with(".blob") {
                self.delete_object(&key).await?;
            }
        }
        Ok(())
    }

    async fn save_log(&self, pathspec: &Pathspec, stream: LogStream, content: &str) -> Result<()> {
        self.put_object(&self.log_key(pathspec, stream), content.as_bytes().to_vec())
            .await
    }

    async fn load_log(&self, pathspec: &Pathspec, stream: LogStream) -> Result<String> {
        match self.get_object(&self.log_key(pathspec, stream)).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|e| CoreError::Internal(format!("log is not UTF-8: {e}"))),
            None => Ok(String::new()),
        }
    }

    async fn save_card(
        &self,
        pathspec: &Pathspec,
        index: usize,
        html: &str,
        meta: &CardMeta,
    ) -> Result<()> {
        self.put_object(
            &self.card_key(pathspec, index, "html"),
            html.as_bytes().to_vec(),
        )
        .await?;
        let meta_json = serde_json::to_vec(meta)
            .map_err(|e| CoreError::Internal(format!("card meta encode: {e}")))?;
        self.put_object(&self.card_key(pathspec, index, "json"), meta_json)
            .await
    }

    async fn load_card(
        &self,
        pathspec: &Pathspec,
        index: usize,
    ) -> Result<Option<(String, CardMeta)>> {
        let html = match self.get_object(&self.card_key(pathspec, index, "html")).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            None => return Ok(None),
        };
        let meta = match self.get_object(&self.card_key(pathspec, index, "json")).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::Internal(format!("card meta decode: {e}")))?,
            None => return Ok(None),
        };
        Ok(Some((html, meta)))
    }

    async fn list_cards(&self, pathspec: &Pathspec) -> Result<Vec<(usize, CardMeta)>> {
        let prefix = format!("{}/cards/", self.task_prefix(pathspec));
        let mut result = Vec::new();
        for key in self.list_keys(&prefix).await? {
            if let Some(idx) = key
                .rsplit('/')
                .next()
                .and_then(|f| f.strip_suffix(".json"))
                .and_then(|s| s.parse::<usize>().ok())
            {
                if let Some(bytes) = self.get_object(&key).await? {
                    let meta = serde_json::from_slice(&bytes)
                        .map_err(|e| CoreError::Internal(format!("card meta decode: {e}")))?;
                    result.push((idx, meta));
                }
            }
        }
        result.sort_by_key(|(idx, _)| *idx);
        Ok(result)
    }
}
