use crate::error::{CoreError, Result};
use crate::metadata::{sort_task_ids, MetadataProvider, RunInfo, RunStatus};
use crate::types::{MetadataEntry, Pathspec};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 7;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 10_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST metadata provider mirroring the provider interface:
/// `POST /flows/{f}/runs`, `POST /flows/{f}/runs/{r}/steps`, and so on.
///
/// 404 maps to *not found*, 401/403 to *access denied*; known transient
/// statuses retry with exponential backoff up to the provider budget.
pub struct ServiceMetadataProvider {
    base_url: String,
    client: reqwest::Client,
}

enum Method {
    Get,
    Post,
    Patch,
}

impl ServiceMetadataProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("METAFLOW_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
        )
    }

    fn classify(status: reqwest::StatusCode) -> CoreError {
        match status.as_u16() {
            404 => CoreError::NotFound("metadata service returned 404".to_string()),
            401 | 403 => {
                CoreError::AccessDenied(format!("metadata service returned {status}"))
            }
            429 | 500 | 502 | 503 | 504 => {
                CoreError::TransientBackend(format!("metadata service returned {status}"))
            }
            _ => CoreError::Internal(format!("metadata service returned {status}")),
        }
    }

    /// One request with internal retries. `Ok(None)` means 404.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;
        loop {
            let builder = match method {
                Method::Get => self.client.get(&url),
                Method::Post => self.client.post(&url),
                Method::Patch => self.client.patch(&url),
            }
            .timeout(REQUEST_TIMEOUT);
            let builder = match body {
                Some(b) => builder.json(b),
                None => builder,
            };

            let err = match builder.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let parsed = resp.json::<Value>().await.unwrap_or(Value::Null);
                    return Ok(Some(parsed));
                }
                Ok(resp) if resp.status().as_u16() == 404 => return Ok(None),
                Ok(resp) => Self::classify(resp.status()),
                Err(e) => CoreError::TransientBackend(e.to_string()),
            };

            if err.is_transient() && attempt + 1 < MAX_ATTEMPTS {
                let delay = (BACKOFF_BASE_MS << attempt).min(BACKOFF_CAP_MS);
                tracing::warn!(
                    path,
                    attempt,
                    delay_ms = delay,
                    "transient metadata service error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            } else {
                return Err(err);
            }
        }
    }
}

#[async_trait]
impl MetadataProvider for ServiceMetadataProvider {
    async fn new_run(
        &self,
        flow: &str,
        run: &str,
        tags: &[String],
        sys_tags: &[String],
    ) -> Result<()> {
        self.request(
            Method::Post,
            &format!("/flows/{flow}/runs"),
            Some(&json!({
                "run_number": run,
                "tags": tags,
                "system_tags": sys_tags,
            })),
        )
        .await?;
        Ok(())
    }

    async fn new_step(&self, flow: &str, run: &str, step: &str) -> Result<()> {
        self.request(
            Method::Post,
            &format!("/flows/{flow}/runs/{run}/steps"),
            Some(&json!({ "step_name": step })),
        )
        .await?;
        Ok(())
    }

    async fn new_task(&self, ps: &Pathspec) -> Result<()> {
        self.request(
            Method::Post,
            &format!("/flows/{}/runs/{}/steps/{}/tasks", ps.flow, ps.run, ps.step),
            Some(&json!({ "task_id": ps.task })),
        )
        .await?;
        Ok(())
    }

    async fn register_metadata(&self, ps: &Pathspec, entries: &[MetadataEntry]) -> Result<()> {
        let body = serde_json::to_value(entries)
            .map_err(|e| CoreError::Internal(format!("metadata encode: {e}")))?;
        self.request(
            Method::Post,
            &format!(
                "/flows/{}/runs/{}/steps/{}/tasks/{}/metadata",
                ps.flow, ps.run, ps.step, ps.task
            ),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn done_task(&self, ps: &Pathspec) -> Result<()> {
        self.request(
            Method::Post,
            &format!(
                "/flows/{}/runs/{}/steps/{}/tasks/{}/heartbeat",
                ps.flow, ps.run, ps.step, ps.task
            ),
            Some(&json!({ "status": "done" })),
        )
        .await?;
        Ok(())
    }

    async fn done_run(&self, flow: &str, run: &str) -> Result<()> {
        self.request(
            Method::Post,
            &format!("/flows/{flow}/runs/{run}/heartbeat"),
            Some(&json!({ "status": "done" })),
        )
        .await?;
        Ok(())
    }

    async fn is_task_done(&self, ps: &Pathspec) -> Result<bool> {
        let resp = self
            .request(
                Method::Get,
                &format!(
                    "/flows/{}/runs/{}/steps/{}/tasks/{}",
                    ps.flow, ps.run, ps.step, ps.task
                ),
                None,
            )
            .await?;
        Ok(resp
            .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(|s| s == "done"))
            .unwrap_or(false))
    }

    async fn is_run_done(&self, flow: &str, run: &str) -> Result<bool> {
        let resp = self
            .request(Method::Get, &format!("/flows/{flow}/runs/{run}"), None)
            .await?;
        Ok(resp
            .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(|s| s == "done"))
            .unwrap_or(false))
    }

    async fn get_run_ids(&self, flow: &str) -> Result<Vec<String>> {
        let resp = self
            .request(Method::Get, &format!("/flows/{flow}/runs"), None)
            .await?;
        let mut ids: Vec<String> = match resp {
            Some(Value::Array(runs)) => runs
                .iter()
                .filter_map(|r| {
                    r.get("run_number")
                        .or_else(|| r.get("run_id"))
                        .map(value_as_string)
                })
                .collect(),
            _ => Vec::new(),
        };
        ids.sort();
        ids.reverse();
        Ok(ids)
    }

    async fn get_step_names(&self, flow: &str, run: &str) -> Result<Vec<String>> {
        let resp = self
            .request(Method::Get, &format!("/flows/{flow}/runs/{run}/steps"), None)
            .await?;
        Ok(match resp {
            Some(Value::Array(steps)) => steps
                .iter()
                .filter_map(|s| s.get("step_name").map(value_as_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    async fn get_task_ids(&self, flow: &str, run: &str, step: &str) -> Result<Vec<String>> {
        let resp = self
            .request(
                Method::Get,
                &format!("/flows/{flow}/runs/{run}/steps/{step}/tasks"),
                None,
            )
            .await?;
        let mut ids: Vec<String> = match resp {
            Some(Value::Array(tasks)) => tasks
                .iter()
                .filter_map(|t| t.get("task_id").map(value_as_string))
                .collect(),
            _ => Vec::new(),
        };
        sort_task_ids(&mut ids);
        Ok(ids)
    }

    async fn get_task_metadata(&self, ps: &Pathspec) -> Result<Vec<MetadataEntry>> {
        let resp = self
            .request(
                Method::Get,
                &format!(
                    "/flows/{}/runs/{}/steps/{}/tasks/{}/metadata",
                    ps.flow, ps.run, ps.step, ps.task
                ),
                None,
            )
            .await?;
        match resp {
            Some(v @ Value::Array(_)) => serde_json::from_value(v)
                .map_err(|e| CoreError::Internal(format!("metadata decode: {e}"))),
            _ => Ok(Vec::new()),
        }
    }

    async fn get_run_meta(&self, flow: &str, run: &str) -> Result<Option<RunInfo>> {
        let resp = self
            .request(Method::Get, &format!("/flows/{flow}/runs/{run}"), None)
            .await?;
        let Some(v) = resp else { return Ok(None) };
        let status = match v.get("status").and_then(|s| s.as_str()) {
            Some("done") => RunStatus::Done,
            _ => RunStatus::Running,
        };
        Ok(Some(RunInfo {
            tags: string_list(v.get("tags")),
            sys_tags: string_list(v.get("system_tags").or_else(|| v.get("sys_tags"))),
            status,
            created_at: v.get("created_at").and_then(|t| t.as_i64()).unwrap_or(0),
            finished_at: v.get("finished_at").and_then(|t| t.as_i64()),
        }))
    }

    async fn update_run_tags(&self, flow: &str, run: &str, tags: &[String]) -> Result<()> {
        let resp = self
            .request(
                Method::Patch,
                &format!("/flows/{flow}/runs/{run}"),
                Some(&json!({ "tags": tags })),
            )
            .await?;
        if resp.is_none() {
            return Err(CoreError::NotFound(format!("run {flow}/{run}")));
        }
        Ok(())
    }
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items.iter().map(value_as_string).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalised() {
        let p = ServiceMetadataProvider::new("http://svc:8080///".to_string());
        assert_eq!(p.base_url, "http://svc:8080");
    }

    /// Status classes map onto the provider failure model
    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ServiceMetadataProvider::classify(reqwest::StatusCode::NOT_FOUND),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            ServiceMetadataProvider::classify(reqwest::StatusCode::FORBIDDEN),
            CoreError::AccessDenied(_)
        ));
        assert!(
            ServiceMetadataProvider::classify(reqwest::StatusCode::SERVICE_UNAVAILABLE)
                .is_transient()
        );
        assert!(
            !ServiceMetadataProvider::classify(reqwest::StatusCode::BAD_REQUEST).is_transient()
        );
    }

    #[test]
    fn test_run_meta_decoding() {
        let v = json!({
            "status": "done",
            "tags": ["a"],
            "system_tags": ["user:ada"],
            "created_at": 123,
            "finished_at": 456,
        });
        let status = v.get("status").and_then(|s| s.as_str());
        assert_eq!(status, Some("done"));
        assert_eq!(string_list(v.get("tags")), vec!["a"]);
        assert_eq!(string_list(v.get("system_tags")), vec!["user:ada"]);
    }
}
