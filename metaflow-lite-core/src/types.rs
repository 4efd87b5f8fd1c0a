use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Named artifact values as seen by user code and the scheduler.
pub type ArtifactMap = BTreeMap<String, Value>;

/// Named artifact blobs as seen by the datastore.
pub type BlobMap = BTreeMap<String, Vec<u8>>;

pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh run id: a lexicographically sortable, monotonically
/// increasing string (microsecond UTC timestamp).
pub fn gen_run_id() -> String {
    format!("{}", chrono::Utc::now().timestamp_micros())
}

/// Resolve the invoking user from `METAFLOW_USER`, falling back to `USER`.
pub fn username() -> String {
    std::env::var("METAFLOW_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

// ─── Reserved artifact namespace ──────────────────────────────

pub const ART_TASK_OK: &str = "_task_ok";
pub const ART_FOREACH_STACK: &str = "_foreach_stack";
pub const ART_EXCEPTION: &str = "_exception";
pub const ART_GRAPH_INFO: &str = "_graph_info";
pub const ART_CARD_PREFIX: &str = "_card_";

/// Underscore-prefixed names are owned by the scheduler, never user data.
pub fn is_internal_artifact(name: &str) -> bool {
    name.starts_with('_')
}

// ─── Metadata entry types ─────────────────────────────────────

pub const META_ATTEMPT: &str = "attempt";
pub const META_ORIGIN_TASK_ID: &str = "origin-task-id";
pub const META_ORIGIN_RUN_ID: &str = "origin-run-id";
pub const META_RUNTIME_VERSION: &str = "runtime-version";
pub const META_FOREACH_INDICES: &str = "foreach-indices";
pub const META_PARENT_TASK_IDS: &str = "parent-task-ids";
pub const META_PARALLEL_NODE_INDEX: &str = "parallel-node-index";
pub const META_PARALLEL_NUM_NODES: &str = "parallel-num-nodes";
pub const META_INTERNAL_TASK_TYPE: &str = "internal_task_type";

/// One free-form `(type, value)` metadata entry. Entries are append-only;
/// retries append new `attempt` entries rather than rewriting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl MetadataEntry {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

// ─── Pathspec ─────────────────────────────────────────────────

/// Canonical four-part task address: `FlowName/RunId/StepName/TaskId`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pathspec {
    pub flow: String,
    pub run: String,
    pub step: String,
    pub task: String,
}

impl Pathspec {
    pub fn new(
        flow: impl Into<String>,
        run: impl Into<String>,
        step: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            flow: flow.into(),
            run: run.into(),
            step: step.into(),
            task: task.into(),
        }
    }

    /// Sibling pathspec in the same step with a different task id.
    pub fn with_task(&self, task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Pathspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.flow, self.run, self.step, self.task)
    }
}

impl FromStr for Pathspec {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(CoreError::NotFound(format!(
                "invalid task pathspec '{s}': expected Flow/Run/Step/Task"
            )));
        }
        Ok(Pathspec::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

/// Split a pathspec string addressing any level of the hierarchy.
/// One segment addresses a Flow, two a Run, three a Step, four a Task.
pub fn split_pathspec(s: &str) -> Result<Vec<&str>, CoreError> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
        return Err(CoreError::NotFound(format!(
            "invalid pathspec '{s}': expected 1-4 non-empty components"
        )));
    }
    Ok(parts)
}

// ─── Log streams ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Tags ─────────────────────────────────────────────────────

pub const MAX_TAG_BYTES: usize = 512;

/// A user tag must be a non-empty UTF-8 string of at most 512 bytes.
pub fn validate_tag(tag: &str) -> Result<(), CoreError> {
    if tag.is_empty() {
        return Err(CoreError::InvalidTag("tag must not be empty".to_string()));
    }
    if tag.len() > MAX_TAG_BYTES {
        let head: String = tag.chars().take(32).collect();
        return Err(CoreError::InvalidTag(format!(
            "tag exceeds {MAX_TAG_BYTES} bytes: '{head}...'"
        )));
    }
    Ok(())
}

// ─── Foreach frames ───────────────────────────────────────────

/// One level of foreach nesting: which split pushed it, over which
/// variable, at which index, with which element value. `num_splits` is
/// absent for unbounded sources whose size is only known at runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeachFrame {
    pub step: String,
    pub var: String,
    pub index: usize,
    pub value: Value,
    pub num_splits: Option<usize>,
}

/// Decode a `_foreach_stack` artifact value into frames.
pub fn foreach_stack_from_value(v: &Value) -> Vec<ForeachFrame> {
    serde_json::from_value(v.clone()).unwrap_or_default()
}

/// Encode frames back into the `_foreach_stack` artifact value.
pub fn foreach_stack_to_value(stack: &[ForeachFrame]) -> Value {
    serde_json::to_value(stack).unwrap_or(Value::Array(vec![]))
}

// ─── Transitions ──────────────────────────────────────────────

/// What a step's `next` call declared: target step names plus at most one
/// of a foreach variable, a switch condition variable, or a parallel
/// degree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub targets: Vec<String>,
    pub foreach_var: Option<String>,
    pub condition_var: Option<String>,
    pub num_parallel: Option<usize>,
    /// Dict-style switch: condition value → target step name.
    pub switch_map: Option<BTreeMap<String, String>>,
    /// Foreach source declared unbounded (size known only at runtime).
    pub unbounded: bool,
}

impl Transition {
    /// Render a condition value as a switch key. Strings are used raw;
    /// other JSON values use their canonical rendering.
    pub fn condition_key(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Resolve which branch a switch takes given the condition value.
    ///
    /// Dict mode looks the value up in the declared mapping (falling back
    /// to the rendered value); direct mode treats the value itself as a
    /// target step name.
    pub fn resolve_switch_target(&self, condition_value: &Value) -> Option<String> {
        let key = Self::condition_key(condition_value);
        if let Some(map) = &self.switch_map {
            return Some(map.get(&key).cloned().unwrap_or(key));
        }
        match condition_value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

// ─── Exception wrapper & task results ─────────────────────────

/// Serialisable exception snapshot: stored under `_exception`, in `@catch`
/// variables, and carried over the child→parent result channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub traceback: String,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    pub fn from_error(err: &CoreError) -> Self {
        Self {
            kind: err.kind_name().to_string(),
            message: err.to_string(),
            traceback: format!("{err:?}"),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Child→parent IPC result for one isolated task attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    /// Switch routing computed in the child from the recorded transition.
    pub taken_branch: Option<String>,
    pub exception: Option<ExceptionInfo>,
}

impl TaskResult {
    pub fn ok(taken_branch: Option<String>) -> Self {
        Self {
            success: true,
            taken_branch,
            exception: None,
        }
    }

    pub fn failed(exception: ExceptionInfo) -> Self {
        Self {
            success: false,
            taken_branch: None,
            exception: Some(exception),
        }
    }
}

// ─── Artifact value ↔ blob codec ──────────────────────────────

/// The datastore stores opaque bytes; the flow layer owns serialisation.
pub fn value_to_blob(value: &Value) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value)
        .map_err(|e| CoreError::Internal(format!("artifact encode failed: {e}")))
}

pub fn blob_to_value(blob: &[u8]) -> Result<Value, CoreError> {
    serde_json::from_slice(blob)
        .map_err(|e| CoreError::Internal(format!("artifact decode failed: {e}")))
}

pub fn artifacts_to_blobs(arts: &ArtifactMap) -> Result<BlobMap, CoreError> {
    arts.iter()
        .map(|(k, v)| Ok((k.clone(), value_to_blob(v)?)))
        .collect()
}

pub fn blobs_to_artifacts(blobs: &BlobMap) -> Result<ArtifactMap, CoreError> {
    blobs
        .iter()
        .map(|(k, v)| Ok((k.clone(), blob_to_value(v)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Pathspec round-trip and validation
    #[test]
    fn test_pathspec_parse() {
        let ps: Pathspec = "HelloFlow/1700000000000000/start/1".parse().unwrap();
        assert_eq!(ps.flow, "HelloFlow");
        assert_eq!(ps.task, "1");
        assert_eq!(ps.to_string(), "HelloFlow/1700000000000000/start/1");

        assert!("HelloFlow/1/start".parse::<Pathspec>().is_err());
        assert!("HelloFlow//start/1".parse::<Pathspec>().is_err());
        assert!("a/b/c/d/e".parse::<Pathspec>().is_err());
    }

    #[test]
    fn test_split_pathspec_levels() {
        assert_eq!(split_pathspec("Flow").unwrap().len(), 1);
        assert_eq!(split_pathspec("Flow/1/step").unwrap().len(), 3);
        assert!(split_pathspec("Flow/1/step/2/extra").is_err());
        assert!(split_pathspec("Flow//step").is_err());
    }

    /// Run ids sort lexicographically in creation order
    #[test]
    fn test_run_id_sortable() {
        let a = gen_run_id();
        std::thread::sleep(std::time::Duration::from_micros(10));
        let b = gen_run_id();
        assert!(b >= a);
    }

    #[test]
    fn test_tag_validation() {
        assert!(validate_tag("experiment:v2").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag(&"x".repeat(513)).is_err());
        assert!(validate_tag(&"x".repeat(512)).is_ok());
    }

    /// Switch resolution: direct and dict-style
    #[test]
    fn test_switch_resolution() {
        let direct = Transition {
            targets: vec!["a".into(), "b".into()],
            condition_var: Some("pick".into()),
            ..Default::default()
        };
        assert_eq!(
            direct.resolve_switch_target(&json!("a")),
            Some("a".to_string())
        );
        assert_eq!(direct.resolve_switch_target(&json!(3)), None);

        let mapped = Transition {
            targets: vec!["small".into(), "large".into()],
            condition_var: Some("size".into()),
            switch_map: Some(BTreeMap::from([
                ("1".to_string(), "small".to_string()),
                ("2".to_string(), "large".to_string()),
            ])),
            ..Default::default()
        };
        assert_eq!(
            mapped.resolve_switch_target(&json!(2)),
            Some("large".to_string())
        );
        // Unknown keys fall back to the rendered value.
        assert_eq!(
            mapped.resolve_switch_target(&json!("9")),
            Some("9".to_string())
        );
    }

    #[test]
    fn test_foreach_stack_codec() {
        let stack = vec![ForeachFrame {
            step: "fan".into(),
            var: "xs".into(),
            index: 2,
            value: json!(30),
            num_splits: Some(3),
        }];
        let v = foreach_stack_to_value(&stack);
        assert_eq!(foreach_stack_from_value(&v), stack);
        // Unbounded frames keep num_splits absent.
        let unbounded = vec![ForeachFrame {
            step: "fan".into(),
            var: "xs".into(),
            index: 0,
            value: json!(1),
            num_splits: None,
        }];
        let v = foreach_stack_to_value(&unbounded);
        assert_eq!(foreach_stack_from_value(&v)[0].num_splits, None);
    }

    #[test]
    fn test_blob_codec_round_trip() {
        let arts = ArtifactMap::from([
            ("x".to_string(), json!(1)),
            ("ys".to_string(), json!([2, 4, 6])),
        ]);
        let blobs = artifacts_to_blobs(&arts).unwrap();
        assert_eq!(blobs_to_artifacts(&blobs).unwrap(), arts);
    }
}
