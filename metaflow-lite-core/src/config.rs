use crate::error::{CoreError, Result};
use crate::types::ArtifactMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// ─── Immutable attribute-access wrapper ───────────────────────

/// Immutable view over a resolved config value with dotted-path access.
///
/// Lookups recursively wrap nested maps; lists wrap element-wise. There
/// is no mutating API: changing a frozen value means building a new one.
#[derive(Clone, Debug, PartialEq)]
pub struct FrozenValue(Arc<Value>);

impl FrozenValue {
    pub fn freeze(value: Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn get(&self, key: &str) -> Option<FrozenValue> {
        self.0
            .get(key)
            .map(|v| FrozenValue(Arc::new(v.clone())))
    }

    /// Dotted-path lookup: `model.layers.0.width`.
    pub fn path(&self, path: &str) -> Option<FrozenValue> {
        let mut current = self.0.as_ref().clone();
        for seg in path.split('.') {
            current = match seg.parse::<usize>() {
                Ok(idx) => current.get(idx)?.clone(),
                Err(_) => current.get(seg)?.clone(),
            };
        }
        Some(FrozenValue(Arc::new(current)))
    }

    pub fn index(&self, idx: usize) -> Option<FrozenValue> {
        self.0.get(idx).map(|v| FrozenValue(Arc::new(v.clone())))
    }

    pub fn len(&self) -> usize {
        match self.0.as_ref() {
            Value::Array(a) => a.len(),
            Value::Object(o) => o.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Vec<FrozenValue> {
        match self.0.as_ref() {
            Value::Array(a) => a
                .iter()
                .map(|v| FrozenValue(Arc::new(v.clone())))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self.0.as_ref() {
            Value::Object(o) => o.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.as_i64()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.0.as_f64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.0.as_bool()
    }

    pub fn to_value(&self) -> Value {
        self.0.as_ref().clone()
    }
}

// ─── Config expressions ───────────────────────────────────────

/// Deferred dotted-path reference into the resolved configs map, used in
/// decorator attributes and parameter defaults. Validated at registration
/// time; no arbitrary evaluation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigExpr {
    expr: String,
}

impl ConfigExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        // Identifier segments, plus bare numerics for list indexing.
        let valid_segment =
            |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if expr.is_empty() || !expr.split('.').all(valid_segment) {
            return Err(CoreError::Internal(format!(
                "invalid config expression '{expr}': expected dotted identifiers"
            )));
        }
        Ok(Self {
            expr: expr.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Evaluate against resolved configs: the first segment names the
    /// config, the rest walk into its value.
    pub fn resolve(&self, configs: &ArtifactMap) -> Option<Value> {
        let (head, rest) = match self.expr.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (self.expr.as_str(), None),
        };
        let root = configs.get(head)?;
        match rest {
            None => Some(root.clone()),
            Some(path) => FrozenValue::freeze(root.clone())
                .path(path)
                .map(|f| f.to_value()),
        }
    }
}

// ─── Config descriptors ───────────────────────────────────────

type ParserFn = Arc<dyn Fn(&str) -> anyhow::Result<Value> + Send + Sync>;
type DefaultFn = Arc<dyn Fn(&FrozenValue) -> Value + Send + Sync>;

/// How a config's raw string is parsed into a value.
#[derive(Clone)]
pub enum ConfigParser {
    Json,
    Yaml,
    Custom(ParserFn),
}

impl ConfigParser {
    fn parse(&self, raw: &str) -> Result<Value> {
        match self {
            ConfigParser::Json => serde_json::from_str(raw)
                .map_err(|e| CoreError::Internal(format!("config JSON parse: {e}"))),
            ConfigParser::Yaml => serde_yaml::from_str(raw)
                .map_err(|e| CoreError::Internal(format!("config YAML parse: {e}"))),
            ConfigParser::Custom(f) => {
                f(raw).map_err(|e| CoreError::Internal(format!("config parse: {e}")))
            }
        }
    }
}

/// Declarative config descriptor on a flow, resolved once at run start.
#[derive(Clone)]
pub struct Config {
    pub name: String,
    /// File path or literal fallback, lowest precedence.
    pub default: Option<String>,
    /// Callable default, given a read-only view of already-resolved
    /// configs.
    pub default_value: Option<DefaultFn>,
    pub required: bool,
    pub parser: Option<ConfigParser>,
}

impl Config {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
            default_value: None,
            required: false,
            parser: None,
        }
    }

    pub fn default_path(mut self, path_or_literal: &str) -> Self {
        self.default = Some(path_or_literal.to_string());
        self
    }

    pub fn default_value<F>(mut self, f: F) -> Self
    where
        F: Fn(&FrozenValue) -> Value + Send + Sync + 'static,
    {
        self.default_value = Some(Arc::new(f));
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn parser(mut self, parser: ConfigParser) -> Self {
        self.parser = Some(parser);
        self
    }
}

// ─── Resolution ───────────────────────────────────────────────

/// Config bindings handed in by the runner/CLI: literal values and file
/// paths, both keyed by config name.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ConfigInputs {
    pub values: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
}

fn env_json_map(var: &str) -> BTreeMap<String, Value> {
    std::env::var(var)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

/// Resolve every config descriptor, in declaration order.
///
/// Source precedence: CLI values, CLI files, `METAFLOW_FLOW_CONFIG_VALUE`,
/// `METAFLOW_FLOW_CONFIG`, the callable default, the path/literal default.
/// String results are JSON-parsed when they parse (unless a parser is
/// declared); a `required` config with no value fails `ConfigRequired`.
pub fn resolve_configs(configs: &[Config], inputs: &ConfigInputs) -> Result<ArtifactMap> {
    let env_values = env_json_map("METAFLOW_FLOW_CONFIG_VALUE");
    let env_files = env_json_map("METAFLOW_FLOW_CONFIG");

    let mut resolved = ArtifactMap::new();
    for config in configs {
        let name = &config.name;

        let raw: Option<Value> = if let Some(v) = inputs.values.get(name) {
            Some(parse_string_source(v, config)?)
        } else if let Some(path) = inputs.files.get(name) {
            Some(parse_string_source(&read_config_file(path)?, config)?)
        } else if let Some(v) = env_values.get(name) {
            match v {
                Value::String(s) => Some(parse_string_source(s, config)?),
                other => Some(other.clone()),
            }
        } else if let Some(path) = env_files.get(name).and_then(|v| v.as_str()) {
            Some(parse_string_source(&read_config_file(path)?, config)?)
        } else if let Some(default_fn) = &config.default_value {
            let view = FrozenValue::freeze(Value::Object(
                resolved.clone().into_iter().collect(),
            ));
            Some(default_fn(&view))
        } else if let Some(default) = &config.default {
            match std::fs::read_to_string(default) {
                Ok(content) => Some(parse_string_source(&content, config)?),
                // Not a readable file: treat the default as a literal.
                Err(_) => Some(parse_string_source(default, config)?),
            }
        } else {
            None
        };

        match raw {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None if config.required => {
                return Err(CoreError::ConfigRequired(name.clone()));
            }
            None => {
                resolved.insert(name.clone(), Value::Null);
            }
        }
    }
    Ok(resolved)
}

fn read_config_file(path: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| CoreError::NotFound(format!("config file '{path}': {e}")))
}

fn parse_string_source(raw: &str, config: &Config) -> Result<Value> {
    if let Some(parser) = &config.parser {
        return parser.parse(raw);
    }
    // JSON-parse strings that parse; keep everything else as a literal.
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => Ok(v),
        Err(_) => Ok(Value::String(raw.to_string())),
    }
}
