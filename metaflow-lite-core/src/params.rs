use crate::config::{ConfigExpr, FrozenValue};
use crate::error::{CoreError, Result};
use crate::types::ArtifactMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

type ParamDefaultFn = Arc<dyn Fn(&ParamContext) -> Value + Send + Sync>;

/// Coercion target for string-sourced parameter values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ParamKind {
    /// Infer from the default value's type, else keep the string.
    #[default]
    Auto,
    Json,
    Bool,
    Int,
    Float,
    Str,
}

/// Context handed to callable parameter defaults.
pub struct ParamContext {
    pub parameter_name: String,
    pub flow_name: String,
    pub user_name: String,
    pub configs: FrozenValue,
}

/// A declarative flow parameter, resolved once per run and bound as an
/// immutable attribute on every task scope. Values may come from the
/// runner/CLI, from `METAFLOW_RUN_<NAME>`, or from the default.
#[derive(Clone)]
pub struct Parameter {
    pub name: String,
    pub default: Option<Value>,
    pub default_fn: Option<ParamDefaultFn>,
    pub default_expr: Option<ConfigExpr>,
    pub required: bool,
    pub kind: ParamKind,
    pub separator: Option<String>,
    pub help: Option<String>,
}

impl Parameter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
            default_fn: None,
            default_expr: None,
            required: false,
            kind: ParamKind::Auto,
            separator: None,
            help: None,
        }
    }

    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn default_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ParamContext) -> Value + Send + Sync + 'static,
    {
        self.default_fn = Some(Arc::new(f));
        self
    }

    /// Default drawn from a resolved config via a dotted-path expression.
    pub fn default_expr(mut self, expr: ConfigExpr) -> Self {
        self.default_expr = Some(expr);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn kind(mut self, kind: ParamKind) -> Self {
        self.kind = kind;
        self
    }

    /// Split string values into a list on this separator.
    pub fn separator(mut self, sep: &str) -> Self {
        self.separator = Some(sep.to_string());
        self
    }

    pub fn help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }

    fn env_override(&self) -> Option<String> {
        std::env::var(format!("METAFLOW_RUN_{}", self.name.to_uppercase())).ok()
    }

    /// Coerce a string-sourced value to the declared (or inferred) kind.
    pub fn coerce(&self, raw: &str) -> Result<Value> {
        let fail = |msg: String| CoreError::ParameterCoercion {
            name: self.name.clone(),
            message: msg,
        };

        if let Some(sep) = &self.separator {
            let items: Vec<Value> = raw
                .split(sep.as_str())
                .map(|s| Value::String(s.to_string()))
                .collect();
            return Ok(Value::Array(items));
        }

        let effective = match self.kind {
            ParamKind::Auto => match &self.default {
                Some(Value::Bool(_)) => ParamKind::Bool,
                Some(Value::Number(n)) if n.is_i64() => ParamKind::Int,
                Some(Value::Number(_)) => ParamKind::Float,
                _ => ParamKind::Str,
            },
            k => k,
        };

        match effective {
            ParamKind::Json => {
                serde_json::from_str(raw).map_err(|e| fail(format!("invalid JSON: {e}")))
            }
            ParamKind::Bool => {
                let truthy = !matches!(raw.to_lowercase().as_str(), "false" | "0" | "no" | "");
                Ok(Value::Bool(truthy))
            }
            ParamKind::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| fail(format!("invalid integer: {e}"))),
            ParamKind::Float => raw
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|e| fail(format!("invalid float: {e}"))),
            ParamKind::Str | ParamKind::Auto => Ok(Value::String(raw.to_string())),
        }
    }
}

/// Resolve every parameter once, before any task runs.
///
/// Precedence: explicit overrides (runner/CLI), `METAFLOW_RUN_<NAME>`,
/// config-expression default, callable default, literal default. A
/// `required` parameter with no value fails before the run starts.
pub fn resolve_params(
    params: &[Parameter],
    overrides: &BTreeMap<String, String>,
    configs: &ArtifactMap,
    flow_name: &str,
) -> Result<ArtifactMap> {
    let config_view = FrozenValue::freeze(Value::Object(configs.clone().into_iter().collect()));
    let mut resolved = ArtifactMap::new();

    for param in params {
        let value = if let Some(raw) = overrides.get(&param.name) {
            Some(param.coerce(raw)?)
        } else if let Some(raw) = param.env_override() {
            Some(param.coerce(&raw)?)
        } else if let Some(expr) = &param.default_expr {
            expr.resolve(configs)
        } else if let Some(f) = &param.default_fn {
            let ctx = ParamContext {
                parameter_name: param.name.clone(),
                flow_name: flow_name.to_string(),
                user_name: crate::types::username(),
                configs: config_view.clone(),
            };
            Some(f(&ctx))
        } else {
            param.default.clone()
        };

        match value {
            Some(v) => {
                resolved.insert(param.name.clone(), v);
            }
            None if param.required => {
                return Err(CoreError::ParameterCoercion {
                    name: param.name.clone(),
                    message: "required parameter has no value".to_string(),
                });
            }
            None => {
                resolved.insert(param.name.clone(), Value::Null);
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coercion_kinds() {
        let p = Parameter::new("n").kind(ParamKind::Int);
        assert_eq!(p.coerce("42").unwrap(), json!(42));
        assert!(p.coerce("nope").is_err());

        let p = Parameter::new("ratio").kind(ParamKind::Float);
        assert_eq!(p.coerce("0.5").unwrap(), json!(0.5));

        let p = Parameter::new("flag").kind(ParamKind::Bool);
        assert_eq!(p.coerce("False").unwrap(), json!(false));
        assert_eq!(p.coerce("1").unwrap(), json!(true));

        let p = Parameter::new("blob").kind(ParamKind::Json);
        assert_eq!(p.coerce(r#"{"a": 1}"#).unwrap(), json!({ "a": 1 }));
        assert!(p.coerce("{broken").is_err());
    }

    /// Auto kind infers from the default's type
    #[test]
    fn test_auto_kind_inference() {
        let p = Parameter::new("n").default(json!(3));
        assert_eq!(p.coerce("7").unwrap(), json!(7));

        let p = Parameter::new("s").default(json!("x"));
        assert_eq!(p.coerce("7").unwrap(), json!("7"));
    }

    #[test]
    fn test_separator_lists() {
        let p = Parameter::new("cols").separator(",");
        assert_eq!(p.coerce("a,b,c").unwrap(), json!(["a", "b", "c"]));
    }

    #[test]
    fn test_resolution_precedence() {
        let params = vec![Parameter::new("alpha").default(json!(0.1))];
        let resolved =
            resolve_params(&params, &BTreeMap::new(), &ArtifactMap::new(), "F").unwrap();
        assert_eq!(resolved["alpha"], json!(0.1));

        let overrides = BTreeMap::from([("alpha".to_string(), "0.9".to_string())]);
        let resolved = resolve_params(&params, &overrides, &ArtifactMap::new(), "F").unwrap();
        assert_eq!(resolved["alpha"], json!(0.9));
    }

    #[test]
    fn test_required_param_missing() {
        let params = vec![Parameter::new("must").required()];
        let err =
            resolve_params(&params, &BTreeMap::new(), &ArtifactMap::new(), "F").unwrap_err();
        assert!(matches!(err, CoreError::ParameterCoercion { name, .. } if name == "must"));
    }

    #[test]
    fn test_config_expr_default() {
        let configs = ArtifactMap::from([(
            "settings".to_string(),
            json!({ "alpha": 0.25 }),
        )]);
        let params = vec![
            Parameter::new("alpha").default_expr(ConfigExpr::parse("settings.alpha").unwrap())
        ];
        let resolved = resolve_params(&params, &BTreeMap::new(), &configs, "F").unwrap();
        assert_eq!(resolved["alpha"], json!(0.25));
    }

    #[test]
    fn test_callable_default() {
        let params = vec![Parameter::new("tag").default_fn(|ctx| {
            json!(format!("{}-{}", ctx.flow_name, ctx.parameter_name))
        })];
        let resolved =
            resolve_params(&params, &BTreeMap::new(), &ArtifactMap::new(), "F").unwrap();
        assert_eq!(resolved["tag"], json!("F-tag"));
    }
}
