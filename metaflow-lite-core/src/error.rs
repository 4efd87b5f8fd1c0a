use thiserror::Error;

/// The closed error taxonomy of the engine. Kinds, not open types: every
/// failure the core can surface is one of these variants, with a free-form
/// message carrying the detail.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Pre-run validation ──
    #[error("config '{0}' is required but not provided")]
    ConfigRequired(String),

    #[error("parameter '{name}' could not be coerced: {message}")]
    ParameterCoercion { name: String, message: String },

    // ── Graph invariants ──
    #[error("flow must have a 'start' step")]
    MissingStart,

    #[error("flow must have an 'end' step")]
    MissingEnd,

    #[error("no matching join found for split '{0}'")]
    UnreachableJoin(String),

    #[error("graph invariant violated: {0}")]
    GraphInvariant(String),

    // ── Provider failures ──
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("transient backend error: {0}")]
    TransientBackend(String),

    // ── Task execution ──
    #[error("step failed: {message}")]
    UserStep { type_name: String, message: String },

    #[error("step timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    FailureHandledByCatch(String),

    // ── merge_artifacts ──
    #[error("unhandled artifacts in merge: {}", .0.join(", "))]
    UnhandledInMerge(Vec<String>),

    #[error("artifacts named in 'include' do not exist: {}", .0.join(", "))]
    MissingInMerge(Vec<String>),

    // ── Client ──
    #[error("namespace mismatch: {0}")]
    NamespaceMismatch(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    // ── Flow data model ──
    #[error("flow has no artifact or attribute '{0}'")]
    AttributeMissing(String),

    #[error("cannot modify parameter/config/constant '{0}'")]
    ImmutableAttribute(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable kind name, used in exception wrappers and metadata.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CoreError::ConfigRequired(_) => "ConfigRequired",
            CoreError::ParameterCoercion { .. } => "ParameterCoercionFailed",
            CoreError::MissingStart => "MissingStart",
            CoreError::MissingEnd => "MissingEnd",
            CoreError::UnreachableJoin(_) => "UnreachableJoin",
            CoreError::GraphInvariant(_) => "GraphInvariantViolated",
            CoreError::NotFound(_) => "NotFound",
            CoreError::AccessDenied(_) => "AccessDenied",
            CoreError::TransientBackend(_) => "TransientBackend",
            CoreError::UserStep { .. } => "UserStepException",
            CoreError::Timeout(_) => "TimeoutException",
            CoreError::FailureHandledByCatch(_) => "FailureHandledByCatch",
            CoreError::UnhandledInMerge(_) => "UnhandledInMerge",
            CoreError::MissingInMerge(_) => "MissingInMerge",
            CoreError::NamespaceMismatch(_) => "NamespaceMismatch",
            CoreError::InvalidTag(_) => "InvalidTag",
            CoreError::AttributeMissing(_) => "AttributeMissing",
            CoreError::ImmutableAttribute(_) => "ImmutableAttribute",
            CoreError::Internal(_) => "InternalError",
        }
    }

    /// Whether a provider should retry this error internally.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientBackend(_))
    }

    /// Wrap an arbitrary user-code failure.
    pub fn user_step(err: &anyhow::Error) -> Self {
        CoreError::UserStep {
            type_name: "UserStepException".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => CoreError::AccessDenied(e.to_string()),
            _ => CoreError::Internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
