//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant maps onto one stable wire code (`Error::code`) so callers branch on
//! the code, never on transport status.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// A definition file that failed to parse or validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionError {
    pub file: String,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: field '{}': {}", self.file, self.field, self.message)
    }
}

/// Main error enum for the tool runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, detected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// A definition file could not be loaded; the reload was aborted.
    #[error("invalid definition {0}")]
    Definition(DefinitionError),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Execution asked for a tool that is not in the catalog.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The target host is unknown to the asset directory.
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// Auth is required but no credential exists for the purpose.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// Internal key absent or wrong. Carries no detail on purpose.
    #[error("forbidden")]
    Forbidden,

    /// Deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Caller went away or the operation was aborted.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// No pooled connection became available within the checkout timeout.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// A collaborator (embedding provider, asset directory, broker, job
    /// scheduler) failed after retries.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable wire code for the error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::Definition(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::ToolNotFound(_) => "tool_not_found",
            Error::AssetNotFound(_) => "asset_not_found",
            Error::MissingCredentials(_) => "missing_credentials",
            Error::Forbidden => "forbidden",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::Upstream(_) => "upstream_error",
            Error::Internal(_) | Error::Serialization(_) | Error::Storage(_) | Error::Io(_) => {
                "internal_error"
            }
        }
    }

    /// HTTP status for routes that do use transport codes.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::Definition(_) => 400,
            Error::NotFound(_)
            | Error::ToolNotFound(_)
            | Error::AssetNotFound(_)
            | Error::MissingCredentials(_) => 404,
            Error::Forbidden => 403,
            Error::Timeout(_) => 504,
            Error::Cancelled(_) => 499,
            Error::PoolExhausted(_) => 503,
            Error::Upstream(_) => 502,
            Error::Internal(_) | Error::Serialization(_) | Error::Storage(_) | Error::Io(_) => 500,
        }
    }

    /// Whether a retry of the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::Timeout(_) | Error::PoolExhausted(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn definition(
        file: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Definition(DefinitionError {
            file: file.into(),
            field: field.into(),
            message: message.into(),
        })
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn tool_not_found(msg: impl Into<String>) -> Self {
        Self::ToolNotFound(msg.into())
    }

    pub fn asset_not_found(msg: impl Into<String>) -> Self {
        Self::AssetNotFound(msg.into())
    }

    pub fn missing_credentials(msg: impl Into<String>) -> Self {
        Self::MissingCredentials(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::PoolExhausted(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Upstream(err.to_string())
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Validation(format!("yaml: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_cover_taxonomy() {
        assert_eq!(Error::validation("x").code(), "validation_error");
        assert_eq!(Error::definition("a.yaml", "name", "missing").code(), "validation_error");
        assert_eq!(Error::not_found("x").code(), "not_found");
        assert_eq!(Error::missing_credentials("x").code(), "missing_credentials");
        assert_eq!(Error::Forbidden.code(), "forbidden");
        assert_eq!(Error::timeout("x").code(), "timeout");
        assert_eq!(Error::pool_exhausted("x").code(), "pool_exhausted");
        assert_eq!(Error::upstream("x").code(), "upstream_error");
        assert_eq!(Error::internal("x").code(), "internal_error");
    }

    #[test]
    fn test_forbidden_message_has_no_detail() {
        assert_eq!(Error::Forbidden.to_string(), "forbidden");
    }

    #[test]
    fn test_definition_error_names_file_and_field() {
        let err = Error::definition("tools/ping.yaml", "patterns[0].inputs[1].validation", "bad regex");
        let msg = err.to_string();
        assert!(msg.contains("tools/ping.yaml"));
        assert!(msg.contains("patterns[0].inputs[1].validation"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::upstream("x").is_transient());
        assert!(Error::timeout("x").is_transient());
        assert!(!Error::validation("x").is_transient());
        assert!(!Error::Forbidden.is_transient());
    }
}
