//! Orchestrator error taxonomy.
//!
//! Every failure surfaced by the core maps to one of six kinds:
//! validation, not-found, conflict, precondition, external, timeout.
//! HTTP callers receive the structured `{message, details?, field?}`
//! envelope produced by [`OrchestratorError::envelope`]; the realtime
//! channel broadcasts the same code/status pair on the `system` topic.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad input: invalid ref name, worktree name, option string, path
    /// traversal. Returned to the caller before any side effect.
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Unique constraint or dual active session; the caller should
    /// observe the existing state instead.
    #[error("{message}")]
    Conflict { message: String },

    /// Wrong status, dirty working tree, missing binary, MCP not
    /// configured. Carries a stable machine-readable code.
    #[error("{message}")]
    Precondition {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// git/docker/provider/container failure, wrapped with command
    /// context by the caller.
    #[error("{message}")]
    External {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn precondition(code: &'static str, message: impl Into<String>) -> Self {
        Self::Precondition {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn precondition_with(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::Precondition {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::External {
            message: message.into(),
            source: None,
        }
    }

    pub fn external_with(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::External {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_FAILED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Precondition { code, .. } => code,
            Self::External { .. } => "EXTERNAL_FAILURE",
            Self::Timeout { .. } => "TIMEOUT",
        }
    }

    /// HTTP status the taxonomy maps onto.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::Precondition { .. } => 412,
            Self::External { .. } => 502,
            Self::Timeout { .. } => 504,
        }
    }

    /// Structured envelope returned to HTTP callers.
    pub fn envelope(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "message": self.to_string(),
            "code": self.code(),
        });
        match self {
            Self::Validation {
                field: Some(field), ..
            } => {
                body["field"] = serde_json::Value::String(field.clone());
            }
            Self::Precondition {
                details: Some(details),
                ..
            } => {
                body["details"] = details.clone();
            }
            _ => {}
        }
        body
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<crate::subprocess::ProcessError> for OrchestratorError {
    fn from(err: crate::subprocess::ProcessError) -> Self {
        match err {
            crate::subprocess::ProcessError::Timeout { command, timeout } => Self::Timeout {
                operation: command,
                timeout,
            },
            other => Self::External {
                message: other.to_string(),
                source: Some(other.into()),
            },
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        Self::External {
            message: format!("database error: {err}"),
            source: Some(err.into()),
        }
    }
}
