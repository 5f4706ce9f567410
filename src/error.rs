//! Error taxonomy for the orchestration workflow.
//!
//! Router, judge and specialist failures abort a request and surface as a
//! [`WorkflowError`]. Graph pipeline failures use the same type but are always
//! caught by the workflow. Tools report [`ToolError`]s back to the model
//! instead of aborting the reasoning turn; a rejected SQL statement is a
//! [`ToolError::SqlPolicy`] the model reads and corrects.

use std::time::Duration;
use thiserror::Error;

/// Failure of one workflow execution (or of one of its stages).
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed request (empty question, unknown role label, ...).
    #[error("invalid request: {0}")]
    Validation(String),

    /// A routing decision named a specialist that does not exist.
    #[error("routing error: {0}")]
    Routing(String),

    /// A capability returned content that does not fit its result schema.
    #[error("{capability} returned content not matching its schema: {message}")]
    SchemaValidation { capability: String, message: String },

    /// Transport, timeout or server failure of a capability.
    #[error("service error: {0}")]
    Service(String),

    /// Generated chart code failed or produced no image.
    #[error("sandbox execution failed: {0}")]
    SandboxExecution(String),

    /// The file-hosting collaborator rejected the image.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The wall-clock budget of the workflow ran out.
    #[error("workflow timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl WorkflowError {
    pub fn schema(capability: impl Into<String>, message: impl ToString) -> Self {
        WorkflowError::SchemaValidation {
            capability: capability.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-friendly kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Validation(_) => "validation",
            WorkflowError::Routing(_) => "routing",
            WorkflowError::SchemaValidation { .. } => "schema_validation",
            WorkflowError::Service(_) => "service",
            WorkflowError::SandboxExecution(_) => "sandbox_execution",
            WorkflowError::Upload(_) => "upload",
            WorkflowError::Timeout(_) => "timeout",
        }
    }
}

/// Domain error raised by a tool while the reasoning service is mid-turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A non-retrieval SQL statement was attempted.
    #[error("statement rejected: {0}")]
    SqlPolicy(String),

    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error("execution failed: {0}")]
    Execution(String),
}
