//! Error types for the generation pipeline

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Pipeline error types
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("User resolution failed: {reason}")]
    UserResolution { reason: String },

    #[error("Workspace materialization failed: {reason}")]
    WorkspaceMaterialization { reason: String },

    #[error("Generation engine error: {0}")]
    Generation(String),

    #[error("Could not parse generated output: {reason}")]
    GenerationParse {
        reason: String,
        /// Raw engine output, preserved for diagnostics.
        raw_output: String,
    },

    #[error("AST modification failed: {0}")]
    AstModification(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Deployment failed: {0}")]
    Deploy(String),

    #[error("Platform request failed: {0}")]
    Platform(String),

    #[error("Invalid file path in generated output: {path}")]
    InvalidGeneratedPath { path: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<mongodb::error::Error> for ForgeError {
    fn from(err: mongodb::error::Error) -> Self {
        ForgeError::Database(err.to_string())
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        ForgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for ForgeError {
    fn from(err: zip::result::ZipError) -> Self {
        ForgeError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(err: reqwest::Error) -> Self {
        ForgeError::Platform(err.to_string())
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ForgeError {
    /// Convert to API error code
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            ForgeError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            ForgeError::UserResolution { .. } => "USER_RESOLUTION_FAILED",
            ForgeError::WorkspaceMaterialization { .. } => "WORKSPACE_MATERIALIZATION_FAILED",
            ForgeError::Generation(_) => "GENERATION_FAILED",
            ForgeError::GenerationParse { .. } => "GENERATION_PARSE_FAILED",
            ForgeError::AstModification(_) => "AST_MODIFICATION_FAILED",
            ForgeError::Build(_) => "BUILD_FAILED",
            ForgeError::Deploy(_) => "DEPLOY_FAILED",
            ForgeError::Platform(_) => "PLATFORM_ERROR",
            ForgeError::InvalidGeneratedPath { .. } => "INVALID_GENERATED_PATH",
            ForgeError::Validation(_) => "VALIDATION_ERROR",
            ForgeError::Database(_) => "DATABASE_ERROR",
            ForgeError::Io(_) => "IO_ERROR",
            ForgeError::Serialization(_) => "SERIALIZATION_ERROR",
            ForgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ForgeError::ProjectNotFound(_) | ForgeError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }

            ForgeError::Validation(_) | ForgeError::InvalidGeneratedPath { .. } => {
                StatusCode::BAD_REQUEST
            }

            ForgeError::GenerationParse { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            ForgeError::Generation(_)
            | ForgeError::AstModification(_)
            | ForgeError::Build(_)
            | ForgeError::Deploy(_)
            | ForgeError::Platform(_) => StatusCode::BAD_GATEWAY,

            ForgeError::UserResolution { .. }
            | ForgeError::WorkspaceMaterialization { .. }
            | ForgeError::Database(_)
            | ForgeError::Io(_)
            | ForgeError::Serialization(_)
            | ForgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure happened after files were generated.
    /// Build/deploy failures preserve the generation result; the
    /// response reports partial success instead of a blanket failure.
    pub fn is_post_generation(&self) -> bool {
        matches!(
            self,
            ForgeError::Build(_) | ForgeError::Deploy(_) | ForgeError::Platform(_)
        )
    }
}

impl IntoResponse for ForgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let details = match &self {
            ForgeError::GenerationParse { raw_output, .. } => Some(serde_json::json!({
                "raw_output": raw_output,
            })),
            _ => None,
        };
        let body = ApiError {
            code: self.code().to_string(),
            message: self.to_string(),
            details,
        };

        (status, axum::Json(body)).into_response()
    }
}
