//! External collaborator contracts
//!
//! The generation engine, the AST modification engine, and the object
//! storage / build / hosting platform are consumed services. The
//! pipeline only ever sees these traits; HTTP implementations live in
//! `http`, test doubles live with the orchestrator tests.

mod http;

pub use http::{HttpAstEngine, HttpBuildPlatform, HttpGenerationEngine};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ForgeResult;

/// Lazy, finite, non-restartable sequence of completion text chunks
pub type ChunkStream = BoxStream<'static, ForgeResult<String>>;

/// Code-generation engine: prompt in, streamed completion out
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> ForgeResult<ChunkStream>;
}

/// Outcome of a targeted AST-level edit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstEditOutcome {
    pub success: bool,
    pub approach: String,
    #[serde(default)]
    pub selected_files: Vec<String>,
    #[serde(default)]
    pub added_files: Vec<String>,
    #[serde(default)]
    pub modified_ranges: u32,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// AST-based modification engine for targeted edits
#[async_trait]
pub trait AstEngine: Send + Sync {
    async fn apply_edit(
        &self,
        prompt: &str,
        workspace_path: &std::path::Path,
        session_id: &str,
    ) -> ForgeResult<AstEditOutcome>;
}

/// Remote build trigger result
#[derive(Debug, Clone, Deserialize)]
pub struct BuildResult {
    #[serde(rename = "downloadUrl")]
    pub download_url: String,
}

/// Deployment result
#[derive(Debug, Clone, Deserialize)]
pub struct DeployResult {
    #[serde(rename = "previewUrl")]
    pub preview_url: String,
    #[serde(rename = "downloadUrl")]
    pub download_url: Option<String>,
}

/// Object storage plus remote build and hosting platform
#[async_trait]
pub trait BuildPlatform: Send + Sync {
    /// Upload a blob, returning its address
    async fn upload(&self, container: &str, blob_name: &str, bytes: Vec<u8>) -> ForgeResult<String>;

    /// Fetch a blob by address. Archives double as the next
    /// modification's base, so the platform must read them back too.
    async fn download(&self, url: &str) -> ForgeResult<Vec<u8>>;

    /// Trigger a remote build against an uploaded archive, awaiting
    /// the built-artifact address. `config` is forwarded opaquely to
    /// the build service.
    async fn trigger_build(
        &self,
        source_url: &str,
        build_id: &str,
        config: &serde_json::Value,
    ) -> ForgeResult<BuildResult>;

    /// Deploy a built artifact, obtaining a public preview URL
    async fn deploy(&self, built_url: &str, build_id: &str) -> ForgeResult<DeployResult>;
}
