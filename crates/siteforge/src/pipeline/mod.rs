//! Pipeline types and the orchestrator
//!
//! One pipeline instance drives one generation or modification
//! request end to end. Progress streams out as tagged events; the
//! stage enum carries the step arithmetic consumers use to render a
//! progress indicator.

mod orchestrator;

pub use orchestrator::{Orchestrator, PipelineConfig};

use serde::{Deserialize, Serialize};

/// Pipeline state machine states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Resolving,
    Materializing,
    Generating,
    Parsing,
    Persisting,
    Packaging,
    Building,
    Deploying,
    Finalizing,
    Done,
    Failed,
    DuplicateShortCircuit,
}

impl PipelineStage {
    /// 1-based progress step for active stages
    pub fn step(&self) -> u8 {
        match self {
            Self::Resolving => 1,
            Self::Materializing => 2,
            Self::Generating => 3,
            Self::Parsing => 4,
            Self::Persisting => 5,
            Self::Packaging => 6,
            Self::Building => 7,
            Self::Deploying => 8,
            Self::Finalizing => 9,
            Self::Done | Self::Failed | Self::DuplicateShortCircuit => Self::TOTAL_STEPS,
        }
    }

    pub const TOTAL_STEPS: u8 = 9;

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::DuplicateShortCircuit)
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::Materializing => "materializing",
            Self::Generating => "generating",
            Self::Parsing => "parsing",
            Self::Persisting => "persisting",
            Self::Packaging => "packaging",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::DuplicateShortCircuit => "duplicate_short_circuit",
        };
        write!(f, "{}", name)
    }
}

/// Stream event for real-time pipeline updates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    /// Stage progress for the consumer's indicator
    Progress {
        step: u8,
        total: u8,
        message: String,
    },
    /// Accumulated generation text (streaming cadence)
    Text { content: String },
    /// Terminal success
    Complete {
        project_id: String,
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        deployment_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
        duplicate: bool,
    },
    /// Terminal failure
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        build_id: String,
        session_id: String,
        /// True when files were generated but deployment failed
        generation_succeeded: bool,
    },
}

impl ProgressEvent {
    /// SSE event type string for this event variant.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Text { .. } => "text",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event signals the end of the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    pub fn progress(stage: PipelineStage, message: &str) -> Self {
        Self::Progress {
            step: stage.step(),
            total: PipelineStage::TOTAL_STEPS,
            message: message.to_string(),
        }
    }
}

/// One incoming generation or modification request
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineRequest {
    pub session_id: String,
    pub build_id: String,
    pub prompt: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub is_modification: bool,
}

/// Terminal result of one pipeline run. Failures still carry the
/// build/session/project identifiers; callers never get a bare error.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub build_id: String,
    pub session_id: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    pub duplicate: bool,
    pub generation_succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
