//! Conversation history and summary models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One persisted conversation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    /// Conversation scope, normally the session id
    pub scope_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(scope_id: &str, role: MessageRole, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            scope_id: scope_id.to_string(),
            role,
            content: content.to_string(),
            project_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }
}

/// The single growing summary for one conversation scope.
/// Absorbs every message evicted from the recent window; message_count
/// never regresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub scope_id: String,
    pub summary: String,
    pub message_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ConversationSummary {
    pub fn new(scope_id: &str) -> Self {
        let now = Utc::now();
        Self {
            scope_id: scope_id.to_string(),
            summary: String::new(),
            message_count: 0,
            start_time: now,
            end_time: now,
        }
    }
}
