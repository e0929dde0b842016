//! Persistent store contracts
//!
//! The relational/document store is an external collaborator; these
//! traits are the only surface the pipeline sees. Two backends ship:
//! MongoDB for replicated deployments and an in-memory twin for dev
//! and tests.

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ForgeResult;
use crate::models::{ConversationSummary, MessageRecord, ProjectRecord, ProjectStatus, UserRecord};

/// Result of a guarded create: either this call inserted the record,
/// or another request for the same session got there first and the
/// winner's record is returned instead.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(ProjectRecord),
    Existing(ProjectRecord),
}

impl CreateOutcome {
    pub fn into_record(self) -> ProjectRecord {
        match self {
            Self::Created(p) | Self::Existing(p) => p,
        }
    }
}

/// CRUD and lookup operations over project records
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, id: &str) -> ForgeResult<Option<ProjectRecord>>;

    async fn find_by_session(&self, session_id: &str) -> ForgeResult<Option<ProjectRecord>>;

    async fn find_by_build(&self, build_id: &str) -> ForgeResult<Option<ProjectRecord>>;

    async fn find_by_archive_url(&self, url: &str) -> ForgeResult<Option<ProjectRecord>>;

    /// Most recent project for a user, if any
    async fn most_recent_for_user(&self, user_id: &str) -> ForgeResult<Option<ProjectRecord>>;

    /// Most recent project overall (single-tenant fallback)
    async fn most_recent(&self) -> ForgeResult<Option<ProjectRecord>>;

    /// Most recent project for a user created at or after `since`
    async fn find_recent_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> ForgeResult<Option<ProjectRecord>>;

    /// Insert a new project unless one already exists for its session.
    /// Implementations must make the session uniqueness guarantee
    /// hold under concurrency (unique index or lock), not just as an
    /// advisory pre-check.
    async fn create_guarded(&self, project: ProjectRecord) -> ForgeResult<CreateOutcome>;

    /// Replace the stored record, bumping updated_at
    async fn update(&self, project: &ProjectRecord) -> ForgeResult<()>;

    async fn set_status(&self, id: &str, status: ProjectStatus) -> ForgeResult<()>;
}

/// User existence checks and creation
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn exists(&self, id: &str) -> ForgeResult<bool>;

    async fn create(&self, user: &UserRecord) -> ForgeResult<()>;
}

/// Message history and the single growing summary per scope
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(&self, message: &MessageRecord) -> ForgeResult<()>;

    /// Last `limit` messages for a scope, in chronological order
    async fn recent_messages(&self, scope_id: &str, limit: usize)
        -> ForgeResult<Vec<MessageRecord>>;

    async fn count_messages(&self, scope_id: &str) -> ForgeResult<u64>;

    async fn get_summary(&self, scope_id: &str) -> ForgeResult<Option<ConversationSummary>>;

    /// Upsert the scope's summary. The stored message_count never
    /// regresses: an upsert carrying a lower count keeps the higher
    /// stored value.
    async fn upsert_summary(&self, summary: &ConversationSummary) -> ForgeResult<()>;
}

/// Bundle of the three store facets, shared by resolver and pipeline
#[derive(Clone)]
pub struct Stores {
    pub projects: std::sync::Arc<dyn ProjectStore>,
    pub users: std::sync::Arc<dyn UserStore>,
    pub conversations: std::sync::Arc<dyn ConversationStore>,
}
