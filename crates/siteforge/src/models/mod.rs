//! Data models for projects, sessions, and conversations

pub mod conversation;
pub mod project;
pub mod session;
pub mod user;

pub use conversation::{ConversationSummary, MessageRecord, MessageRole};
pub use project::{ProjectRecord, ProjectStatus};
pub use session::{CachedFile, CachedFileSet, ChangeLogEntry, ProjectSummary, SessionRecord};
pub use user::UserRecord;
