//! In-memory store backend
//!
//! Serves single-process deployments and the test suite. The project
//! map is guarded by one mutex, so the session-uniqueness check in
//! create_guarded is race-free by construction.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ConversationStore, CreateOutcome, ProjectStore, Stores, UserStore};
use crate::error::{ForgeError, ForgeResult};
use crate::models::{ConversationSummary, MessageRecord, ProjectRecord, ProjectStatus, UserRecord};

#[derive(Default)]
struct Inner {
    projects: HashMap<String, ProjectRecord>,
    users: HashMap<String, UserRecord>,
    messages: Vec<MessageRecord>,
    summaries: HashMap<String, ConversationSummary>,
}

/// Mutex-guarded in-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a `Stores` bundle where all three facets share one store
    pub fn stores() -> Stores {
        let store = std::sync::Arc::new(Self::new());
        Stores {
            projects: store.clone(),
            users: store.clone(),
            conversations: store,
        }
    }

    fn lock(&self) -> ForgeResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ForgeError::Internal("store lock poisoned".to_string()))
    }
}

fn most_recent_of<'a, I: Iterator<Item = &'a ProjectRecord>>(iter: I) -> Option<ProjectRecord> {
    iter.max_by_key(|p| p.created_at).cloned()
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get(&self, id: &str) -> ForgeResult<Option<ProjectRecord>> {
        Ok(self.lock()?.projects.get(id).cloned())
    }

    async fn find_by_session(&self, session_id: &str) -> ForgeResult<Option<ProjectRecord>> {
        Ok(self
            .lock()?
            .projects
            .values()
            .find(|p| p.last_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn find_by_build(&self, build_id: &str) -> ForgeResult<Option<ProjectRecord>> {
        Ok(self
            .lock()?
            .projects
            .values()
            .find(|p| p.build_id == build_id)
            .cloned())
    }

    async fn find_by_archive_url(&self, url: &str) -> ForgeResult<Option<ProjectRecord>> {
        Ok(self
            .lock()?
            .projects
            .values()
            .find(|p| p.archive_url.as_deref() == Some(url))
            .cloned())
    }

    async fn most_recent_for_user(&self, user_id: &str) -> ForgeResult<Option<ProjectRecord>> {
        Ok(most_recent_of(
            self.lock()?.projects.values().filter(|p| p.user_id == user_id),
        ))
    }

    async fn most_recent(&self) -> ForgeResult<Option<ProjectRecord>> {
        Ok(most_recent_of(self.lock()?.projects.values()))
    }

    async fn find_recent_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> ForgeResult<Option<ProjectRecord>> {
        Ok(most_recent_of(
            self.lock()?
                .projects
                .values()
                .filter(|p| p.user_id == user_id && p.created_at >= since),
        ))
    }

    async fn create_guarded(&self, project: ProjectRecord) -> ForgeResult<CreateOutcome> {
        let mut inner = self.lock()?;
        if let Some(session_id) = project.last_session_id.as_deref() {
            if let Some(existing) = inner
                .projects
                .values()
                .find(|p| p.last_session_id.as_deref() == Some(session_id))
            {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }
        inner.projects.insert(project.id.clone(), project.clone());
        Ok(CreateOutcome::Created(project))
    }

    async fn update(&self, project: &ProjectRecord) -> ForgeResult<()> {
        let mut inner = self.lock()?;
        let mut updated = project.clone();
        updated.updated_at = Utc::now();
        inner.projects.insert(updated.id.clone(), updated);
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ProjectStatus) -> ForgeResult<()> {
        let mut inner = self.lock()?;
        match inner.projects.get_mut(id) {
            Some(project) => {
                project.status = status;
                project.updated_at = Utc::now();
                Ok(())
            }
            None => Err(ForgeError::ProjectNotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn exists(&self, id: &str) -> ForgeResult<bool> {
        Ok(self.lock()?.users.contains_key(id))
    }

    async fn create(&self, user: &UserRecord) -> ForgeResult<()> {
        self.lock()?.users.insert(user.id.clone(), user.clone());
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn append_message(&self, message: &MessageRecord) -> ForgeResult<()> {
        self.lock()?.messages.push(message.clone());
        Ok(())
    }

    async fn recent_messages(
        &self,
        scope_id: &str,
        limit: usize,
    ) -> ForgeResult<Vec<MessageRecord>> {
        let inner = self.lock()?;
        let scoped: Vec<MessageRecord> = inner
            .messages
            .iter()
            .filter(|m| m.scope_id == scope_id)
            .cloned()
            .collect();
        let start = scoped.len().saturating_sub(limit);
        Ok(scoped[start..].to_vec())
    }

    async fn count_messages(&self, scope_id: &str) -> ForgeResult<u64> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|m| m.scope_id == scope_id)
            .count() as u64)
    }

    async fn get_summary(&self, scope_id: &str) -> ForgeResult<Option<ConversationSummary>> {
        Ok(self.lock()?.summaries.get(scope_id).cloned())
    }

    async fn upsert_summary(&self, summary: &ConversationSummary) -> ForgeResult<()> {
        let mut inner = self.lock()?;
        let entry = inner
            .summaries
            .entry(summary.scope_id.clone())
            .or_insert_with(|| summary.clone());
        // The growing summary never regresses its message count
        if summary.message_count >= entry.message_count {
            let start_time = entry.start_time.min(summary.start_time);
            *entry = summary.clone();
            entry.start_time = start_time;
        }
        Ok(())
    }
}
