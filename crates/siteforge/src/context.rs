//! Conversation context assembly
//!
//! Feeds the generation engine a bounded text context: one growing
//! summary absorbing everything evicted from a small rolling window of
//! recent messages, then the window itself, then the active project
//! summary, then the newest modification-change-log entries. Prompt
//! size stays bounded no matter how long the conversation runs; the
//! trade is summary fidelity for boundedness.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::cache::{SessionCache, SessionCacheExt};
use crate::error::ForgeResult;
use crate::models::{ConversationSummary, MessageRecord, MessageRole, ProjectSummary};
use crate::store::ConversationStore;

/// Rolling window size: raw messages kept verbatim in the context
pub const RECENT_WINDOW: usize = 5;

/// Change-log entries appended to the context tail
const CHANGE_LOG_TAIL: usize = 5;

const MAX_ITEM_CHARS: usize = 220;

/// External text-summarization capability. Merging must preserve
/// approach, files touched, success/failure, and timestamps; it
/// appends and blends, never overwrites prior facts.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn merge(&self, existing: &str, evicted: &MessageRecord) -> String;
}

/// Built-in summarizer: condenses locally into capped bullet lines,
/// newest last. No engine round-trip, deterministic, and it never
/// drops previously absorbed lines.
pub struct HeuristicSummarizer;

#[async_trait]
impl Summarizer for HeuristicSummarizer {
    async fn merge(&self, existing: &str, evicted: &MessageRecord) -> String {
        let mut content = evicted.content.replace('\n', " ");
        if content.len() > MAX_ITEM_CHARS {
            content.truncate(MAX_ITEM_CHARS);
            content.push('…');
        }
        let line = format!(
            "- [{}] {}: {}",
            evicted.created_at.format("%Y-%m-%d %H:%M:%S"),
            evicted.role,
            content
        );
        if existing.is_empty() {
            line
        } else {
            format!("{}\n{}", existing, line)
        }
    }
}

/// Assembles bounded context for one conversation scope
pub struct ContextAssembler {
    store: Arc<dyn ConversationStore>,
    cache: Arc<dyn SessionCache>,
    summarizer: Arc<dyn Summarizer>,
    window: usize,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        cache: Arc<dyn SessionCache>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            store,
            cache,
            summarizer,
            window: RECENT_WINDOW,
        }
    }

    #[cfg(test)]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Append a message and, when the window overflows, fold the
    /// evicted message into the growing summary.
    pub async fn record_message(
        &self,
        scope_id: &str,
        role: MessageRole,
        content: &str,
    ) -> ForgeResult<()> {
        let message = MessageRecord::new(scope_id, role, content);
        self.store.append_message(&message).await?;

        let total = self.store.count_messages(scope_id).await?;
        if total as usize <= self.window {
            return Ok(());
        }

        // The message leaving the window is the oldest of the last
        // window+1; everything older was absorbed on earlier appends.
        let overflow = self
            .store
            .recent_messages(scope_id, self.window + 1)
            .await?;
        let Some(evicted) = overflow.first() else {
            return Ok(());
        };

        let mut summary = self
            .store
            .get_summary(scope_id)
            .await?
            .unwrap_or_else(|| ConversationSummary::new(scope_id));

        let absorbed = total as u32 - self.window as u32;
        if absorbed <= summary.message_count {
            // Already absorbed by a concurrent or replayed append
            return Ok(());
        }

        summary.summary = self.summarizer.merge(&summary.summary, evicted).await;
        summary.message_count = absorbed;
        summary.end_time = Utc::now();
        self.store.upsert_summary(&summary).await?;
        Ok(())
    }

    /// Assemble the full context string in fixed order: growing
    /// summary, recent window (chronological), active project summary,
    /// newest change-log entries.
    pub async fn get_context(&self, scope_id: &str) -> ForgeResult<String> {
        let mut sections: Vec<String> = Vec::new();

        match self.store.get_summary(scope_id).await {
            Ok(Some(summary)) if !summary.summary.is_empty() => {
                sections.push(format!(
                    "## Conversation so far ({} earlier messages)\n{}",
                    summary.message_count, summary.summary
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(scope = scope_id, error = %e, "Summary read failed, omitting"),
        }

        let recent = self.store.recent_messages(scope_id, self.window).await?;
        if !recent.is_empty() {
            let lines: Vec<String> = recent
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect();
            sections.push(format!("## Recent messages\n{}", lines.join("\n")));
        }

        if let Some(project) = self.active_project_summary(scope_id).await {
            sections.push(format!("## Active project\n{}", project.summary));
        }

        let changes = self.cache.load_changes(scope_id).await;
        if !changes.is_empty() {
            let tail = changes.iter().rev().take(CHANGE_LOG_TAIL).rev();
            let lines: Vec<String> = tail
                .map(|c| {
                    format!(
                        "- [{}] {} {} ({})",
                        c.timestamp.format("%H:%M:%S"),
                        c.change_type,
                        c.description,
                        if c.success { "ok" } else { "failed" }
                    )
                })
                .collect();
            sections.push(format!("## Recent changes\n{}", lines.join("\n")));
        }

        Ok(sections.join("\n\n"))
    }

    async fn active_project_summary(&self, scope_id: &str) -> Option<ProjectSummary> {
        self.cache
            .load_session(scope_id)
            .await
            .and_then(|s| s.project_summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySessionCache;
    use crate::models::{ChangeLogEntry, SessionRecord};
    use crate::store::MemoryStore;

    fn assembler() -> (ContextAssembler, Arc<MemoryStore>, Arc<MemorySessionCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemorySessionCache::default());
        let assembler = ContextAssembler::new(
            store.clone(),
            cache.clone(),
            Arc::new(HeuristicSummarizer),
        );
        (assembler, store, cache)
    }

    #[tokio::test]
    async fn context_is_bounded_to_window_plus_one_summary() {
        let (assembler, _, _) = assembler();
        for i in 0..12 {
            assembler
                .record_message("s1", MessageRole::User, &format!("message number {}", i))
                .await
                .unwrap();
        }

        let context = assembler.get_context("s1").await.unwrap();

        // At most RECENT_WINDOW raw messages appear verbatim; summary
        // lines are bullet-prefixed, raw window lines are not
        let raw_count = context
            .lines()
            .filter(|l| l.starts_with("user: message number"))
            .count();
        assert_eq!(raw_count, RECENT_WINDOW);
        // The oldest messages only survive inside the summary bullets
        assert!(!context.lines().any(|l| l == "user: message number 0"));

        // Exactly one summary block
        assert_eq!(context.matches("## Conversation so far").count(), 1);
        // The summary accounts for everything evicted
        assert!(context.contains("(7 earlier messages)"));
    }

    #[tokio::test]
    async fn no_summary_until_window_overflows() {
        let (assembler, store, _) = assembler();
        for i in 0..RECENT_WINDOW {
            assembler
                .record_message("s1", MessageRole::User, &format!("m{}", i))
                .await
                .unwrap();
        }
        assert!(store.get_summary("s1").await.unwrap().is_none());

        assembler
            .record_message("s1", MessageRole::User, "overflow")
            .await
            .unwrap();
        let summary = store.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(summary.message_count, 1);
        // The oldest message is the one that left the window
        assert!(summary.summary.contains("m0"));
    }

    #[tokio::test]
    async fn summary_absorbs_in_order_and_keeps_prior_facts() {
        let (assembler, store, _) = assembler();
        let assembler = assembler.with_window(2);
        for content in ["first", "second", "third", "fourth"] {
            assembler
                .record_message("s1", MessageRole::Assistant, content)
                .await
                .unwrap();
        }
        let summary = store.get_summary("s1").await.unwrap().unwrap();
        // "first" and "second" were both evicted, in that order
        let first_pos = summary.summary.find("first").unwrap();
        let second_pos = summary.summary.find("second").unwrap();
        assert!(first_pos < second_pos);
        assert_eq!(summary.message_count, 2);
    }

    #[tokio::test]
    async fn context_order_is_summary_window_project_changes() {
        let (assembler, _, cache) = assembler();
        for i in 0..8 {
            assembler
                .record_message("s1", MessageRole::User, &format!("msg {}", i))
                .await
                .unwrap();
        }

        let mut session = SessionRecord::new("s1", "b1");
        session.project_summary = Some(ProjectSummary {
            summary: "A bakery landing page".to_string(),
            archive_url: None,
            build_id: "b1".to_string(),
        });
        cache.store_session(&session).await;
        cache
            .append_change(
                "s1",
                &ChangeLogEntry::generation("initial generation", vec!["index.html".into()], true),
            )
            .await;

        let context = assembler.get_context("s1").await.unwrap();
        let summary_pos = context.find("## Conversation so far").unwrap();
        let window_pos = context.find("## Recent messages").unwrap();
        let project_pos = context.find("## Active project").unwrap();
        let changes_pos = context.find("## Recent changes").unwrap();
        assert!(summary_pos < window_pos);
        assert!(window_pos < project_pos);
        assert!(project_pos < changes_pos);
    }

    #[tokio::test]
    async fn heuristic_summarizer_preserves_timestamps_and_roles() {
        let summarizer = HeuristicSummarizer;
        let msg = MessageRecord::new("s1", MessageRole::Assistant, "rebuilt the nav bar");
        let merged = summarizer.merge("- earlier line", &msg).await;
        assert!(merged.starts_with("- earlier line\n"));
        assert!(merged.contains("assistant: rebuilt the nav bar"));
        assert!(merged.contains(&msg.created_at.format("%Y-%m-%d").to_string()));
    }
}
