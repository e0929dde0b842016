//! Project identity resolver
//!
//! Guarantees at-most-one logical project per logical request despite
//! retries and concurrent callers. Resolution runs an ordered chain of
//! lookups; every miss falls through to the next strategy and only
//! user creation can abort the chain.

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::error::{ForgeError, ForgeResult};
use crate::models::{ProjectRecord, UserRecord};
use crate::store::{CreateOutcome, Stores};

/// Window inside which a same-user create is treated as a retry
const RETRY_WINDOW_SECS: i64 = 60;

/// A fully deployed project updated this recently short-circuits the
/// whole pipeline and replays the prior result
const SHORT_CIRCUIT_SECS: i64 = 2;

/// Caller-supplied resolution context
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub is_modification: bool,
    pub prompt: Option<String>,
    /// Archive URL from the session, when known; feeds the
    /// archive-equality duplicate check
    pub archive_url: Option<String>,
}

/// What resolution decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Created,
    Updated,
    /// An identical, fully deployed result already exists; the
    /// orchestrator should replay it without re-running the pipeline
    Duplicate,
}

/// Resolution outcome
#[derive(Debug, Clone)]
pub struct Resolution {
    pub project: ProjectRecord,
    pub action: ResolveAction,
}

/// Resolves (session, build, context) to exactly one project
pub struct ProjectResolver {
    stores: Stores,
}

impl ProjectResolver {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn resolve(
        &self,
        session_id: &str,
        build_id: &str,
        ctx: &ResolveContext,
    ) -> ForgeResult<Resolution> {
        // 1. Explicit project id wins outright
        if let Some(project_id) = ctx.project_id.as_deref() {
            if let Some(project) = self.lookup(self.stores.projects.get(project_id)).await {
                return Ok(self.finish(project, ResolveAction::Updated));
            }
            warn!(project_id = project_id, "Explicit project id not found, falling back");
        }

        // 2. Modification lookups
        if ctx.is_modification {
            if let Some(project) = self.modification_target(session_id, build_id, ctx).await {
                return Ok(self.finish(project, ResolveAction::Updated));
            }
            warn!(session_id = session_id, "Modification request found no prior project");
        }

        // 3. Duplicate checks before any create
        if let Some(project) = self.duplicate_of(session_id, build_id, ctx).await {
            return Ok(self.finish(project, ResolveAction::Updated));
        }

        // 4. Nothing matched anywhere: create
        self.create(session_id, build_id, ctx).await
    }

    /// Lookup helper: store errors degrade to not-found so the chain
    /// keeps falling through
    async fn lookup(
        &self,
        result: impl std::future::Future<Output = ForgeResult<Option<ProjectRecord>>>,
    ) -> Option<ProjectRecord> {
        match result.await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Project lookup failed, treating as not found");
                None
            }
        }
    }

    async fn modification_target(
        &self,
        session_id: &str,
        build_id: &str,
        ctx: &ResolveContext,
    ) -> Option<ProjectRecord> {
        if let Some(p) = self.lookup(self.stores.projects.find_by_session(session_id)).await {
            return Some(p);
        }
        if let Some(user_id) = ctx.user_id.as_deref() {
            if let Some(p) = self
                .lookup(self.stores.projects.most_recent_for_user(user_id))
                .await
            {
                return Some(p);
            }
        }
        // Single-tenant fallback: whatever project is newest
        if let Some(p) = self.lookup(self.stores.projects.most_recent()).await {
            return Some(p);
        }
        // Some clients send the build id where the session id belongs
        self.lookup(self.stores.projects.find_by_session(build_id))
            .await
    }

    async fn duplicate_of(
        &self,
        session_id: &str,
        build_id: &str,
        ctx: &ResolveContext,
    ) -> Option<ProjectRecord> {
        if let Some(p) = self.lookup(self.stores.projects.find_by_session(session_id)).await {
            return Some(p);
        }
        if let Some(p) = self.lookup(self.stores.projects.find_by_build(build_id)).await {
            return Some(p);
        }
        if let Some(url) = ctx.archive_url.as_deref() {
            if let Some(p) = self.lookup(self.stores.projects.find_by_archive_url(url)).await {
                return Some(p);
            }
        }
        if let Some(user_id) = ctx.user_id.as_deref() {
            let since = Utc::now() - Duration::seconds(RETRY_WINDOW_SECS);
            if let Some(p) = self
                .lookup(self.stores.projects.find_recent_for_user(user_id, since))
                .await
            {
                info!(project_id = %p.id, "Same-user project created within retry window, reusing");
                return Some(p);
            }
        }
        None
    }

    async fn create(
        &self,
        session_id: &str,
        build_id: &str,
        ctx: &ResolveContext,
    ) -> ForgeResult<Resolution> {
        // User creation failure is the one fatal path in resolution
        let user_id = self.ensure_user(ctx.user_id.as_deref()).await?;

        let name = ctx
            .prompt
            .as_deref()
            .map(project_name_from_prompt)
            .unwrap_or_else(|| "untitled-site".to_string());

        let mut project = ProjectRecord::new(&user_id, &name, build_id, session_id);
        project.description = ctx.prompt.clone();

        match self.stores.projects.create_guarded(project).await? {
            CreateOutcome::Created(project) => {
                info!(project_id = %project.id, session_id = session_id, "Resolved to new project");
                Ok(Resolution {
                    project,
                    action: ResolveAction::Created,
                })
            }
            CreateOutcome::Existing(project) => {
                // A concurrent request for the same session won the
                // insert; this request updates the winner instead.
                Ok(self.finish(project, ResolveAction::Updated))
            }
        }
    }

    async fn ensure_user(&self, user_id: Option<&str>) -> ForgeResult<String> {
        if let Some(id) = user_id.filter(|id| !id.trim().is_empty()) {
            let exists = self.stores.users.exists(id).await.map_err(|e| {
                ForgeError::UserResolution {
                    reason: format!("user existence check failed: {}", e),
                }
            })?;
            if !exists {
                self.stores
                    .users
                    .create(&UserRecord::supplied(id))
                    .await
                    .map_err(|e| ForgeError::UserResolution {
                        reason: format!("user creation failed: {}", e),
                    })?;
            }
            return Ok(id.to_string());
        }

        let user = UserRecord::synthesized();
        self.stores
            .users
            .create(&user)
            .await
            .map_err(|e| ForgeError::UserResolution {
                reason: format!("synthesized user creation failed: {}", e),
            })?;
        Ok(user.id)
    }

    /// Apply the idempotent-replay short-circuit to a found project
    fn finish(&self, project: ProjectRecord, action: ResolveAction) -> Resolution {
        let age = Utc::now() - project.updated_at;
        if project.is_fully_deployed() && age < Duration::seconds(SHORT_CIRCUIT_SECS) {
            info!(project_id = %project.id, "Fully deployed moments ago, replaying prior result");
            return Resolution {
                project,
                action: ResolveAction::Duplicate,
            };
        }
        Resolution { project, action }
    }
}

/// Derive a short project name from the prompt's leading words
fn project_name_from_prompt(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().take(6).collect();
    let mut name: String = words
        .join(" ")
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();
    name.truncate(60);
    let name = name.trim();
    if name.is_empty() {
        "untitled-site".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectStatus;
    use crate::store::MemoryStore;

    fn resolver() -> (ProjectResolver, Stores) {
        let stores = MemoryStore::stores();
        (ProjectResolver::new(stores.clone()), stores)
    }

    #[tokio::test]
    async fn resolving_twice_yields_same_project() {
        let (resolver, _) = resolver();
        let ctx = ResolveContext {
            prompt: Some("a landing page for a bakery".to_string()),
            ..Default::default()
        };

        let first = resolver.resolve("s1", "b1", &ctx).await.unwrap();
        assert_eq!(first.action, ResolveAction::Created);

        let second = resolver.resolve("s1", "b2", &ctx).await.unwrap();
        assert_eq!(second.action, ResolveAction::Updated);
        assert_eq!(second.project.id, first.project.id);
    }

    #[tokio::test]
    async fn explicit_project_id_wins() {
        let (resolver, stores) = resolver();
        let seeded = ProjectRecord::new("u1", "seeded", "b0", "s0");
        stores.projects.create_guarded(seeded.clone()).await.unwrap();

        let ctx = ResolveContext {
            project_id: Some(seeded.id.clone()),
            ..Default::default()
        };
        let resolved = resolver.resolve("s-new", "b-new", &ctx).await.unwrap();
        assert_eq!(resolved.project.id, seeded.id);
        assert_eq!(resolved.action, ResolveAction::Updated);
    }

    #[tokio::test]
    async fn missing_explicit_id_falls_back_to_create() {
        let (resolver, _) = resolver();
        let ctx = ResolveContext {
            project_id: Some("does-not-exist".to_string()),
            ..Default::default()
        };
        let resolved = resolver.resolve("s1", "b1", &ctx).await.unwrap();
        assert_eq!(resolved.action, ResolveAction::Created);
    }

    #[tokio::test]
    async fn modification_finds_project_by_session() {
        let (resolver, stores) = resolver();
        let seeded = ProjectRecord::new("u1", "site", "b0", "s1");
        stores.projects.create_guarded(seeded.clone()).await.unwrap();

        let ctx = ResolveContext {
            is_modification: true,
            ..Default::default()
        };
        let resolved = resolver.resolve("s1", "b1", &ctx).await.unwrap();
        assert_eq!(resolved.project.id, seeded.id);
        assert_eq!(resolved.action, ResolveAction::Updated);
    }

    #[tokio::test]
    async fn modification_falls_back_to_most_recent_for_user() {
        let (resolver, stores) = resolver();
        let seeded = ProjectRecord::new("u7", "site", "b0", "s-old");
        stores.projects.create_guarded(seeded.clone()).await.unwrap();

        let ctx = ResolveContext {
            is_modification: true,
            user_id: Some("u7".to_string()),
            ..Default::default()
        };
        let resolved = resolver.resolve("s-fresh", "b1", &ctx).await.unwrap();
        assert_eq!(resolved.project.id, seeded.id);
    }

    #[tokio::test]
    async fn fully_deployed_recent_project_short_circuits() {
        let (resolver, stores) = resolver();
        let mut seeded = ProjectRecord::new("u1", "site", "b1", "s1");
        seeded.status = ProjectStatus::Ready;
        seeded.archive_url = Some("https://store/a.zip".into());
        seeded.download_url = Some("https://store/built.zip".into());
        seeded.deployment_url = Some("https://preview.example".into());
        stores.projects.create_guarded(seeded.clone()).await.unwrap();
        // update() refreshes updated_at to now, inside the window
        stores.projects.update(&seeded).await.unwrap();

        let resolved = resolver
            .resolve("s1", "b2", &ResolveContext::default())
            .await
            .unwrap();
        assert_eq!(resolved.action, ResolveAction::Duplicate);
        assert_eq!(resolved.project.id, seeded.id);
    }

    #[tokio::test]
    async fn synthesized_user_owns_created_project() {
        let (resolver, stores) = resolver();
        let resolved = resolver
            .resolve("s1", "b1", &ResolveContext::default())
            .await
            .unwrap();
        assert!(resolved.project.user_id.starts_with("anon-"));
        assert!(stores.users.exists(&resolved.project.user_id).await.unwrap());
    }

    #[test]
    fn project_name_derives_from_prompt() {
        assert_eq!(
            project_name_from_prompt("Build me a portfolio site with three pages please"),
            "Build me a portfolio site with"
        );
        assert_eq!(project_name_from_prompt("!!!"), "untitled-site");
    }
}
