//! Pipeline orchestrator
//!
//! Drives one request through the stage machine:
//! Resolving → Materializing → Generating → Parsing → Persisting →
//! Packaging → Building → Deploying → Finalizing, with Failed
//! reachable from anywhere and a duplicate short-circuit out of
//! Resolving. A cleanup timer armed on entry guarantees the workspace
//! disappears even when a stage wedges; consumers always receive a
//! terminal event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{PipelineOutcome, PipelineRequest, PipelineStage, ProgressEvent};
use crate::cache::{SessionCache, SessionCacheExt};
use crate::context::{ContextAssembler, Summarizer};
use crate::engine::{AstEditOutcome, AstEngine, BuildPlatform, GenerationEngine};
use crate::error::{ForgeError, ForgeResult};
use crate::models::{
    CachedFileSet, ChangeLogEntry, MessageRole, ProjectStatus, ProjectSummary, SessionRecord,
};
use crate::output_parser::{parse_generated_files, GeneratedFileSet};
use crate::resolver::{ProjectResolver, ResolveAction, ResolveContext};
use crate::store::Stores;
use crate::workspace::Workspace;

/// Streaming text is batched and re-emitted at this cadence
const TEXT_EMIT_BYTES: usize = 2048;

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub template_dir: PathBuf,
    /// Object storage container for source archives
    pub storage_container: String,
    /// Force-cleanup timer armed at pipeline entry
    pub cleanup_timeout: Duration,
}

impl PipelineConfig {
    fn workspace_path(&self, build_id: &str) -> PathBuf {
        self.workspace_root.join(format!("siteforge-{}", build_id))
    }
}

/// Top-level pipeline driver. Stateless across requests: everything a
/// run needs arrives in the request or lives in the shared cache and
/// stores, so any server replica can run any request.
pub struct Orchestrator {
    stores: Stores,
    cache: Arc<dyn SessionCache>,
    generation: Arc<dyn GenerationEngine>,
    ast: Arc<dyn AstEngine>,
    platform: Arc<dyn BuildPlatform>,
    resolver: ProjectResolver,
    assembler: ContextAssembler,
    config: PipelineConfig,
}

/// Mutable run state threaded past the failure handler
struct RunState {
    project_id: Option<String>,
    action: ResolveAction,
    archive_url: Option<String>,
    download_url: Option<String>,
    deployment_url: Option<String>,
    generation_succeeded: bool,
    workspace: Option<Workspace>,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        cache: Arc<dyn SessionCache>,
        generation: Arc<dyn GenerationEngine>,
        ast: Arc<dyn AstEngine>,
        platform: Arc<dyn BuildPlatform>,
        summarizer: Arc<dyn Summarizer>,
        config: PipelineConfig,
    ) -> Self {
        let resolver = ProjectResolver::new(stores.clone());
        let assembler =
            ContextAssembler::new(stores.conversations.clone(), cache.clone(), summarizer);
        Self {
            stores,
            cache,
            generation,
            ast,
            platform,
            resolver,
            assembler,
            config,
        }
    }

    /// Run one request to a terminal state. Never returns a bare
    /// error: failures produce an outcome carrying the identifiers
    /// and whatever partial results exist.
    pub async fn run(
        &self,
        req: PipelineRequest,
        events: broadcast::Sender<ProgressEvent>,
    ) -> PipelineOutcome {
        let emit = |event: ProgressEvent| {
            // A gone consumer never stops the pipeline; remote builds
            // are not cheaply cancellable mid-flight.
            let _ = events.send(event);
        };

        let timer_token = self.arm_cleanup_timer(&req, events.clone());

        let mut state = RunState {
            project_id: None,
            action: ResolveAction::Created,
            archive_url: None,
            download_url: None,
            deployment_url: None,
            generation_succeeded: false,
            workspace: None,
        };

        let result = self.drive(&req, &mut state, &emit).await;

        timer_token.cancel();

        // Terminal cleanup: the workspace goes away on every path.
        if let Some(workspace) = &state.workspace {
            if let Err(e) = workspace.cleanup().await {
                error!(build_id = %req.build_id, error = %e, "Workspace cleanup failed");
            }
        }

        match result {
            Ok(outcome) => {
                emit(ProgressEvent::Complete {
                    project_id: outcome.project_id.clone().unwrap_or_default(),
                    action: outcome.action.clone(),
                    deployment_url: outcome.deployment_url.clone(),
                    download_url: outcome.download_url.clone(),
                    duplicate: outcome.duplicate,
                });
                outcome
            }
            Err(e) => self.fail(&req, state, e, &emit).await,
        }
    }

    /// The stage machine proper; any error unwinds to `fail`
    async fn drive(
        &self,
        req: &PipelineRequest,
        state: &mut RunState,
        emit: &(dyn Fn(ProgressEvent) + Sync),
    ) -> ForgeResult<PipelineOutcome> {
        // ── Resolving ──
        emit(ProgressEvent::progress(
            PipelineStage::Resolving,
            "Resolving project identity",
        ));

        let cached_session = self.cache.load_session(&req.session_id).await;
        let ctx = ResolveContext {
            project_id: req.project_id.clone(),
            user_id: req.user_id.clone(),
            is_modification: req.is_modification,
            prompt: Some(req.prompt.clone()),
            archive_url: cached_session
                .as_ref()
                .and_then(|s| s.project_summary.as_ref())
                .and_then(|p| p.archive_url.clone()),
        };
        let resolution = self.resolver.resolve(&req.session_id, &req.build_id, &ctx).await?;
        let mut project = resolution.project;
        state.project_id = Some(project.id.clone());
        state.action = resolution.action;

        if resolution.action == ResolveAction::Duplicate {
            info!(project_id = %project.id, "Duplicate short-circuit, replaying prior result");
            return Ok(PipelineOutcome {
                project_id: Some(project.id),
                build_id: req.build_id.clone(),
                session_id: req.session_id.clone(),
                action: "updated".to_string(),
                archive_url: project.archive_url,
                download_url: project.download_url,
                deployment_url: project.deployment_url,
                duplicate: true,
                generation_succeeded: true,
                error: None,
            });
        }

        let mut session = cached_session
            .unwrap_or_else(|| SessionRecord::new(&req.session_id, &req.build_id));
        session.build_id = req.build_id.clone();
        session.touch();
        self.cache.store_session(&session).await;

        project.last_session_id = Some(req.session_id.clone());
        project.status = ProjectStatus::Generating;
        self.stores.projects.update(&project).await?;

        // ── Materializing ──
        emit(ProgressEvent::progress(
            PipelineStage::Materializing,
            "Preparing workspace",
        ));
        let prior_archive = self.fetch_prior_archive(&project).await;
        let workspace = Workspace::materialize(
            &self.config.workspace_root,
            &req.build_id,
            prior_archive,
            &self.config.template_dir,
        )
        .await?;
        session.workspace_path = Some(workspace.path().to_string_lossy().into_owned());
        session.touch();
        self.cache.store_session(&session).await;
        state.workspace = Some(workspace.clone());

        // ── Generating / Modifying ──
        emit(ProgressEvent::progress(
            PipelineStage::Generating,
            if req.is_modification {
                "Applying modification"
            } else {
                "Generating project files"
            },
        ));
        let (files, ast_outcome) = self.generate_files(req, &workspace, emit).await?;

        // ── Persisting ── (write_files already ran for the AST path)
        emit(ProgressEvent::progress(
            PipelineStage::Persisting,
            "Writing project files",
        ));
        workspace.write_files(&files).await?;

        let file_set = CachedFileSet::from_files(files.iter().map(|(p, c)| (p.clone(), c.clone())));
        self.cache.store_file_set(&req.session_id, &file_set).await;

        let entry = if req.is_modification {
            // An AST edit knows which files it touched vs. created and
            // by what approach; a full regeneration does not.
            match &ast_outcome {
                Some(outcome) => ChangeLogEntry::modification(
                    &req.prompt,
                    Some(outcome.approach.clone()),
                    outcome.selected_files.clone(),
                    outcome.added_files.clone(),
                    true,
                ),
                None => ChangeLogEntry::modification(
                    &req.prompt,
                    None,
                    files.keys().cloned().collect(),
                    Vec::new(),
                    true,
                ),
            }
        } else {
            ChangeLogEntry::generation(&req.prompt, files.keys().cloned().collect(), true)
        };
        self.cache.append_change(&req.session_id, &entry).await;

        project.status = ProjectStatus::Generated;
        self.stores.projects.update(&project).await?;
        state.generation_succeeded = true;

        // ── Packaging ──
        emit(ProgressEvent::progress(
            PipelineStage::Packaging,
            "Packaging workspace",
        ));
        let archive = workspace.pack().await?;

        // ── Building ──
        emit(ProgressEvent::progress(
            PipelineStage::Building,
            "Uploading archive and triggering remote build",
        ));
        let blob_name = format!("{}.zip", req.build_id);
        let archive_url = self
            .platform
            .upload(&self.config.storage_container, &blob_name, archive)
            .await?;
        // The archive URL lands on the record before the build runs:
        // a deploy failure still leaves a resumable project.
        project.archive_url = Some(archive_url.clone());
        project.status = ProjectStatus::Building;
        self.stores.projects.update(&project).await?;
        state.archive_url = Some(archive_url.clone());

        let build_config = serde_json::json!({
            "projectId": project.id,
            "projectName": project.name,
        });
        let build = self
            .platform
            .trigger_build(&archive_url, &req.build_id, &build_config)
            .await
            .map_err(|e| ForgeError::Build(e.to_string()))?;
        state.download_url = Some(build.download_url.clone());

        // ── Deploying ──
        emit(ProgressEvent::progress(
            PipelineStage::Deploying,
            "Deploying built artifact",
        ));
        project.status = ProjectStatus::Deploying;
        self.stores.projects.update(&project).await?;
        let deployment = self
            .platform
            .deploy(&build.download_url, &req.build_id)
            .await
            .map_err(|e| ForgeError::Deploy(e.to_string()))?;
        state.deployment_url = Some(deployment.preview_url.clone());

        // ── Finalizing ──
        emit(ProgressEvent::progress(
            PipelineStage::Finalizing,
            "Recording results",
        ));
        project.download_url = Some(build.download_url.clone());
        project.deployment_url = Some(deployment.preview_url.clone());
        project.status = ProjectStatus::Ready;
        project.message_count += 2;
        self.stores.projects.update(&project).await?;

        self.assembler
            .record_message(&req.session_id, MessageRole::User, &req.prompt)
            .await?;
        let reply = format!(
            "Generated {} files; deployed at {}",
            files.len(),
            deployment.preview_url
        );
        self.assembler
            .record_message(&req.session_id, MessageRole::Assistant, &reply)
            .await?;

        session.project_summary = Some(ProjectSummary {
            summary: format!("{}: {}", project.name, reply),
            archive_url: Some(archive_url.clone()),
            build_id: req.build_id.clone(),
        });
        session.touch();
        self.cache.store_session(&session).await;

        info!(project_id = %project.id, build_id = %req.build_id, "Pipeline completed");
        Ok(PipelineOutcome {
            project_id: Some(project.id),
            build_id: req.build_id.clone(),
            session_id: req.session_id.clone(),
            action: match state.action {
                ResolveAction::Created => "created",
                _ => "updated",
            }
            .to_string(),
            archive_url: Some(archive_url),
            download_url: Some(build.download_url),
            deployment_url: Some(deployment.preview_url),
            duplicate: false,
            generation_succeeded: true,
            error: None,
        })
    }

    /// Produce the generated file set, either via a targeted AST edit
    /// or by streaming a full generation and parsing it. The edit
    /// outcome rides along when the AST path won, so the change log
    /// can record the approach and the created-vs-modified split.
    async fn generate_files(
        &self,
        req: &PipelineRequest,
        workspace: &Workspace,
        emit: &(dyn Fn(ProgressEvent) + Sync),
    ) -> ForgeResult<(GeneratedFileSet, Option<AstEditOutcome>)> {
        let context = if req.is_modification {
            match self.assembler.get_context(&req.session_id).await {
                Ok(ctx) if !ctx.is_empty() => Some(ctx),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Context assembly failed, generating without context");
                    None
                }
            }
        } else {
            None
        };

        // Modifications first try the AST engine; anything short of a
        // confirmed success falls back to full regeneration.
        if req.is_modification {
            match self
                .ast
                .apply_edit(&req.prompt, workspace.path(), &req.session_id)
                .await
            {
                Ok(outcome) if outcome.success => {
                    info!(approach = %outcome.approach, "AST edit applied");
                    let files = self
                        .read_touched_files(workspace, &outcome.selected_files, &outcome.added_files)
                        .await?;
                    return Ok((files, Some(outcome)));
                }
                Ok(outcome) => {
                    warn!(error = ?outcome.error, "AST edit declined, regenerating in full");
                }
                Err(e) => {
                    warn!(error = %e, "AST engine unavailable, regenerating in full");
                }
            }
        }

        let mut stream = self
            .generation
            .generate(&req.prompt, context.as_deref())
            .await?;

        let mut accumulated = String::new();
        let mut pending = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            accumulated.push_str(&chunk);
            pending.push_str(&chunk);
            if pending.len() >= TEXT_EMIT_BYTES {
                emit(ProgressEvent::Text {
                    content: std::mem::take(&mut pending),
                });
            }
        }
        if !pending.is_empty() {
            emit(ProgressEvent::Text { content: pending });
        }

        // ── Parsing ──
        emit(ProgressEvent::progress(
            PipelineStage::Parsing,
            "Parsing generated output",
        ));
        Ok((parse_generated_files(&accumulated)?, None))
    }

    /// After an AST edit the workspace already holds the new content;
    /// read the touched files back so caching and packaging see them.
    async fn read_touched_files(
        &self,
        workspace: &Workspace,
        selected: &[String],
        added: &[String],
    ) -> ForgeResult<GeneratedFileSet> {
        let mut files = GeneratedFileSet::new();
        for rel in selected.iter().chain(added) {
            let path = workspace.path().join(rel);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    files.insert(rel.clone(), content);
                }
                Err(e) => {
                    warn!(file = rel.as_str(), error = %e, "Touched file unreadable, skipping");
                }
            }
        }
        if files.is_empty() {
            return Err(ForgeError::AstModification(
                "AST edit reported success but no touched files were readable".to_string(),
            ));
        }
        Ok(files)
    }

    async fn fetch_prior_archive(&self, project: &crate::models::ProjectRecord) -> Option<Vec<u8>> {
        let url = project.archive_url.as_deref()?;
        match self.platform.download(url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                // Materialization falls back to the blank template
                warn!(url = url, error = %e, "Prior archive download failed");
                None
            }
        }
    }

    /// Failure path: record the failure, clean up, emit a terminal
    /// error, and still hand back every identifier we have.
    async fn fail(
        &self,
        req: &PipelineRequest,
        state: RunState,
        err: ForgeError,
        emit: &(dyn Fn(ProgressEvent) + Sync),
    ) -> PipelineOutcome {
        error!(build_id = %req.build_id, session_id = %req.session_id, error = %err,
            "Pipeline failed");

        if let Some(project_id) = &state.project_id {
            if let Err(e) = self
                .stores
                .projects
                .set_status(project_id, ProjectStatus::Failed)
                .await
            {
                warn!(project_id = %project_id, error = %e, "Could not mark project failed");
            }
        }

        // The failure itself becomes a history entry
        let note = format!("Pipeline failed: {}", err);
        if let Err(e) = self
            .assembler
            .record_message(&req.session_id, MessageRole::Assistant, &note)
            .await
        {
            warn!(error = %e, "Could not record failure message");
        }

        let message = if err.is_post_generation() && state.generation_succeeded {
            format!("Generation succeeded but deployment failed: {}", err)
        } else {
            err.to_string()
        };

        emit(ProgressEvent::Error {
            message: message.clone(),
            project_id: state.project_id.clone(),
            build_id: req.build_id.clone(),
            session_id: req.session_id.clone(),
            generation_succeeded: state.generation_succeeded,
        });

        PipelineOutcome {
            project_id: state.project_id,
            build_id: req.build_id.clone(),
            session_id: req.session_id.clone(),
            action: match state.action {
                ResolveAction::Created => "created",
                _ => "updated",
            }
            .to_string(),
            archive_url: state.archive_url,
            download_url: state.download_url,
            deployment_url: state.deployment_url,
            duplicate: false,
            generation_succeeded: state.generation_succeeded,
            error: Some(message),
        }
    }

    /// Arm the force-cleanup timer. If the run does not cancel it in
    /// time, the workspace is deleted, the session association is
    /// released, and consumers get their terminal event.
    fn arm_cleanup_timer(
        &self,
        req: &PipelineRequest,
        events: broadcast::Sender<ProgressEvent>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        let path = self.config.workspace_path(&req.build_id);
        let timeout = self.config.cleanup_timeout;
        let cache = self.cache.clone();
        let session_id = req.session_id.clone();
        let build_id = req.build_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!(build_id = %build_id, "Cleanup timer fired, force-removing workspace");
                    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            error!(error = %e, "Forced workspace removal failed");
                        }
                    }
                    if let Some(mut session) = cache.load_session(&session_id).await {
                        session.workspace_path = None;
                        cache.store_session(&session).await;
                    }
                    let _ = events.send(ProgressEvent::Error {
                        message: "Pipeline timed out; workspace reclaimed".to_string(),
                        project_id: None,
                        build_id,
                        session_id,
                        generation_succeeded: false,
                    });
                }
            }
        });

        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySessionCache;
    use crate::context::HeuristicSummarizer;
    use crate::engine::{AstEditOutcome, BuildResult, ChunkStream, DeployResult};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    enum EngineMode {
        Chunks(Vec<String>),
        Garbage,
        Hang,
    }

    struct FakeEngine {
        mode: EngineMode,
        calls: AtomicUsize,
    }

    impl FakeEngine {
        fn fenced(files: &[(&str, &str)]) -> Self {
            let mut map = serde_json::Map::new();
            for (p, c) in files {
                map.insert(p.to_string(), serde_json::Value::String(c.to_string()));
            }
            let payload = serde_json::json!({ "codeFiles": map }).to_string();
            let raw = format!("```json\n{}\n```", payload);
            // Split into chunks to exercise stream accumulation
            let mid = raw.len() / 2;
            Self {
                mode: EngineMode::Chunks(vec![raw[..mid].to_string(), raw[mid..].to_string()]),
                calls: AtomicUsize::new(0),
            }
        }

        fn garbage() -> Self {
            Self {
                mode: EngineMode::Garbage,
                calls: AtomicUsize::new(0),
            }
        }

        fn hanging() -> Self {
            Self {
                mode: EngineMode::Hang,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationEngine for FakeEngine {
        async fn generate(&self, _prompt: &str, _context: Option<&str>) -> ForgeResult<ChunkStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.mode {
                EngineMode::Chunks(chunks) => {
                    let items: Vec<ForgeResult<String>> =
                        chunks.iter().cloned().map(Ok).collect();
                    Ok(futures::stream::iter(items).boxed())
                }
                EngineMode::Garbage => Ok(futures::stream::iter(vec![Ok(
                    "I cannot produce a website today.".to_string(),
                )])
                .boxed()),
                EngineMode::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct DecliningAst;

    #[async_trait]
    impl AstEngine for DecliningAst {
        async fn apply_edit(
            &self,
            _prompt: &str,
            _workspace_path: &std::path::Path,
            _session_id: &str,
        ) -> ForgeResult<AstEditOutcome> {
            Ok(AstEditOutcome {
                success: false,
                approach: "none".to_string(),
                selected_files: Vec::new(),
                added_files: Vec::new(),
                modified_ranges: 0,
                reasoning: "declined".to_string(),
                error: None,
            })
        }
    }

    /// Edits the workspace in place and reports a confirmed success,
    /// the way the real AST service does for a targeted change
    struct TargetedAst;

    #[async_trait]
    impl AstEngine for TargetedAst {
        async fn apply_edit(
            &self,
            _prompt: &str,
            workspace_path: &std::path::Path,
            _session_id: &str,
        ) -> ForgeResult<AstEditOutcome> {
            tokio::fs::write(
                workspace_path.join("index.html"),
                "<h1 style=\"color: blue\">bakery</h1>",
            )
            .await
            .unwrap();
            tokio::fs::write(workspace_path.join("about.html"), "<p>our story</p>")
                .await
                .unwrap();
            Ok(AstEditOutcome {
                success: true,
                approach: "targeted_nodes".to_string(),
                selected_files: vec!["index.html".to_string()],
                added_files: vec!["about.html".to_string()],
                modified_ranges: 1,
                reasoning: "recolored the heading, added an about page".to_string(),
                error: None,
            })
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        uploads: Mutex<Vec<String>>,
        downloads: Mutex<Vec<String>>,
        stored_archive: Mutex<Option<Vec<u8>>>,
        build_config: Mutex<Option<serde_json::Value>>,
        fail_deploy: bool,
    }

    #[async_trait]
    impl BuildPlatform for FakePlatform {
        async fn upload(
            &self,
            container: &str,
            blob_name: &str,
            bytes: Vec<u8>,
        ) -> ForgeResult<String> {
            *self.stored_archive.lock().unwrap() = Some(bytes);
            let url = format!("https://storage.test/{}/{}", container, blob_name);
            self.uploads.lock().unwrap().push(url.clone());
            Ok(url)
        }

        async fn download(&self, url: &str) -> ForgeResult<Vec<u8>> {
            self.downloads.lock().unwrap().push(url.to_string());
            self.stored_archive
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ForgeError::Platform("no archive stored".to_string()))
        }

        async fn trigger_build(
            &self,
            source_url: &str,
            build_id: &str,
            config: &serde_json::Value,
        ) -> ForgeResult<BuildResult> {
            assert!(source_url.starts_with("https://storage.test/"));
            *self.build_config.lock().unwrap() = Some(config.clone());
            Ok(BuildResult {
                download_url: format!("https://storage.test/built/{}.zip", build_id),
            })
        }

        async fn deploy(&self, _built_url: &str, build_id: &str) -> ForgeResult<DeployResult> {
            if self.fail_deploy {
                return Err(ForgeError::Deploy("hosting quota exceeded".to_string()));
            }
            Ok(DeployResult {
                preview_url: format!("https://{}.preview.test", build_id),
                download_url: None,
            })
        }
    }

    /// Cache double that stores nothing and finds nothing
    struct NullCache;

    #[async_trait]
    impl SessionCache for NullCache {
        async fn put(&self, _: &str, _: &str, _: &serde_json::Value, _: crate::cache::TtlClass) {}
        async fn get(&self, _: &str, _: &str) -> Option<serde_json::Value> {
            None
        }
        async fn append_to_list(
            &self,
            _: &str,
            _: &str,
            _: serde_json::Value,
            _: crate::cache::TtlClass,
        ) {
        }
        async fn exists(&self, _: &str, _: &str) -> bool {
            false
        }
        async fn clear_scope(&self, _: &str) {}
    }

    struct Harness {
        orchestrator: Orchestrator,
        stores: Stores,
        cache: Arc<MemorySessionCache>,
        engine: Arc<FakeEngine>,
        platform: Arc<FakePlatform>,
        _root: TempDir,
        _template: TempDir,
    }

    fn harness_with_ast(
        engine: FakeEngine,
        platform: FakePlatform,
        ast: Arc<dyn AstEngine>,
    ) -> Harness {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join("index.html"), "<html></html>").unwrap();

        let stores = MemoryStore::stores();
        let cache = Arc::new(MemorySessionCache::default());
        let engine = Arc::new(engine);
        let platform = Arc::new(platform);
        let orchestrator = Orchestrator::new(
            stores.clone(),
            cache.clone(),
            engine.clone(),
            ast,
            platform.clone(),
            Arc::new(HeuristicSummarizer),
            PipelineConfig {
                workspace_root: root.path().to_path_buf(),
                template_dir: template.path().to_path_buf(),
                storage_container: "archives".to_string(),
                cleanup_timeout: Duration::from_secs(300),
            },
        );
        Harness {
            orchestrator,
            stores,
            cache,
            engine,
            platform,
            _root: root,
            _template: template,
        }
    }

    fn harness_with(engine: FakeEngine, platform: FakePlatform) -> Harness {
        harness_with_ast(engine, platform, Arc::new(DecliningAst))
    }

    fn harness() -> Harness {
        harness_with(
            FakeEngine::fenced(&[("index.html", "<h1>bakery</h1>"), ("style.css", "h1{}")]),
            FakePlatform::default(),
        )
    }

    fn request(session: &str, build: &str) -> PipelineRequest {
        PipelineRequest {
            session_id: session.to_string(),
            build_id: build.to_string(),
            prompt: "a bakery landing page".to_string(),
            user_id: None,
            project_id: None,
            is_modification: false,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn happy_path_generates_builds_and_deploys() {
        let h = harness();
        let (tx, mut rx) = broadcast::channel(128);

        let outcome = h.orchestrator.run(request("s1", "b1"), tx).await;

        assert!(outcome.error.is_none());
        assert!(!outcome.duplicate);
        assert_eq!(outcome.action, "created");
        let project_id = outcome.project_id.clone().unwrap();
        assert_eq!(
            outcome.deployment_url.as_deref(),
            Some("https://b1.preview.test")
        );

        let project = h.stores.projects.get(&project_id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Ready);
        assert!(project.is_fully_deployed());
        assert_eq!(project.message_count, 2);

        // Workspace removed on the happy path
        assert!(!h._root.path().join("siteforge-b1").exists());

        // File set and change log cached for the session
        let cached = h.cache.load_file_set("s1").await.unwrap();
        assert_eq!(cached.len(), 2);
        let changes = h.cache.load_changes("s1").await;
        assert_eq!(changes.len(), 1);
        assert!(changes[0].success);

        // Consumers saw progress and a terminal complete
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.event_type() == "progress"));
        let last = events.last().unwrap();
        assert_eq!(last.event_type(), "complete");

        // The build service received the project's config
        let config = h.platform.build_config.lock().unwrap().clone().unwrap();
        assert_eq!(
            config.get("projectId").and_then(|v| v.as_str()),
            Some(project_id.as_str())
        );
        assert!(config.get("projectName").is_some());
    }

    #[tokio::test]
    async fn second_request_after_ready_short_circuits() {
        let h = harness();
        let (tx, _rx) = broadcast::channel(128);
        let first = h.orchestrator.run(request("s1", "b1"), tx).await;
        let p1 = first.project_id.clone().unwrap();
        assert_eq!(h.engine.call_count(), 1);

        // Same session, immediately after reaching ready
        let (tx2, _rx2) = broadcast::channel(128);
        let second = h.orchestrator.run(request("s1", "b2"), tx2).await;

        assert!(second.duplicate);
        assert_eq!(second.project_id.as_deref(), Some(p1.as_str()));
        assert_eq!(second.deployment_url, first.deployment_url);
        // Generation never re-ran
        assert_eq!(h.engine.call_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_output_fails_run_and_cleans_up() {
        let h = harness_with(FakeEngine::garbage(), FakePlatform::default());
        let (tx, mut rx) = broadcast::channel(128);

        let outcome = h.orchestrator.run(request("s1", "b1"), tx).await;

        assert!(outcome.error.is_some());
        assert!(!outcome.generation_succeeded);
        // Identifiers survive failure
        assert_eq!(outcome.build_id, "b1");
        assert_eq!(outcome.session_id, "s1");
        let project_id = outcome.project_id.unwrap();
        let project = h.stores.projects.get(&project_id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);

        assert!(!h._root.path().join("siteforge-b1").exists());

        let events = drain(&mut rx);
        assert_eq!(events.last().unwrap().event_type(), "error");

        // The failure landed in conversation history
        let messages = h
            .stores
            .conversations
            .recent_messages("s1", 10)
            .await
            .unwrap();
        assert!(messages.iter().any(|m| m.content.contains("Pipeline failed")));
    }

    #[tokio::test]
    async fn deploy_failure_preserves_generation_result() {
        let h = harness_with(
            FakeEngine::fenced(&[("index.html", "<h1>x</h1>")]),
            FakePlatform {
                fail_deploy: true,
                ..Default::default()
            },
        );
        let (tx, _rx) = broadcast::channel(128);

        let outcome = h.orchestrator.run(request("s1", "b1"), tx).await;

        assert!(outcome.generation_succeeded);
        assert!(outcome.archive_url.is_some());
        assert!(outcome.download_url.is_some());
        assert!(outcome.deployment_url.is_none());
        let message = outcome.error.unwrap();
        assert!(message.contains("Generation succeeded but deployment failed"));

        // The archive URL was persisted before the deploy attempt
        let project_id = outcome.project_id.unwrap();
        let project = h.stores.projects.get(&project_id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert!(project.archive_url.is_some());
    }

    #[tokio::test]
    async fn modification_downloads_prior_archive() {
        let h = harness();
        let (tx, _rx) = broadcast::channel(128);
        let first = h.orchestrator.run(request("s1", "b1"), tx).await;
        assert!(first.error.is_none());

        // Let the short-circuit window lapse
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let mut req = request("s1", "b2");
        req.is_modification = true;
        req.prompt = "make the heading blue".to_string();
        let (tx2, _rx2) = broadcast::channel(128);
        let second = h.orchestrator.run(req, tx2).await;

        assert!(second.error.is_none());
        assert_eq!(second.action, "updated");
        assert_eq!(second.project_id, first.project_id);
        // The prior archive seeded the modification workspace
        assert_eq!(h.platform.downloads.lock().unwrap().len(), 1);
        // Two pipeline runs, one project
        let changes = h.cache.load_changes("s1").await;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].change_type, "modification");
    }

    #[tokio::test]
    async fn ast_edit_success_records_approach_and_skips_regeneration() {
        let h = harness_with_ast(
            FakeEngine::fenced(&[("index.html", "<h1>bakery</h1>")]),
            FakePlatform::default(),
            Arc::new(TargetedAst),
        );
        let (tx, _rx) = broadcast::channel(128);
        let first = h.orchestrator.run(request("s1", "b1"), tx).await;
        assert!(first.error.is_none());
        assert_eq!(h.engine.call_count(), 1);

        // Let the short-circuit window lapse
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let mut req = request("s1", "b2");
        req.is_modification = true;
        req.prompt = "make the heading blue".to_string();
        let (tx2, _rx2) = broadcast::channel(128);
        let second = h.orchestrator.run(req, tx2).await;

        assert!(second.error.is_none());
        assert_eq!(second.project_id, first.project_id);
        // The targeted edit satisfied the request without a second
        // full generation
        assert_eq!(h.engine.call_count(), 1);

        // The edit outcome's metadata reached the change log
        let changes = h.cache.load_changes("s1").await;
        assert_eq!(changes.len(), 2);
        let edit = &changes[1];
        assert_eq!(edit.change_type, "modification");
        assert_eq!(edit.approach.as_deref(), Some("targeted_nodes"));
        assert_eq!(edit.files_modified, vec!["index.html".to_string()]);
        assert_eq!(edit.files_created, vec!["about.html".to_string()]);

        // The cached file set holds the post-edit content, including
        // the file the edit added
        let cached = h.cache.load_file_set("s1").await.unwrap();
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn disabled_cache_produces_same_project_record() {
        // Warm-cache run
        let cached = harness();
        let (tx, _rx) = broadcast::channel(128);
        let with_cache = cached.orchestrator.run(request("s1", "b1"), tx).await;

        // Identical run against a cache that stores nothing
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join("index.html"), "<html></html>").unwrap();
        let stores = MemoryStore::stores();
        let orchestrator = Orchestrator::new(
            stores.clone(),
            Arc::new(NullCache),
            Arc::new(FakeEngine::fenced(&[
                ("index.html", "<h1>bakery</h1>"),
                ("style.css", "h1{}"),
            ])),
            Arc::new(DecliningAst),
            Arc::new(FakePlatform::default()),
            Arc::new(HeuristicSummarizer),
            PipelineConfig {
                workspace_root: root.path().to_path_buf(),
                template_dir: template.path().to_path_buf(),
                storage_container: "archives".to_string(),
                cleanup_timeout: Duration::from_secs(300),
            },
        );
        let (tx2, _rx2) = broadcast::channel(128);
        let without_cache = orchestrator.run(request("s1", "b1"), tx2).await;

        assert!(without_cache.error.is_none());
        // Same terminal record modulo the generated project id
        let a = cached
            .stores
            .projects
            .get(with_cache.project_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        let b = stores
            .projects
            .get(without_cache.project_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.status, b.status);
        assert_eq!(a.name, b.name);
        assert_eq!(a.archive_url, b.archive_url);
        assert_eq!(a.deployment_url, b.deployment_url);
        assert_eq!(a.message_count, b.message_count);
    }

    #[tokio::test]
    async fn cleanup_timer_reclaims_hung_pipeline() {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join("index.html"), "x").unwrap();

        let stores = MemoryStore::stores();
        let cache = Arc::new(MemorySessionCache::default());
        let orchestrator = Arc::new(Orchestrator::new(
            stores,
            cache,
            Arc::new(FakeEngine::hanging()),
            Arc::new(DecliningAst),
            Arc::new(FakePlatform::default()),
            Arc::new(HeuristicSummarizer),
            PipelineConfig {
                workspace_root: root.path().to_path_buf(),
                template_dir: template.path().to_path_buf(),
                storage_container: "archives".to_string(),
                cleanup_timeout: Duration::from_millis(100),
            },
        ));

        let (tx, mut rx) = broadcast::channel(128);
        let runner = {
            let orchestrator = orchestrator.clone();
            let tx = tx.clone();
            tokio::spawn(async move { orchestrator.run(request("s1", "b1"), tx).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Timer fired: workspace reclaimed, terminal error emitted
        assert!(!root.path().join("siteforge-b1").exists());
        let events = drain(&mut rx);
        let terminal = events
            .iter()
            .find(|e| e.is_terminal())
            .expect("timer must emit a terminal event");
        assert_eq!(terminal.event_type(), "error");

        runner.abort();
    }
}
