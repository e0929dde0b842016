//! Shared application state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use siteforge::cache::{MemorySessionCache, MongoSessionCache, SessionCache, TtlConfig};
use siteforge::context::{ContextAssembler, HeuristicSummarizer, Summarizer};
use siteforge::engine::{HttpAstEngine, HttpBuildPlatform, HttpGenerationEngine};
use siteforge::pipeline::{Orchestrator, PipelineConfig};
use siteforge::store::{MemoryStore, MongoStore, Stores};
use siteforge::MongoDb;
use tracing::info;

use crate::config::{Config, StoreBackend};
use crate::runs::RunManager;

pub struct AppState {
    pub config: Config,
    pub stores: Stores,
    pub cache: Arc<dyn SessionCache>,
    /// Present only on the MongoDB backend; used by the health check
    pub db: Option<MongoDb>,
    pub orchestrator: Arc<Orchestrator>,
    pub assembler: ContextAssembler,
    pub runs: Arc<RunManager>,
}

impl AppState {
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let (stores, cache, db): (Stores, Arc<dyn SessionCache>, Option<MongoDb>) =
            match config.store_backend {
                StoreBackend::MongoDB => {
                    let db = MongoDb::connect(&config.database_url, &config.database_name).await?;
                    let cache: Arc<dyn SessionCache> =
                        Arc::new(MongoSessionCache::new(db.clone(), TtlConfig::default()));
                    (MongoStore::stores(db.clone()), cache, Some(db))
                }
                StoreBackend::Memory => {
                    info!("Using in-memory store backend; state will not survive a restart");
                    let cache: Arc<dyn SessionCache> = Arc::new(MemorySessionCache::default());
                    (MemoryStore::stores(), cache, None)
                }
            };

        let generation = Arc::new(HttpGenerationEngine::new(
            &config.engine_url,
            config.engine_api_key.clone(),
            &config.engine_model,
        ));
        let ast = Arc::new(HttpAstEngine::new(&config.ast_engine_url));
        let platform = Arc::new(HttpBuildPlatform::new(
            &config.platform_url,
            config.platform_api_key.clone(),
        ));
        let summarizer: Arc<dyn Summarizer> = Arc::new(HeuristicSummarizer);

        let pipeline_config = PipelineConfig {
            workspace_root: PathBuf::from(&config.workspace_root),
            template_dir: PathBuf::from(&config.template_dir),
            storage_container: config.storage_container.clone(),
            cleanup_timeout: Duration::from_secs(config.cleanup_timeout_secs),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            stores.clone(),
            cache.clone(),
            generation,
            ast,
            platform,
            summarizer.clone(),
            pipeline_config,
        ));

        let assembler =
            ContextAssembler::new(stores.conversations.clone(), cache.clone(), summarizer);

        Ok(Arc::new(Self {
            config,
            stores,
            cache,
            db,
            orchestrator,
            assembler,
            runs: Arc::new(RunManager::new()),
        }))
    }
}
