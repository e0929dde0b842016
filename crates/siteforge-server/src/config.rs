//! Configuration management for the siteforge server

use std::str::FromStr;

use anyhow::Result;
use serde::Deserialize;

/// Store backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    MongoDB,
    /// Single-process in-memory backend for dev and tests. State does
    /// not survive a restart and cannot be shared across replicas.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(StoreBackend::MongoDB),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            _ => Err(format!("Unknown store backend: {}", s)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Store backend (default: mongodb)
    #[serde(default)]
    pub store_backend: StoreBackend,

    /// Server host (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port (default: 3030)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database URL (default: mongodb://localhost:27017)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Database name (default: siteforge)
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Root directory for per-run workspace isolation
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,

    /// Blank project template copied into fresh workspaces
    #[serde(default = "default_template_dir")]
    pub template_dir: String,

    /// Object storage container for source archives
    #[serde(default = "default_storage_container")]
    pub storage_container: String,

    /// Force-cleanup timer for wedged pipeline runs, in seconds
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,

    /// Generation engine endpoint (OpenAI-compatible chat completions)
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Generation engine API key
    pub engine_api_key: Option<String>,

    /// Generation engine model name
    #[serde(default = "default_engine_model")]
    pub engine_model: String,

    /// AST modification engine base URL
    #[serde(default = "default_ast_engine_url")]
    pub ast_engine_url: String,

    /// Build/deploy platform base URL
    #[serde(default = "default_platform_url")]
    pub platform_url: String,

    /// Build/deploy platform API key
    pub platform_api_key: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_database_url() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database_name() -> String {
    "siteforge".to_string()
}

fn default_workspace_root() -> String {
    "./data/workspaces".to_string()
}

fn default_template_dir() -> String {
    "./data/template".to_string()
}

fn default_storage_container() -> String {
    "site-archives".to_string()
}

fn default_cleanup_timeout_secs() -> u64 {
    5 * 60
}

fn default_engine_url() -> String {
    "http://localhost:4000/v1/chat/completions".to_string()
}

fn default_engine_model() -> String {
    "gpt-4o".to_string()
}

fn default_ast_engine_url() -> String {
    "http://localhost:4100".to_string()
}

fn default_platform_url() -> String {
    "http://localhost:4200".to_string()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let store_backend = match std::env::var("STORE_BACKEND") {
            Ok(raw) => raw
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,
            Err(_) => StoreBackend::default(),
        };
        let host = std::env::var("SITEFORGE_HOST").unwrap_or_else(|_| default_host());
        let port = std::env::var("SITEFORGE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_port);
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("MONGODB_URL"))
            .unwrap_or_else(|_| default_database_url());
        let database_name = std::env::var("DATABASE_NAME")
            .or_else(|_| std::env::var("MONGODB_DATABASE"))
            .unwrap_or_else(|_| default_database_name());
        let workspace_root =
            std::env::var("WORKSPACE_ROOT").unwrap_or_else(|_| default_workspace_root());
        let template_dir = std::env::var("TEMPLATE_DIR").unwrap_or_else(|_| default_template_dir());
        let storage_container =
            std::env::var("STORAGE_CONTAINER").unwrap_or_else(|_| default_storage_container());
        let cleanup_timeout_secs = std::env::var("CLEANUP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_cleanup_timeout_secs);
        let engine_url = std::env::var("ENGINE_URL").unwrap_or_else(|_| default_engine_url());
        let engine_api_key = std::env::var("ENGINE_API_KEY").ok();
        let engine_model = std::env::var("ENGINE_MODEL").unwrap_or_else(|_| default_engine_model());
        let ast_engine_url =
            std::env::var("AST_ENGINE_URL").unwrap_or_else(|_| default_ast_engine_url());
        let platform_url = std::env::var("PLATFORM_URL").unwrap_or_else(|_| default_platform_url());
        let platform_api_key = std::env::var("PLATFORM_API_KEY").ok();

        Ok(Self {
            store_backend,
            host,
            port,
            database_url,
            database_name,
            workspace_root,
            template_dir,
            storage_container,
            cleanup_timeout_secs,
            engine_url,
            engine_api_key,
            engine_model,
            ast_engine_url,
            platform_url,
            platform_api_key,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::default(),
            host: default_host(),
            port: default_port(),
            database_url: default_database_url(),
            database_name: default_database_name(),
            workspace_root: default_workspace_root(),
            template_dir: default_template_dir(),
            storage_container: default_storage_container(),
            cleanup_timeout_secs: default_cleanup_timeout_secs(),
            engine_url: default_engine_url(),
            engine_api_key: None,
            engine_model: default_engine_model(),
            ast_engine_url: default_ast_engine_url(),
            platform_url: default_platform_url(),
            platform_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_aliases() {
        assert_eq!("mongo".parse::<StoreBackend>(), Ok(StoreBackend::MongoDB));
        assert_eq!("Memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.port, 3030);
        assert_eq!(config.store_backend, StoreBackend::MongoDB);
        assert_eq!(config.cleanup_timeout_secs, 300);
    }
}
