//! Session cache service
//!
//! TTL-keyed store for project file snapshots, modification change
//! logs, parse-result caches, and arbitrary session-scoped blobs.
//! Every server replica reads and writes the same cache, so any
//! instance can pick up an in-flight session.
//!
//! Failure semantics: the cache is never load-bearing. A failed read
//! reports absent, a failed write is logged and dropped, and the
//! pipeline recomputes or rehydrates from the persistent store.

mod memory;
mod mongo;

pub use memory::MemorySessionCache;
pub use mongo::MongoSessionCache;

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::models::{CachedFileSet, ChangeLogEntry, SessionRecord};

/// TTL class for a cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Generic blobs, shortest-lived
    Default,
    /// Project file snapshots; files are expensive to re-fetch so they
    /// outlive the session record itself
    FileSet,
    /// Session records and change logs; bounds log growth
    Session,
}

/// TTL durations per class
#[derive(Debug, Clone, Copy)]
pub struct TtlConfig {
    pub default: Duration,
    pub file_set: Duration,
    pub session: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(15 * 60),
            file_set: Duration::from_secs(2 * 60 * 60),
            session: Duration::from_secs(30 * 60),
        }
    }
}

impl TtlConfig {
    pub fn duration(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Default => self.default,
            TtlClass::FileSet => self.file_set,
            TtlClass::Session => self.session,
        }
    }
}

/// Shared TTL-keyed session cache.
///
/// All writes refresh the entry's TTL, so an active session never
/// expires mid-pipeline. Implementations must not surface transport
/// errors: reads degrade to absent, writes are best-effort.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Write a value, resetting its TTL
    async fn put(&self, scope: &str, key: &str, value: &serde_json::Value, ttl: TtlClass);

    /// Read a value; absent on miss, expiry, or cache failure
    async fn get(&self, scope: &str, key: &str) -> Option<serde_json::Value>;

    /// Append an item to a list value (read-modify-write with a
    /// refreshed TTL). Within one session, writers are serialized by
    /// the orchestrator; cross-session writes never share a key.
    async fn append_to_list(&self, scope: &str, key: &str, item: serde_json::Value, ttl: TtlClass);

    /// Whether a live entry exists
    async fn exists(&self, scope: &str, key: &str) -> bool;

    /// Drop every entry in a scope
    async fn clear_scope(&self, scope: &str);
}

/// Cache key layout. Other components must construct keys only through
/// these helpers so the namespacing convention holds everywhere.
pub mod keys {
    pub const PROJECT_FILES: &str = "project_files";
    pub const MOD_CHANGES: &str = "mod_changes";
    pub const SESSION_RECORD: &str = "record";

    pub fn session_scope(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    pub fn ast_analysis(file_hash: &str) -> String {
        format!("ast_analysis:{}", file_hash)
    }

    pub fn build(build_id: &str) -> String {
        format!("build:{}", build_id)
    }
}

/// Content digest for content-addressed reuse of derived artifacts.
/// Deterministic sha256, hex-encoded. Not a security boundary.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

fn to_json<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "Failed to serialize cache value, dropping write");
            None
        }
    }
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "Cached value failed to deserialize, treating as miss");
            None
        }
    }
}

/// Typed convenience layer over the raw cache contract
#[async_trait]
pub trait SessionCacheExt: SessionCache {
    async fn store_session(&self, record: &SessionRecord) {
        if let Some(value) = to_json(record) {
            let scope = keys::session_scope(&record.session_id);
            self.put(&scope, keys::SESSION_RECORD, &value, TtlClass::Session)
                .await;
        }
    }

    async fn load_session(&self, session_id: &str) -> Option<SessionRecord> {
        let scope = keys::session_scope(session_id);
        self.get(&scope, keys::SESSION_RECORD).await.and_then(from_json)
    }

    async fn store_file_set(&self, session_id: &str, files: &CachedFileSet) {
        if let Some(value) = to_json(files) {
            self.put(keys::PROJECT_FILES, session_id, &value, TtlClass::FileSet)
                .await;
        }
    }

    async fn load_file_set(&self, session_id: &str) -> Option<CachedFileSet> {
        self.get(keys::PROJECT_FILES, session_id)
            .await
            .and_then(from_json)
    }

    async fn append_change(&self, session_id: &str, entry: &ChangeLogEntry) {
        if let Some(value) = to_json(entry) {
            self.append_to_list(keys::MOD_CHANGES, session_id, value, TtlClass::Session)
                .await;
        }
    }

    async fn load_changes(&self, session_id: &str) -> Vec<ChangeLogEntry> {
        self.get(keys::MOD_CHANGES, session_id)
            .await
            .and_then(from_json)
            .unwrap_or_default()
    }

    /// Store a derived analysis keyed by the content digest of the file
    /// it was computed from
    async fn store_analysis(&self, file_hash: &str, analysis: &serde_json::Value) {
        self.put(&keys::ast_analysis(file_hash), "result", analysis, TtlClass::Default)
            .await;
    }

    async fn load_analysis(&self, file_hash: &str) -> Option<serde_json::Value> {
        self.get(&keys::ast_analysis(file_hash), "result").await
    }
}

impl<C: SessionCache + ?Sized> SessionCacheExt for C {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        let a = content_hash(b"export default {}");
        let b = content_hash(b"export default {}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn content_hash_distinguishes_content() {
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }

    #[test]
    fn key_helpers_follow_layout() {
        assert_eq!(keys::session_scope("s1"), "session:s1");
        assert_eq!(keys::ast_analysis("abc"), "ast_analysis:abc");
        assert_eq!(keys::build("b1"), "build:b1");
    }
}
