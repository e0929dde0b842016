//! In-memory session cache
//!
//! Single-process twin of the Mongo cache, used by the memory backend
//! and the test suite. Entries carry an Instant deadline checked on
//! read; there is no background reaper, expired entries are dropped
//! lazily.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use super::{SessionCache, TtlClass, TtlConfig};

struct Entry {
    value: serde_json::Value,
    deadline: Instant,
}

/// Mutex-guarded map cache for dev and test deployments
pub struct MemorySessionCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
    ttl: TtlConfig,
}

impl MemorySessionCache {
    pub fn new(ttl: TtlConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn key(scope: &str, key: &str) -> (String, String) {
        (scope.to_string(), key.to_string())
    }

    /// Cache access must never panic; a poisoned lock just hands the
    /// map back, worst case a stale entry that TTL checks drop anyway.
    fn entries(&self) -> MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySessionCache {
    fn default() -> Self {
        Self::new(TtlConfig::default())
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn put(&self, scope: &str, key: &str, value: &serde_json::Value, ttl: TtlClass) {
        let deadline = Instant::now() + self.ttl.duration(ttl);
        let mut entries = self.entries();
        entries.insert(
            Self::key(scope, key),
            Entry {
                value: value.clone(),
                deadline,
            },
        );
    }

    async fn get(&self, scope: &str, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries();
        let k = Self::key(scope, key);
        match entries.get(&k) {
            Some(entry) if entry.deadline > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&k);
                None
            }
            None => None,
        }
    }

    async fn append_to_list(&self, scope: &str, key: &str, item: serde_json::Value, ttl: TtlClass) {
        let deadline = Instant::now() + self.ttl.duration(ttl);
        let mut entries = self.entries();
        let k = Self::key(scope, key);
        let mut list = match entries.get(&k) {
            Some(entry) if entry.deadline > Instant::now() => entry
                .value
                .as_array()
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        list.push(item);
        entries.insert(
            k,
            Entry {
                value: serde_json::Value::Array(list),
                deadline,
            },
        );
    }

    async fn exists(&self, scope: &str, key: &str) -> bool {
        self.get(scope, key).await.is_some()
    }

    async fn clear_scope(&self, scope: &str) {
        let mut entries = self.entries();
        entries.retain(|(s, _), _| s != scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SessionCacheExt;
    use crate::models::ChangeLogEntry;
    use std::time::Duration;

    fn short_ttl_cache() -> MemorySessionCache {
        MemorySessionCache::new(TtlConfig {
            default: Duration::from_millis(20),
            file_set: Duration::from_millis(60),
            session: Duration::from_millis(40),
        })
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let cache = MemorySessionCache::default();
        let value = serde_json::json!({"a": 1});
        cache.put("s", "k", &value, TtlClass::Default).await;
        assert_eq!(cache.get("s", "k").await, Some(value));
        assert!(cache.exists("s", "k").await);
        assert!(!cache.exists("s", "other").await);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = short_ttl_cache();
        cache
            .put("s", "k", &serde_json::json!(1), TtlClass::Default)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("s", "k").await, None);
    }

    #[tokio::test]
    async fn write_refreshes_ttl() {
        let cache = short_ttl_cache();
        cache
            .put("s", "k", &serde_json::json!(1), TtlClass::Default)
            .await;
        tokio::time::sleep(Duration::from_millis(12)).await;
        cache
            .put("s", "k", &serde_json::json!(2), TtlClass::Default)
            .await;
        tokio::time::sleep(Duration::from_millis(12)).await;
        // 24ms after the first write but only 12ms after the refresh
        assert_eq!(cache.get("s", "k").await, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn append_preserves_insertion_order() {
        let cache = MemorySessionCache::default();
        for i in 0..5 {
            cache
                .append_to_list("s", "log", serde_json::json!(i), TtlClass::Session)
                .await;
        }
        let list = cache.get("s", "log").await.unwrap();
        let list = list.as_array().unwrap();
        let values: Vec<i64> = list.iter().map(|v| v.as_i64().unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn clear_scope_only_touches_that_scope() {
        let cache = MemorySessionCache::default();
        cache
            .put("s1", "k", &serde_json::json!(1), TtlClass::Default)
            .await;
        cache
            .put("s2", "k", &serde_json::json!(2), TtlClass::Default)
            .await;
        cache.clear_scope("s1").await;
        assert!(!cache.exists("s1", "k").await);
        assert!(cache.exists("s2", "k").await);
    }

    #[tokio::test]
    async fn analysis_is_reused_by_content_digest() {
        let cache = MemorySessionCache::default();
        let digest = crate::cache::content_hash(b"const a = 1;");
        let analysis = serde_json::json!({"imports": [], "exports": ["a"]});
        cache.store_analysis(&digest, &analysis).await;

        // Same content hashed again finds the stored analysis
        let digest_again = crate::cache::content_hash(b"const a = 1;");
        assert_eq!(cache.load_analysis(&digest_again).await, Some(analysis));
    }

    #[tokio::test]
    async fn poisoned_lock_degrades_instead_of_panicking() {
        let cache = std::sync::Arc::new(MemorySessionCache::default());
        cache
            .put("s", "k", &serde_json::json!(1), TtlClass::Default)
            .await;

        // Panic while holding the guard to poison the lock
        let poisoner = cache.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries();
            panic!("poisoning the cache lock");
        })
        .join();

        // Reads and writes keep working against the recovered map
        assert_eq!(cache.get("s", "k").await, Some(serde_json::json!(1)));
        cache
            .put("s", "k2", &serde_json::json!(2), TtlClass::Default)
            .await;
        assert!(cache.exists("s", "k2").await);
    }

    #[tokio::test]
    async fn change_log_round_trips_typed() {
        let cache = MemorySessionCache::default();
        let entry = ChangeLogEntry::generation("initial site", vec!["index.html".into()], true);
        cache.append_change("s1", &entry).await;
        let changes = cache.load_changes("s1").await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, "generation");
        assert!(changes[0].success);
    }
}
