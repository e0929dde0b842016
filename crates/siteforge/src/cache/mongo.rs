//! MongoDB-backed session cache
//!
//! One document per (scope, key) in the `session_cache` collection.
//! The `expires_at` field is refreshed on every write and reaped by a
//! TTL index (see `MongoDb::ensure_indexes`), which gives every server
//! replica the same view of ephemeral session state.
//!
//! The TTL monitor runs about once a minute, so reads also check
//! `expires_at` themselves rather than trusting the reaper.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mongodb::bson::{doc, Bson};
use mongodb::options::UpdateOptions;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{SessionCache, TtlClass, TtlConfig};
use crate::db::{collections, MongoDb};

#[derive(Debug, Serialize, Deserialize)]
struct CacheDoc {
    scope: String,
    key: String,
    value: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    expires_at: DateTime<Utc>,
}

/// Shared cache over the `session_cache` TTL collection
pub struct MongoSessionCache {
    db: MongoDb,
    ttl: TtlConfig,
}

impl MongoSessionCache {
    pub fn new(db: MongoDb, ttl: TtlConfig) -> Self {
        Self { db, ttl }
    }

    fn deadline(&self, class: TtlClass) -> DateTime<Utc> {
        let ttl = self.ttl.duration(class);
        Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(15))
    }

    fn coll(&self) -> mongodb::Collection<CacheDoc> {
        self.db.collection(collections::SESSION_CACHE)
    }

    async fn read_live(&self, scope: &str, key: &str) -> Option<serde_json::Value> {
        let filter = doc! {
            "scope": scope,
            "key": key,
            "expires_at": { "$gt": Bson::DateTime(Utc::now().into()) },
        };
        match self.coll().find_one(filter, None).await {
            Ok(Some(doc)) => match serde_json::from_str(&doc.value) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(scope = scope, key = key, error = %e,
                        "Cached document held invalid JSON, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                // Cache unavailable is never an error to the caller
                warn!(scope = scope, key = key, error = %e,
                    "Cache read failed, degrading to miss");
                None
            }
        }
    }

    async fn write(&self, scope: &str, key: &str, value: &serde_json::Value, ttl: TtlClass) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                warn!(scope = scope, key = key, error = %e, "Unserializable cache value dropped");
                return;
            }
        };
        let filter = doc! { "scope": scope, "key": key };
        let update = doc! {
            "$set": {
                "value": payload,
                "expires_at": Bson::DateTime(self.deadline(ttl).into()),
            },
        };
        let options = UpdateOptions::builder().upsert(true).build();
        if let Err(e) = self.coll().update_one(filter, update, options).await {
            warn!(scope = scope, key = key, error = %e,
                "Cache write failed, continuing without cache");
        }
    }
}

#[async_trait]
impl SessionCache for MongoSessionCache {
    async fn put(&self, scope: &str, key: &str, value: &serde_json::Value, ttl: TtlClass) {
        self.write(scope, key, value, ttl).await;
    }

    async fn get(&self, scope: &str, key: &str) -> Option<serde_json::Value> {
        self.read_live(scope, key).await
    }

    async fn append_to_list(&self, scope: &str, key: &str, item: serde_json::Value, ttl: TtlClass) {
        // Read-modify-write. Within one session the orchestrator
        // serializes writers, and list keys are session-scoped, so the
        // non-atomic rewrite cannot collide across requests.
        let mut list = match self.read_live(scope, key).await {
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => {
                warn!(scope = scope, key = key, "Non-list value under list key, resetting");
                Vec::new()
            }
            None => Vec::new(),
        };
        list.push(item);
        self.write(scope, key, &serde_json::Value::Array(list), ttl)
            .await;
    }

    async fn exists(&self, scope: &str, key: &str) -> bool {
        let filter = doc! {
            "scope": scope,
            "key": key,
            "expires_at": { "$gt": Bson::DateTime(Utc::now().into()) },
        };
        match self.coll().count_documents(filter, None).await {
            Ok(count) => count > 0,
            Err(e) => {
                warn!(scope = scope, key = key, error = %e, "Cache exists check failed");
                false
            }
        }
    }

    async fn clear_scope(&self, scope: &str) {
        if let Err(e) = self.coll().delete_many(doc! { "scope": scope }, None).await {
            warn!(scope = scope, error = %e, "Cache scope clear failed");
        }
    }
}
