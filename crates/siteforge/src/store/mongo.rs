//! MongoDB store backend
//!
//! Document shapes mirror the API models but pin chrono timestamps to
//! native BSON datetimes so range filters and sort orders behave.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneOptions, FindOptions, UpdateOptions};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ConversationStore, CreateOutcome, ProjectStore, Stores, UserStore};
use crate::db::{collections, MongoDb};
use crate::error::{ForgeError, ForgeResult};
use crate::models::{
    ConversationSummary, MessageRecord, MessageRole, ProjectRecord, ProjectStatus, UserRecord,
};

#[derive(Debug, Serialize, Deserialize)]
struct ProjectDoc {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    name: String,
    description: Option<String>,
    status: String,
    archive_url: Option<String>,
    download_url: Option<String>,
    deployment_url: Option<String>,
    build_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_session_id: Option<String>,
    message_count: u32,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
}

impl ProjectDoc {
    fn from_record(record: &ProjectRecord) -> Self {
        Self {
            id: record.id.clone(),
            user_id: record.user_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            status: record.status.to_string(),
            archive_url: record.archive_url.clone(),
            download_url: record.download_url.clone(),
            deployment_url: record.deployment_url.clone(),
            build_id: record.build_id.clone(),
            last_session_id: record.last_session_id.clone(),
            message_count: record.message_count,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn into_record(self) -> ForgeResult<ProjectRecord> {
        let status: ProjectStatus = self
            .status
            .parse()
            .map_err(ForgeError::Database)?;
        Ok(ProjectRecord {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            description: self.description,
            status,
            archive_url: self.archive_url,
            download_url: self.download_url,
            deployment_url: self.deployment_url,
            build_id: self.build_id,
            last_session_id: self.last_session_id,
            message_count: self.message_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageDoc {
    #[serde(rename = "_id")]
    id: String,
    scope_id: String,
    role: String,
    content: String,
    project_id: Option<String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SummaryDoc {
    scope_id: String,
    summary: String,
    message_count: u32,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    start_time: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    end_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserDoc {
    #[serde(rename = "_id")]
    id: String,
    display_name: String,
    synthesized: bool,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
}

/// MongoDB implementation of the store facets
#[derive(Clone)]
pub struct MongoStore {
    db: MongoDb,
}

impl MongoStore {
    pub fn new(db: MongoDb) -> Self {
        Self { db }
    }

    /// Build a `Stores` bundle where all three facets share one store
    pub fn stores(db: MongoDb) -> Stores {
        let store = std::sync::Arc::new(Self::new(db));
        Stores {
            projects: store.clone(),
            users: store.clone(),
            conversations: store,
        }
    }

    fn projects(&self) -> mongodb::Collection<ProjectDoc> {
        self.db.collection(collections::PROJECTS)
    }

    async fn find_one_project(
        &self,
        filter: mongodb::bson::Document,
        options: Option<FindOneOptions>,
    ) -> ForgeResult<Option<ProjectRecord>> {
        match self.projects().find_one(filter, options).await? {
            Some(doc) => Ok(Some(doc.into_record()?)),
            None => Ok(None),
        }
    }

    fn newest_first() -> FindOneOptions {
        FindOneOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build()
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::Command(ce) => ce.code == 11000,
        _ => false,
    }
}

#[async_trait]
impl ProjectStore for MongoStore {
    async fn get(&self, id: &str) -> ForgeResult<Option<ProjectRecord>> {
        self.find_one_project(doc! { "_id": id }, None).await
    }

    async fn find_by_session(&self, session_id: &str) -> ForgeResult<Option<ProjectRecord>> {
        self.find_one_project(doc! { "last_session_id": session_id }, None)
            .await
    }

    async fn find_by_build(&self, build_id: &str) -> ForgeResult<Option<ProjectRecord>> {
        self.find_one_project(doc! { "build_id": build_id }, None)
            .await
    }

    async fn find_by_archive_url(&self, url: &str) -> ForgeResult<Option<ProjectRecord>> {
        self.find_one_project(doc! { "archive_url": url }, None).await
    }

    async fn most_recent_for_user(&self, user_id: &str) -> ForgeResult<Option<ProjectRecord>> {
        self.find_one_project(doc! { "user_id": user_id }, Some(Self::newest_first()))
            .await
    }

    async fn most_recent(&self) -> ForgeResult<Option<ProjectRecord>> {
        self.find_one_project(doc! {}, Some(Self::newest_first()))
            .await
    }

    async fn find_recent_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> ForgeResult<Option<ProjectRecord>> {
        self.find_one_project(
            doc! {
                "user_id": user_id,
                "created_at": { "$gte": Bson::DateTime(since.into()) },
            },
            Some(Self::newest_first()),
        )
        .await
    }

    async fn create_guarded(&self, project: ProjectRecord) -> ForgeResult<CreateOutcome> {
        let doc = ProjectDoc::from_record(&project);
        match self.projects().insert_one(&doc, None).await {
            Ok(_) => {
                info!(project_id = %project.id, session_id = ?project.last_session_id,
                    "Project created");
                Ok(CreateOutcome::Created(project))
            }
            Err(e) if is_duplicate_key(&e) => {
                // Lost the insert race on the unique last_session_id
                // index; the winner's record is the project for this
                // session.
                let session_id = project.last_session_id.as_deref().unwrap_or_default();
                info!(session_id = session_id, "Concurrent create detected, reusing winner");
                match self.find_by_session(session_id).await? {
                    Some(existing) => Ok(CreateOutcome::Existing(existing)),
                    None => Err(ForgeError::Database(
                        "duplicate key on create but no project found for session".to_string(),
                    )),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, project: &ProjectRecord) -> ForgeResult<()> {
        let mut updated = project.clone();
        updated.updated_at = Utc::now();
        let doc = ProjectDoc::from_record(&updated);
        self.projects()
            .replace_one(doc! { "_id": &project.id }, &doc, None)
            .await?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ProjectStatus) -> ForgeResult<()> {
        let result = self
            .projects()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": {
                    "status": status.to_string(),
                    "updated_at": Bson::DateTime(Utc::now().into()),
                }},
                None,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(ForgeError::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MongoStore {
    async fn exists(&self, id: &str) -> ForgeResult<bool> {
        let count = self
            .db
            .collection::<UserDoc>(collections::USERS)
            .count_documents(doc! { "_id": id }, None)
            .await?;
        Ok(count > 0)
    }

    async fn create(&self, user: &UserRecord) -> ForgeResult<()> {
        let doc = UserDoc {
            id: user.id.clone(),
            display_name: user.display_name.clone(),
            synthesized: user.synthesized,
            created_at: user.created_at,
        };
        self.db
            .collection::<UserDoc>(collections::USERS)
            .insert_one(&doc, None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MongoStore {
    async fn append_message(&self, message: &MessageRecord) -> ForgeResult<()> {
        let doc = MessageDoc {
            id: message.id.clone(),
            scope_id: message.scope_id.clone(),
            role: message.role.to_string(),
            content: message.content.clone(),
            project_id: message.project_id.clone(),
            created_at: message.created_at,
        };
        self.db
            .collection::<MessageDoc>(collections::MESSAGES)
            .insert_one(&doc, None)
            .await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        scope_id: &str,
        limit: usize,
    ) -> ForgeResult<Vec<MessageRecord>> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .limit(limit as i64)
            .build();
        let docs: Vec<MessageDoc> = self
            .db
            .collection::<MessageDoc>(collections::MESSAGES)
            .find(doc! { "scope_id": scope_id }, options)
            .await?
            .try_collect()
            .await?;

        let mut messages: Vec<MessageRecord> = docs
            .into_iter()
            .map(|d| {
                let role = match d.role.as_str() {
                    "assistant" => MessageRole::Assistant,
                    _ => MessageRole::User,
                };
                MessageRecord {
                    id: d.id,
                    scope_id: d.scope_id,
                    role,
                    content: d.content,
                    project_id: d.project_id,
                    created_at: d.created_at,
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn count_messages(&self, scope_id: &str) -> ForgeResult<u64> {
        let count = self
            .db
            .collection::<MessageDoc>(collections::MESSAGES)
            .count_documents(doc! { "scope_id": scope_id }, None)
            .await?;
        Ok(count)
    }

    async fn get_summary(&self, scope_id: &str) -> ForgeResult<Option<ConversationSummary>> {
        let doc = self
            .db
            .collection::<SummaryDoc>(collections::SUMMARIES)
            .find_one(doc! { "scope_id": scope_id }, None)
            .await?;
        Ok(doc.map(|d| ConversationSummary {
            scope_id: d.scope_id,
            summary: d.summary,
            message_count: d.message_count,
            start_time: d.start_time,
            end_time: d.end_time,
        }))
    }

    async fn upsert_summary(&self, summary: &ConversationSummary) -> ForgeResult<()> {
        // message_count only moves forward: the filter refuses the
        // write when the stored count is already higher.
        let filter = doc! {
            "scope_id": &summary.scope_id,
            "$or": [
                { "message_count": { "$lte": summary.message_count as i64 } },
                { "message_count": { "$exists": false } },
            ],
        };
        let update = doc! {
            "$set": {
                "summary": &summary.summary,
                "message_count": summary.message_count as i64,
                "end_time": Bson::DateTime(summary.end_time.into()),
            },
            "$setOnInsert": {
                "scope_id": &summary.scope_id,
                "start_time": Bson::DateTime(summary.start_time.into()),
            },
        };
        let options = UpdateOptions::builder().upsert(true).build();
        match self
            .db
            .collection::<SummaryDoc>(collections::SUMMARIES)
            .update_one(filter, update, options)
            .await
        {
            Ok(_) => Ok(()),
            // Upsert raced the unique scope_id index against a newer
            // summary; the stored one wins.
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
