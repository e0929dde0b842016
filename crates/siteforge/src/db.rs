//! MongoDB database connection and configuration

use mongodb::bson::doc;
use mongodb::{options::ClientOptions, options::IndexOptions, Client, Database, IndexModel};

/// MongoDB database wrapper
#[derive(Clone)]
pub struct MongoDb {
    #[allow(dead_code)]
    client: Client,
    db: Database,
}

impl MongoDb {
    /// Connect to MongoDB
    pub async fn connect(uri: &str, db_name: &str) -> anyhow::Result<Self> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;
        let db = client.database(db_name);

        // Test connection
        db.run_command(doc! { "ping": 1 }, None).await?;
        tracing::info!("Connected to MongoDB: {}", db_name);

        let instance = Self { client, db };

        // Ensure indexes exist
        instance.ensure_indexes().await?;

        Ok(instance)
    }

    /// Get database reference
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Get collection
    pub fn collection<T>(&self, name: &str) -> mongodb::Collection<T> {
        self.db.collection(name)
    }

    /// Ping the database to check connection
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.db
            .run_command(mongodb::bson::doc! { "ping": 1 }, None)
            .await?;
        Ok(())
    }

    /// Ensure all required indexes exist
    pub async fn ensure_indexes(&self) -> anyhow::Result<()> {
        tracing::info!("Ensuring MongoDB indexes...");

        // Projects collection indexes. The unique sparse index on
        // last_session_id is what turns the advisory duplicate check
        // into a hard guarantee: two concurrent creates for the same
        // session cannot both insert (see ProjectStore::create_guarded).
        self.create_indexes(
            collections::PROJECTS,
            vec![
                IndexModel::builder()
                    .keys(doc! { "last_session_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .sparse(true)
                            .build(),
                    )
                    .build(),
                IndexModel::builder().keys(doc! { "build_id": 1 }).build(),
                IndexModel::builder().keys(doc! { "user_id": 1 }).build(),
                IndexModel::builder()
                    .keys(doc! { "archive_url": 1 })
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "created_at": -1 })
                    .build(),
            ],
        )
        .await?;

        // Session cache collection: entries carry an expires_at date
        // refreshed on every write; Mongo's TTL monitor reaps them.
        self.create_indexes(
            collections::SESSION_CACHE,
            vec![
                IndexModel::builder()
                    .keys(doc! { "scope": 1, "key": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "expires_at": 1 })
                    .options(
                        IndexOptions::builder()
                            .expire_after(std::time::Duration::from_secs(0))
                            .build(),
                    )
                    .build(),
            ],
        )
        .await?;

        // Messages collection indexes
        self.create_indexes(
            collections::MESSAGES,
            vec![
                IndexModel::builder()
                    .keys(doc! { "scope_id": 1, "created_at": 1 })
                    .build(),
                IndexModel::builder().keys(doc! { "project_id": 1 }).build(),
            ],
        )
        .await?;

        // Conversation summaries: one current summary per scope
        self.create_indexes(
            collections::SUMMARIES,
            vec![IndexModel::builder()
                .keys(doc! { "scope_id": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build()],
        )
        .await?;

        // Users collection indexes
        self.create_indexes(
            collections::USERS,
            vec![IndexModel::builder()
                .keys(doc! { "created_at": -1 })
                .build()],
        )
        .await?;

        tracing::info!("MongoDB indexes ensured");
        Ok(())
    }

    async fn create_indexes(
        &self,
        collection: &str,
        indexes: Vec<IndexModel>,
    ) -> anyhow::Result<()> {
        let coll = self.db.collection::<mongodb::bson::Document>(collection);
        coll.create_indexes(indexes, None).await?;
        Ok(())
    }
}

/// Collection name constants
pub mod collections {
    pub const PROJECTS: &str = "projects";
    pub const SESSION_CACHE: &str = "session_cache";
    pub const MESSAGES: &str = "messages";
    pub const SUMMARIES: &str = "conversation_summaries";
    pub const USERS: &str = "users";
}
