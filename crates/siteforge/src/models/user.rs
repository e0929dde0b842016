//! User model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User entity. Projects always belong to a user; when a request
/// carries no valid user, one is synthesized so the project record
/// still has an owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub display_name: String,
    /// True when the id was synthesized rather than supplied
    pub synthesized: bool,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn supplied(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            synthesized: false,
            created_at: Utc::now(),
        }
    }

    pub fn synthesized() -> Self {
        let id = format!("anon-{}", Uuid::new_v4());
        Self {
            display_name: id.clone(),
            id,
            synthesized: true,
            created_at: Utc::now(),
        }
    }
}
