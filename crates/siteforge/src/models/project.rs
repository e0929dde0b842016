//! Project model
//! A ProjectRecord is the authoritative, persistent representation of
//! one logical end-user project. A session links to at most one active
//! project; a project may outlive many sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Project status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// Project record exists, nothing generated yet
    Pending,
    /// Generation engine is running
    Generating,
    /// Files generated and written to the workspace
    Generated,
    /// Archive uploaded, remote build in progress
    Building,
    /// Built artifact is being deployed
    Deploying,
    /// Deployed with all URLs populated
    Ready,
    /// Pipeline failed
    Failed,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Generating => write!(f, "generating"),
            Self::Generated => write!(f, "generated"),
            Self::Building => write!(f, "building"),
            Self::Deploying => write!(f, "deploying"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "generating" => Ok(Self::Generating),
            "generated" => Ok(Self::Generated),
            "building" => Ok(Self::Building),
            "deploying" => Ok(Self::Deploying),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// Project entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ProjectStatus,
    /// Source archive in object storage, set before the remote build
    /// is triggered so a deploy failure leaves a resumable project.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
    /// Built artifact address returned by the remote build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Public preview URL from the hosting platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    pub build_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(user_id: &str, name: &str, build_id: &str, session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: None,
            status: ProjectStatus::Pending,
            archive_url: None,
            download_url: None,
            deployment_url: None,
            build_id: build_id.to_string(),
            last_session_id: Some(session_id.to_string()),
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the project reached Ready with all three URLs
    /// populated. Used by the duplicate short-circuit.
    pub fn is_fully_deployed(&self) -> bool {
        self.status == ProjectStatus::Ready
            && self.archive_url.is_some()
            && self.download_url.is_some()
            && self.deployment_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_display() {
        for status in [
            ProjectStatus::Pending,
            ProjectStatus::Generating,
            ProjectStatus::Generated,
            ProjectStatus::Building,
            ProjectStatus::Deploying,
            ProjectStatus::Ready,
            ProjectStatus::Failed,
        ] {
            let parsed = ProjectStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn fully_deployed_requires_all_three_urls() {
        let mut project = ProjectRecord::new("u1", "demo", "b1", "s1");
        project.status = ProjectStatus::Ready;
        assert!(!project.is_fully_deployed());

        project.archive_url = Some("https://store/archive.zip".into());
        project.download_url = Some("https://store/built.zip".into());
        assert!(!project.is_fully_deployed());

        project.deployment_url = Some("https://preview.example".into());
        assert!(project.is_fully_deployed());

        project.status = ProjectStatus::Failed;
        assert!(!project.is_fully_deployed());
    }
}
