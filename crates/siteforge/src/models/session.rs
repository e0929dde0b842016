//! Session-scoped ephemeral models
//!
//! Everything here lives in the session cache only. Records expire via
//! TTL, are never authoritative, and can always be rebuilt from the
//! persistent store at the cost of extra work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::content_hash;

/// Condensed view of the session's active project, carried so a later
/// request on the same session can resume without a project lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
    pub build_id: String,
}

/// Per-session state shared across server replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub build_id: String,
    /// Workspace directory for the in-flight pipeline run, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_summary: Option<ProjectSummary>,
}

impl SessionRecord {
    pub fn new(session_id: &str, build_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            build_id: build_id.to_string(),
            workspace_path: None,
            last_activity: Utc::now(),
            project_summary: None,
        }
    }

    /// Refresh the activity timestamp; called on every pipeline stage.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// One cached project file with its content digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFile {
    /// Relative path, forward slashes
    pub path: String,
    pub content: String,
    /// sha256 hex of the content; identical content always hashes
    /// identically, so derived artifacts keyed by this digest can be
    /// reused without recomputation.
    pub hash: String,
}

/// Snapshot of a session's project files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachedFileSet {
    pub files: Vec<CachedFile>,
}

impl CachedFileSet {
    /// Build a file set from (path, content) pairs, computing digests.
    pub fn from_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let files = files
            .into_iter()
            .map(|(path, content)| {
                let content = content.into();
                let hash = content_hash(content.as_bytes());
                CachedFile {
                    path: path.into(),
                    content,
                    hash,
                }
            })
            .collect();
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// One entry in the per-session modification change log.
/// Append-only; insertion order is chronological order and the cache
/// layer never reorders or deduplicates entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub change_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approach: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    pub success: bool,
}

impl ChangeLogEntry {
    pub fn generation(description: &str, files_created: Vec<String>, success: bool) -> Self {
        Self {
            change_type: "generation".to_string(),
            file: None,
            description: description.to_string(),
            timestamp: Utc::now(),
            approach: None,
            files_modified: Vec::new(),
            files_created,
            success,
        }
    }

    pub fn modification(
        description: &str,
        approach: Option<String>,
        files_modified: Vec<String>,
        files_created: Vec<String>,
        success: bool,
    ) -> Self {
        Self {
            change_type: "modification".to_string(),
            file: None,
            description: description.to_string(),
            timestamp: Utc::now(),
            approach,
            files_modified,
            files_created,
            success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_hashes_identically() {
        let set = CachedFileSet::from_files([("a.ts", "let x = 1;"), ("b.ts", "let x = 1;")]);
        assert_eq!(set.files[0].hash, set.files[1].hash);
        assert_ne!(set.files[0].path, set.files[1].path);
    }

    #[test]
    fn different_content_hashes_differently() {
        let set = CachedFileSet::from_files([("a.ts", "1"), ("b.ts", "2")]);
        assert_ne!(set.files[0].hash, set.files[1].hash);
    }
}
