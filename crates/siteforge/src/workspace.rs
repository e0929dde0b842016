//! Workspace management
//!
//! A workspace is the materialized file tree for one pipeline run:
//! extracted from the project's prior archive when one exists, copied
//! from the blank template otherwise, written into by the generation
//! stage, packed into a zip for the remote build, and removed exactly
//! once when the run reaches a terminal state (or the cleanup timer
//! fires first).

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

use crate::error::{ForgeError, ForgeResult};
use crate::output_parser::GeneratedFileSet;

/// One pipeline run's file tree
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
    build_id: String,
}

impl Workspace {
    /// Create the workspace directory, seeding it from a prior
    /// archive when one is supplied or from the blank template
    /// otherwise. A corrupt prior archive degrades to the template
    /// rather than failing the run.
    pub async fn materialize(
        root: &Path,
        build_id: &str,
        prior_archive: Option<Vec<u8>>,
        template_dir: &Path,
    ) -> ForgeResult<Self> {
        let path = root.join(format!("siteforge-{}", build_id));
        tokio::fs::create_dir_all(&path).await?;

        let workspace = Self {
            path,
            build_id: build_id.to_string(),
        };

        if let Some(archive) = prior_archive {
            match workspace.extract_archive(archive).await {
                Ok(count) => {
                    info!(build_id = build_id, files = count, "Workspace seeded from prior archive");
                    return Ok(workspace);
                }
                Err(e) => {
                    warn!(build_id = build_id, error = %e,
                        "Prior archive extraction failed, falling back to blank template");
                }
            }
        }

        workspace.copy_template(template_dir).await?;
        info!(build_id = build_id, "Workspace seeded from blank template");
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Write generated files into the tree, creating parent
    /// directories. Paths are validated against traversal.
    pub async fn write_files(&self, files: &GeneratedFileSet) -> ForgeResult<()> {
        for (rel_path, content) in files {
            let rel = sanitize_rel_path(rel_path)?;
            let target = self.path.join(&rel);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }
        Ok(())
    }

    /// Pack the tree into a zip blob (deflate)
    pub async fn pack(&self) -> ForgeResult<Vec<u8>> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || pack_dir(&root))
            .await
            .map_err(|e| ForgeError::Internal(format!("pack task panicked: {}", e)))?
    }

    async fn extract_archive(&self, archive: Vec<u8>) -> ForgeResult<usize> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || extract_zip(&root, archive))
            .await
            .map_err(|e| ForgeError::Internal(format!("extract task panicked: {}", e)))?
    }

    async fn copy_template(&self, template_dir: &Path) -> ForgeResult<()> {
        if !template_dir.exists() {
            // An empty workspace is a valid starting point; the
            // generation stage writes the whole tree anyway.
            warn!(template = %template_dir.display(), "Template directory missing, starting empty");
            return Ok(());
        }
        let from = template_dir.to_path_buf();
        let to = self.path.clone();
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| ForgeError::Internal(format!("copy task panicked: {}", e)))?
    }

    /// Remove the workspace directory. Idempotent: a missing directory
    /// is success, so the cleanup timer and the normal completion path
    /// cannot trip over each other.
    pub async fn cleanup(&self) -> ForgeResult<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                info!(build_id = %self.build_id, "Workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject absolute paths and parent-directory components
fn sanitize_rel_path(rel: &str) -> ForgeResult<PathBuf> {
    let path = Path::new(rel);
    if path.is_absolute() {
        return Err(ForgeError::InvalidGeneratedPath {
            path: rel.to_string(),
        });
    }
    for component in path.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => {
                return Err(ForgeError::InvalidGeneratedPath {
                    path: rel.to_string(),
                })
            }
        }
    }
    Ok(path.to_path_buf())
}

fn pack_dir(root: &Path) -> ForgeResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buffer);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        add_dir_entries(&mut writer, root, root, options)?;
        writer.finish()?;
    }
    Ok(buffer.into_inner())
}

fn add_dir_entries(
    writer: &mut ZipWriter<&mut Cursor<Vec<u8>>>,
    root: &Path,
    dir: &Path,
    options: FileOptions,
) -> ForgeResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|e| ForgeError::Internal(e.to_string()))?;
        let name = rel.to_string_lossy().replace('\\', "/");
        if path.is_dir() {
            add_dir_entries(writer, root, &path, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut file = std::fs::File::open(&path)?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;
            writer.write_all(&contents)?;
        }
    }
    Ok(())
}

fn extract_zip(root: &Path, archive: Vec<u8>) -> ForgeResult<usize> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    let mut extracted = 0usize;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };
        let target = root.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        std::fs::write(&target, contents)?;
        extracted += 1;
    }
    if extracted == 0 {
        return Err(ForgeError::WorkspaceMaterialization {
            reason: "archive contained no files".to_string(),
        });
    }
    Ok(extracted)
}

fn copy_tree(from: &Path, to: &Path) -> ForgeResult<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn file_set(entries: &[(&str, &str)]) -> GeneratedFileSet {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect::<BTreeMap<_, _>>()
    }

    #[tokio::test]
    async fn materialize_from_template_and_write_files() {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join("index.html"), "<html></html>").unwrap();

        let ws = Workspace::materialize(root.path(), "b1", None, template.path())
            .await
            .unwrap();
        assert!(ws.path().join("index.html").exists());

        ws.write_files(&file_set(&[("src/app.js", "let a = 1;")]))
            .await
            .unwrap();
        let written = std::fs::read_to_string(ws.path().join("src/app.js")).unwrap();
        assert_eq!(written, "let a = 1;");
    }

    #[tokio::test]
    async fn pack_then_extract_round_trips() {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();

        let ws = Workspace::materialize(root.path(), "b1", None, template.path())
            .await
            .unwrap();
        ws.write_files(&file_set(&[
            ("index.html", "<h1>hi</h1>"),
            ("css/site.css", "h1 { color: red; }"),
        ]))
        .await
        .unwrap();

        let archive = ws.pack().await.unwrap();
        assert!(!archive.is_empty());

        // A later modification run seeds its workspace from this blob
        let ws2 = Workspace::materialize(root.path(), "b2", Some(archive), template.path())
            .await
            .unwrap();
        let content = std::fs::read_to_string(ws2.path().join("css/site.css")).unwrap();
        assert_eq!(content, "h1 { color: red; }");
    }

    #[tokio::test]
    async fn corrupt_archive_falls_back_to_template() {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join("index.html"), "blank").unwrap();

        let ws = Workspace::materialize(
            root.path(),
            "b1",
            Some(b"this is not a zip".to_vec()),
            template.path(),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("index.html")).unwrap(),
            "blank"
        );
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        let ws = Workspace::materialize(root.path(), "b1", None, template.path())
            .await
            .unwrap();

        let result = ws
            .write_files(&file_set(&[("../escape.txt", "nope")]))
            .await;
        assert!(matches!(
            result,
            Err(ForgeError::InvalidGeneratedPath { .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        let ws = Workspace::materialize(root.path(), "b1", None, template.path())
            .await
            .unwrap();
        assert!(ws.path().exists());

        ws.cleanup().await.unwrap();
        assert!(!ws.path().exists());
        // Second cleanup (timer path after normal path) must not fail
        ws.cleanup().await.unwrap();
    }
}
