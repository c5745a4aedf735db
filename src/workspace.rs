//! Per-job workspace directories
//!
//! Handles:
//! - Creating a uniquely named directory per job
//! - Writing submitted files under it, refusing any path that leaves the root
//! - Computing the module search path from the submitted file layout
//! - Removing the directory when the job ends (explicitly, or on drop)
//!
//! Does NOT handle:
//! - Mounting into a container. See `sandbox::runner`
//! - Enforcing disk usage after staging (only submitted content is bounded)

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::job::{FilePayload, JobRequest};

const WORKSPACE_PREFIX: &str = "runtime_sandbox_";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Path escapes workspace root: {0}")]
    PathEscape(String),

    #[error("Submitted content is {size} bytes, exceeding the storage limit of {limit} bytes")]
    StorageLimitExceeded { size: u64, limit: u64 },

    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates workspaces under a base directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    mount_path: String,
}

/// A staged job directory
///
/// The directory is removed by [`Workspace::teardown`], or when the value is
/// dropped if teardown was never reached.
#[derive(Debug)]
pub struct Workspace {
    pub id: Uuid,
    pub root_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Module search path as seen from inside the container
    pub search_path: String,
    dir: Option<TempDir>,
}

impl WorkspaceManager {
    /// `mount_path` is where the sandbox mounts the workspace; it prefixes the search path.
    pub fn new(base_dir: impl Into<PathBuf>, mount_path: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            mount_path: mount_path.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a workspace and write every submitted file into it.
    ///
    /// Every filename is resolved and the total size checked before the
    /// directory is created, so a rejected request leaves nothing on disk.
    pub async fn stage(
        &self,
        job: &JobRequest,
        storage_limit_bytes: u64,
    ) -> Result<Workspace, WorkspaceError> {
        let size = job.content_bytes();
        if size > storage_limit_bytes {
            return Err(WorkspaceError::StorageLimitExceeded {
                size,
                limit: storage_limit_bytes,
            });
        }

        let relative: Vec<PathBuf> = job
            .files
            .iter()
            .map(|f| normalize_relative(&f.filename))
            .collect::<Result<_, _>>()?;

        tokio::fs::create_dir_all(&self.base_dir).await?;
        let id = Uuid::new_v4();
        let base_dir = self.base_dir.clone();
        let prefix = format!("{}{}_", WORKSPACE_PREFIX, id.simple());
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(&prefix).tempdir_in(base_dir)
        })
        .await
        .map_err(std::io::Error::other)??;

        let mut workspace = Workspace {
            id,
            root_path: dir.path().to_path_buf(),
            created_at: Utc::now(),
            search_path: module_search_path(&self.mount_path, &job.files),
            dir: Some(dir),
        };

        if let Err(e) = write_files(&workspace.root_path, &relative, &job.files).await {
            // Partially staged; remove before reporting.
            let _ = workspace.teardown().await;
            return Err(e);
        }

        info!(
            job_id = %workspace.id,
            workspace = %workspace.root_path.display(),
            "Staged {} file(s) ({} bytes)",
            job.files.len(),
            size
        );
        Ok(workspace)
    }
}

async fn write_files(
    root: &Path,
    relative: &[PathBuf],
    files: &[FilePayload],
) -> Result<(), WorkspaceError> {
    for (rel, file) in relative.iter().zip(files) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, file.content.as_bytes()).await?;
        debug!("Wrote {} ({} bytes)", rel.display(), file.content.len());
    }
    Ok(())
}

impl Workspace {
    /// Recursively remove the workspace directory. Safe to call more than once.
    pub async fn teardown(&mut self) -> Result<(), WorkspaceError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        let path = self.root_path.clone();
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(std::io::Error::other)??;
        debug!("Removed workspace {}", path.display());
        Ok(())
    }

    pub fn is_torn_down(&self) -> bool {
        self.dir.is_none()
    }
}

/// Resolve `filename` under `root`, failing if it would land outside it
pub fn resolve_within(root: &Path, filename: &str) -> Result<PathBuf, WorkspaceError> {
    Ok(root.join(normalize_relative(filename)?))
}

/// Lexically normalize a relative path, rejecting anything that is absolute,
/// empty, or climbs above its starting directory.
fn normalize_relative(filename: &str) -> Result<PathBuf, WorkspaceError> {
    let escape = || WorkspaceError::PathEscape(filename.to_string());

    let mut normalized = PathBuf::new();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(escape());
    }
    Ok(normalized)
}

/// Build the module search path for a set of files: the mount point followed by
/// each distinct parent directory, in order of first appearance, joined by `:`.
///
/// Filenames that do not normalize are skipped; staging rejects them anyway.
pub fn module_search_path(mount_path: &str, files: &[FilePayload]) -> String {
    let mount = mount_path.trim_end_matches('/');
    let mut entries = vec![mount.to_string()];

    for file in files {
        let Ok(relative) = normalize_relative(&file.filename) else {
            continue;
        };
        let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) else {
            continue;
        };

        let parts: Vec<String> = parent
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let entry = format!("{}/{}", mount, parts.join("/"));
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    entries.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LIMIT: u64 = 100 * 1024 * 1024;

    fn files(names: &[&str]) -> Vec<FilePayload> {
        names
            .iter()
            .map(|n| FilePayload::new(*n, format!("# {}\n", n)))
            .collect()
    }

    #[tokio::test]
    async fn test_stage_round_trip() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path(), "/app");
        let job = JobRequest::new(
            "pytest",
            vec![
                FilePayload::new("a.py", "print(1+1)"),
                FilePayload::new("pkg/sub/mod.py", "X = 1\n"),
                FilePayload::new("pkg/../b.py", "unicode: \u{00e9}\n"),
            ],
        );

        let mut workspace = manager.stage(&job, LIMIT).await.unwrap();
        assert!(workspace.root_path.starts_with(base.path()));

        let read = |rel: &str| std::fs::read_to_string(workspace.root_path.join(rel)).unwrap();
        assert_eq!(read("a.py"), "print(1+1)");
        assert_eq!(read("pkg/sub/mod.py"), "X = 1\n");
        assert_eq!(read("b.py"), "unicode: \u{00e9}\n");

        workspace.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_file_list_is_legal() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path(), "/app");
        let mut workspace = manager
            .stage(&JobRequest::new("echo hi", vec![]), LIMIT)
            .await
            .unwrap();
        assert!(workspace.root_path.is_dir());
        assert_eq!(workspace.search_path, "/app");
        workspace.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_path_escape_creates_nothing() {
        let base = tempdir().unwrap();
        let jail = base.path().join("jail");
        let manager = WorkspaceManager::new(&jail, "/app");

        for name in ["../escape.py", "a/../../escape.py", "/etc/escape.py", ".", ""] {
            let job = JobRequest::new(
                "ls",
                vec![FilePayload::new("ok.py", ""), FilePayload::new(name, "x")],
            );
            let err = manager.stage(&job, LIMIT).await.unwrap_err();
            assert!(matches!(err, WorkspaceError::PathEscape(_)), "{}", name);
        }

        assert!(!base.path().join("escape.py").exists());
        assert!(!jail.exists());
    }

    #[tokio::test]
    async fn test_storage_limit() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path(), "/app");
        let job = JobRequest::new("ls", vec![FilePayload::new("big.txt", "x".repeat(11))]);

        let err = manager.stage(&job, 10).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::StorageLimitExceeded { size: 11, limit: 10 }
        ));
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path(), "/app");
        let job = JobRequest::new("ls", files(&["a.py", "dir/b.py"]));

        let mut workspace = manager.stage(&job, LIMIT).await.unwrap();
        let root = workspace.root_path.clone();

        workspace.teardown().await.unwrap();
        assert!(!root.exists());
        assert!(workspace.is_torn_down());

        workspace.teardown().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path(), "/app");
        let workspace = manager
            .stage(&JobRequest::new("ls", files(&["a.py"])), LIMIT)
            .await
            .unwrap();
        let root = workspace.root_path.clone();
        drop(workspace);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_concurrent_workspaces_are_distinct() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path(), "/app");
        let job = JobRequest::new("ls", files(&["a.py"]));

        let (a, b) = tokio::join!(manager.stage(&job, LIMIT), manager.stage(&job, LIMIT));
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.root_path, b.root_path);
        assert_ne!(a.id, b.id);

        a.teardown().await.unwrap();
        b.teardown().await.unwrap();
    }

    #[test]
    fn test_search_path_order_and_dedup() {
        let files = files(&[
            "test_main.py",
            "src/utils.py",
            "tests/test_utils.py",
            "src/helpers.py",
            "./src/nested/deep.py",
        ]);
        assert_eq!(
            module_search_path("/app", &files),
            "/app:/app/src:/app/tests:/app/src/nested"
        );
    }

    #[test]
    fn test_search_path_flat_layout() {
        assert_eq!(module_search_path("/app/", &files(&["a.py", "b.py"])), "/app");
    }

    #[test]
    fn test_resolve_within() {
        let root = Path::new("/work/root");
        assert_eq!(
            resolve_within(root, "a/./b/../c.py").unwrap(),
            root.join("a/c.py")
        );
        assert!(resolve_within(root, "../c.py").is_err());
        assert!(resolve_within(root, "/abs.py").is_err());
    }
}
