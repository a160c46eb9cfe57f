//! Hot-reload retrigger
//!
//! Rewrites every changed file with its own contents so the dev server's
//! file watcher fires again after the agent finishes.

use crate::git::{ChangeStatus, GitCoordinator};
use std::path::{Path, PathBuf};

/// Touch all changed, non-deleted files. Returns how many were rewritten.
pub async fn retrigger(git: &GitCoordinator, project_root: &Path) -> usize {
    let changes = match git.changes().await {
        Ok(changes) => changes,
        Err(e) => {
            tracing::warn!("HMR retrigger skipped, git status failed: {}", e);
            return 0;
        }
    };
    if changes.is_empty() {
        return 0;
    }
    let git_root = git
        .git_root()
        .await
        .unwrap_or_else(|_| project_root.to_path_buf());

    let mut touched = 0;
    for change in changes
        .iter()
        .filter(|c| c.status != ChangeStatus::Deleted)
    {
        let Some(path) = locate(&git_root, project_root, &change.file).await else {
            tracing::debug!(file = %change.file, "HMR retrigger: file not found");
            continue;
        };
        match rewrite(&path).await {
            Ok(()) => touched += 1,
            Err(e) => tracing::debug!(file = %path.display(), "HMR retrigger failed: {}", e),
        }
    }
    if touched > 0 {
        tracing::info!(files = touched, "Retriggered hot reload");
    }
    touched
}

async fn locate(git_root: &Path, project_root: &Path, file: &str) -> Option<PathBuf> {
    for base in [git_root, project_root] {
        let candidate = base.join(file);
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|m| m.is_file())
        {
            return Some(candidate);
        }
    }
    None
}

async fn rewrite(path: &Path) -> std::io::Result<()> {
    let contents = tokio::fs::read(path).await?;
    tokio::fs::write(path, contents).await
}
