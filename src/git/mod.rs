//! Git branch coordination
//!
//! Working-tree queries and the stash-protect protocol used around branch
//! switches and creation. [`GitBackend`] is the seam between the protocol
//! ([`GitCoordinator`]) and the `git` binary ([`GitCli`]).

mod cli;
mod coordinator;
#[cfg(test)]
pub(crate) mod fake;

pub use cli::GitCli;
pub use coordinator::{GitCoordinator, WatchKey};

use crate::error::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Message prefix used to tag automatic stashes with their branch
pub const AUTO_STASH_PREFIX: &str = "airdock-auto-stash:";

/// Stash message for uncommitted work made on `branch`
pub fn auto_stash_message(branch: &str) -> String {
    format!("{}{}", AUTO_STASH_PREFIX, branch)
}

/// Working-tree status of a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Untracked,
}

impl ChangeStatus {
    /// Map a porcelain v1 `XY` status pair
    pub fn from_porcelain(x: char, y: char) -> Self {
        match (x, y) {
            ('?', '?') => Self::Untracked,
            ('R', _) | (_, 'R') | ('C', _) => Self::Renamed,
            ('A', _) => Self::Added,
            ('D', _) | (_, 'D') => Self::Deleted,
            _ => Self::Modified,
        }
    }
}

/// A changed file in the working tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub file: String,
    pub status: ChangeStatus,
}

/// Point-in-time summary of the working tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSnapshot {
    pub branch_name: String,
    pub changes: Vec<FileChange>,
    #[serde(rename = "hasPR")]
    pub has_pr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

/// Pull-request state of the current branch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrStatus {
    pub has_pr: bool,
    pub url: Option<String>,
}

/// Local branch entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    pub is_current: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
}

/// Result of an automatic stash attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StashOperation {
    pub did_stash: bool,
    pub error: Option<String>,
}

/// Result of reapplying a branch's automatic stash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    Popped,
    NothingToPop,
    /// The stash could not be applied cleanly and was kept
    Conflict(String),
}

/// Result of a switch or create request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchMutation {
    pub branch_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub warning: Option<String>,
}

impl BranchMutation {
    fn ok(branch_name: &str) -> Self {
        Self {
            branch_name: branch_name.to_string(),
            success: true,
            ..Default::default()
        }
    }

    fn failed(branch_name: &str, error: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.to_string(),
            success: false,
            error: Some(error.into()),
            warning: None,
        }
    }
}

/// Version-control operations the coordinator builds on
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Name of the checked-out branch
    async fn branch_name(&self) -> Result<String>;

    /// Changed files, untracked files listed individually
    async fn changes(&self) -> Result<Vec<FileChange>>;

    /// Pull-request state; any lookup failure means no PR
    async fn pr_status(&self) -> PrStatus;

    /// Local branches, most recently committed first
    async fn recent_branches(&self, limit: usize) -> Result<Vec<Branch>>;

    /// Top-level directory of the repository
    async fn git_root(&self) -> Result<PathBuf>;

    /// Stash uncommitted work (untracked included) under the tag of `branch`
    async fn auto_stash(&self, branch: &str) -> StashOperation;

    /// Reapply the newest stash tagged for `branch`
    async fn auto_pop_stash(&self, branch: &str) -> PopOutcome;

    /// Reapply the stash created just before a failed mutation
    async fn restore_stash_after_failure(&self) -> Result<()>;

    async fn checkout(&self, branch: &str) -> Result<()>;

    /// Create `name` from `main` (or `master` when `main` is missing) and check it out
    async fn create_branch_from_main(&self, name: &str, main: &str) -> Result<()>;

    /// Reset tracked files and remove untracked files and directories
    async fn discard_all_changes(&self) -> Result<()>;
}

fn branch_charset() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/\-]+$").ok())
        .as_ref()
}

/// Whether `name` is acceptable as a branch name.
///
/// A conservative subset of `git check-ref-format --branch`.
pub fn is_valid_branch_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 || name == "@" {
        return false;
    }
    if !branch_charset().is_some_and(|re| re.is_match(name)) {
        return false;
    }
    if name.starts_with('-') || name.starts_with('/') {
        return false;
    }
    if name.ends_with('/') || name.ends_with('.') || name.ends_with(".lock") {
        return false;
    }
    if name.contains("..") || name.contains("//") {
        return false;
    }
    !name
        .split('/')
        .any(|component| component.starts_with('.') || component.ends_with(".lock"))
}
