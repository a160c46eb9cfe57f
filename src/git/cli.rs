//! `git`/`gh` subprocess backend

use super::{
    auto_stash_message, Branch, ChangeStatus, FileChange, GitBackend, PopOutcome, PrStatus,
    StashOperation,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// [`GitBackend`] that shells out to `git` in a working directory
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    pr_lookup: bool,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pr_lookup: true,
        }
    }

    /// Enable or disable the `gh` pull-request lookup
    pub fn with_pr_lookup(mut self, enabled: bool) -> Self {
        self.pr_lookup = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `git` and return stdout, or the trimmed stderr as the error
    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| Error::Git(format!("Failed to run git {}: {}", args.join(" "), e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let message = if stderr.is_empty() { stdout } else { stderr };
            Err(Error::Git(if message.is_empty() {
                format!("git {} exited with {}", args.join(" "), output.status)
            } else {
                message
            }))
        }
    }

    async fn branch_exists(&self, name: &str) -> bool {
        let refname = format!("refs/heads/{}", name);
        self.git(&["rev-parse", "--verify", "--quiet", &refname])
            .await
            .is_ok()
    }

    /// Newest stash entry tagged for `branch`, as a `stash@{n}` ref
    async fn find_auto_stash(&self, branch: &str) -> Result<Option<String>> {
        let list = self.git(&["stash", "list", "--format=%gd%x09%gs"]).await?;
        let tag = auto_stash_message(branch);
        Ok(list.lines().find_map(|line| {
            let (stash_ref, subject) = line.split_once('\t')?;
            let message = subject.rsplit_once(": ").map_or(subject, |(_, m)| m);
            (message == tag).then(|| stash_ref.to_string())
        }))
    }
}

/// Parse `git status --porcelain=v1 -z` output.
///
/// Rename and copy entries carry the original path as an extra field,
/// which is skipped so the new path is reported.
pub(crate) fn parse_porcelain_z(output: &str) -> Vec<FileChange> {
    let mut changes = Vec::new();
    let mut fields = output.split('\0');
    while let Some(entry) = fields.next() {
        if entry.len() < 4 {
            continue;
        }
        let mut chars = entry.chars();
        let x = chars.next().unwrap_or(' ');
        let y = chars.next().unwrap_or(' ');
        let file = &entry[3..];
        if x == 'R' || x == 'C' {
            fields.next();
        }
        changes.push(FileChange {
            file: file.to_string(),
            status: ChangeStatus::from_porcelain(x, y),
        });
    }
    changes
}

/// Parse `git for-each-ref` lines of `HEAD<TAB>name<TAB>date`
pub(crate) fn parse_branch_list(output: &str) -> Vec<Branch> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let head = parts.next()?;
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let last_commit = parts
                .next()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string);
            Some(Branch {
                name: name.to_string(),
                is_current: head.trim() == "*",
                last_commit,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    state: String,
}

/// Interpret `gh pr view --json url,state`
pub(crate) fn parse_pr_view(output: &str) -> PrStatus {
    match serde_json::from_str::<GhPullRequest>(output) {
        Ok(pr) if !pr.url.is_empty() && !pr.state.eq_ignore_ascii_case("closed") => PrStatus {
            has_pr: true,
            url: Some(pr.url),
        },
        _ => PrStatus::default(),
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn branch_name(&self) -> Result<String> {
        // symbolic-ref works on unborn branches, rev-parse covers detached HEAD
        if let Ok(name) = self.git(&["symbolic-ref", "--short", "-q", "HEAD"]).await {
            let name = name.trim();
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
        let sha = self.git(&["rev-parse", "--short", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    async fn changes(&self) -> Result<Vec<FileChange>> {
        let output = self
            .git(&["status", "--porcelain=v1", "-z", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain_z(&output))
    }

    async fn pr_status(&self) -> PrStatus {
        if !self.pr_lookup {
            return PrStatus::default();
        }
        let output = Command::new("gh")
            .args(["pr", "view", "--json", "url,state"])
            .current_dir(&self.root)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                parse_pr_view(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => PrStatus::default(),
            Err(e) => {
                tracing::debug!("gh unavailable: {}", e);
                PrStatus::default()
            }
        }
    }

    async fn recent_branches(&self, limit: usize) -> Result<Vec<Branch>> {
        let count = format!("--count={}", limit);
        let output = self
            .git(&[
                "for-each-ref",
                "--sort=-committerdate",
                &count,
                "--format=%(HEAD)%09%(refname:short)%09%(committerdate:relative)",
                "refs/heads/",
            ])
            .await?;
        Ok(parse_branch_list(&output))
    }

    async fn git_root(&self) -> Result<PathBuf> {
        let output = self.git(&["rev-parse", "--show-toplevel"]).await?;
        Ok(PathBuf::from(output.trim()))
    }

    async fn auto_stash(&self, branch: &str) -> StashOperation {
        match self.changes().await {
            Ok(changes) if changes.is_empty() => return StashOperation::default(),
            Ok(_) => {}
            Err(e) => {
                return StashOperation {
                    did_stash: false,
                    error: Some(e.to_string()),
                }
            }
        }

        let message = auto_stash_message(branch);
        match self
            .git(&["stash", "push", "--include-untracked", "-m", &message])
            .await
        {
            Ok(output) if output.contains("No local changes to save") => StashOperation::default(),
            Ok(_) => {
                tracing::info!(branch = %branch, "Stashed uncommitted changes");
                StashOperation {
                    did_stash: true,
                    error: None,
                }
            }
            Err(e) => StashOperation {
                did_stash: false,
                error: Some(e.to_string()),
            },
        }
    }

    async fn auto_pop_stash(&self, branch: &str) -> PopOutcome {
        let stash_ref = match self.find_auto_stash(branch).await {
            Ok(Some(stash_ref)) => stash_ref,
            Ok(None) => return PopOutcome::NothingToPop,
            Err(e) => {
                tracing::warn!(branch = %branch, "Failed to list stashes: {}", e);
                return PopOutcome::NothingToPop;
            }
        };

        match self.git(&["stash", "pop", &stash_ref]).await {
            Ok(_) => {
                tracing::info!(branch = %branch, "Restored stashed changes");
                PopOutcome::Popped
            }
            Err(e) => {
                // A conflicting pop keeps the stash entry; put the tree back to HEAD
                tracing::warn!(branch = %branch, "Stash pop conflicted: {}", e);
                if let Err(reset_err) = self.git(&["reset", "--hard", "HEAD"]).await {
                    tracing::warn!(branch = %branch, "Failed to reset after conflict: {}", reset_err);
                }
                PopOutcome::Conflict(format!(
                    "Your saved changes for {} could not be reapplied cleanly and are kept in the stash",
                    branch
                ))
            }
        }
    }

    async fn restore_stash_after_failure(&self) -> Result<()> {
        self.git(&["stash", "pop", "stash@{0}"]).await?;
        Ok(())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", branch]).await?;
        Ok(())
    }

    async fn create_branch_from_main(&self, name: &str, main: &str) -> Result<()> {
        let base = if self.branch_exists(main).await {
            main
        } else if self.branch_exists("master").await {
            "master"
        } else {
            return Err(Error::Git(format!(
                "Neither {} nor master exists to branch from",
                main
            )));
        };
        self.git(&["checkout", "-b", name, base]).await?;
        Ok(())
    }

    async fn discard_all_changes(&self) -> Result<()> {
        self.git(&["reset", "--hard", "HEAD"]).await?;
        self.git(&["clean", "-fd"]).await?;
        Ok(())
    }
}
