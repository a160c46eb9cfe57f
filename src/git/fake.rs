//! In-memory [`GitBackend`] used by coordinator and broker tests

use super::{Branch, ChangeStatus, FileChange, GitBackend, PopOutcome, PrStatus, StashOperation};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct FakeState {
    pub branch: String,
    pub branches: Vec<String>,
    pub changes: Vec<FileChange>,
    /// Per-branch committed content is not modelled; stashes hold changes
    pub stashes: Vec<(String, Vec<FileChange>)>,
    pub fail_stash: bool,
    pub fail_checkout: bool,
    pub conflict_on_pop: bool,
    pub fail_discard: bool,
    pub pr: Option<String>,
    /// Reported git root; defaults to `/repo`
    pub root: PathBuf,
    pub calls: Vec<String>,
}

/// In-memory [`GitBackend`] for protocol tests
#[derive(Debug, Default)]
pub struct FakeGit {
    pub state: std::sync::Mutex<FakeState>,
}

impl FakeGit {
    pub fn on_branch(branch: &str, others: &[&str]) -> Self {
        let mut branches = vec![branch.to_string()];
        branches.extend(others.iter().map(|b| b.to_string()));
        Self {
            state: std::sync::Mutex::new(FakeState {
                branch: branch.to_string(),
                branches,
                root: PathBuf::from("/repo"),
                ..Default::default()
            }),
        }
    }

    pub fn with_changes(self, files: &[&str]) -> Self {
        self.state.lock().unwrap().changes = files
            .iter()
            .map(|f| FileChange {
                file: f.to_string(),
                status: ChangeStatus::Modified,
            })
            .collect();
        self
    }

    pub fn set<F: FnOnce(&mut FakeState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn snapshot_state(&self) -> (String, Vec<FileChange>, usize) {
        let s = self.state.lock().unwrap();
        (s.branch.clone(), s.changes.clone(), s.stashes.len())
    }
}

#[async_trait]
impl GitBackend for FakeGit {
    async fn branch_name(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().branch.clone())
    }

    async fn changes(&self) -> Result<Vec<FileChange>> {
        Ok(self.state.lock().unwrap().changes.clone())
    }

    async fn pr_status(&self) -> PrStatus {
        let s = self.state.lock().unwrap();
        PrStatus {
            has_pr: s.pr.is_some(),
            url: s.pr.clone(),
        }
    }

    async fn recent_branches(&self, limit: usize) -> Result<Vec<Branch>> {
        let s = self.state.lock().unwrap();
        Ok(s.branches
            .iter()
            .take(limit)
            .map(|name| Branch {
                name: name.clone(),
                is_current: *name == s.branch,
                last_commit: None,
            })
            .collect())
    }

    async fn git_root(&self) -> Result<PathBuf> {
        Ok(self.state.lock().unwrap().root.clone())
    }

    async fn auto_stash(&self, branch: &str) -> StashOperation {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("stash:{}", branch));
        if s.changes.is_empty() {
            return StashOperation::default();
        }
        if s.fail_stash {
            return StashOperation {
                did_stash: false,
                error: Some("stash failed".to_string()),
            };
        }
        let changes = std::mem::take(&mut s.changes);
        s.stashes.insert(0, (branch.to_string(), changes));
        StashOperation {
            did_stash: true,
            error: None,
        }
    }

    async fn auto_pop_stash(&self, branch: &str) -> PopOutcome {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("pop:{}", branch));
        let Some(index) = s.stashes.iter().position(|(b, _)| b == branch) else {
            return PopOutcome::NothingToPop;
        };
        if s.conflict_on_pop {
            return PopOutcome::Conflict("conflict".to_string());
        }
        let (_, changes) = s.stashes.remove(index);
        s.changes = changes;
        PopOutcome::Popped
    }

    async fn restore_stash_after_failure(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("restore".to_string());
        if s.stashes.is_empty() {
            return Err(Error::Git("No stash entries found".to_string()));
        }
        let (_, changes) = s.stashes.remove(0);
        s.changes = changes;
        Ok(())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("checkout:{}", branch));
        if s.fail_checkout || !s.branches.iter().any(|b| b == branch) {
            return Err(Error::Git(format!(
                "pathspec '{}' did not match any file(s) known to git",
                branch
            )));
        }
        s.branch = branch.to_string();
        Ok(())
    }

    async fn create_branch_from_main(&self, name: &str, main: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("create:{}:{}", name, main));
        if s.branches.iter().any(|b| b == name) {
            return Err(Error::Git(format!(
                "a branch named '{}' already exists",
                name
            )));
        }
        s.branches.insert(0, name.to_string());
        s.branch = name.to_string();
        Ok(())
    }

    async fn discard_all_changes(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_discard {
            return Err(Error::Git("index.lock exists".to_string()));
        }
        s.changes.clear();
        Ok(())
    }
}
