//! Stash-protect protocol and snapshot computation

use super::{
    is_valid_branch_name, Branch, BranchMutation, FileChange, GitBackend, GitSnapshot, PopOutcome,
};
use crate::config::GitConfig;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cheap change-detection key used by the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchKey {
    pub branch_name: String,
    pub changes_hash: String,
}

impl WatchKey {
    pub fn new(branch_name: impl Into<String>, changes: &[FileChange]) -> Self {
        Self {
            branch_name: branch_name.into(),
            changes_hash: hash_changes(changes),
        }
    }
}

/// SHA-256 over the JSON encoding of `changes`
pub fn hash_changes(changes: &[FileChange]) -> String {
    let json = serde_json::to_vec(changes).unwrap_or_default();
    format!("{:x}", Sha256::digest(&json))
}

/// Serializes git access and runs branch mutations under stash protection
pub struct GitCoordinator {
    backend: Arc<dyn GitBackend>,
    /// Held for the duration of every git operation
    lock: Mutex<()>,
    main_branch: String,
    recent_branch_limit: usize,
}

impl GitCoordinator {
    pub fn new(backend: Arc<dyn GitBackend>, config: &GitConfig) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
            main_branch: config.main_branch.clone(),
            recent_branch_limit: config.recent_branch_limit,
        }
    }

    pub fn backend(&self) -> &Arc<dyn GitBackend> {
        &self.backend
    }

    /// Full snapshot: branch, changes and pull-request state
    pub async fn snapshot(&self) -> Result<GitSnapshot> {
        let _guard = self.lock.lock().await;
        let branch_name = self.backend.branch_name().await?;
        let changes = self.backend.changes().await?;
        let pr = self.backend.pr_status().await;
        Ok(GitSnapshot {
            branch_name,
            changes,
            has_pr: pr.has_pr,
            pr_url: pr.url,
        })
    }

    /// Branch name and changes hash, without the PR lookup
    pub async fn watch_key(&self) -> Result<WatchKey> {
        let _guard = self.lock.lock().await;
        let branch_name = self.backend.branch_name().await?;
        let changes = self.backend.changes().await?;
        Ok(WatchKey::new(branch_name, &changes))
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        let _guard = self.lock.lock().await;
        self.backend.recent_branches(self.recent_branch_limit).await
    }

    pub async fn git_root(&self) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        self.backend.git_root().await
    }

    /// Check out `target`, carrying uncommitted work with the branch it was made on.
    ///
    /// Changes on the current branch are stashed under that branch's tag and
    /// the target's own stash, if any, is reapplied. A failed checkout puts
    /// the stashed changes back before reporting.
    pub async fn switch_branch(&self, target: &str) -> BranchMutation {
        if !is_valid_branch_name(target) {
            return BranchMutation::failed(target, "Invalid branch name");
        }

        let _guard = self.lock.lock().await;
        let current = match self.backend.branch_name().await {
            Ok(name) => name,
            Err(e) => return BranchMutation::failed(target, e.to_string()),
        };
        if current == target {
            return BranchMutation::ok(target);
        }

        let stash = self.backend.auto_stash(&current).await;
        if let Some(error) = stash.error {
            tracing::warn!(branch = %current, "Aborting switch, stash failed: {}", error);
            return BranchMutation::failed(target, format!("Failed to stash changes: {}", error));
        }

        match self.backend.checkout(target).await {
            Ok(()) => {
                tracing::info!(from = %current, branch = %target, "Switched branch");
                let warning = match self.backend.auto_pop_stash(target).await {
                    PopOutcome::Conflict(message) => Some(message),
                    PopOutcome::Popped | PopOutcome::NothingToPop => None,
                };
                let mut mutation = BranchMutation::ok(&self.current_or(target).await);
                mutation.warning = warning;
                mutation
            }
            Err(e) => {
                tracing::warn!(branch = %target, "Checkout failed: {}", e);
                if stash.did_stash {
                    self.restore(&current).await;
                }
                BranchMutation::failed(target, e.to_string())
            }
        }
    }

    /// Create `name` from the main branch and check it out.
    ///
    /// Uncommitted work stays stashed under the current branch's tag; the new
    /// branch starts clean.
    pub async fn create_branch(&self, name: &str) -> BranchMutation {
        if !is_valid_branch_name(name) {
            return BranchMutation::failed(name, "Invalid branch name");
        }

        let _guard = self.lock.lock().await;
        let current = match self.backend.branch_name().await {
            Ok(branch) => branch,
            Err(e) => return BranchMutation::failed(name, e.to_string()),
        };

        let stash = self.backend.auto_stash(&current).await;
        if let Some(error) = stash.error {
            tracing::warn!(branch = %current, "Aborting create, stash failed: {}", error);
            return BranchMutation::failed(name, format!("Failed to stash changes: {}", error));
        }

        match self
            .backend
            .create_branch_from_main(name, &self.main_branch)
            .await
        {
            Ok(()) => {
                tracing::info!(from = %current, branch = %name, "Created branch");
                BranchMutation::ok(&self.current_or(name).await)
            }
            Err(e) => {
                tracing::warn!(branch = %name, "Branch creation failed: {}", e);
                if stash.did_stash {
                    self.restore(&current).await;
                }
                BranchMutation::failed(name, e.to_string())
            }
        }
    }

    /// Reset tracked files and remove untracked ones, then snapshot
    pub async fn discard_all_changes(&self) -> Result<GitSnapshot> {
        {
            let _guard = self.lock.lock().await;
            self.backend.discard_all_changes().await?;
        }
        tracing::info!("Discarded all working-tree changes");
        self.snapshot().await
    }

    /// Branch actually checked out after a mutation
    async fn current_or(&self, fallback: &str) -> String {
        self.backend
            .branch_name()
            .await
            .unwrap_or_else(|_| fallback.to_string())
    }

    /// Working-tree changes, serialized with other git access
    pub async fn changes(&self) -> Result<Vec<FileChange>> {
        let _guard = self.lock.lock().await;
        self.backend.changes().await
    }

    async fn restore(&self, branch: &str) {
        match self.backend.restore_stash_after_failure().await {
            Ok(()) => tracing::info!(branch = %branch, "Restored stashed changes after failure"),
            Err(e) => tracing::error!(
                branch = %branch,
                "Failed to restore stashed changes, they remain in the stash: {}",
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::fake::FakeGit;
    use crate::git::ChangeStatus;

    fn coordinator(fake: Arc<FakeGit>) -> GitCoordinator {
        GitCoordinator::new(fake, &GitConfig::default())
    }

    #[tokio::test]
    async fn test_switch_carries_changes_with_branch() {
        let fake = Arc::new(FakeGit::on_branch("main", &["feature"]).with_changes(&["a.rs"]));
        let git = coordinator(fake.clone());

        let result = git.switch_branch("feature").await;
        assert!(result.success);
        assert!(result.warning.is_none());
        let (branch, changes, stashes) = fake.snapshot_state();
        assert_eq!(branch, "feature");
        assert!(changes.is_empty());
        assert_eq!(stashes, 1);

        let result = git.switch_branch("main").await;
        assert!(result.success);
        let (branch, changes, stashes) = fake.snapshot_state();
        assert_eq!(branch, "main");
        assert_eq!(changes.len(), 1);
        assert_eq!(stashes, 0);
    }

    #[tokio::test]
    async fn test_switch_with_conflict_keeps_stash() {
        let fake = Arc::new(FakeGit::on_branch("main", &["feature"]).with_changes(&["a.rs"]));
        let git = coordinator(fake.clone());
        git.switch_branch("feature").await;
        fake.set(|s| s.conflict_on_pop = true);

        let result = git.switch_branch("main").await;
        assert!(result.success);
        assert_eq!(result.warning.as_deref(), Some("conflict"));
        let (_, _, stashes) = fake.snapshot_state();
        assert_eq!(stashes, 1);
    }

    #[tokio::test]
    async fn test_failed_checkout_restores_changes() {
        let fake = Arc::new(FakeGit::on_branch("main", &[]).with_changes(&["a.rs", "b.rs"]));
        let git = coordinator(fake.clone());
        let (_, before, _) = fake.snapshot_state();

        let result = git.switch_branch("missing").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("did not match"));

        let (branch, after, stashes) = fake.snapshot_state();
        assert_eq!(branch, "main");
        assert_eq!(before, after);
        assert_eq!(stashes, 0);
    }

    #[tokio::test]
    async fn test_stash_failure_aborts_before_checkout() {
        let fake = Arc::new(FakeGit::on_branch("main", &["feature"]).with_changes(&["a.rs"]));
        fake.set(|s| s.fail_stash = true);
        let git = coordinator(fake.clone());

        let result = git.switch_branch("feature").await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Failed to stash changes: stash failed")
        );
        let calls = fake.state.lock().unwrap().calls.clone();
        assert!(!calls.iter().any(|c| c.starts_with("checkout")));
    }

    #[tokio::test]
    async fn test_invalid_name_touches_nothing() {
        let fake = Arc::new(FakeGit::on_branch("main", &[]).with_changes(&["a.rs"]));
        let git = coordinator(fake.clone());

        let result = git.switch_branch("bad..name").await;
        assert!(!result.success);
        let result = git.create_branch("-x").await;
        assert!(!result.success);
        assert!(fake.state.lock().unwrap().calls.is_empty());
    }

    #[tokio::test]
    async fn test_switch_to_current_branch_is_noop() {
        let fake = Arc::new(FakeGit::on_branch("main", &[]).with_changes(&["a.rs"]));
        let git = coordinator(fake.clone());
        assert!(git.switch_branch("main").await.success);
        assert!(fake.state.lock().unwrap().calls.is_empty());
    }

    #[tokio::test]
    async fn test_create_branch_starts_clean() {
        let fake = Arc::new(FakeGit::on_branch("main", &[]).with_changes(&["a.rs"]));
        let git = coordinator(fake.clone());

        let result = git.create_branch("feature/new").await;
        assert!(result.success);
        let (branch, changes, stashes) = fake.snapshot_state();
        assert_eq!(branch, "feature/new");
        assert!(changes.is_empty());
        assert_eq!(stashes, 1);
        let calls = fake.state.lock().unwrap().calls.clone();
        assert!(calls.contains(&"create:feature/new:main".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("pop")));
    }

    #[tokio::test]
    async fn test_create_existing_branch_restores() {
        let fake = Arc::new(FakeGit::on_branch("main", &["taken"]).with_changes(&["a.rs"]));
        let git = coordinator(fake.clone());

        let result = git.create_branch("taken").await;
        assert!(!result.success);
        let (branch, changes, stashes) = fake.snapshot_state();
        assert_eq!(branch, "main");
        assert_eq!(changes.len(), 1);
        assert_eq!(stashes, 0);
    }

    #[tokio::test]
    async fn test_snapshot_and_watch_key() {
        let fake = Arc::new(FakeGit::on_branch("main", &[]).with_changes(&["a.rs"]));
        fake.set(|s| s.pr = Some("https://example.com/pr/1".to_string()));
        let git = coordinator(fake.clone());

        let snapshot = git.snapshot().await.unwrap();
        assert_eq!(snapshot.branch_name, "main");
        assert!(snapshot.has_pr);
        assert_eq!(snapshot.changes.len(), 1);

        let key = git.watch_key().await.unwrap();
        assert_eq!(key, WatchKey::new("main", &snapshot.changes));

        fake.set(|s| s.changes.clear());
        let changed = git.watch_key().await.unwrap();
        assert_ne!(key, changed);
        assert_eq!(changed.branch_name, key.branch_name);
    }

    #[tokio::test]
    async fn test_discard_returns_clean_snapshot() {
        let fake = Arc::new(FakeGit::on_branch("main", &[]).with_changes(&["a.rs"]));
        let git = coordinator(fake.clone());
        let snapshot = git.discard_all_changes().await.unwrap();
        assert!(snapshot.changes.is_empty());

        fake.set(|s| s.fail_discard = true);
        assert!(git.discard_all_changes().await.is_err());
    }

    #[tokio::test]
    async fn test_list_branches_respects_limit() {
        let fake = Arc::new(FakeGit::on_branch("main", &["a", "b", "c"]));
        let mut config = GitConfig::default();
        config.recent_branch_limit = 2;
        let git = GitCoordinator::new(fake, &config);
        let branches = git.list_branches().await.unwrap();
        assert_eq!(branches.len(), 2);
        assert!(branches[0].is_current);
    }

    #[test]
    fn test_hash_changes_is_stable() {
        let changes = vec![FileChange {
            file: "a".to_string(),
            status: ChangeStatus::Added,
        }];
        assert_eq!(hash_changes(&changes), hash_changes(&changes.clone()));
        assert_ne!(hash_changes(&changes), hash_changes(&[]));
        assert_eq!(hash_changes(&[]).len(), 64);
    }
}
