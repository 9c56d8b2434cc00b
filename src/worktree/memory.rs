//! In-memory worktree store for tests.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::context::OpContext;
use crate::error::{Error, Result};

use super::{WorktreeEntry, WorktreeStore};

#[derive(Debug, Default)]
struct State {
    /// Branch name to a canned summary.
    branches: BTreeMap<String, String>,
    /// Worktree path to branch name.
    worktrees: BTreeMap<PathBuf, String>,
    fail_create: bool,
    fail_remove: HashSet<PathBuf>,
    deleted: Vec<(String, bool)>,
}

/// Deterministic [`WorktreeStore`] with failure injection.
///
/// With [`InMemoryWorktrees::materialized`] the worktree directories are also
/// created and removed on disk, so file copies into them work.
#[derive(Debug)]
pub struct InMemoryWorktrees {
    repo_path: PathBuf,
    materialize: bool,
    state: Mutex<State>,
}

impl InMemoryWorktrees {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            materialize: false,
            state: Mutex::new(State::default()),
        }
    }

    /// Also creates and deletes worktree directories on disk.
    pub fn materialized(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            materialize: true,
            ..Self::new(repo_path)
        }
    }

    /// Adds a branch with a canned summary.
    pub fn add_branch(&self, branch: impl Into<String>, summary: impl Into<String>) {
        self.lock().branches.insert(branch.into(), summary.into());
    }

    /// Registers an existing worktree for `branch` at `path`.
    pub fn add_worktree(&self, path: impl Into<PathBuf>, branch: impl Into<String>) {
        let branch = branch.into();
        let mut st = self.lock();
        st.branches.entry(branch.clone()).or_default();
        st.worktrees.insert(path.into(), branch);
    }

    /// Makes every worktree creation fail.
    pub fn fail_create(&self) {
        self.lock().fail_create = true;
    }

    /// Makes removal of the worktree at `path` fail.
    pub fn fail_remove_of(&self, path: impl Into<PathBuf>) {
        self.lock().fail_remove.insert(path.into());
    }

    /// Returns true if a worktree exists at `path`.
    pub fn has_worktree(&self, path: &Path) -> bool {
        self.lock().worktrees.contains_key(path)
    }

    /// Returns true if `branch` exists.
    pub fn has_branch(&self, branch: &str) -> bool {
        self.lock().branches.contains_key(branch)
    }

    /// Branch deletions performed, as `(branch, remote)`.
    pub fn deleted_branches(&self) -> Vec<(String, bool)> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, path: &Path, branch: &str, must_exist: bool) -> Result<()> {
        let mut st = self.lock();
        let creation_err = |reason: &str| Error::WorktreeCreation {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if st.fail_create {
            return Err(creation_err("injected worktree failure"));
        }
        if st.worktrees.contains_key(path) {
            return Err(creation_err("path already exists"));
        }
        if st.worktrees.values().any(|b| b == branch) {
            return Err(creation_err("branch is already checked out"));
        }
        let exists = st.branches.contains_key(branch);
        if must_exist && !exists {
            return Err(creation_err("invalid reference"));
        }
        if !must_exist && exists {
            return Err(creation_err("a branch with that name already exists"));
        }

        if self.materialize {
            std::fs::create_dir_all(path).map_err(|e| creation_err(&e.to_string()))?;
        }
        st.branches.entry(branch.to_string()).or_default();
        st.worktrees.insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }
}

#[async_trait]
impl WorktreeStore for InMemoryWorktrees {
    fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn create_worktree(&self, ctx: &OpContext, path: &Path, branch: &str) -> Result<()> {
        ctx.check()?;
        self.add(path, branch, false)
    }

    async fn create_worktree_from_existing(
        &self,
        ctx: &OpContext,
        path: &Path,
        branch: &str,
    ) -> Result<()> {
        ctx.check()?;
        self.add(path, branch, true)
    }

    async fn remove_worktree(&self, ctx: &OpContext, path: &Path) -> Result<()> {
        ctx.check()?;
        let mut st = self.lock();
        if st.fail_remove.contains(path) {
            return Err(Error::WorktreeRemoval {
                path: path.to_path_buf(),
                reason: "injected removal failure".to_string(),
            });
        }
        if st.worktrees.remove(path).is_none() {
            return Err(Error::WorktreeRemoval {
                path: path.to_path_buf(),
                reason: "not a working tree".to_string(),
            });
        }
        if self.materialize && path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    async fn worktree_list(&self, ctx: &OpContext) -> Result<Vec<WorktreeEntry>> {
        ctx.check()?;
        Ok(self
            .lock()
            .worktrees
            .iter()
            .map(|(path, branch)| WorktreeEntry {
                path: path.clone(),
                branch: Some(branch.clone()),
            })
            .collect())
    }

    async fn branch_exists(&self, ctx: &OpContext, branch: &str) -> Result<bool> {
        ctx.check()?;
        Ok(self.has_branch(branch))
    }

    async fn branch_summary(&self, ctx: &OpContext, branch: &str) -> Result<String> {
        ctx.check()?;
        self.lock()
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| Error::Git(format!("unknown branch {}", branch)))
    }

    async fn delete_branch(&self, ctx: &OpContext, branch: &str, remote: bool) -> Result<()> {
        ctx.check()?;
        let mut st = self.lock();
        if st.worktrees.values().any(|b| b == branch) {
            return Err(Error::Git(format!("branch {} is checked out", branch)));
        }
        if st.branches.remove(branch).is_none() {
            return Err(Error::Git(format!("branch {} not found", branch)));
        }
        st.deleted.push((branch.to_string(), remote));
        Ok(())
    }

    async fn git_common_dir(&self, ctx: &OpContext) -> Result<PathBuf> {
        ctx.check()?;
        Ok(self.repo_path.join(".git"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_branch_worktree_round_trip() {
        let store = InMemoryWorktrees::new("/repo");
        let ctx = OpContext::new();
        let path = Path::new("/repo-worktrees/x");

        store.create_worktree(&ctx, path, "x").await.unwrap();
        assert!(store.branch_exists(&ctx, "x").await.unwrap());
        assert_eq!(
            store.worktree_for_branch(&ctx, "x").await.unwrap(),
            Some(path.to_path_buf())
        );

        store.remove_worktree(&ctx, path).await.unwrap();
        assert!(!store.has_worktree(path));
        assert!(store.has_branch("x"));
    }

    #[tokio::test]
    async fn existing_branch_required_for_checkout() {
        let store = InMemoryWorktrees::new("/repo");
        let ctx = OpContext::new();

        let err = store
            .create_worktree_from_existing(&ctx, Path::new("/w/y"), "y")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorktreeCreation { .. }));

        store.add_branch("y", "last commit: abc fix");
        store
            .create_worktree_from_existing(&ctx, Path::new("/w/y"), "y")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn checked_out_branch_cannot_be_deleted() {
        let store = InMemoryWorktrees::new("/repo");
        let ctx = OpContext::new();
        store.add_worktree("/w/z", "z");

        assert!(store.delete_branch(&ctx, "z", false).await.is_err());
        store.remove_worktree(&ctx, Path::new("/w/z")).await.unwrap();
        store.delete_branch(&ctx, "z", true).await.unwrap();
        assert_eq!(store.deleted_branches(), vec![("z".to_string(), true)]);
    }
}
