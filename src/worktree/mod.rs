//! Git worktree seam.
//!
//! [`WorktreeStore`] is implemented by [`GitWorktrees`] (the `git` CLI) and by
//! [`InMemoryWorktrees`] for tests.

mod git;
mod memory;

pub use git::GitWorktrees;
pub use memory::InMemoryWorktrees;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::context::OpContext;
use crate::error::Result;

/// One checked-out worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name, `None` for a detached HEAD.
    pub branch: Option<String>,
}

/// Operations the manager needs from the git worktree/branch store.
#[async_trait]
pub trait WorktreeStore: Send + Sync {
    /// Path of the main repository checkout.
    fn repo_path(&self) -> &Path;

    /// Creates a worktree at `path` on a new branch `branch` from HEAD.
    async fn create_worktree(&self, ctx: &OpContext, path: &Path, branch: &str) -> Result<()>;

    /// Creates a worktree at `path` checking out the existing `branch`.
    async fn create_worktree_from_existing(
        &self,
        ctx: &OpContext,
        path: &Path,
        branch: &str,
    ) -> Result<()>;

    async fn remove_worktree(&self, ctx: &OpContext, path: &Path) -> Result<()>;

    async fn worktree_list(&self, ctx: &OpContext) -> Result<Vec<WorktreeEntry>>;

    /// Returns the worktree path using `branch`, if any.
    async fn worktree_for_branch(&self, ctx: &OpContext, branch: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .worktree_list(ctx)
            .await?
            .into_iter()
            .find(|w| w.branch.as_deref() == Some(branch))
            .map(|w| w.path))
    }

    async fn branch_exists(&self, ctx: &OpContext, branch: &str) -> Result<bool>;

    /// Human-readable last-commit and diff summary for `branch`.
    async fn branch_summary(&self, ctx: &OpContext, branch: &str) -> Result<String>;

    /// Deletes the local branch, and the remote one if `remote` is set.
    async fn delete_branch(&self, ctx: &OpContext, branch: &str, remote: bool) -> Result<()>;

    /// The repository's common `.git` directory, shared by all worktrees.
    async fn git_common_dir(&self, ctx: &OpContext) -> Result<PathBuf>;
}
