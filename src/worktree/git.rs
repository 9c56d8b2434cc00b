//! Worktree store backed by the `git` CLI.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::context::OpContext;
use crate::error::{Error, Result};

use super::{WorktreeEntry, WorktreeStore};

/// Result of a git invocation.
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Worktree store that runs git against a repository on disk.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    /// Path to the main repository checkout.
    repo_path: PathBuf,
    /// Remote used for remote branch deletion.
    remote: String,
}

impl GitWorktrees {
    /// Creates a store for the repository at `repo_path`.
    pub fn new(repo_path: PathBuf) -> Self {
        Self {
            repo_path,
            remote: "origin".to_string(),
        }
    }

    /// Opens the main checkout of the repository containing `dir`.
    ///
    /// `dir` may be any directory inside the checkout or inside one of its
    /// linked worktrees.
    pub async fn discover(ctx: &OpContext, dir: &Path) -> Result<Self> {
        let nested = Self::new(dir.to_path_buf());
        let toplevel = nested.git(ctx, ["rev-parse", "--show-toplevel"]).await?;
        let common = nested.git_common_dir(ctx).await?;

        // Linked worktrees share the main checkout's `.git` directory
        let repo_path = match common.parent() {
            Some(parent) if common.ends_with(".git") => parent.to_path_buf(),
            _ => PathBuf::from(toplevel),
        };
        tracing::debug!(dir = ?dir, repo = ?repo_path, "discovered repository");
        Ok(Self::new(repo_path))
    }

    /// Uses a remote other than `origin`.
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    async fn exec<I, S>(&self, ctx: &OpContext, args: I) -> Result<GitOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tracing::debug!(repo = ?self.repo_path, cmd = ?cmd.as_std(), "running git");

        let child = cmd
            .spawn()
            .map_err(|e| Error::Git(format!("failed to spawn git: {}", e)))?;
        let output = ctx
            .run(async move { child.wait_with_output().await.map_err(Error::from) })
            .await?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn git<I, S>(&self, ctx: &OpContext, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.exec(ctx, args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(Error::Git(out.stderr))
        }
    }

    async fn default_branch(&self, ctx: &OpContext) -> Option<String> {
        let head = self
            .git(ctx, ["symbolic-ref", "--short", "HEAD"])
            .await
            .ok()?;
        if head.is_empty() {
            None
        } else {
            Some(head)
        }
    }
}

/// Parses `git worktree list --porcelain`.
fn parse_worktree_porcelain(stdout: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(reference) = line.strip_prefix("branch ") {
            if let Some(entry) = current.as_mut() {
                let short = reference.strip_prefix("refs/heads/").unwrap_or(reference);
                entry.branch = Some(short.to_string());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

#[async_trait]
impl WorktreeStore for GitWorktrees {
    fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn create_worktree(&self, ctx: &OpContext, path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let out = self
            .exec(
                ctx,
                [
                    OsStr::new("worktree"),
                    OsStr::new("add"),
                    OsStr::new("-b"),
                    OsStr::new(branch),
                    path.as_os_str(),
                    OsStr::new("HEAD"),
                ],
            )
            .await?;

        if !out.success {
            return Err(Error::WorktreeCreation {
                path: path.to_path_buf(),
                reason: format!("git worktree add failed: {}", out.stderr),
            });
        }

        tracing::info!(path = ?path, branch = %branch, "created worktree");
        Ok(())
    }

    async fn create_worktree_from_existing(
        &self,
        ctx: &OpContext,
        path: &Path,
        branch: &str,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let out = self
            .exec(
                ctx,
                [
                    OsStr::new("worktree"),
                    OsStr::new("add"),
                    path.as_os_str(),
                    OsStr::new(branch),
                ],
            )
            .await?;

        if !out.success {
            return Err(Error::WorktreeCreation {
                path: path.to_path_buf(),
                reason: format!("git worktree add failed: {}", out.stderr),
            });
        }

        tracing::info!(path = ?path, branch = %branch, "created worktree for existing branch");
        Ok(())
    }

    async fn remove_worktree(&self, ctx: &OpContext, path: &Path) -> Result<()> {
        let out = self
            .exec(
                ctx,
                [
                    OsStr::new("worktree"),
                    OsStr::new("remove"),
                    OsStr::new("--force"),
                    path.as_os_str(),
                ],
            )
            .await?;

        if !out.success {
            return Err(Error::WorktreeRemoval {
                path: path.to_path_buf(),
                reason: out.stderr,
            });
        }

        // Stale administrative entries are harmless; pruning is best-effort
        if let Err(e) = self.git(ctx, ["worktree", "prune"]).await {
            tracing::warn!(error = %e, "git worktree prune failed");
        }

        tracing::info!(path = ?path, "removed worktree");
        Ok(())
    }

    async fn worktree_list(&self, ctx: &OpContext) -> Result<Vec<WorktreeEntry>> {
        let stdout = self.git(ctx, ["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_porcelain(&stdout))
    }

    async fn branch_exists(&self, ctx: &OpContext, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        let out = self
            .exec(ctx, ["show-ref", "--verify", "--quiet", reference.as_str()])
            .await?;
        Ok(out.success)
    }

    async fn branch_summary(&self, ctx: &OpContext, branch: &str) -> Result<String> {
        let last_commit = self
            .git(ctx, ["log", "-1", "--format=%h %s (%cr, %an)", branch])
            .await?;

        let mut summary = format!("last commit: {}", last_commit);

        if let Some(base) = self.default_branch(ctx).await {
            if base != branch {
                let range = format!("{}...{}", base, branch);
                let commits = format!("{}..{}", base, branch);
                let ahead = self
                    .git(ctx, ["rev-list", "--count", commits.as_str()])
                    .await
                    .unwrap_or_default();
                let stat = self
                    .git(ctx, ["diff", "--shortstat", range.as_str()])
                    .await
                    .unwrap_or_default();

                if !ahead.is_empty() {
                    summary.push_str(&format!("\n{} commit(s) ahead of {}", ahead, base));
                }
                if !stat.is_empty() {
                    summary.push_str(&format!("\n{}", stat));
                }
            }
        }

        Ok(summary)
    }

    async fn delete_branch(&self, ctx: &OpContext, branch: &str, remote: bool) -> Result<()> {
        self.git(ctx, ["branch", "-D", branch]).await?;
        tracing::info!(branch = %branch, "deleted local branch");

        if remote {
            self.git(ctx, ["push", self.remote.as_str(), "--delete", branch])
                .await?;
            tracing::info!(branch = %branch, remote = %self.remote, "deleted remote branch");
        }
        Ok(())
    }

    async fn git_common_dir(&self, ctx: &OpContext) -> Result<PathBuf> {
        let dir = self
            .git(ctx, ["rev-parse", "--path-format=absolute", "--git-common-dir"])
            .await?;
        Ok(PathBuf::from(dir))
    }
}
