//! Workstream lifecycle: create, destroy, rebuild, pause and resume.
//!
//! A workstream is one branch, one worktree and at most one container. The
//! orchestrator drives the container runtime and the worktree store through
//! those transitions, rolling back partial state when creation fails.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::build_lock::{BuildLockRegistry, ImageOutcome};
use crate::config::{ManagerConfig, Validate};
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::naming::{self, LABEL_BRANCH, LABEL_PROJECT, LABEL_WORKSTREAM};
use crate::runtime::{
    ContainerConfig, ContainerInfo, ContainerRuntime, ImageBuildSpec, Mount, ResourceLimits,
};
use crate::security::{
    load_project_security, run_with_fallback, save_project_security, ResolvedSecurity,
    SecurityConfig, SecurityRelaxation, SecurityTier,
};
use crate::tracker::ContainerTracker;
use crate::worktree::WorktreeStore;

/// Time allowed for cleanup after a failed or cancelled operation.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Command keeping a dev container alive between sessions.
const KEEPALIVE_COMMAND: [&str; 2] = ["sleep", "infinity"];

/// A unit of work bound to one branch, one worktree and at most one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workstream {
    pub id: String,
    pub branch_name: String,
    /// Set only after a container was created and started.
    pub container_id: Option<String>,
    /// Set only after the worktree and container both exist.
    pub worktree_path: Option<PathBuf>,
}

impl Workstream {
    /// Creates an empty workstream for `branch_name` with a fresh ID.
    pub fn new(branch_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            branch_name: branch_name.into(),
            container_id: None,
            worktree_path: None,
        }
    }
}

/// Options for creating (or rebuilding) a workstream container.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Image to run. Falls back to the manager's configured image.
    pub image: Option<String>,
    /// Build the image under the build lock if it does not exist yet.
    pub build: Option<ImageBuildSpec>,
    /// Explicit security settings. Otherwise the project override is used.
    pub security: Option<SecurityConfig>,
    /// Zero fields fall back to the manager config, then the global defaults.
    pub limits: ResourceLimits,
    /// Untracked files, relative to the repository, copied into the worktree.
    pub copy_files: Vec<PathBuf>,
    /// Additional mounts (e.g. from a devcontainer definition).
    pub extra_mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    /// Use a worktree that already has the branch checked out instead of
    /// failing. A reused worktree is never rolled back.
    pub reuse_existing_worktree: bool,
}

/// Options for destroying a workstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Remove only the container.
    pub keep_worktree: bool,
    /// Delete the local branch after removing the worktree.
    pub delete_branch: bool,
    /// Also delete the branch on the remote.
    pub delete_remote_branch: bool,
}

/// Result of a successful create or rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateResult {
    pub container_id: String,
    pub worktree_path: PathBuf,
    /// Present when the container only started at a weaker tier.
    pub security_relaxation: Option<SecurityRelaxation>,
    /// Present when an image build spec was supplied.
    pub image: Option<ImageOutcome>,
}

/// An existing branch that a new workstream would collide with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConflict {
    pub branch_name: String,
    pub has_worktree: bool,
    pub worktree_path: Option<PathBuf>,
    /// Last commit and diff summary, for display.
    pub branch_info: String,
}

/// Container side of a create, before it is recorded on the workstream.
struct Launch {
    container_id: String,
    relaxation: Option<SecurityRelaxation>,
    image: Option<ImageOutcome>,
}

/// Drives workstream lifecycle transitions for one repository.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    worktrees: Arc<dyn WorktreeStore>,
    build_locks: Arc<BuildLockRegistry>,
    tracker: Option<Arc<ContainerTracker>>,
    config: ManagerConfig,
    project: String,
}

impl Orchestrator {
    /// Creates an orchestrator for the repository behind `worktrees`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        worktrees: Arc<dyn WorktreeStore>,
        config: ManagerConfig,
    ) -> Self {
        let project = naming::project_name(worktrees.repo_path());
        Self {
            runtime,
            worktrees,
            build_locks: Arc::new(BuildLockRegistry::new()),
            tracker: None,
            config,
            project,
        }
    }

    /// Shares a build-lock registry with other orchestrators.
    pub fn with_build_locks(mut self, build_locks: Arc<BuildLockRegistry>) -> Self {
        self.build_locks = build_locks;
        self
    }

    /// Records created and destroyed containers in `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<ContainerTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn repo_path(&self) -> &Path {
        self.worktrees.repo_path()
    }

    /// Deterministic worktree location for `branch`.
    pub fn worktree_path_for(&self, branch: &str) -> PathBuf {
        self.config
            .worktree_root_for(self.repo_path())
            .join(naming::sanitize_branch_name(branch))
    }

    /// Creates the worktree and container for `ws`.
    ///
    /// `ws` is only updated on success. On failure the worktree created by
    /// this call is removed again.
    pub async fn create_workstream(
        &self,
        ctx: &OpContext,
        ws: &mut Workstream,
        opts: &CreateOptions,
    ) -> Result<CreateResult> {
        if ws.container_id.is_some() {
            return Err(Error::InvalidState(format!(
                "workstream {} already has a container",
                ws.id
            )));
        }

        let (worktree_path, created_worktree) = self.add_worktree(ctx, ws, opts).await?;

        let launched = match self.copy_untracked_files(&opts.copy_files, &worktree_path).await {
            Ok(()) => self.launch_container(ctx, ws, &worktree_path, opts).await,
            Err(e) => Err(e),
        };

        let launch = match launched {
            Ok(launch) => launch,
            Err(e) => {
                if created_worktree {
                    self.rollback_worktree(&worktree_path).await;
                }
                return Err(e);
            }
        };

        ws.container_id = Some(launch.container_id.clone());
        ws.worktree_path = Some(worktree_path.clone());
        self.track(ws, &launch.container_id);

        tracing::info!(
            workstream = %ws.id,
            branch = %ws.branch_name,
            container_id = %launch.container_id,
            path = ?worktree_path,
            "workstream created"
        );

        Ok(CreateResult {
            container_id: launch.container_id,
            worktree_path,
            security_relaxation: launch.relaxation,
            image: launch.image,
        })
    }

    /// Removes the container and, unless told otherwise, the worktree.
    ///
    /// Every step is attempted; failures are collected and reported together.
    pub async fn destroy_workstream(
        &self,
        ctx: &OpContext,
        ws: &mut Workstream,
        opts: &DestroyOptions,
    ) -> Result<()> {
        let mut errors = Vec::new();

        if let Some(container_id) = ws.container_id.clone() {
            match self.remove_container(ctx, &container_id).await {
                Ok(()) => {
                    ws.container_id = None;
                    self.untrack(&container_id);
                }
                Err(e) => errors.push(e),
            }
        }

        if !opts.keep_worktree {
            let path = match &ws.worktree_path {
                Some(path) => Some(path.clone()),
                None => self
                    .worktrees
                    .worktree_for_branch(ctx, &ws.branch_name)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, branch = %ws.branch_name, "worktree lookup failed");
                        None
                    }),
            };

            let mut worktree_gone = true;
            if let Some(path) = path {
                match self.worktrees.remove_worktree(ctx, &path).await {
                    Ok(()) => ws.worktree_path = None,
                    Err(e) => {
                        worktree_gone = false;
                        errors.push(e);
                    }
                }
            }

            if opts.delete_branch && worktree_gone {
                if let Err(e) = self
                    .worktrees
                    .delete_branch(ctx, &ws.branch_name, opts.delete_remote_branch)
                    .await
                {
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            tracing::info!(workstream = %ws.id, branch = %ws.branch_name, "workstream destroyed");
        } else {
            tracing::warn!(
                workstream = %ws.id,
                failures = errors.len(),
                "workstream destroy finished with errors"
            );
        }
        Error::from_collected(errors)
    }

    /// Replaces the container, keeping the worktree and branch untouched.
    pub async fn rebuild_workstream(
        &self,
        ctx: &OpContext,
        ws: &mut Workstream,
        opts: &CreateOptions,
    ) -> Result<CreateResult> {
        let worktree_path = ws.worktree_path.clone().ok_or_else(|| {
            Error::InvalidState(format!("workstream {} has no worktree to rebuild", ws.id))
        })?;

        self.destroy_workstream(
            ctx,
            ws,
            &DestroyOptions {
                keep_worktree: true,
                ..Default::default()
            },
        )
        .await?;

        let launch = self.launch_container(ctx, ws, &worktree_path, opts).await?;
        ws.container_id = Some(launch.container_id.clone());
        self.track(ws, &launch.container_id);

        tracing::info!(
            workstream = %ws.id,
            container_id = %launch.container_id,
            "workstream rebuilt"
        );

        Ok(CreateResult {
            container_id: launch.container_id,
            worktree_path,
            security_relaxation: launch.relaxation,
            image: launch.image,
        })
    }

    pub async fn pause_workstream(&self, ctx: &OpContext, ws: &Workstream) -> Result<()> {
        let id = Self::require_container(ws)?;
        self.runtime.pause_container(ctx, id).await?;
        tracing::info!(workstream = %ws.id, container_id = %id, "workstream paused");
        Ok(())
    }

    pub async fn resume_workstream(&self, ctx: &OpContext, ws: &Workstream) -> Result<()> {
        let id = Self::require_container(ws)?;
        self.runtime.unpause_container(ctx, id).await?;
        tracing::info!(workstream = %ws.id, container_id = %id, "workstream resumed");
        Ok(())
    }

    /// Reports on an existing branch, or `None` if the branch is free.
    pub async fn check_branch_conflict(
        &self,
        ctx: &OpContext,
        branch: &str,
    ) -> Result<Option<BranchConflict>> {
        if !self.worktrees.branch_exists(ctx, branch).await? {
            return Ok(None);
        }

        let worktree_path = self.worktrees.worktree_for_branch(ctx, branch).await?;
        let branch_info = self
            .worktrees
            .branch_summary(ctx, branch)
            .await
            .unwrap_or_else(|e| format!("(summary unavailable: {})", e));

        Ok(Some(BranchConflict {
            branch_name: branch.to_string(),
            has_worktree: worktree_path.is_some(),
            worktree_path,
            branch_info,
        }))
    }

    /// Lists every container in this project's namespace.
    pub async fn list_containers(&self, ctx: &OpContext) -> Result<Vec<ContainerInfo>> {
        let prefix = naming::project_prefix(&self.config.container_prefix, &self.project);
        self.runtime.list_containers(ctx, &prefix).await
    }

    /// Rebuilds a workstream handle for `branch` from the runtime and
    /// worktree store.
    pub async fn load_workstream(&self, ctx: &OpContext, branch: &str) -> Result<Workstream> {
        let container = self.containers_for_branch(ctx, branch).await?.into_iter().next();
        let worktree_path = self.worktrees.worktree_for_branch(ctx, branch).await?;

        let id = container
            .as_ref()
            .and_then(|c| c.labels.get(LABEL_WORKSTREAM).cloned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Workstream {
            id,
            branch_name: branch.to_string(),
            container_id: container.map(|c| c.id),
            worktree_path,
        })
    }

    /// Containers in this project's namespace that belong to `branch`.
    ///
    /// Matches on the branch label, falling back to the name for containers
    /// without labels.
    async fn containers_for_branch(
        &self,
        ctx: &OpContext,
        branch: &str,
    ) -> Result<Vec<ContainerInfo>> {
        let sanitized = naming::sanitize_branch_name(branch);
        let containers = self.list_containers(ctx).await?;
        Ok(containers
            .into_iter()
            .filter(|c| match c.labels.get(LABEL_BRANCH) {
                Some(label) => label == branch,
                None => {
                    naming::branch_from_container_name(
                        &self.config.container_prefix,
                        &self.project,
                        &c.name,
                    )
                    .as_deref()
                        == Some(sanitized.as_str())
                }
            })
            .collect())
    }

    fn require_container(ws: &Workstream) -> Result<&str> {
        ws.container_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidState(format!("workstream {} has no container", ws.id)))
    }

    /// Creates the worktree for `ws`. Returns its path and whether this call
    /// created it.
    async fn add_worktree(
        &self,
        ctx: &OpContext,
        ws: &Workstream,
        opts: &CreateOptions,
    ) -> Result<(PathBuf, bool)> {
        let branch = &ws.branch_name;

        if opts.reuse_existing_worktree {
            if let Some(existing) = self.worktrees.worktree_for_branch(ctx, branch).await? {
                // Two live containers would share one checkout
                if let Some(live) = self
                    .containers_for_branch(ctx, branch)
                    .await?
                    .into_iter()
                    .find(|c| c.state.is_active())
                {
                    return Err(Error::InvalidState(format!(
                        "branch {} already has a {} container {}",
                        branch, live.state, live.name
                    )));
                }
                tracing::info!(branch = %branch, path = ?existing, "reusing existing worktree");
                return Ok((existing, false));
            }
        }

        let path = self.worktree_path_for(branch);
        let created = if self.worktrees.branch_exists(ctx, branch).await? {
            self.worktrees
                .create_worktree_from_existing(ctx, &path, branch)
                .await
        } else {
            self.worktrees.create_worktree(ctx, &path, branch).await
        };

        created.map_err(|e| match e {
            Error::WorktreeCreation { .. } | Error::Cancelled | Error::DeadlineExceeded => e,
            other => Error::WorktreeCreation {
                path: path.clone(),
                reason: other.to_string(),
            },
        })?;
        Ok((path, true))
    }

    async fn rollback_worktree(&self, path: &Path) {
        let cleanup = OpContext::with_timeout(CLEANUP_TIMEOUT);
        match self.worktrees.remove_worktree(&cleanup, path).await {
            Ok(()) => tracing::info!(path = ?path, "rolled back worktree"),
            Err(e) => tracing::error!(error = %e, path = ?path, "failed to roll back worktree"),
        }
    }

    /// Copies untracked files from the repository into the worktree.
    ///
    /// Stops at the first failure.
    async fn copy_untracked_files(&self, files: &[PathBuf], worktree_path: &Path) -> Result<()> {
        for rel in files {
            if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(Error::Config(format!(
                    "copy path '{}' must be relative to the repository",
                    rel.display()
                )));
            }

            let src = self.repo_path().join(rel);
            let dst = worktree_path.join(rel);
            let copy_err = |e: std::io::Error| Error::WorktreeCreation {
                path: worktree_path.to_path_buf(),
                reason: format!("failed to copy {}: {}", rel.display(), e),
            };

            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(copy_err)?;
            }
            tokio::fs::copy(&src, &dst).await.map_err(copy_err)?;
            tracing::debug!(file = ?rel, "copied untracked file into worktree");
        }
        Ok(())
    }

    /// Acquires the image and starts a container, relaxing the security tier
    /// as needed.
    async fn launch_container(
        &self,
        ctx: &OpContext,
        ws: &Workstream,
        worktree_path: &Path,
        opts: &CreateOptions,
    ) -> Result<Launch> {
        let image = match &opts.build {
            Some(spec) => spec.image.clone(),
            None => opts.image.clone().unwrap_or_else(|| self.config.image.clone()),
        };
        let image_outcome = match &opts.build {
            Some(spec) => Some(
                self.build_locks
                    .ensure_image(ctx, self.runtime.as_ref(), spec)
                    .await?,
            ),
            None => None,
        };

        let security = match &opts.security {
            Some(explicit) => explicit.clone(),
            None => load_project_security(self.repo_path())?.unwrap_or_default(),
        };
        let git_dir = self.worktrees.git_common_dir(ctx).await?;
        let name = naming::container_name(
            &self.config.container_prefix,
            &self.project,
            &ws.branch_name,
            Utc::now(),
        );

        // No tier can fix an invalid request, so check it before the ladder
        let mut validation = security.validate();
        validation.merge(
            self.container_config(
                &name,
                &image,
                ws,
                worktree_path,
                &git_dir,
                opts,
                security.resolve(self.config.default_tier),
            )
            .validate(),
        );
        for warning in validation.into_result()? {
            tracing::warn!(project = %self.project, "{}", warning);
        }

        let outcome = run_with_fallback(&security, self.config.default_tier, |resolved| {
            let config =
                self.container_config(&name, &image, ws, worktree_path, &git_dir, opts, resolved);
            async move { self.create_and_start(ctx, &config).await }
        })
        .await?;

        let relaxation = if outcome.relaxed() {
            Some(self.record_relaxation(&outcome.config, outcome.requested_tier, outcome.final_tier()))
        } else {
            None
        };

        Ok(Launch {
            container_id: outcome.value,
            relaxation,
            image: image_outcome,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn container_config(
        &self,
        name: &str,
        image: &str,
        ws: &Workstream,
        worktree_path: &Path,
        git_dir: &Path,
        opts: &CreateOptions,
        security: ResolvedSecurity,
    ) -> ContainerConfig {
        // Worktree `.git` files point at the host git dir, so mount it at the same path
        let mut mounts = vec![Mount::same_path(worktree_path), Mount::same_path(git_dir)];
        for path in &self.config.config_mounts {
            if path.exists() {
                mounts.push(Mount::read_only(path.clone(), path.clone()));
            } else {
                tracing::debug!(path = ?path, "skipping missing config mount");
            }
        }
        mounts.extend(opts.extra_mounts.iter().cloned());

        let limits = opts.limits.or(self.config.limits()).or_defaults();

        let labels = BTreeMap::from([
            (LABEL_PROJECT.to_string(), self.project.clone()),
            (LABEL_BRANCH.to_string(), ws.branch_name.clone()),
            (LABEL_WORKSTREAM.to_string(), ws.id.clone()),
        ]);

        ContainerConfig {
            name: name.to_string(),
            image: image.to_string(),
            mounts,
            working_dir: worktree_path.to_path_buf(),
            env: opts.env.clone(),
            labels,
            command: KEEPALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
            limits,
            security,
        }
    }

    /// One create-then-start attempt. A container that fails to start is
    /// removed so the next attempt starts clean.
    async fn create_and_start(&self, ctx: &OpContext, config: &ContainerConfig) -> Result<String> {
        let id = self.runtime.create_container(ctx, config).await?;

        if let Err(e) = self.runtime.start_container(ctx, &id).await {
            let cleanup = OpContext::with_timeout(CLEANUP_TIMEOUT);
            if let Err(remove_err) = self.runtime.remove_container(&cleanup, &id).await {
                tracing::warn!(
                    container_id = %id,
                    error = %remove_err,
                    "failed to remove container that did not start"
                );
            }
            return Err(e);
        }

        Ok(id)
    }

    /// Persists the tier that worked (if enabled) and builds the report.
    fn record_relaxation(
        &self,
        working: &SecurityConfig,
        requested: SecurityTier,
        final_tier: SecurityTier,
    ) -> SecurityRelaxation {
        tracing::warn!(
            project = %self.project,
            from = %requested,
            to = %final_tier,
            "container only started at a weaker security tier"
        );

        let saved = if self.config.persist_relaxation {
            match save_project_security(self.repo_path(), working) {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to save relaxed security tier");
                    None
                }
            }
        } else {
            None
        };

        SecurityRelaxation {
            original_tier: requested,
            final_tier,
            config_saved: saved.is_some(),
            config_path: saved,
        }
    }

    /// Stops the container if it is active, then force-removes it. A
    /// container the runtime no longer knows counts as removed.
    async fn remove_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        match self.runtime.get_container_state(ctx, id).await {
            Ok(state) if state.is_active() => {
                if let Err(e) = self.runtime.stop_container(ctx, id).await {
                    tracing::warn!(container_id = %id, error = %e, "stop failed, forcing removal");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(container_id = %id, error = %e, "state lookup failed, forcing removal");
            }
        }
        match self.runtime.remove_container(ctx, id).await {
            Err(Error::ContainerNotFound(_)) => {
                tracing::info!(container_id = %id, "container already gone");
                Ok(())
            }
            other => other,
        }
    }

    fn track(&self, ws: &Workstream, container_id: &str) {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.track(container_id, &ws.id, &ws.branch_name, self.repo_path()) {
                tracing::warn!(error = %e, container_id = %container_id, "failed to track container");
            }
        }
    }

    fn untrack(&self, container_id: &str) {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.untrack(container_id) {
                tracing::warn!(error = %e, container_id = %container_id, "failed to untrack container");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerState, InMemoryRuntime};
    use crate::worktree::InMemoryWorktrees;
    use tempfile::TempDir;

    struct Fixture {
        runtime: Arc<InMemoryRuntime>,
        worktrees: Arc<InMemoryWorktrees>,
        orchestrator: Orchestrator,
        _repo: TempDir,
    }

    fn fixture() -> Fixture {
        let repo = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let worktrees = Arc::new(InMemoryWorktrees::new(repo.path()));
        let config = ManagerConfig {
            worktree_root: Some(repo.path().join("worktrees")),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(runtime.clone(), worktrees.clone(), config);
        Fixture {
            runtime,
            worktrees,
            orchestrator,
            _repo: repo,
        }
    }

    #[tokio::test]
    async fn create_sets_fields_and_mounts_git_dir_at_same_path() {
        let f = fixture();
        let ctx = OpContext::new();
        let mut ws = Workstream::new("feature/x");

        let result = f
            .orchestrator
            .create_workstream(&ctx, &mut ws, &CreateOptions::default())
            .await
            .unwrap();

        assert_eq!(ws.container_id.as_deref(), Some(result.container_id.as_str()));
        assert_eq!(ws.worktree_path.as_ref(), Some(&result.worktree_path));
        assert!(result.worktree_path.ends_with("feature-x"));
        assert!(result.security_relaxation.is_none());

        let config = f.runtime.config_of(&result.container_id).unwrap();
        let git_dir = f.worktrees.repo_path().join(".git");
        assert!(config
            .mounts
            .iter()
            .any(|m| m.source == git_dir && m.target == git_dir));
        assert_eq!(config.working_dir, result.worktree_path);
        assert_eq!(config.limits.cpus, 2.0);
        assert_eq!(config.labels.get(LABEL_BRANCH).unwrap(), "feature/x");
        assert_eq!(config.security.tier, SecurityTier::Moderate);
        assert_eq!(
            f.runtime.state_of(&result.container_id),
            Some(ContainerState::Running)
        );
    }

    #[tokio::test]
    async fn worktree_failure_leaves_workstream_untouched() {
        let f = fixture();
        f.worktrees.fail_create();
        let mut ws = Workstream::new("topic");
        let before = ws.clone();

        let err = f
            .orchestrator
            .create_workstream(&OpContext::new(), &mut ws, &CreateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::WorktreeCreation { .. }));
        assert_eq!(ws, before);
        assert_eq!(f.runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn container_failure_at_every_tier_rolls_back_worktree() {
        let f = fixture();
        for tier in SecurityTier::ALL {
            f.runtime.fail_start_at(tier);
        }
        let mut ws = Workstream::new("topic");

        let err = f
            .orchestrator
            .create_workstream(&OpContext::new(), &mut ws, &CreateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ContainerStart { .. }));
        assert!(ws.container_id.is_none());
        assert!(ws.worktree_path.is_none());
        assert!(!f
            .worktrees
            .has_worktree(&f.orchestrator.worktree_path_for("topic")));
        assert_eq!(f.runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn second_create_on_same_workstream_is_rejected() {
        let f = fixture();
        let ctx = OpContext::new();
        let mut ws = Workstream::new("one");
        f.orchestrator
            .create_workstream(&ctx, &mut ws, &CreateOptions::default())
            .await
            .unwrap();

        let err = f
            .orchestrator
            .create_workstream(&ctx, &mut ws, &CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(f.runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn reusing_worktree_with_live_container_is_rejected() {
        let f = fixture();
        let ctx = OpContext::new();
        let reuse = CreateOptions {
            reuse_existing_worktree: true,
            ..Default::default()
        };
        let mut first = Workstream::new("topic");
        let created = f
            .orchestrator
            .create_workstream(&ctx, &mut first, &CreateOptions::default())
            .await
            .unwrap();

        for state in [ContainerState::Running, ContainerState::Paused] {
            if state == ContainerState::Paused {
                f.runtime.pause_container(&ctx, &created.container_id).await.unwrap();
            }
            let mut second = Workstream::new("topic");
            let err = f
                .orchestrator
                .create_workstream(&ctx, &mut second, &reuse)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidState(ref msg) if msg.contains("topic")));
            assert!(second.container_id.is_none());
            assert_eq!(f.runtime.container_count(), 1);
        }

        // The shared worktree survives the rejected attempts
        assert!(f.worktrees.has_worktree(&created.worktree_path));

        f.runtime.remove_container(&ctx, &created.container_id).await.unwrap();
        let mut third = Workstream::new("topic");
        let reused = f
            .orchestrator
            .create_workstream(&ctx, &mut third, &reuse)
            .await
            .unwrap();
        assert_eq!(reused.worktree_path, created.worktree_path);
        assert_eq!(f.runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn pause_without_container_fails_fast() {
        let f = fixture();
        let ws = Workstream::new("idle");
        let ctx = OpContext::new();

        assert!(matches!(
            f.orchestrator.pause_workstream(&ctx, &ws).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            f.orchestrator.resume_workstream(&ctx, &ws).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let f = fixture();
        let ctx = OpContext::new();
        let mut ws = Workstream::new("live");
        let created = f
            .orchestrator
            .create_workstream(&ctx, &mut ws, &CreateOptions::default())
            .await
            .unwrap();

        f.orchestrator.pause_workstream(&ctx, &ws).await.unwrap();
        assert_eq!(
            f.runtime.state_of(&created.container_id),
            Some(ContainerState::Paused)
        );
        f.orchestrator.resume_workstream(&ctx, &ws).await.unwrap();
        assert_eq!(
            f.runtime.state_of(&created.container_id),
            Some(ContainerState::Running)
        );
    }

    #[tokio::test]
    async fn explicit_limits_override_config() {
        let f = fixture();
        let mut ws = Workstream::new("big");
        let opts = CreateOptions {
            limits: ResourceLimits {
                cpus: 8.0,
                memory_bytes: 0,
            },
            ..Default::default()
        };

        let created = f
            .orchestrator
            .create_workstream(&OpContext::new(), &mut ws, &opts)
            .await
            .unwrap();
        let config = f.runtime.config_of(&created.container_id).unwrap();
        assert_eq!(config.limits.cpus, 8.0);
        assert_eq!(config.limits.memory_bytes, crate::runtime::DEFAULT_MEMORY_BYTES);
    }

    #[tokio::test]
    async fn escaping_copy_path_is_rejected_and_rolled_back() {
        let f = fixture();
        let mut ws = Workstream::new("copy");
        let opts = CreateOptions {
            copy_files: vec![PathBuf::from("../secret.env")],
            ..Default::default()
        };

        let err = f
            .orchestrator
            .create_workstream(&OpContext::new(), &mut ws, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!f
            .worktrees
            .has_worktree(&f.orchestrator.worktree_path_for("copy")));
    }

    #[tokio::test]
    async fn conflict_is_none_for_unknown_branch() {
        let f = fixture();
        let conflict = f
            .orchestrator
            .check_branch_conflict(&OpContext::new(), "nope")
            .await
            .unwrap();
        assert!(conflict.is_none());
    }

    #[tokio::test]
    async fn load_workstream_finds_container_by_label() {
        let f = fixture();
        let ctx = OpContext::new();
        let mut ws = Workstream::new("feature/y");
        f.orchestrator
            .create_workstream(&ctx, &mut ws, &CreateOptions::default())
            .await
            .unwrap();

        let loaded = f.orchestrator.load_workstream(&ctx, "feature/y").await.unwrap();
        assert_eq!(loaded, ws);
    }
}
