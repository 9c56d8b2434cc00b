//! Orphan container reconciliation.
//!
//! Containers whose branch no longer has a worktree are leftovers from
//! crashed or interrupted sessions and get removed. Containers that are
//! tracked by a live session, or whose branch still has a worktree, stay.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::naming::{self, LABEL_BRANCH, LABEL_PROJECT};
use crate::runtime::{ContainerInfo, ContainerRuntime};
use crate::tracker::ContainerTracker;
use crate::worktree::WorktreeStore;

/// What reconciliation did with each container it looked at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Removed container IDs.
    pub reclaimed: Vec<String>,
    /// In the known set.
    pub skipped_known: Vec<String>,
    /// Branch still has a worktree.
    pub skipped_worktree: Vec<String>,
    /// Name matched the prefix but no branch could be recovered.
    pub skipped_unparseable: Vec<String>,
    /// Removal attempted and failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed.len()
    }
}

/// Outcome of crash recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// True when a live session still owns the tracked containers.
    pub owner_alive: bool,
    pub prune: Option<ReconcileReport>,
    /// Tracker entries dropped because their container is gone.
    pub untracked: Vec<String>,
}

/// Finds and removes orphaned containers for one repository.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    worktrees: Arc<dyn WorktreeStore>,
    tracker: Option<Arc<ContainerTracker>>,
    prefix: String,
    project: String,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        worktrees: Arc<dyn WorktreeStore>,
        container_prefix: impl Into<String>,
    ) -> Self {
        let project = naming::project_name(worktrees.repo_path());
        Self {
            runtime,
            worktrees,
            tracker: None,
            prefix: container_prefix.into(),
            project,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ContainerTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// IDs owned by a live session: tracked entries for this repository,
    /// but only while the heartbeat is fresh.
    pub fn known_from_tracker(&self) -> HashSet<String> {
        match &self.tracker {
            Some(tracker) if !tracker.is_heartbeat_stale() => self
                .tracked_here(tracker)
                .into_iter()
                .collect(),
            _ => HashSet::new(),
        }
    }

    /// Removes this project's containers that are neither known nor backed
    /// by a worktree.
    ///
    /// Fails without removing anything if the container or worktree listing
    /// is unavailable.
    pub async fn prune(
        &self,
        ctx: &OpContext,
        known_ids: &HashSet<String>,
    ) -> Result<ReconcileReport> {
        let prefix = naming::project_prefix(&self.prefix, &self.project);
        let containers = self.runtime.list_containers(ctx, &prefix).await?;
        let worktree_branches: HashSet<String> = self
            .worktrees
            .worktree_list(ctx)
            .await?
            .into_iter()
            .filter_map(|w| w.branch)
            .map(|b| naming::sanitize_branch_name(&b))
            .collect();

        let mut report = ReconcileReport::default();

        for container in containers {
            if !self.belongs_here(&container) {
                continue;
            }
            if known_ids.contains(&container.id) {
                report.skipped_known.push(container.id);
                continue;
            }
            let Some(branch) = self.branch_of(&container) else {
                tracing::debug!(name = %container.name, "cannot recover branch from container");
                report.skipped_unparseable.push(container.id);
                continue;
            };
            if worktree_branches.contains(&branch) {
                report.skipped_worktree.push(container.id);
                continue;
            }

            if container.state.is_active() {
                if let Err(e) = self.runtime.stop_container(ctx, &container.id).await {
                    tracing::debug!(container_id = %container.id, error = %e, "stop failed, forcing removal");
                }
            }

            match self.runtime.remove_container(ctx, &container.id).await {
                Ok(()) => {
                    tracing::info!(
                        container_id = %container.id,
                        name = %container.name,
                        branch = %branch,
                        "removed orphaned container"
                    );
                    if let Some(tracker) = &self.tracker {
                        if let Err(e) = tracker.untrack(&container.id) {
                            tracing::warn!(error = %e, "failed to untrack reclaimed container");
                        }
                    }
                    report.reclaimed.push(container.id);
                }
                Err(e @ (Error::Cancelled | Error::DeadlineExceeded)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        container_id = %container.id,
                        error = %e,
                        "failed to remove orphaned container"
                    );
                    report.failed.push((container.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Cleans up after a session that died without shutting down.
    ///
    /// Does nothing while the heartbeat is fresh. Otherwise prunes with an
    /// empty known set and drops tracker entries whose container is gone.
    pub async fn recover_after_crash(&self, ctx: &OpContext) -> Result<RecoveryReport> {
        let tracker = self.tracker.as_ref().ok_or_else(|| {
            Error::InvalidState("crash recovery needs a container tracker".to_string())
        })?;

        if !tracker.is_heartbeat_stale() {
            tracing::debug!("heartbeat is fresh, another session owns the containers");
            return Ok(RecoveryReport {
                owner_alive: true,
                ..Default::default()
            });
        }

        let tracked = self.tracked_here(tracker);
        tracing::info!(
            project = %self.project,
            tracked = tracked.len(),
            "recovering containers from a stale session"
        );

        let prune = self.prune(ctx, &HashSet::new()).await?;

        let prefix = naming::project_prefix(&self.prefix, &self.project);
        let live: HashSet<String> = self
            .runtime
            .list_containers(ctx, &prefix)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut untracked = Vec::new();
        for id in tracked {
            if live.contains(&id) || prune.reclaimed.contains(&id) {
                continue;
            }
            match tracker.untrack(&id) {
                Ok(()) => untracked.push(id),
                Err(e) => tracing::warn!(error = %e, container_id = %id, "failed to untrack"),
            }
        }

        Ok(RecoveryReport {
            owner_alive: false,
            prune: Some(prune),
            untracked,
        })
    }

    fn tracked_here(&self, tracker: &ContainerTracker) -> Vec<String> {
        let repo = self.worktrees.repo_path();
        tracker
            .list()
            .into_iter()
            .filter(|t| t.repo_path.as_path() == repo)
            .map(|t| t.container_id)
            .collect()
    }

    /// The name prefix of "repo" also matches "repo-x"; a project label
    /// settles it.
    fn belongs_here(&self, container: &ContainerInfo) -> bool {
        match container.labels.get(LABEL_PROJECT) {
            Some(project) => *project == self.project,
            None => true,
        }
    }

    /// Sanitized branch of `container`, from its label or its name.
    fn branch_of(&self, container: &ContainerInfo) -> Option<String> {
        if let Some(branch) = container.labels.get(LABEL_BRANCH) {
            return Some(naming::sanitize_branch_name(branch));
        }
        naming::branch_from_container_name(&self.prefix, &self.project, &container.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerState, InMemoryRuntime};
    use crate::worktree::InMemoryWorktrees;
    use std::collections::BTreeMap;

    const PREFIX: &str = "workstream-";

    fn setup() -> (Arc<InMemoryRuntime>, Arc<InMemoryWorktrees>, Reconciler) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let worktrees = Arc::new(InMemoryWorktrees::new("/src/repo"));
        let reconciler = Reconciler::new(runtime.clone(), worktrees.clone(), PREFIX);
        (runtime, worktrees, reconciler)
    }

    fn insert(runtime: &InMemoryRuntime, branch: &str) -> String {
        runtime.insert_container(
            format!("{}repo-{}-20240101-120000", PREFIX, branch),
            ContainerState::Running,
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn prune_keeps_known_and_worktree_backed_containers() {
        let (runtime, worktrees, reconciler) = setup();
        let c1 = insert(&runtime, "known");
        let c2 = insert(&runtime, "gone");
        let c3 = insert(&runtime, "active");
        worktrees.add_worktree("/src/repo-worktrees/active", "active");

        let known = HashSet::from([c1.clone()]);
        let report = reconciler.prune(&OpContext::new(), &known).await.unwrap();

        assert_eq!(report.reclaimed, vec![c2.clone()]);
        assert_eq!(report.skipped_known, vec![c1.clone()]);
        assert_eq!(report.skipped_worktree, vec![c3.clone()]);
        assert!(runtime.contains(&c1));
        assert!(!runtime.contains(&c2));
        assert!(runtime.contains(&c3));
    }

    #[tokio::test]
    async fn worktree_branch_is_compared_sanitized() {
        let (runtime, worktrees, reconciler) = setup();
        let id = insert(&runtime, "feature-login");
        worktrees.add_worktree("/w/feature-login", "feature/login");

        let report = reconciler
            .prune(&OpContext::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(report.skipped_worktree, vec![id]);
        assert!(report.reclaimed.is_empty());
    }

    #[tokio::test]
    async fn other_projects_with_shared_prefix_are_ignored() {
        let (runtime, _worktrees, reconciler) = setup();
        let labels = BTreeMap::from([
            (LABEL_PROJECT.to_string(), "repo-x".to_string()),
            (LABEL_BRANCH.to_string(), "main".to_string()),
        ]);
        let foreign = runtime.insert_container(
            format!("{}repo-x-main-20240101-120000", PREFIX),
            ContainerState::Running,
            labels,
        );

        let report = reconciler
            .prune(&OpContext::new(), &HashSet::new())
            .await
            .unwrap();
        assert!(runtime.contains(&foreign));
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn unparseable_names_are_left_alone() {
        let (runtime, _worktrees, reconciler) = setup();
        let id = runtime.insert_container(
            format!("{}repo-handmade", PREFIX),
            ContainerState::Exited,
            BTreeMap::new(),
        );

        let report = reconciler
            .prune(&OpContext::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(report.skipped_unparseable, vec![id.clone()]);
        assert!(runtime.contains(&id));
    }

    #[tokio::test]
    async fn removal_failures_are_reported_and_do_not_stop_the_sweep() {
        let (runtime, _worktrees, reconciler) = setup();
        let stuck = insert(&runtime, "stuck");
        let loose = insert(&runtime, "loose");
        runtime.fail_remove_of(stuck.clone());

        let report = reconciler
            .prune(&OpContext::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(report.reclaimed, vec![loose]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, stuck);
    }

    #[tokio::test]
    async fn recovery_is_skipped_while_heartbeat_is_fresh() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracker = Arc::new(ContainerTracker::open(dir.path()).unwrap());
        tracker.write_heartbeat(std::process::id()).unwrap();

        let (runtime, _worktrees, reconciler) = setup();
        let reconciler = reconciler.with_tracker(tracker);
        let orphan = insert(&runtime, "orphan");

        let report = reconciler.recover_after_crash(&OpContext::new()).await.unwrap();
        assert!(report.owner_alive);
        assert!(runtime.contains(&orphan));
    }

    #[tokio::test]
    async fn recovery_after_stale_heartbeat_prunes_and_untracks() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracker = Arc::new(ContainerTracker::open(dir.path()).unwrap());

        let (runtime, _worktrees, reconciler) = setup();
        let orphan = insert(&runtime, "orphan");
        tracker
            .track(&orphan, "ws-1", "orphan", std::path::Path::new("/src/repo"))
            .unwrap();
        tracker
            .track("vanished", "ws-2", "old", std::path::Path::new("/src/repo"))
            .unwrap();
        tracker
            .track("elsewhere", "ws-3", "x", std::path::Path::new("/src/other"))
            .unwrap();
        let reconciler = reconciler.with_tracker(tracker.clone());

        let report = reconciler.recover_after_crash(&OpContext::new()).await.unwrap();

        assert!(!report.owner_alive);
        assert_eq!(report.prune.unwrap().reclaimed, vec![orphan.clone()]);
        assert_eq!(report.untracked, vec!["vanished".to_string()]);
        assert!(!runtime.contains(&orphan));
        assert!(tracker.get(&orphan).is_none());
        assert!(tracker.get("elsewhere").is_some());
    }
}
