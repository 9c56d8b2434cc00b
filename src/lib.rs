//! Workstream Manager - per-branch development containers bound to git worktrees
//!
//! This library creates, destroys, rebuilds, pauses and resumes isolated
//! development environments, relaxes container security tiers when a host
//! cannot run the hardened defaults, and reclaims containers left behind by
//! crashed sessions.

pub mod build_lock;
pub mod config;
pub mod context;
pub mod error;
pub mod naming;
pub mod orchestrator;
pub mod reconcile;
pub mod runtime;
pub mod security;
pub mod tracker;
pub mod worktree;

pub use build_lock::{BuildLockRegistry, ImageOutcome};
pub use config::{ManagerConfig, Validate, ValidationResult};
pub use context::OpContext;
pub use error::{Error, Result};
pub use orchestrator::{
    BranchConflict, CreateOptions, CreateResult, DestroyOptions, Orchestrator, Workstream,
};
pub use reconcile::{ReconcileReport, Reconciler, RecoveryReport};
pub use runtime::{
    ContainerConfig, ContainerInfo, ContainerRuntime, ContainerState, DockerCli, ImageBuildSpec,
    InMemoryRuntime, Mount, ResourceLimits,
};
pub use security::{
    ResolvedSecurity, SecurityConfig, SecurityRelaxation, SecurityTier, TierLadder,
};
pub use tracker::{ContainerTracker, HeartbeatTask, TrackedContainer};
pub use worktree::{GitWorktrees, InMemoryWorktrees, WorktreeEntry, WorktreeStore};
