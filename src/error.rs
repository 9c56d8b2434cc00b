//! Error types for workstream lifecycle operations.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for workstream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to create the git worktree for a workstream.
    #[error("failed to create worktree at {path}: {reason}")]
    WorktreeCreation { path: PathBuf, reason: String },

    /// Failed to remove a git worktree.
    #[error("failed to remove worktree at {path}: {reason}")]
    WorktreeRemoval { path: PathBuf, reason: String },

    /// The container runtime rejected a container create request.
    #[error("failed to create container: {0}")]
    ContainerCreate(String),

    /// A created container could not be started.
    #[error("failed to start container {id}: {reason}")]
    ContainerStart { id: String, reason: String },

    /// The runtime has no container with this ID or name.
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// Any other container runtime call failed.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// Tracking or heartbeat file I/O failed.
    #[error("failed to persist {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// Image build failed.
    #[error("failed to build image {image}: {reason}")]
    ImageBuild { image: String, reason: String },

    /// The workstream is not in a state that allows the operation.
    #[error("invalid workstream state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation ran past its deadline.
    #[error("operation exceeded its deadline")]
    DeadlineExceeded,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Several independent steps failed; every failure is reported.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Returns true if retrying container creation at a weaker security tier
    /// could succeed.
    pub fn is_retryable_at_weaker_tier(&self) -> bool {
        matches!(self, Error::ContainerCreate(_) | Error::ContainerStart { .. })
    }

    /// Folds collected errors into a single result.
    ///
    /// No errors is `Ok`, one error is returned as-is, more become
    /// [`Error::Multiple`].
    pub fn from_collected(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

/// Result type alias for workstream operations.
pub type Result<T> = std::result::Result<T, Error>;
