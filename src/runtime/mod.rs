//! Container runtime seam.
//!
//! [`ContainerRuntime`] is implemented by [`DockerCli`] for real use and by
//! [`InMemoryRuntime`] for deterministic tests.

mod docker;
mod memory;

pub use docker::{security_args, DockerCli};
pub use memory::InMemoryRuntime;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::OpContext;
use crate::error::Result;
use crate::security::ResolvedSecurity;

/// Default CPU limit when none is configured.
pub const DEFAULT_CPUS: f64 = 2.0;

/// Default memory limit (4 GiB) when none is configured.
pub const DEFAULT_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// Mounts `path` at the same location inside the container.
    pub fn same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::read_write(path.clone(), path)
    }
}

/// CPU and memory limits. Zero means "use the default".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_bytes: u64,
}

impl ResourceLimits {
    /// Replaces zero values with those of `fallback`.
    pub fn or(self, fallback: ResourceLimits) -> Self {
        Self {
            cpus: if self.cpus > 0.0 { self.cpus } else { fallback.cpus },
            memory_bytes: if self.memory_bytes > 0 {
                self.memory_bytes
            } else {
                fallback.memory_bytes
            },
        }
    }

    /// Replaces zero values with the defaults.
    pub fn or_defaults(self) -> Self {
        self.or(ResourceLimits {
            cpus: DEFAULT_CPUS,
            memory_bytes: DEFAULT_MEMORY_BYTES,
        })
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub limits: ResourceLimits,
    pub security: ResolvedSecurity,
}

/// Lifecycle state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Exited,
    Unknown,
}

impl ContainerState {
    /// Parses docker's status strings.
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" | "restarting" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "exited" | "dead" | "removing" => ContainerState::Exited,
            _ => ContainerState::Unknown,
        }
    }

    /// True for states that must be stopped before removal.
    pub fn is_active(self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Paused)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Summary of a container as listed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
}

/// Instructions for building an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildSpec {
    pub image: String,
    pub context_dir: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub build_args: BTreeMap<String, String>,
}

impl ImageBuildSpec {
    pub fn new(image: impl Into<String>, context_dir: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            context_dir: context_dir.into(),
            dockerfile: None,
            build_args: BTreeMap::new(),
        }
    }
}

/// Operations the manager needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container without starting it and returns its ID.
    async fn create_container(&self, ctx: &OpContext, config: &ContainerConfig) -> Result<String>;

    async fn start_container(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn stop_container(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn pause_container(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn unpause_container(&self, ctx: &OpContext, id: &str) -> Result<()>;

    /// Force-removes a container.
    async fn remove_container(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn get_container_state(&self, ctx: &OpContext, id: &str) -> Result<ContainerState>;

    /// Lists containers (in any state) whose name starts with `name_prefix`.
    async fn list_containers(&self, ctx: &OpContext, name_prefix: &str) -> Result<Vec<ContainerInfo>>;

    async fn image_exists(&self, ctx: &OpContext, image: &str) -> Result<bool>;

    async fn build_image(&self, ctx: &OpContext, spec: &ImageBuildSpec) -> Result<()>;
}
