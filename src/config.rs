//! Manager configuration and validation.
//!
//! Configuration is read from `$XDG_CONFIG_HOME/workstream/config.toml`; every
//! field has a default, so a missing file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::naming;
use crate::runtime::{ContainerConfig, ResourceLimits, DEFAULT_CPUS, DEFAULT_MEMORY_BYTES};
use crate::security::{SecurityConfig, SecurityTier};

/// Config file name under the config directory.
const CONFIG_FILE: &str = "config.toml";

/// Application directory name used under the platform config/data dirs.
const APP_DIR: &str = "workstream";

/// Settings shared by every workstream the manager creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Prefix of every container name.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Image used when a create request names none.
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_cpus")]
    pub cpus: f64,

    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,

    /// Tier used when neither the request nor the project names one.
    #[serde(default)]
    pub default_tier: SecurityTier,

    /// Write the working tier to the project after a relaxation.
    #[serde(default = "default_true")]
    pub persist_relaxation: bool,

    /// Directory for the tracking and heartbeat files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root for worktrees. Defaults to `<repo parent>/<repo name>-worktrees`.
    #[serde(default)]
    pub worktree_root: Option<PathBuf>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Host paths mounted read-only at the same location (credentials,
    /// tool configs).
    #[serde(default)]
    pub config_mounts: Vec<PathBuf>,

    /// Docker-compatible CLI, e.g. `podman`.
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,

    /// Remote used by `destroy --delete-remote`.
    #[serde(default = "default_git_remote")]
    pub git_remote: String,
}

fn default_container_prefix() -> String {
    "workstream-".to_string()
}

fn default_image() -> String {
    "workstream-dev:latest".to_string()
}

fn default_cpus() -> f64 {
    DEFAULT_CPUS
}

fn default_memory_bytes() -> u64 {
    DEFAULT_MEMORY_BYTES
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_git_remote() -> String {
    "origin".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            container_prefix: default_container_prefix(),
            image: default_image(),
            cpus: default_cpus(),
            memory_bytes: default_memory_bytes(),
            default_tier: SecurityTier::default(),
            persist_relaxation: default_true(),
            data_dir: default_data_dir(),
            worktree_root: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            config_mounts: Vec::new(),
            runtime_binary: default_runtime_binary(),
            git_remote: default_git_remote(),
        }
    }
}

impl ManagerConfig {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Loads the config from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads the config at `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// Resource limits from this config.
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpus: self.cpus,
            memory_bytes: self.memory_bytes,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Root directory for the worktrees of the repository at `repo_path`.
    pub fn worktree_root_for(&self, repo_path: &Path) -> PathBuf {
        if let Some(root) = &self.worktree_root {
            return root.clone();
        }
        let name = repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let parent = repo_path.parent().unwrap_or(repo_path);
        parent.join(format!("{}-worktrees", name))
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for ManagerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.container_prefix.is_empty() {
            result.add_error("container_prefix cannot be empty");
        }
        if self
            .container_prefix
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        {
            result.add_error(format!(
                "container_prefix '{}' contains characters docker rejects in names",
                self.container_prefix
            ));
        }
        if self.image.trim().is_empty() {
            result.add_error("image cannot be empty");
        }
        if self.runtime_binary.trim().is_empty() {
            result.add_error("runtime_binary cannot be empty");
        }
        if self.git_remote.trim().is_empty() {
            result.add_error("git_remote cannot be empty");
        }
        if self.cpus < 0.0 {
            result.add_error("cpus cannot be negative");
        }
        if self.memory_bytes > 0 && self.memory_bytes < 64 * 1024 * 1024 {
            result.add_warning("memory_bytes under 64 MiB will likely fail to start a dev container");
        }
        if self.heartbeat_interval() * 2 >= crate::tracker::HEARTBEAT_STALE_AFTER {
            result.add_warning(
                "heartbeat_interval_secs is close to the staleness threshold; live sessions may look dead",
            );
        }

        result
    }
}

impl Validate for SecurityConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(limit) = self.pids_limit {
            if limit < 0 {
                result.add_error("pids_limit cannot be negative");
            }
        }
        if self.privileged == Some(true) && self.tier == Some(SecurityTier::Hardened) {
            result.add_warning("privileged overrides every hardened-tier restriction");
        }
        if self.docker_socket {
            result.add_warning("docker_socket gives the container control of the host daemon");
        }
        if self.host_pid || self.host_ipc {
            result.add_warning("sharing host PID/IPC namespaces weakens isolation");
        }
        for cap in &self.cap_add {
            if cap == "SYS_ADMIN" || cap == "ALL" {
                result.add_warning(format!("cap_add '{}' is close to privileged", cap));
            }
        }

        result
    }
}

impl Validate for ContainerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.name.is_empty() {
            result.add_error("container name cannot be empty");
        } else if !naming::is_valid_container_name(&self.name) {
            result.add_error(format!(
                "container name '{}' must match [a-zA-Z0-9][a-zA-Z0-9_.-]+",
                self.name
            ));
        }
        if self.image.is_empty() {
            result.add_error("container image cannot be empty");
        }
        if self.limits.cpus < 0.0 {
            result.add_error("cpus cannot be negative");
        }
        for mount in &self.mounts {
            if !mount.source.is_absolute() {
                result.add_error(format!(
                    "mount source '{}' must be absolute",
                    mount.source.display()
                ));
            }
            if !mount.target.is_absolute() {
                result.add_error(format!(
                    "mount target '{}' must be absolute",
                    mount.target.display()
                ));
            }
        }

        result
    }
}
