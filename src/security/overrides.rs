//! Per-project security override file.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::policy::SecurityConfig;

/// Directory inside a repository holding local workstream settings.
const PROJECT_DIR: &str = ".workstream";

/// File name of the per-project security override.
const SECURITY_FILE: &str = "security.local.toml";

/// Returns the override file path for the repository at `repo_path`.
pub fn project_security_path(repo_path: &Path) -> PathBuf {
    repo_path.join(PROJECT_DIR).join(SECURITY_FILE)
}

/// Loads the project's security override, if one exists.
pub fn load_project_security(repo_path: &Path) -> Result<Option<SecurityConfig>> {
    let path = project_security_path(repo_path);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?;
    Ok(Some(config))
}

/// Writes `config` as the project's security override and returns its path.
///
/// The file is replaced atomically.
pub fn save_project_security(repo_path: &Path, config: &SecurityConfig) -> Result<PathBuf> {
    let path = project_security_path(repo_path);
    let persist_err = |reason: String| Error::Persistence {
        path: path.clone(),
        reason,
    };

    let dir = path
        .parent()
        .ok_or_else(|| persist_err("override path has no parent".to_string()))?;
    std::fs::create_dir_all(dir).map_err(|e| persist_err(e.to_string()))?;

    let body = toml::to_string_pretty(config).map_err(|e| persist_err(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| persist_err(e.to_string()))?;
    writeln!(
        tmp,
        "# Written after containers failed to start at a stricter tier.\n{}",
        body
    )
    .map_err(|e| persist_err(e.to_string()))?;
    tmp.persist(&path)
        .map_err(|e| persist_err(e.error.to_string()))?;

    Ok(path)
}
