//! Branch-name sanitization and the container naming contract.
//!
//! Container names follow `<prefix><project>-<sanitized-branch>-<YYYYMMDD-HHMMSS>`.
//! Reconciliation parses this format back, so it must stay stable.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Name used when sanitization leaves nothing behind.
pub const UNNAMED: &str = "unnamed";

/// Timestamp layout appended to container names.
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Length of a rendered timestamp (`YYYYMMDD-HHMMSS`).
const TIMESTAMP_LEN: usize = 15;

/// Label holding the owning project on every container we create.
pub const LABEL_PROJECT: &str = "dev.workstream.project";
/// Label holding the unsanitized branch name.
pub const LABEL_BRANCH: &str = "dev.workstream.branch";
/// Label holding the workstream ID.
pub const LABEL_WORKSTREAM: &str = "dev.workstream.id";

/// Sanitizes a branch name for use in paths and container names.
///
/// `/`, `\` and spaces become `-`, runs of `-` collapse to one, and leading or
/// trailing `-` are stripped. An empty result becomes [`UNNAMED`].
pub fn sanitize_branch_name(branch: &str) -> String {
    let mut out = String::with_capacity(branch.len());
    for c in branch.chars() {
        let c = match c {
            '/' | '\\' | ' ' => '-',
            other => other,
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        UNNAMED.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Derives the project name from a repository path.
///
/// Uses the final path segment, lower-cased and sanitized.
pub fn project_name(repo_path: &Path) -> String {
    let base = repo_path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    sanitize_branch_name(&base)
}

/// Returns the prefix shared by every container of `project`.
pub fn project_prefix(prefix: &str, project: &str) -> String {
    format!("{}{}-", prefix, project)
}

/// Builds a container name for `branch` in `project` at time `now`.
pub fn container_name(prefix: &str, project: &str, branch: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}{}-{}",
        project_prefix(prefix, project),
        sanitize_branch_name(branch),
        now.format(TIMESTAMP_FORMAT)
    )
}

/// Recovers the sanitized branch name from a container name.
///
/// Returns `None` if the name does not belong to `project` or lacks a valid
/// trailing timestamp.
pub fn branch_from_container_name(prefix: &str, project: &str, name: &str) -> Option<String> {
    // Docker reports names with a leading slash in some API paths
    let name = name.strip_prefix('/').unwrap_or(name);
    let rest = name.strip_prefix(&project_prefix(prefix, project))?;

    if rest.len() < TIMESTAMP_LEN + 2 {
        return None;
    }
    let split = rest.len() - TIMESTAMP_LEN;
    if !rest.is_char_boundary(split) {
        return None;
    }
    let (head, stamp) = rest.split_at(split);
    let branch = head.strip_suffix('-')?;

    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    if branch.is_empty() {
        return None;
    }
    Some(branch.to_string())
}

/// Reports whether the runtime accepts `name` as a container name.
///
/// Names must match `[a-zA-Z0-9][a-zA-Z0-9_.-]+`.
pub fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    let rest = chars.as_str();
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn sanitize_replaces_separators_and_spaces() {
        assert_eq!(sanitize_branch_name("feature/x"), "feature-x");
        assert_eq!(sanitize_branch_name("fix\\windows path"), "fix-windows-path");
        assert_eq!(sanitize_branch_name("a//b  c"), "a-b-c");
    }

    #[test]
    fn sanitize_strips_edges_and_collapses() {
        assert_eq!(sanitize_branch_name("/lead/"), "lead");
        assert_eq!(sanitize_branch_name("--x--y--"), "x-y");
    }

    #[test]
    fn sanitize_empty_becomes_unnamed() {
        assert_eq!(sanitize_branch_name(""), UNNAMED);
        assert_eq!(sanitize_branch_name("/ \\ -"), UNNAMED);
    }

    #[test]
    fn sanitized_output_never_contains_separators() {
        for input in ["a/b", "a\\b", "a b", " / ", "x/y\\z w", "release/1.2 rc"] {
            let out = sanitize_branch_name(input);
            assert!(!out.contains('/'), "{out}");
            assert!(!out.contains('\\'), "{out}");
            assert!(!out.contains(' '), "{out}");
        }
    }

    #[test]
    fn project_name_uses_lowercase_basename() {
        assert_eq!(project_name(Path::new("/src/My Repo")), "my-repo");
        assert_eq!(project_name(Path::new("/repo")), "repo");
    }

    #[test]
    fn container_name_follows_contract() {
        let name = container_name("workstream-", "repo", "feature/x", fixed_time());
        assert_eq!(name, "workstream-repo-feature-x-20260314-092653");
    }

    #[test]
    fn branch_round_trips_through_container_name() {
        let name = container_name("workstream-", "repo", "feat/login-v2", fixed_time());
        assert_eq!(
            branch_from_container_name("workstream-", "repo", &name).as_deref(),
            Some("feat-login-v2")
        );
    }

    #[test]
    fn branch_parse_rejects_other_projects_and_bad_stamps() {
        assert!(branch_from_container_name(
            "workstream-",
            "repo",
            "workstream-other-main-20260314-092653"
        )
        .is_none());
        assert!(branch_from_container_name("workstream-", "repo", "workstream-repo-main").is_none());
        assert!(branch_from_container_name(
            "workstream-",
            "repo",
            "workstream-repo-main-2026031x-092653"
        )
        .is_none());
    }

    #[test]
    fn branch_parse_tolerates_leading_slash() {
        assert_eq!(
            branch_from_container_name("workstream-", "repo", "/workstream-repo-main-20260314-092653")
                .as_deref(),
            Some("main")
        );
    }

    #[test]
    fn branch_parse_rejects_multibyte_tail_without_panicking() {
        // The 15-byte split point lands inside a multi-byte character
        for name in [
            "workstream-repo-abé0260314-092653",
            "workstream-repo-main-ééééééé-x",
            "workstream-repo-ブランチ-ブランチ",
        ] {
            assert!(branch_from_container_name("workstream-", "repo", name).is_none());
        }
        assert_eq!(
            branch_from_container_name("workstream-", "repo", "workstream-repo-é-20260314-092653")
                .as_deref(),
            Some("é")
        );
    }

    #[test]
    fn container_name_validity_matches_runtime_rules() {
        assert!(is_valid_container_name("workstream-repo-feature-x-20260314-092653"));
        assert!(is_valid_container_name("a.b_c-1"));
        assert!(!is_valid_container_name("workstream-repo-feat#1-20260314-092653"));
        assert!(!is_valid_container_name("workstream-repo-é-20260314-092653"));
        assert!(!is_valid_container_name(".hidden"));
        assert!(!is_valid_container_name("x"));
        assert!(!is_valid_container_name(""));
    }
}
