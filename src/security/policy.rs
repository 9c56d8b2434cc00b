//! Security configuration and its resolution into concrete settings.

use serde::{Deserialize, Serialize};

use super::tier::SecurityTier;

/// Default process limit applied to every container.
pub const DEFAULT_PIDS_LIMIT: i64 = 1024;

/// User-facing security configuration.
///
/// Every `None` field falls back to a tier-specific or global default when
/// resolved. This is also the on-disk shape of the per-project override file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Starting tier. Falls back to the manager's configured default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<SecurityTier>,

    /// Set `no-new-privileges`. Defaults per tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_new_privileges: Option<bool>,

    /// Run an init process as PID 1. Defaults to true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,

    /// Maximum number of processes. Defaults to [`DEFAULT_PIDS_LIMIT`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,

    /// Run fully privileged. Defaults to false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    /// Extra capabilities to add.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,

    /// Explicit capability drops, replacing the tier's set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap_drop: Option<Vec<String>>,

    /// Retry at weaker tiers when creation fails. Defaults to true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_relax: Option<bool>,

    /// Share the host network namespace.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub host_network: bool,

    /// Share the host PID namespace.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub host_pid: bool,

    /// Share the host IPC namespace.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub host_ipc: bool,

    /// Mount the host docker socket.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub docker_socket: bool,
}

/// Concrete security settings for one container create attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSecurity {
    pub tier: SecurityTier,
    pub no_new_privileges: bool,
    pub init: bool,
    pub pids_limit: i64,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub auto_relax: bool,
    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,
    pub docker_socket: bool,
}

impl SecurityConfig {
    /// Creates a configuration pinned to `tier` with every other field unset.
    pub fn for_tier(tier: SecurityTier) -> Self {
        Self {
            tier: Some(tier),
            ..Default::default()
        }
    }

    /// Returns the starting tier, using `default_tier` when unset.
    pub fn effective_tier(&self, default_tier: SecurityTier) -> SecurityTier {
        self.tier.unwrap_or(default_tier)
    }

    /// Returns whether fallback to weaker tiers is allowed.
    pub fn auto_relax(&self) -> bool {
        self.auto_relax.unwrap_or(true)
    }

    /// Returns a copy demoted to `tier`.
    ///
    /// Tier-dependent overrides (`cap_drop`, `no_new_privileges`) are cleared
    /// so the new tier's defaults apply. Everything else is kept.
    pub fn with_tier(&self, tier: SecurityTier) -> Self {
        Self {
            tier: Some(tier),
            cap_drop: None,
            no_new_privileges: None,
            ..self.clone()
        }
    }

    /// Resolves unset fields to tier-specific or global defaults.
    pub fn resolve(&self, default_tier: SecurityTier) -> ResolvedSecurity {
        let tier = self.effective_tier(default_tier);
        ResolvedSecurity {
            tier,
            no_new_privileges: self
                .no_new_privileges
                .unwrap_or_else(|| tier.default_no_new_privileges()),
            init: self.init.unwrap_or(true),
            pids_limit: self.pids_limit.unwrap_or(DEFAULT_PIDS_LIMIT),
            privileged: self.privileged.unwrap_or(false),
            cap_add: self.cap_add.clone(),
            cap_drop: self
                .cap_drop
                .clone()
                .unwrap_or_else(|| tier.cap_drops().iter().map(|c| c.to_string()).collect()),
            auto_relax: self.auto_relax(),
            host_network: self.host_network,
            host_pid: self.host_pid,
            host_ipc: self.host_ipc,
            docker_socket: self.docker_socket,
        }
    }
}
