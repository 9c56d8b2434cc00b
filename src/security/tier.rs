//! Security tier ordering and capability-drop sets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Container hardening tier, from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityTier {
    /// Drops networking and tracing capabilities on top of Moderate.
    Hardened,
    /// Drops only the capabilities that allow escaping the container.
    #[default]
    Moderate,
    /// No capability drops. Last resort for images that need them.
    Compat,
}

const HARDENED_DROPS: &[&str] = &["SYS_ADMIN", "SYS_MODULE", "SYS_PTRACE", "NET_ADMIN", "NET_RAW"];
const MODERATE_DROPS: &[&str] = &["SYS_ADMIN", "SYS_MODULE"];

impl SecurityTier {
    /// All tiers in fallback order.
    pub const ALL: [SecurityTier; 3] = [
        SecurityTier::Hardened,
        SecurityTier::Moderate,
        SecurityTier::Compat,
    ];

    /// Returns the next, less restrictive tier, or `None` at the end.
    pub fn next(self) -> Option<SecurityTier> {
        match self {
            SecurityTier::Hardened => Some(SecurityTier::Moderate),
            SecurityTier::Moderate => Some(SecurityTier::Compat),
            SecurityTier::Compat => None,
        }
    }

    /// Capabilities dropped at this tier.
    pub fn cap_drops(self) -> &'static [&'static str] {
        match self {
            SecurityTier::Hardened => HARDENED_DROPS,
            SecurityTier::Moderate => MODERATE_DROPS,
            SecurityTier::Compat => &[],
        }
    }

    /// Whether `no-new-privileges` is on by default at this tier.
    ///
    /// Compat leaves it off so setuid tools like `sudo` work.
    pub fn default_no_new_privileges(self) -> bool {
        !matches!(self, SecurityTier::Compat)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityTier::Hardened => "hardened",
            SecurityTier::Moderate => "moderate",
            SecurityTier::Compat => "compat",
        }
    }
}

impl fmt::Display for SecurityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hardened" => Ok(SecurityTier::Hardened),
            "moderate" => Ok(SecurityTier::Moderate),
            "compat" | "compatible" => Ok(SecurityTier::Compat),
            other => Err(Error::Config(format!("unknown security tier '{}'", other))),
        }
    }
}
