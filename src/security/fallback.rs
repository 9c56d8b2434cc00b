//! Tier fallback: retry container creation at progressively weaker tiers.

use std::future::Future;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::policy::{ResolvedSecurity, SecurityConfig};
use super::tier::SecurityTier;

/// Iterator over tiers starting at a given tier and following
/// [`SecurityTier::next`] until it runs out.
#[derive(Debug, Clone)]
pub struct TierLadder {
    current: Option<SecurityTier>,
}

impl TierLadder {
    /// Walks every tier from `start` to the least restrictive one.
    pub fn from(start: SecurityTier) -> Self {
        Self {
            current: Some(start),
        }
    }
}

impl Iterator for TierLadder {
    type Item = SecurityTier;

    fn next(&mut self) -> Option<SecurityTier> {
        let tier = self.current?;
        self.current = tier.next();
        Some(tier)
    }
}

/// Report returned when creation only succeeded after relaxing the tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRelaxation {
    pub original_tier: SecurityTier,
    pub final_tier: SecurityTier,
    /// Whether the working configuration was written to the project.
    pub config_saved: bool,
    pub config_path: Option<PathBuf>,
}

/// Outcome of a successful fallback run.
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub requested_tier: SecurityTier,
    /// Configuration that produced `value`, pinned to the tier that worked.
    pub config: SecurityConfig,
    /// Failed attempts before the successful one.
    pub failures: Vec<(SecurityTier, String)>,
}

impl<T> FallbackOutcome<T> {
    pub fn final_tier(&self) -> SecurityTier {
        self.config.effective_tier(self.requested_tier)
    }

    /// True when the working tier differs from the requested one.
    pub fn relaxed(&self) -> bool {
        self.final_tier() != self.requested_tier
    }
}

/// Runs `attempt` at each tier of the ladder until one succeeds.
///
/// Only errors for which [`Error::is_retryable_at_weaker_tier`] holds move the
/// ladder forward, and only if the configuration allows relaxing. When every
/// tier fails, the last error is returned.
pub async fn run_with_fallback<T, F, Fut>(
    config: &SecurityConfig,
    default_tier: SecurityTier,
    mut attempt: F,
) -> Result<FallbackOutcome<T>>
where
    F: FnMut(ResolvedSecurity) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let requested_tier = config.effective_tier(default_tier);
    let auto_relax = config.auto_relax();
    let mut failures = Vec::new();
    let mut last_err: Option<Error> = None;

    for tier in TierLadder::from(requested_tier) {
        let tier_config = if tier == requested_tier {
            config.with_tier_pinned(tier)
        } else {
            config.with_tier(tier)
        };

        match attempt(tier_config.resolve(default_tier)).await {
            Ok(value) => {
                return Ok(FallbackOutcome {
                    value,
                    requested_tier,
                    config: tier_config,
                    failures,
                });
            }
            Err(e) => {
                let retry = auto_relax && e.is_retryable_at_weaker_tier() && tier.next().is_some();
                tracing::warn!(
                    tier = %tier,
                    error = %e,
                    retry,
                    "container attempt failed"
                );
                failures.push((tier, e.to_string()));
                if !retry {
                    return Err(e);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::ContainerCreate("no security tier attempted".into())))
}

impl SecurityConfig {
    /// Pins the tier without touching any override.
    fn with_tier_pinned(&self, tier: SecurityTier) -> Self {
        Self {
            tier: Some(tier),
            ..self.clone()
        }
    }
}
