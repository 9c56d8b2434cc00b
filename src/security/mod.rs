//! Container hardening tiers and the fallback protocol between them.
//!
//! [`SecurityTier`] is the ordered set of hardening bundles, [`SecurityConfig`]
//! is the user-facing (partially specified) configuration and
//! [`ResolvedSecurity`] the concrete settings handed to the runtime.
//! [`TierLadder`] walks tiers from a starting point toward the least
//! restrictive one.

mod fallback;
mod overrides;
mod policy;
mod tier;

pub use fallback::{run_with_fallback, FallbackOutcome, SecurityRelaxation, TierLadder};
pub use overrides::{load_project_security, project_security_path, save_project_security};
pub use policy::{ResolvedSecurity, SecurityConfig, DEFAULT_PIDS_LIMIT};
pub use tier::SecurityTier;
