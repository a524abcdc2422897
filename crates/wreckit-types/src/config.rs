//! The resolved shape of `.wreckit/config.json` (§3, §6). `ResolvedConfig`
//! is what the rest of wreckit consumes; `wreckit-config` owns parsing raw
//! JSON (including legacy-field migration) into this shape.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::duration::{
    deserialize_duration, deserialize_duration_opt, serialize_duration, serialize_duration_opt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Open a PR via the configured forge CLI and stop; a human merges it.
    PullRequest,
    /// Merge directly into the base branch once checks pass, no PR created.
    DirectMerge,
}

impl Default for MergeMode {
    fn default() -> Self {
        MergeMode::PullRequest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchCleanupPolicy {
    /// Delete the local and remote branch once the PR merges.
    DeleteOnMerge,
    /// Leave branches in place; the operator cleans up manually.
    Keep,
}

impl Default for BranchCleanupPolicy {
    fn default() -> Self {
        BranchCleanupPolicy::DeleteOnMerge
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPolicy {
    /// Run agents directly against the working tree's checkout.
    None,
    /// Require the `sprite` agent backend kind; refuse to run any other
    /// backend kind against this repo (§4.3).
    RequireSprite,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        SandboxPolicy::None
    }
}

/// Whether and how the critique loop runs after `implement` (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritiquePolicy {
    Disabled,
    /// Run the critique agent once; rejection is advisory.
    Advisory,
    /// Run the critique agent for up to `max_rounds`; a rejection on the
    /// final round sends the item to `Failed` instead of proceeding (§9:
    /// open question resolved against silently continuing).
    Enforced { max_rounds: u32 },
}

impl Default for CritiquePolicy {
    fn default() -> Self {
        CritiquePolicy::Disabled
    }
}

/// Per-error-kind retry tuning, keyed by the `AgentErrorKind` label
/// produced by `wreckit_types::AgentErrorKind`'s snake_case serde form.
/// Mirrors the teacher's `PerErrorConfig` map shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerErrorRetryConfig {
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub default_agent: AgentConfig,
    /// Backend override per phase, e.g. a cheaper model for `research`.
    #[serde(default)]
    pub phase_agents: BTreeMap<String, AgentConfig>,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub phase_timeout: Duration,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt"
    )]
    pub agent_idle_timeout: Option<Duration>,
    #[serde(default)]
    pub max_attempts_default: u32,
    #[serde(default)]
    pub per_error_retry: BTreeMap<String, PerErrorRetryConfig>,
    #[serde(default)]
    pub merge_mode: MergeMode,
    #[serde(default)]
    pub branch_cleanup: BranchCleanupPolicy,
    #[serde(default)]
    pub sandbox: SandboxPolicy,
    #[serde(default)]
    pub critique: CritiquePolicy,
    pub branch_prefix: String,
    pub base_branch: String,
    /// Shell commands run locally before a PR is opened; any non-zero exit
    /// fails the `pr` phase (§4.4).
    #[serde(default)]
    pub pr_checks: Vec<String>,
    #[serde(default)]
    pub allow_unsafe_direct_merge: bool,
    #[serde(default)]
    pub allowed_remote_patterns: Vec<String>,
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
    #[serde(default)]
    pub worker_count: Option<u32>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
}
