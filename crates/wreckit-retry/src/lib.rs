//! Retry strategy selection for phase agent invocations (§4.4, §7).
//!
//! A phase failure classifies into an [`AgentErrorKind`]; that kind picks a
//! [`RetryStrategyConfig`], either from an explicit per-kind override or the
//! item's default, which then yields the delay before the next attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wreckit_types::AgentErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    Immediate,
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// Predefined bundles; `Custom` means the operator supplied an explicit
/// [`RetryStrategyConfig`] instead of picking one of the presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    Default,
    Aggressive,
    Conservative,
    Custom,
}

impl RetryPolicy {
    pub fn to_config(self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            RetryPolicy::Aggressive => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
            RetryPolicy::Conservative => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 2,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "wreckit_types::duration::deserialize_duration",
        serialize_with = "wreckit_types::duration::serialize_duration",
        default
    )]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "wreckit_types::duration::deserialize_duration",
        serialize_with = "wreckit_types::duration::serialize_duration",
        default
    )]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        RetryPolicy::Default.to_config()
    }
}

fn default_jitter() -> f64 {
    0.5
}

/// Per-`AgentErrorKind` retry overrides, keyed by the kind's snake_case
/// serde label (`"network"`, `"rate_limit"`, ...). Unlisted kinds fall back
/// to the item's default config — `auth`/`policy_violation` are non-retryable
/// by convention (the phase runner checks `AgentErrorKind::is_backoff_retryable`
/// before consulting this map at all).
pub type PerErrorConfig = std::collections::BTreeMap<String, RetryStrategyConfig>;

pub fn error_kind_key(kind: AgentErrorKind) -> &'static str {
    match kind {
        AgentErrorKind::Auth => "auth",
        AgentErrorKind::RateLimit => "rate_limit",
        AgentErrorKind::ContextWindow => "context_window",
        AgentErrorKind::Network => "network",
        AgentErrorKind::Timeout => "timeout",
        AgentErrorKind::PolicyViolation => "policy_violation",
        AgentErrorKind::Other => "other",
    }
}

pub fn config_for_error(
    default_config: &RetryStrategyConfig,
    per_error: &PerErrorConfig,
    kind: AgentErrorKind,
) -> RetryStrategyConfig {
    per_error
        .get(error_kind_key(kind))
        .cloned()
        .unwrap_or_else(|| default_config.clone())
}

pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_three_attempts() {
        let config = RetryPolicy::Default.to_config();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.strategy, RetryStrategyType::Exponential);
    }

    #[test]
    fn calculate_delay_exponential_doubles_then_caps() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(10));
    }

    #[test]
    fn calculate_delay_immediate_is_always_zero() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 3,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::ZERO);
        assert_eq!(calculate_delay(&config, 9), Duration::ZERO);
    }

    #[test]
    fn config_for_error_prefers_explicit_override() {
        let default_config = RetryStrategyConfig::default();
        let mut per_error = PerErrorConfig::new();
        per_error.insert(
            error_kind_key(AgentErrorKind::Network).to_string(),
            RetryStrategyConfig {
                strategy: RetryStrategyType::Immediate,
                max_attempts: 10,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter: 0.0,
            },
        );

        let resolved = config_for_error(&default_config, &per_error, AgentErrorKind::Network);
        assert_eq!(resolved.strategy, RetryStrategyType::Immediate);

        let fallback = config_for_error(&default_config, &per_error, AgentErrorKind::Timeout);
        assert_eq!(fallback.strategy, default_config.strategy);
    }

    #[test]
    fn retry_strategy_config_parses_humantime_durations() {
        let json = r#"{
            "strategy": "linear",
            "max_attempts": 4,
            "base_delay": "5s",
            "max_delay": "1m",
            "jitter": 0.2
        }"#;
        let config: RetryStrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.strategy, RetryStrategyType::Linear);
        assert_eq!(config.base_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(60));
    }
}
