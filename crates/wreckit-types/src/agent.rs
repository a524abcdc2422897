//! Agent backend configuration and the event stream a running agent
//! produces (§3 "Agent event", §4.3).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration, serialize_duration};

/// Discriminated union over backend kinds (§4.3). Deliberately open for
/// additions — an unrecognized `kind` string fails at config-parse time
/// with a clear error rather than silently picking a default backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentConfig {
    Process {
        command: String,
        args: Vec<String>,
        completion_signal: String,
    },
    ClaudeSdk {
        model: String,
        #[serde(default)]
        max_tokens: Option<u32>,
        permission_mode: String,
    },
    CodexSdk {
        model: String,
        #[serde(default)]
        max_tokens: Option<u32>,
        permission_mode: String,
    },
    AmpSdk {
        model: String,
        #[serde(default)]
        max_tokens: Option<u32>,
        permission_mode: String,
    },
    OpencodeSdk {
        model: String,
        #[serde(default)]
        max_tokens: Option<u32>,
        permission_mode: String,
    },
    Rlm {
        model: String,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    Sprite {
        /// The backend run inside the provisioned VM.
        inner: Box<AgentConfig>,
        vm_name_prefix: String,
        sync_back: bool,
    },
}

impl AgentConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentConfig::Process { .. } => "process",
            AgentConfig::ClaudeSdk { .. } => "claude_sdk",
            AgentConfig::CodexSdk { .. } => "codex_sdk",
            AgentConfig::AmpSdk { .. } => "amp_sdk",
            AgentConfig::OpencodeSdk { .. } => "opencode_sdk",
            AgentConfig::Rlm { .. } => "rlm",
            AgentConfig::Sprite { .. } => "sprite",
        }
    }

    /// Provider API key env var this backend expects to be set, if any
    /// (§6: "the core logs which env vars are missing").
    pub fn required_env_var(&self) -> Option<&'static str> {
        match self {
            AgentConfig::ClaudeSdk { .. } => Some("ANTHROPIC_API_KEY"),
            AgentConfig::CodexSdk { .. } => Some("OPENAI_API_KEY"),
            AgentConfig::AmpSdk { .. } => Some("AMP_API_KEY"),
            AgentConfig::OpencodeSdk { .. } => Some("OPENCODE_API_KEY"),
            AgentConfig::Process { .. } | AgentConfig::Rlm { .. } => None,
            AgentConfig::Sprite { inner, .. } => inner.required_env_var(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    Auth,
    RateLimit,
    ContextWindow,
    Network,
    Timeout,
    PolicyViolation,
    Other,
}

impl AgentErrorKind {
    /// Network and RateLimit are the two classes the phase runner
    /// retries with exponential backoff (§7).
    pub fn is_backoff_retryable(self) -> bool {
        matches!(self, AgentErrorKind::Network | AgentErrorKind::RateLimit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    Denied,
}

/// One event in the strictly-ordered stream a running agent produces (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    AssistantText {
        text: String,
    },
    Thought {
        text: String,
    },
    ToolStarted {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        status: ToolStatus,
        output_summary: String,
    },
    RunResult {
        success: bool,
        stats: BTreeMap<String, serde_json::Value>,
    },
    Error {
        message: String,
        classification: AgentErrorKind,
    },
}

/// The dispatcher's terminal result for one `run_agent` invocation (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub error_classification: Option<AgentErrorKind>,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub duration: Duration,
    pub events_emitted: usize,
}

impl AgentOutcome {
    pub fn success(duration: Duration, events_emitted: usize) -> Self {
        Self {
            success: true,
            timed_out: false,
            error_classification: None,
            duration,
            events_emitted,
        }
    }

    pub fn failure(
        classification: AgentErrorKind,
        duration: Duration,
        events_emitted: usize,
    ) -> Self {
        Self {
            success: false,
            timed_out: false,
            error_classification: Some(classification),
            duration,
            events_emitted,
        }
    }

    pub fn timed_out(duration: Duration, events_emitted: usize) -> Self {
        Self {
            success: false,
            timed_out: true,
            error_classification: Some(AgentErrorKind::Timeout),
            duration,
            events_emitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_kind_matches_tag() {
        let cfg = AgentConfig::Process {
            command: "claude".into(),
            args: vec![],
            completion_signal: "DONE".into(),
        };
        assert_eq!(cfg.kind(), "process");
    }

    #[test]
    fn sprite_forwards_required_env_var_from_inner() {
        let cfg = AgentConfig::Sprite {
            inner: Box::new(AgentConfig::ClaudeSdk {
                model: "claude".into(),
                max_tokens: None,
                permission_mode: "default".into(),
            }),
            vm_name_prefix: "wreckit-sandbox".into(),
            sync_back: true,
        };
        assert_eq!(cfg.required_env_var(), Some("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn network_and_rate_limit_are_backoff_retryable() {
        assert!(AgentErrorKind::Network.is_backoff_retryable());
        assert!(AgentErrorKind::RateLimit.is_backoff_retryable());
        assert!(!AgentErrorKind::Auth.is_backoff_retryable());
    }

    #[test]
    fn unknown_backend_kind_fails_to_parse() {
        let json = r#"{"kind": "mystery_backend"}"#;
        let err = serde_json::from_str::<AgentConfig>(json).unwrap_err();
        assert!(err.to_string().contains("mystery_backend") || err.to_string().contains("unknown variant"));
    }

    #[test]
    fn agent_event_tagged_union_roundtrips() {
        let event = AgentEvent::ToolResult {
            id: "t1".into(),
            status: ToolStatus::Denied,
            output_summary: "tool not allowlisted".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        match back {
            AgentEvent::ToolResult { status, .. } => assert_eq!(status, ToolStatus::Denied),
            _ => panic!("wrong variant"),
        }
    }
}
