//! Loading `.wreckit/config.json` into a [`ResolvedConfig`] (§3, §6, §9).
//!
//! The repo's config file is read once per invocation and never mutated
//! implicitly — if an agent object carries the legacy `"mode"` key (`{
//! process, sdk }`, predating the tagged-union `"kind"` discriminator), we
//! translate it in memory to `kind` ∈ `{ process, claude_sdk }` and log a
//! deprecation warning, but leave the file on disk exactly as the operator
//! wrote it. Rewriting it silently would race a human editing the same
//! file, and would make `git diff` on the config noisy for no reason the
//! operator asked for.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use wreckit_types::ResolvedConfig;

pub const CONFIG_DIR: &str = ".wreckit";
pub const CONFIG_FILE: &str = "config.json";

pub fn config_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(CONFIG_DIR)
}

pub fn config_path(repo_root: &Path) -> PathBuf {
    config_dir(repo_root).join(CONFIG_FILE)
}

/// Read `.wreckit/config.json` under `repo_root`. Returns `Ok(None)` if it
/// doesn't exist yet — callers distinguish "no repo initialized here" from
/// a parse failure.
pub fn load_config(repo_root: &Path) -> Result<Option<ResolvedConfig>> {
    let path = config_path(repo_root);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let mut value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config JSON {}", path.display()))?;

    migrate_legacy_agent_mode_field(&mut value, &path);

    let config: ResolvedConfig = serde_json::from_value(value)
        .with_context(|| format!("failed to deserialize config {}", path.display()))?;

    Ok(Some(config))
}

/// Translate `default_agent` and every entry of `phase_agents` that still
/// uses the retired `"mode"` key into the tagged-union `"kind"` shape
/// [`wreckit_types::agent::AgentConfig`] expects (§6).
fn migrate_legacy_agent_mode_field(value: &mut serde_json::Value, path: &Path) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if let Some(agent) = obj.get_mut("default_agent") {
        migrate_agent_mode_to_kind(agent, path);
    }
    if let Some(phase_agents) = obj.get_mut("phase_agents").and_then(|v| v.as_object_mut()) {
        for agent in phase_agents.values_mut() {
            migrate_agent_mode_to_kind(agent, path);
        }
    }
}

/// `"mode"` predates the `"kind"` discriminator: `process` meant exactly
/// what `kind = "process"` means today, and `sdk` meant the (then sole)
/// hosted backend, now named `claude_sdk`.
fn migrate_agent_mode_to_kind(agent: &mut serde_json::Value, path: &Path) {
    let Some(obj) = agent.as_object_mut() else {
        return;
    };
    if obj.contains_key("kind") {
        return;
    }
    let Some(mode) = obj.remove("mode") else {
        return;
    };
    let kind = match mode.as_str() {
        Some("process") => "process",
        Some("sdk") => "claude_sdk",
        Some(other) => {
            tracing::warn!(
                config = %path.display(),
                mode = other,
                "unrecognized legacy agent 'mode' value, ignoring"
            );
            return;
        }
        None => return,
    };
    tracing::warn!(
        config = %path.display(),
        "agent config uses the retired 'mode' field; treating as kind = \"{kind}\" \
         without rewriting the file"
    );
    obj.insert("kind".to_string(), serde_json::Value::String(kind.to_string()));
}

pub fn save_config(repo_root: &Path, config: &ResolvedConfig) -> Result<()> {
    wreckit_store::atomic_write_json(&config_path(repo_root), config)
}

/// Walk upward from `start_dir` looking for a `.wreckit/config.json`,
/// the way a lot of tools (git, cargo) find their project root.
pub fn find_repo_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        if config_path(current).exists() {
            return Some(current.to_path_buf());
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

/// Load config or fail with a clear message naming the directory that was
/// searched, for callers that require an initialized repo.
pub fn require_config(repo_root: &Path) -> Result<ResolvedConfig> {
    match load_config(repo_root)? {
        Some(config) => Ok(config),
        None => bail!(
            "no .wreckit/config.json found under {} (run `wreckit init` first)",
            repo_root.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wreckit_types::{AgentConfig, MergeMode};

    fn minimal_config_json() -> serde_json::Value {
        serde_json::json!({
            "default_agent": {
                "kind": "process",
                "command": "claude",
                "args": [],
                "completion_signal": "DONE"
            },
            "phase_timeout": "30m",
            "branch_prefix": "wreckit/",
            "base_branch": "main"
        })
    }

    #[test]
    fn load_config_returns_none_when_absent() {
        let td = tempfile::tempdir().unwrap();
        assert!(load_config(td.path()).unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let config = ResolvedConfig {
            default_agent: AgentConfig::Process {
                command: "claude".into(),
                args: vec![],
                completion_signal: "DONE".into(),
            },
            phase_agents: Default::default(),
            phase_timeout: std::time::Duration::from_secs(1800),
            agent_idle_timeout: None,
            max_attempts_default: 3,
            per_error_retry: Default::default(),
            merge_mode: MergeMode::PullRequest,
            branch_cleanup: Default::default(),
            sandbox: Default::default(),
            critique: Default::default(),
            branch_prefix: "wreckit/".into(),
            base_branch: "main".into(),
            pr_checks: vec![],
            allow_unsafe_direct_merge: false,
            allowed_remote_patterns: vec![],
            tool_allowlist: vec![],
            worker_count: Some(2),
            webhook_url: None,
            webhook_secret_env: None,
        };

        save_config(td.path(), &config).unwrap();
        let loaded = load_config(td.path()).unwrap().unwrap();
        assert_eq!(loaded.base_branch, "main");
        assert_eq!(loaded.worker_count, Some(2));
    }

    #[test]
    fn legacy_agent_mode_process_migrates_to_kind_process() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(config_dir(td.path())).unwrap();
        let json = serde_json::json!({
            "default_agent": {
                "mode": "process",
                "command": "claude",
                "args": [],
                "completion_signal": "DONE"
            },
            "phase_timeout": "30m",
            "branch_prefix": "wreckit/",
            "base_branch": "main"
        });
        std::fs::write(config_path(td.path()), json.to_string()).unwrap();

        let config = load_config(td.path()).unwrap().unwrap();
        assert_eq!(config.default_agent.kind(), "process");

        let raw = std::fs::read_to_string(config_path(td.path())).unwrap();
        assert!(raw.contains("\"mode\""), "file on disk must be untouched");
    }

    #[test]
    fn legacy_agent_mode_sdk_migrates_to_kind_claude_sdk() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(config_dir(td.path())).unwrap();
        let json = serde_json::json!({
            "default_agent": {
                "mode": "sdk",
                "model": "claude-opus",
                "max_tokens": 4096,
                "permission_mode": "default"
            },
            "phase_timeout": "30m",
            "branch_prefix": "wreckit/",
            "base_branch": "main"
        });
        std::fs::write(config_path(td.path()), json.to_string()).unwrap();

        let config = load_config(td.path()).unwrap().unwrap();
        assert_eq!(config.default_agent.kind(), "claude_sdk");
    }

    #[test]
    fn explicit_kind_wins_over_legacy_agent_mode() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(config_dir(td.path())).unwrap();
        let json = serde_json::json!({
            "default_agent": {
                "mode": "process",
                "kind": "claude_sdk",
                "model": "claude-opus",
                "max_tokens": 4096,
                "permission_mode": "default"
            },
            "phase_timeout": "30m",
            "branch_prefix": "wreckit/",
            "base_branch": "main"
        });
        std::fs::write(config_path(td.path()), json.to_string()).unwrap();

        let config = load_config(td.path()).unwrap().unwrap();
        assert_eq!(config.default_agent.kind(), "claude_sdk");
    }

    #[test]
    fn legacy_agent_mode_migrates_inside_phase_agents_too() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(config_dir(td.path())).unwrap();
        let mut json = minimal_config_json();
        json["phase_agents"] = serde_json::json!({
            "plan": {
                "mode": "sdk",
                "model": "claude-opus",
                "max_tokens": 4096,
                "permission_mode": "default"
            }
        });
        std::fs::write(config_path(td.path()), json.to_string()).unwrap();

        let config = load_config(td.path()).unwrap().unwrap();
        let plan_agent = config.phase_agents.get("plan").expect("plan agent present");
        assert_eq!(plan_agent.kind(), "claude_sdk");
    }

    #[test]
    fn find_repo_root_walks_up_directory_tree() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(config_dir(td.path())).unwrap();
        std::fs::write(config_path(td.path()), minimal_config_json().to_string()).unwrap();

        let nested = td.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_repo_root(&nested).unwrap(), td.path());
    }

    #[test]
    fn require_config_fails_with_clear_message_when_missing() {
        let td = tempfile::tempdir().unwrap();
        let err = require_config(td.path()).unwrap_err();
        assert!(err.to_string().contains("wreckit init"));
    }
}
