//! Agent backend dispatch (§4.3).
//!
//! `run_agent` is the single entry point every phase runner call goes
//! through regardless of which [`AgentConfig`] backend is configured: it
//! spawns the backend, streams [`AgentEvent`]s to the caller as they
//! arrive, enforces the tool allowlist post-hoc, and returns a terminal
//! [`AgentOutcome`]. The contract (success semantics, timeout handling,
//! dry-run behavior) is identical across backends; only command
//! construction differs.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use wreckit_types::agent::{AgentConfig, AgentErrorKind, AgentEvent, AgentOutcome, ToolStatus};

/// Per-invocation knobs the phase runner supplies (§4.3: "options include
/// tool allowlist, MCP server handles, streaming callbacks, dry-run flag,
/// mock flag, timeout, and an item identifier"). MCP server handles and
/// the event callback are passed as separate arguments to `run_agent`
/// rather than folded into this struct, since the callback needs to be
/// `FnMut` and the MCP handle set varies by crate layering.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub tool_allowlist: Vec<String>,
    pub dry_run: bool,
    pub mock: bool,
    pub timeout: Option<Duration>,
    pub item_id: String,
}

impl RunOptions {
    pub fn is_tool_allowed(&self, name: &str) -> bool {
        self.tool_allowlist.iter().any(|t| t == name)
    }
}

fn agent_bin(env_var: &str, default: &str) -> String {
    env::var(env_var).unwrap_or_else(|_| default.to_string())
}

/// Derives the program and argument vector for a backend. SDK backends
/// shell out to their vendor CLI the same way the process backend shells
/// out to an arbitrary command — wreckit carries no SDK client libraries,
/// only the convention each vendor's CLI accepts `--model`/`--permission-mode`
/// and a `--prompt-file` pointing at the rendered prompt.
fn backend_command(config: &AgentConfig, prompt_file: &Path) -> (String, Vec<String>) {
    let prompt_arg = prompt_file.display().to_string();
    match config {
        AgentConfig::Process { command, args, .. } => {
            let mut full_args = args.clone();
            full_args.push("--prompt-file".into());
            full_args.push(prompt_arg);
            (command.clone(), full_args)
        }
        AgentConfig::ClaudeSdk {
            model,
            max_tokens,
            permission_mode,
        } => sdk_args("WRECKIT_CLAUDE_BIN", "claude", model, *max_tokens, permission_mode, &prompt_arg),
        AgentConfig::CodexSdk {
            model,
            max_tokens,
            permission_mode,
        } => sdk_args("WRECKIT_CODEX_BIN", "codex", model, *max_tokens, permission_mode, &prompt_arg),
        AgentConfig::AmpSdk {
            model,
            max_tokens,
            permission_mode,
        } => sdk_args("WRECKIT_AMP_BIN", "amp", model, *max_tokens, permission_mode, &prompt_arg),
        AgentConfig::OpencodeSdk {
            model,
            max_tokens,
            permission_mode,
        } => sdk_args(
            "WRECKIT_OPENCODE_BIN",
            "opencode",
            model,
            *max_tokens,
            permission_mode,
            &prompt_arg,
        ),
        AgentConfig::Rlm { model, max_tokens } => {
            let mut args = vec!["--model".to_string(), model.clone()];
            if let Some(tokens) = max_tokens {
                args.push("--max-tokens".into());
                args.push(tokens.to_string());
            }
            args.push("--prompt-file".into());
            args.push(prompt_arg);
            (agent_bin("WRECKIT_RLM_BIN", "rlm"), args)
        }
        AgentConfig::Sprite { inner, .. } => backend_command(inner, prompt_file),
    }
}

fn sdk_args(
    env_var: &str,
    default_bin: &str,
    model: &str,
    max_tokens: Option<u32>,
    permission_mode: &str,
    prompt_arg: &str,
) -> (String, Vec<String>) {
    let mut args = vec![
        "--model".to_string(),
        model.to_string(),
        "--permission-mode".to_string(),
        permission_mode.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
    ];
    if let Some(tokens) = max_tokens {
        args.push("--max-tokens".into());
        args.push(tokens.to_string());
    }
    args.push("--prompt-file".into());
    args.push(prompt_arg.to_string());
    (agent_bin(env_var, default_bin), args)
}

/// Parses one line of backend stdout into an event. Lines that parse as a
/// JSON-encoded [`AgentEvent`] are passed through as-is (this is how SDK
/// backends report thoughts/tool calls/run results); anything else is
/// treated as raw assistant text, which is how the plain `process` backend
/// behaves when it isn't emitting structured events.
fn parse_event_line(line: &str) -> AgentEvent {
    serde_json::from_str::<AgentEvent>(line).unwrap_or_else(|_| AgentEvent::AssistantText {
        text: line.to_string(),
    })
}

/// Provisions and guarantees teardown of the sprite backend's ephemeral
/// remote VM. Teardown runs on every exit path, including an early return
/// from an error, because it happens in `Drop` rather than at the end of
/// a success path.
struct SpriteVm {
    name: String,
    ctl_bin: String,
}

impl SpriteVm {
    fn provision(vm_name_prefix: &str, cwd: &Path) -> Result<Self> {
        let ctl_bin = agent_bin("WRECKIT_SPRITE_CTL_BIN", "sprite-ctl");
        let name = format!("{vm_name_prefix}-{}", std::process::id());
        wreckit_process::run_command_with_timeout(
            &ctl_bin,
            &["provision", &name],
            cwd,
            Some(Duration::from_secs(120)),
        )
        .context("failed to provision sprite VM")?;
        wreckit_process::run_command_with_timeout(
            &ctl_bin,
            &["sync-in", &name],
            cwd,
            Some(Duration::from_secs(120)),
        )
        .context("failed to sync working tree into sprite VM")?;
        Ok(Self { name, ctl_bin })
    }

    fn sync_back(&self, cwd: &Path) -> Result<()> {
        wreckit_process::run_command_with_timeout(
            &self.ctl_bin,
            &["sync-out", &self.name],
            cwd,
            Some(Duration::from_secs(120)),
        )
        .context("failed to sync sprite VM working tree back")?;
        Ok(())
    }
}

impl Drop for SpriteVm {
    fn drop(&mut self) {
        let _ = wreckit_process::run_command_with_timeout(
            &self.ctl_bin,
            &["teardown", &self.name],
            Path::new("."),
            Some(Duration::from_secs(60)),
        );
    }
}

/// Dispatches `prompt` to the backend described by `config`, streaming
/// events to `on_event` in order and returning the terminal outcome.
pub fn run_agent(
    config: &AgentConfig,
    cwd: &Path,
    prompt: &str,
    options: &RunOptions,
    mut on_event: impl FnMut(AgentEvent),
) -> Result<AgentOutcome> {
    if options.dry_run || options.mock {
        let outcome = AgentOutcome::success(Duration::from_millis(0), 0);
        on_event(AgentEvent::RunResult {
            success: true,
            stats: Default::default(),
        });
        return Ok(outcome);
    }

    if let AgentConfig::Sprite {
        inner,
        vm_name_prefix,
        sync_back,
    } = config
    {
        let vm = SpriteVm::provision(vm_name_prefix, cwd)?;
        let outcome = run_agent(inner, cwd, prompt, options, &mut on_event)?;
        if *sync_back && outcome.success {
            vm.sync_back(cwd)?;
        }
        return Ok(outcome);
    }

    let tmp_dir = cwd.join(".wreckit-tmp");
    fs::create_dir_all(&tmp_dir).context("failed to create prompt scratch dir")?;
    let prompt_file = tmp_dir.join(format!("{}.prompt", options.item_id));
    fs::write(&prompt_file, prompt).context("failed to write rendered prompt")?;

    let (program, args) = backend_command(config, &prompt_file);
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();

    let mut events_emitted = 0usize;
    let mut policy_violation = false;
    let mut events_on_emit = |line: &str| {
        let event = parse_event_line(line);
        let event = enforce_allowlist(event, options, &mut policy_violation);
        events_emitted += 1;
        on_event(event);
    };

    let output = wreckit_process::run_command_streaming(
        &program,
        &args_ref,
        cwd,
        options.timeout,
        &mut events_on_emit,
    )
    .with_context(|| format!("failed to run agent backend '{program}'"))?;

    let _ = fs::remove_file(&prompt_file);

    if output.timed_out {
        return Ok(AgentOutcome::timed_out(output.duration, events_emitted));
    }

    if policy_violation {
        on_event(AgentEvent::Error {
            message: "agent referenced a tool outside the allowlist".into(),
            classification: AgentErrorKind::PolicyViolation,
        });
        return Ok(AgentOutcome::failure(
            AgentErrorKind::PolicyViolation,
            output.duration,
            events_emitted,
        ));
    }

    let backend_signaled_done = match config {
        AgentConfig::Process { completion_signal, .. } => {
            output.exit_code == 0 && output.stdout.contains(completion_signal.as_str())
        }
        _ => output.exit_code == 0,
    };

    if backend_signaled_done {
        Ok(AgentOutcome::success(output.duration, events_emitted))
    } else {
        Ok(AgentOutcome::failure(
            AgentErrorKind::Other,
            output.duration,
            events_emitted,
        ))
    }
}

/// Rejects post-hoc any `ToolStarted`/`ToolResult` event naming a tool
/// outside the allowlist, turning it into a denial instead of letting it
/// pass through to the event log (§4.3: "rejecting post-hoc any
/// tool_result event referencing a disallowed tool").
fn enforce_allowlist(event: AgentEvent, options: &RunOptions, violated: &mut bool) -> AgentEvent {
    match event {
        AgentEvent::ToolStarted { id, name, input } if !options.is_tool_allowed(&name) => {
            *violated = true;
            AgentEvent::ToolResult {
                id,
                status: ToolStatus::Denied,
                output_summary: format!("tool '{name}' is not in the allowlist for this phase"),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    fn write_fake_bin(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn process_config(command: String, completion_signal: &str) -> AgentConfig {
        AgentConfig::Process {
            command,
            args: vec![],
            completion_signal: completion_signal.to_string(),
        }
    }

    #[test]
    fn dry_run_returns_synthetic_success_without_spawning() {
        let td = tempdir().unwrap();
        let config = process_config("/nonexistent/should-not-run".into(), "DONE");
        let options = RunOptions {
            tool_allowlist: vec!["read".into()],
            dry_run: true,
            mock: false,
            timeout: None,
            item_id: "features-001".into(),
        };
        let mut events = Vec::new();
        let outcome = run_agent(&config, td.path(), "prompt", &options, |e| events.push(e)).unwrap();
        assert!(outcome.success);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn success_requires_completion_signal_in_stdout() {
        let td = tempdir().unwrap();
        let bin_dir = td.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        let script = write_fake_bin(&bin_dir, "fake-agent", "echo 'working...'\necho DONE");
        let config = process_config(script.to_str().unwrap().to_string(), "DONE");
        let options = RunOptions {
            tool_allowlist: vec![],
            dry_run: false,
            mock: false,
            timeout: None,
            item_id: "features-002".into(),
        };
        let outcome = run_agent(&config, td.path(), "prompt", &options, |_| {}).unwrap();
        assert!(outcome.success);
    }

    #[test]
    fn missing_completion_signal_is_a_failure() {
        let td = tempdir().unwrap();
        let bin_dir = td.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        let script = write_fake_bin(&bin_dir, "fake-agent", "echo 'still working'");
        let config = process_config(script.to_str().unwrap().to_string(), "DONE");
        let options = RunOptions {
            tool_allowlist: vec![],
            dry_run: false,
            mock: false,
            timeout: None,
            item_id: "features-003".into(),
        };
        let outcome = run_agent(&config, td.path(), "prompt", &options, |_| {}).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_classification, Some(AgentErrorKind::Other));
    }

    #[test]
    fn tool_started_outside_allowlist_is_rejected_post_hoc() {
        let td = tempdir().unwrap();
        let bin_dir = td.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        let event_line = serde_json::json!({"event": "tool_started", "id": "t1", "name": "bash", "input": {}})
            .to_string();
        let script = write_fake_bin(&bin_dir, "fake-agent", &format!("echo '{event_line}'\necho DONE"));
        let config = process_config(script.to_str().unwrap().to_string(), "DONE");
        let options = RunOptions {
            tool_allowlist: vec!["read".into()],
            dry_run: false,
            mock: false,
            timeout: None,
            item_id: "features-004".into(),
        };
        let mut events = Vec::new();
        let outcome = run_agent(&config, td.path(), "prompt", &options, |e| events.push(e)).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_classification, Some(AgentErrorKind::PolicyViolation));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolResult { status: ToolStatus::Denied, .. }
        )));
    }

    #[test]
    fn timeout_kills_backend_and_reports_timed_out() {
        let td = tempdir().unwrap();
        let bin_dir = td.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        let script = write_fake_bin(&bin_dir, "fake-agent", "sleep 5\necho DONE");
        let config = process_config(script.to_str().unwrap().to_string(), "DONE");
        let options = RunOptions {
            tool_allowlist: vec![],
            dry_run: false,
            mock: false,
            timeout: Some(Duration::from_millis(150)),
            item_id: "features-005".into(),
        };
        let outcome = run_agent(&config, td.path(), "prompt", &options, |_| {}).unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
    }
}
