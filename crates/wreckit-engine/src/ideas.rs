//! Ideas-ingest (§9 open question 3, SPEC_FULL.md §3 ideas-ingest pathway).
//!
//! Ideas parsing itself is an agent concern: only the tool-call surface
//! (`save_parsed_ideas`) is specified. This module reads a source document,
//! hands it to the default agent with that one tool allowed, and collects
//! whatever items the agent's `save_parsed_ideas` call created. The MCP
//! server's own bulk-create call already defers the index patch until
//! every item directory is durably written, so a worker polling the index
//! never observes a half-ingested batch.

use std::collections::HashMap;
use std::path::Path;

use wreckit_agent::{RunOptions, run_agent};
use wreckit_mcp::{McpServer, ToolCall};
use wreckit_prompt::Template;
use wreckit_store::Store;
use wreckit_types::ResolvedConfig;
use wreckit_types::agent::{AgentErrorKind, AgentEvent};
use wreckit_types::error::WreckitError;
use wreckit_types::item::ItemId;

const IDEAS_TEMPLATE: &str = "You are ingesting a batch of feature/bug ideas from the\n\
following source document. Parse each distinct idea into a section\n\
(\"features\" or \"bugs\"), a short title and a one-paragraph overview, then\n\
call save_parsed_ideas exactly once with the full list.\n\n\
Source:\n{{source}}\n\n\
Allowed tools: {{allowed_tools}}.\nFinish by printing DONE on its own line.\n";

/// Runs the ingest agent against `source` and returns the ids of every
/// item it created via `save_parsed_ideas`.
pub fn run_ideas_ingest(
    store: &Store,
    config: &ResolvedConfig,
    repo_root: &Path,
    source: &Path,
    dry_run: bool,
    mock: bool,
) -> Result<Vec<ItemId>, WreckitError> {
    let source_text = std::fs::read_to_string(source).map_err(|e| {
        WreckitError::Artifact(format!("failed to read ideas source {}: {e}", source.display()))
    })?;

    let allowed = vec!["save_parsed_ideas".to_string()];
    let mut vars = HashMap::new();
    vars.insert("source".to_string(), source_text);
    vars.insert("allowed_tools".to_string(), allowed.join(", "));

    let template = Template::parse(IDEAS_TEMPLATE)
        .map_err(|e| WreckitError::Config(format!("invalid built-in prompt template: {e}")))?;
    let prompt = template
        .render(&vars)
        .map_err(|e| WreckitError::Artifact(format!("prompt assembly failed: {e}")))?;

    let options = RunOptions {
        tool_allowlist: allowed,
        dry_run,
        mock,
        timeout: Some(config.phase_timeout),
        item_id: "ideas-ingest".to_string(),
    };

    let mcp = McpServer::new(store.clone());
    let placeholder_id = ItemId::from_raw("ideas-ingest");
    let mut created = Vec::new();

    let outcome = run_agent(&config.default_agent, repo_root, &prompt, &options, |event| {
        let AgentEvent::ToolStarted { id, name, input } = event else {
            return;
        };
        if name != "save_parsed_ideas" {
            return;
        }
        let result = mcp.dispatch(&placeholder_id, ToolCall { id, name, input });
        if !result.ok {
            return;
        }
        if let Some(ids) = result.output.get("created").and_then(|v| v.as_array()) {
            for entry in ids {
                if let Some(s) = entry.as_str() {
                    created.push(ItemId::from_raw(s.to_string()));
                }
            }
        }
    })
    .map_err(|e| WreckitError::Agent {
        item: placeholder_id.clone(),
        phase: "ideas".to_string(),
        kind: AgentErrorKind::Other,
        message: e.to_string(),
    })?;

    if !outcome.success {
        return Err(WreckitError::Artifact(
            "ideas ingestion agent did not complete successfully".into(),
        ));
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wreckit_types::config::{BranchCleanupPolicy, CritiquePolicy, MergeMode, SandboxPolicy};
    use wreckit_types::AgentConfig;

    fn test_config() -> ResolvedConfig {
        ResolvedConfig {
            default_agent: AgentConfig::Process {
                command: "true".into(),
                args: vec![],
                completion_signal: "DONE".into(),
            },
            phase_agents: Default::default(),
            phase_timeout: std::time::Duration::from_secs(5),
            agent_idle_timeout: None,
            max_attempts_default: 1,
            per_error_retry: Default::default(),
            merge_mode: MergeMode::PullRequest,
            branch_cleanup: BranchCleanupPolicy::DeleteOnMerge,
            sandbox: SandboxPolicy::None,
            critique: CritiquePolicy::Disabled,
            branch_prefix: "wreckit/".into(),
            base_branch: "main".into(),
            pr_checks: vec![],
            allow_unsafe_direct_merge: false,
            allowed_remote_patterns: vec![],
            tool_allowlist: vec![],
            worker_count: None,
            webhook_url: None,
            webhook_secret_env: None,
        }
    }

    #[test]
    fn dry_run_completes_without_creating_items() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let source = td.path().join("ideas.md");
        std::fs::write(&source, "- add a rate limiter\n- fix the crash on startup\n").unwrap();

        let created =
            run_ideas_ingest(&store, &test_config(), td.path(), &source, true, false).unwrap();

        assert!(created.is_empty());
        assert!(store.scan_items().unwrap().is_empty());
    }

    #[test]
    fn missing_source_file_is_an_artifact_error() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let missing = td.path().join("nope.md");

        let err =
            run_ideas_ingest(&store, &test_config(), td.path(), &missing, false, true).unwrap_err();

        assert!(matches!(err, WreckitError::Artifact(_)));
    }

    #[test]
    fn mock_run_leaves_store_empty_since_no_tool_call_is_synthesized() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let source = td.path().join("ideas.md");
        std::fs::write(&source, "- add a rate limiter\n").unwrap();

        let created =
            run_ideas_ingest(&store, &test_config(), td.path(), &source, false, true).unwrap();

        assert!(created.is_empty());
    }
}
