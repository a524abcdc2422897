//! The phase runner (§4.4): one function per agent-driven phase, all
//! following the same shape — stamp the `-ing` state, assemble a prompt,
//! resolve the tool allowlist, run the agent, then apply a phase-specific
//! post-processing step before persisting and releasing the item lock.
//!
//! `complete` has no `-ing` state of its own (see
//! [`wreckit_statemachine::Event`]): it's driven procedurally rather than
//! by the common agent loop, since its job is to detect an external PR
//! merge and hand off to the `complete` MCP tool rather than to produce
//! new agent output.

use std::collections::HashMap;
use std::time::Duration;

use wreckit_agent::{RunOptions, run_agent};
use wreckit_events::{EventLog, phase_log_path};
use wreckit_git as git;
use wreckit_lock::{ItemGuard, ItemLockRegistry, WorkingTreeSlot};
use wreckit_mcp::{McpServer, ToolCall};
use wreckit_prompt::Template;
use wreckit_retry::{calculate_delay, config_for_error};
use wreckit_statemachine::{Event as StateEvent, transition};
use wreckit_store::Store;
use wreckit_types::agent::{AgentErrorKind, AgentEvent, ToolStatus};
use wreckit_types::config::{CritiquePolicy, MergeMode, SandboxPolicy};
use wreckit_types::error::WreckitError;
use wreckit_types::item::{Item, ItemId, ItemState, Phase, StoryStatus};
use wreckit_types::ResolvedConfig;

const MCP_TOOL_NAMES: &[&str] = &["save_prd", "update_story_status", "complete", "save_parsed_ideas"];

/// `wreckit-store`/`wreckit-events` report failures as `anyhow::Error`;
/// there's no single matchable variant underneath, so every such failure
/// becomes an opaque [`WreckitError::Artifact`] rather than a new taxonomy
/// entry per call site.
fn artifact(e: anyhow::Error) -> WreckitError {
    WreckitError::Artifact(e.to_string())
}

fn baseline_allowlist(phase: Phase) -> &'static [&'static str] {
    match phase {
        Phase::Research => &["read", "glob", "grep", "list-dir"],
        Phase::Plan => &["read", "write", "edit", "glob", "grep", "save_prd"],
        Phase::Implement => &["read", "write", "edit", "glob", "grep", "bash", "update_story_status"],
        Phase::Pr => &["read", "glob", "grep", "bash"],
        Phase::Complete => &["read", "glob", "grep", "complete"],
    }
}

const RESEARCH_TEMPLATE: &str = "You are researching item {{item_id}} (\"{{title}}\").\n\n\
Overview: {{overview}}\n\n\
Read the relevant parts of this repository and write your findings to\n\
research.md in the item's working directory. Attempt {{attempt}}.\n\
Allowed tools: {{allowed_tools}}.\n\
Finish by printing DONE on its own line.\n";

const PLAN_TEMPLATE: &str = "You are writing a PRD for item {{item_id}} (\"{{title}}\").\n\n\
Overview: {{overview}}\n\n\
Research notes:\n{{research_notes}}\n\n\
Call the save_prd tool exactly once with a problem statement, goals, non-goals,\n\
a list of stories, open questions and references. Attempt {{attempt}}.\n\
Allowed tools: {{allowed_tools}}.\n\
Finish by printing DONE on its own line.\n";

const IMPLEMENT_TEMPLATE: &str = "You are implementing item {{item_id}} (\"{{title}}\") on branch {{branch}}.\n\n\
Stories:\n{{stories_summary}}\n\n\
Implement every story, calling update_story_status as each one completes.\n\
Attempt {{attempt}}.{{critique_feedback}}\n\
Allowed tools: {{allowed_tools}}.\n\
Finish by printing DONE on its own line.\n";

const PR_TEMPLATE: &str = "Item {{item_id}} (\"{{title}}\") is implemented on branch {{branch}},\n\
targeting {{base_branch}}. Write a pull request title and body describing\n\
the change to pr_body.md in the item's working directory. Attempt {{attempt}}.\n\
Allowed tools: {{allowed_tools}}.\n\
Finish by printing DONE on its own line.\n";

const COMPLETE_TEMPLATE: &str = "Item {{item_id}} (\"{{title}}\") has merged. Write a brief summary of\n\
what shipped, then call the complete tool with that summary.\n\
Allowed tools: {{allowed_tools}}.\n\
Finish by printing DONE on its own line.\n";

/// Bundles everything a phase run needs access to: persistence, the two
/// mutual-exclusion primitives (§5), the resolved configuration, and the
/// repo checkout every agent invocation runs against.
#[derive(Clone)]
pub struct PhaseRunner {
    pub store: Store,
    pub locks: ItemLockRegistry,
    pub working_tree: WorkingTreeSlot,
    pub repo_root: std::path::PathBuf,
    pub config: ResolvedConfig,
    /// Short-circuits every agent invocation to a synthetic success without
    /// spawning a backend (`wreckit run --dry-run`).
    pub dry_run: bool,
    /// Spawns the real backend command but treats the run as non-binding
    /// for planning purposes (`wreckit run --mock-agent`); passed straight
    /// through to [`wreckit_agent::RunOptions`].
    pub mock: bool,
}

/// What a single phase invocation produced, for the orchestrator's
/// reporting and for tests.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub item: Item,
    pub phase: Phase,
    pub attempts: u32,
}

impl PhaseRunner {
    fn load_item(&self, id: &ItemId) -> Result<Item, WreckitError> {
        self.store
            .load_item(id)
            .map_err(artifact)?
            .ok_or_else(|| WreckitError::ItemNotFound(id.clone()))
    }

    fn save_item(&self, item: &Item) -> Result<(), WreckitError> {
        self.store.save_item(item).map_err(artifact)
    }

    fn agent_config_for(&self, phase: Phase) -> wreckit_types::agent::AgentConfig {
        let resolved = self
            .config
            .phase_agents
            .get(phase.as_str())
            .cloned()
            .unwrap_or_else(|| self.config.default_agent.clone());

        if self.config.sandbox == SandboxPolicy::RequireSprite
            && !matches!(resolved, wreckit_types::agent::AgentConfig::Sprite { .. })
        {
            wreckit_types::agent::AgentConfig::Sprite {
                inner: Box::new(resolved),
                vm_name_prefix: "wreckit-".to_string(),
                sync_back: true,
            }
        } else {
            resolved
        }
    }

    fn effective_allowlist(&self, phase: Phase) -> Result<Vec<String>, WreckitError> {
        let baseline = baseline_allowlist(phase);
        let effective: Vec<String> = if self.config.tool_allowlist.is_empty() {
            baseline.iter().map(|s| s.to_string()).collect()
        } else {
            baseline
                .iter()
                .filter(|t| self.config.tool_allowlist.iter().any(|a| a == *t))
                .map(|s| s.to_string())
                .collect()
        };
        if effective.is_empty() {
            return Err(WreckitError::Artifact(format!(
                "no tools allowed for phase '{}' after intersecting with the configured allowlist",
                phase.as_str()
            )));
        }
        Ok(effective)
    }

    fn base_variables(&self, item: &Item, phase: Phase, attempt: u32, allowed: &[String]) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("item_id".into(), item.id.as_str().to_string());
        vars.insert("title".into(), item.title.clone());
        vars.insert("overview".into(), item.overview.clone());
        vars.insert("state".into(), item.state.label());
        vars.insert("attempt".into(), attempt.to_string());
        vars.insert("branch".into(), item.branch.clone().unwrap_or_default());
        vars.insert("base_branch".into(), self.config.base_branch.clone());
        vars.insert("allowed_tools".into(), allowed.join(", "));
        vars.insert("research_notes".into(), self.research_notes(&item.id));
        vars.insert("stories_summary".into(), self.stories_summary(&item.id));
        vars.insert("critique_feedback".into(), String::new());
        let _ = phase;
        vars
    }

    fn research_notes(&self, id: &ItemId) -> String {
        let path = self.store.item_dir(id).join("research.md");
        std::fs::read_to_string(path).unwrap_or_else(|_| "(no research notes yet)".to_string())
    }

    fn stories_summary(&self, id: &ItemId) -> String {
        match self.store.load_prd(id).ok().flatten() {
            Some(prd) if !prd.stories.is_empty() => prd
                .stories
                .iter()
                .map(|s| format!("- [{:?}] {} ({})", s.status, s.title, s.story_id))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "(no stories yet)".to_string(),
        }
    }

    fn template_for(&self, phase: Phase) -> &'static str {
        match phase {
            Phase::Research => RESEARCH_TEMPLATE,
            Phase::Plan => PLAN_TEMPLATE,
            Phase::Implement => IMPLEMENT_TEMPLATE,
            Phase::Pr => PR_TEMPLATE,
            Phase::Complete => COMPLETE_TEMPLATE,
        }
    }

    /// Runs `phase`'s agent exactly once (no retry, no critique) and
    /// returns its outcome plus the event log it produced. Shared by every
    /// `run_*` entry point below.
    #[allow(clippy::too_many_arguments)]
    fn invoke_agent(
        &self,
        item: &Item,
        phase: Phase,
        attempt: u32,
        allowed: &[String],
        extra_vars: &HashMap<String, String>,
        mcp: Option<&McpServer>,
        dry_run: bool,
        mock: bool,
    ) -> Result<(wreckit_types::agent::AgentOutcome, EventLog), WreckitError> {
        let mut vars = self.base_variables(item, phase, attempt, allowed);
        vars.extend(extra_vars.clone());

        let template = Template::parse(self.template_for(phase))
            .map_err(|e| WreckitError::Config(format!("invalid built-in prompt template: {e}")))?;
        let prompt = template
            .render(&vars)
            .map_err(|e| WreckitError::Artifact(format!("prompt assembly failed: {e}")))?;

        let options = RunOptions {
            tool_allowlist: allowed.to_vec(),
            dry_run,
            mock,
            timeout: Some(self.config.phase_timeout),
            item_id: item.id.normalized_for_branch(),
        };

        let mut log = EventLog::new();
        let agent_config = self.agent_config_for(phase);
        let item_id = item.id.clone();

        let outcome = run_agent(&agent_config, &self.repo_root, &prompt, &options, |event| {
            let event = route_mcp(event, &item_id, mcp);
            log.record(phase, attempt, event);
        })
        .map_err(|e| WreckitError::Agent {
            item: item.id.clone(),
            phase: phase.as_str().to_string(),
            kind: AgentErrorKind::Other,
            message: e.to_string(),
        })?;

        let log_path = phase_log_path(&self.store.item_dir(&item.id), phase);
        log.write_to_file(&log_path).map_err(artifact)?;

        Ok((outcome, log))
    }

    /// Runs one agent-driven phase to completion, retrying backoff-eligible
    /// failures up to the configured attempt count before forking the item
    /// to `Failed` (§7).
    fn run_with_retry(
        &self,
        item: &mut Item,
        phase: Phase,
        allowed: &[String],
        extra_vars: &HashMap<String, String>,
        mcp: Option<&McpServer>,
    ) -> Result<wreckit_types::agent::AgentOutcome, WreckitError> {
        let max_attempts = self.config.max_attempts_default.max(1);

        let mut attempt = 1;
        loop {
            let (outcome, _log) =
                self.invoke_agent(item, phase, attempt, allowed, extra_vars, mcp, self.dry_run, self.mock)?;

            if outcome.success {
                return Ok(outcome);
            }

            let kind = outcome.error_classification.unwrap_or(AgentErrorKind::Other);
            if kind.is_backoff_retryable() && attempt < max_attempts {
                let per_error: wreckit_retry::PerErrorConfig = self
                    .config
                    .per_error_retry
                    .iter()
                    .map(|(k, v)| (k.clone(), v_to_strategy(v)))
                    .collect();
                let retry_config = config_for_error(
                    &wreckit_retry::RetryPolicy::Default.to_config(),
                    &per_error,
                    kind,
                );
                let delay = calculate_delay(&retry_config, attempt);
                tracing::warn!(item = %item.id, phase = phase.as_str(), attempt, ?delay, "retrying agent after backoff-eligible failure");
                std::thread::sleep(delay.min(Duration::from_secs(1)).max(Duration::ZERO));
                attempt += 1;
                continue;
            }

            item.state = transition(&item.state, StateEvent::PhaseFailed)
                .map_err(|e| state_violation(&item.id, &e))?;
            item.retry_count = attempt;
            item.last_error = Some(format!("{phase:?} failed: {kind:?}"));
            self.save_item(item)?;

            return Err(WreckitError::Agent {
                item: item.id.clone(),
                phase: phase.as_str().to_string(),
                kind,
                message: item.last_error.clone().unwrap_or_default(),
            });
        }
    }

    fn with_item_lock<T>(&self, id: &ItemId, f: impl FnOnce(ItemGuard) -> Result<T, WreckitError>) -> Result<T, WreckitError> {
        let guard = self.locks.lock(id.clone());
        f(guard)
    }

    pub fn run_research(&self, id: &ItemId) -> Result<PhaseReport, WreckitError> {
        self.with_item_lock(id, |_guard| {
            let mut item = self.load_item(id)?;
            item.state = transition(&item.state, StateEvent::StartPhase(Phase::Research))
                .map_err(|e| state_violation(id, &e))?;
            self.save_item(&item)?;

            let allowed = self.effective_allowlist(Phase::Research)?;
            let outcome = self.run_with_retry(&mut item, Phase::Research, &allowed, &HashMap::new(), None)?;

            let research_path = self.store.item_dir(id).join("research.md");
            let notes = std::fs::read_to_string(&research_path).unwrap_or_default();
            if notes.trim().is_empty() {
                item.state = transition(&item.state, StateEvent::PhaseFailed).map_err(|e| state_violation(id, &e))?;
                self.save_item(&item)?;
                return Err(WreckitError::Artifact(
                    "research phase produced no research.md notes".into(),
                ));
            }

            item.state = transition(&item.state, StateEvent::PhaseSucceeded).map_err(|e| state_violation(id, &e))?;
            self.save_item(&item)?;
            let _ = outcome;
            Ok(PhaseReport { item, phase: Phase::Research, attempts: 1 })
        })
    }

    pub fn run_plan(&self, id: &ItemId) -> Result<PhaseReport, WreckitError> {
        self.with_item_lock(id, |_guard| {
            let mut item = self.load_item(id)?;
            item.state = transition(&item.state, StateEvent::StartPhase(Phase::Plan))
                .map_err(|e| state_violation(id, &e))?;
            item.critique_rounds = 0;
            self.save_item(&item)?;

            let allowed = self.effective_allowlist(Phase::Plan)?;
            let mcp = McpServer::new(self.store.clone());

            let critique_rounds = match self.config.critique {
                CritiquePolicy::Enforced { max_rounds } => max_rounds,
                CritiquePolicy::Advisory => 1,
                CritiquePolicy::Disabled => 0,
            };

            let mut critique_feedback = String::new();
            for round in 0..=critique_rounds {
                let mut extra = HashMap::new();
                extra.insert("critique_feedback".into(), critique_feedback.clone());
                self.run_with_retry(&mut item, Phase::Plan, &allowed, &extra, Some(&mcp))?;

                let prd = self.store.load_prd(id).map_err(artifact)?;
                if prd.as_ref().is_none_or(|p| p.stories.is_empty()) {
                    item.state = transition(&item.state, StateEvent::PhaseFailed).map_err(|e| state_violation(id, &e))?;
                    self.save_item(&item)?;
                    return Err(WreckitError::Artifact(
                        "plan phase did not save a PRD with at least one story".into(),
                    ));
                }

                item.state = transition(&item.state, StateEvent::PhaseSucceeded).map_err(|e| state_violation(id, &e))?;
                self.save_item(&item)?;

                if self.config.critique == CritiquePolicy::Disabled {
                    break;
                }

                let verdict = self.run_plan_critique(&item, &allowed)?;
                if verdict {
                    break;
                }

                let is_final_round = round == critique_rounds;
                if matches!(self.config.critique, CritiquePolicy::Enforced { .. }) && is_final_round {
                    item.state = transition(&item.state, StateEvent::CritiqueRejected)
                        .map_err(|e| state_violation(id, &e))?;
                    self.save_item(&item)?;
                    return Err(WreckitError::Artifact(
                        "plan output was rejected by critique after exhausting retries".into(),
                    ));
                }
                if matches!(self.config.critique, CritiquePolicy::Advisory) {
                    tracing::warn!(item = %item.id, "critique rejected plan output; proceeding anyway (advisory)");
                    break;
                }

                critique_feedback = self.append_plan_feedback(id)?;
                item.critique_rounds += 1;
                item.state = ItemState::Researched;
                item.state = transition(&item.state, StateEvent::StartPhase(Phase::Plan))
                    .map_err(|e| state_violation(id, &e))?;
                self.save_item(&item)?;
            }

            Ok(PhaseReport { item, phase: Phase::Plan, attempts: 1 })
        })
    }

    /// Appends a rejection note to `plan.md`/the PRD's working copy and
    /// returns the feedback line to surface in the next round's prompt.
    fn append_plan_feedback(&self, id: &ItemId) -> Result<String, WreckitError> {
        let feedback = "\nThe previous plan was rejected by review; address the feedback and retry.".to_string();
        let plan_path = self.store.item_dir(id).join("plan.md");
        let existing = std::fs::read_to_string(&plan_path).unwrap_or_default();
        std::fs::write(&plan_path, format!("{existing}\n\n## Critique feedback\n{feedback}\n")).map_err(|e| {
            WreckitError::Artifact(format!("failed to append critique feedback to plan.md: {e}"))
        })?;
        Ok(feedback)
    }

    /// Runs a single critique pass over the saved PRD and returns `true` if
    /// it was approved. Mirrors [`Self::run_critique`] but reviews the plan
    /// document instead of an implementation diff, since plan phase has no
    /// branch yet to inspect.
    fn run_plan_critique(&self, item: &Item, allowed: &[String]) -> Result<bool, WreckitError> {
        let mut vars = HashMap::new();
        vars.insert(
            "stories_summary".to_string(),
            format!(
                "{}\n\nReview this PRD's stories for completeness and clarity. Print CRITIQUE_APPROVED or CRITIQUE_REJECTED.",
                self.stories_summary(&item.id)
            ),
        );

        let mut approved_text = String::new();
        let (outcome, log) = self.invoke_agent(item, Phase::Plan, 0, allowed, &vars, None, false, false)?;
        for logged in log.all_events() {
            if let AgentEvent::AssistantText { text } = &logged.event {
                approved_text.push_str(text);
                approved_text.push('\n');
            }
        }
        if !outcome.success {
            return Ok(true);
        }
        Ok(!approved_text.contains("CRITIQUE_REJECTED"))
    }

    pub fn run_implement(&self, id: &ItemId) -> Result<PhaseReport, WreckitError> {
        self.with_item_lock(id, |_guard| {
            let mut item = self.load_item(id)?;
            item.state = transition(&item.state, StateEvent::StartPhase(Phase::Implement))
                .map_err(|e| state_violation(id, &e))?;
            let branch = format!("{}{}", self.config.branch_prefix, item.id.normalized_for_branch());
            item.branch = Some(branch.clone());
            item.critique_rounds = 0;
            self.save_item(&item)?;

            let allowed = self.effective_allowlist(Phase::Implement)?;
            let mcp = McpServer::new(self.store.clone());
            let _tree = self.working_tree.acquire();

            git::ensure_branch(&self.repo_root, &branch, &self.config.base_branch)
                .map_err(WreckitError::from)?;

            let mut critique_feedback = String::new();
            let critique_rounds = match self.config.critique {
                CritiquePolicy::Enforced { max_rounds } => max_rounds,
                CritiquePolicy::Advisory => 1,
                CritiquePolicy::Disabled => 0,
            };

            for round in 0..=critique_rounds {
                let mut extra = HashMap::new();
                extra.insert("critique_feedback".into(), critique_feedback.clone());
                self.run_with_retry(&mut item, Phase::Implement, &allowed, &extra, Some(&mcp))?;

                let prd = self
                    .store
                    .load_prd(id)
                    .map_err(artifact)?
                    .ok_or_else(|| WreckitError::Artifact("implement ran without a saved PRD".into()))?;
                if prd.stories.iter().any(|s| matches!(s.status, StoryStatus::Pending | StoryStatus::InProgress)) {
                    item.state = transition(&item.state, StateEvent::PhaseFailed).map_err(|e| state_violation(id, &e))?;
                    self.save_item(&item)?;
                    return Err(WreckitError::Artifact(
                        "implement finished with stories still pending or in progress".into(),
                    ));
                }

                let committed = git::commit_all(&self.repo_root, &format!("wreckit: implement {}", item.id))
                    .map_err(WreckitError::from)?;
                if !committed {
                    item.state = transition(&item.state, StateEvent::PhaseFailed).map_err(|e| state_violation(id, &e))?;
                    self.save_item(&item)?;
                    return Err(WreckitError::Artifact("implement made no changes to commit".into()));
                }
                git::push_branch(&self.repo_root, &branch).map_err(WreckitError::from)?;

                item.state = transition(&item.state, StateEvent::PhaseSucceeded).map_err(|e| state_violation(id, &e))?;
                self.save_item(&item)?;

                if self.config.critique == CritiquePolicy::Disabled {
                    break;
                }

                let verdict = self.run_critique(&item, &allowed)?;
                if verdict {
                    break;
                }

                let is_final_round = round == critique_rounds;
                if matches!(self.config.critique, CritiquePolicy::Enforced { .. }) && is_final_round {
                    item.state = transition(&item.state, StateEvent::CritiqueRejected)
                        .map_err(|e| state_violation(id, &e))?;
                    self.save_item(&item)?;
                    return Err(WreckitError::Artifact(
                        "implement output was rejected by critique after exhausting retries".into(),
                    ));
                }
                if matches!(self.config.critique, CritiquePolicy::Advisory) {
                    tracing::warn!(item = %item.id, "critique rejected implement output; proceeding anyway (advisory)");
                    break;
                }

                critique_feedback = "\nThe previous attempt was rejected by review; address the feedback and retry.".into();
                item.critique_rounds += 1;
                // No transition models "redo implement from Implemented"; drop back to
                // Planned directly rather than widening the lifecycle table for an
                // internal retry loop the item never actually rests in.
                item.state = ItemState::Planned;
                item.state = transition(&item.state, StateEvent::StartPhase(Phase::Implement))
                    .map_err(|e| state_violation(id, &e))?;
                self.save_item(&item)?;
            }

            Ok(PhaseReport { item, phase: Phase::Implement, attempts: 1 })
        })
    }

    /// Runs a single critique pass and returns `true` if the implementation
    /// was approved. The critique agent shares the implement phase's
    /// backend but is asked to review rather than produce code, and its
    /// verdict is read off a literal token in its output instead of the
    /// normal completion signal.
    fn run_critique(&self, item: &Item, allowed: &[String]) -> Result<bool, WreckitError> {
        let mut vars = HashMap::new();
        vars.insert(
            "stories_summary".to_string(),
            format!("{}\n\nReview the diff on branch {:?}. Print CRITIQUE_APPROVED or CRITIQUE_REJECTED.", self.stories_summary(&item.id), item.branch),
        );

        let mut approved_text = String::new();
        let (outcome, log) = self.invoke_agent(item, Phase::Implement, 0, allowed, &vars, None, false, false)?;
        for logged in log.all_events() {
            if let AgentEvent::AssistantText { text } = &logged.event {
                approved_text.push_str(text);
                approved_text.push('\n');
            }
        }
        if !outcome.success {
            return Ok(true);
        }
        Ok(!approved_text.contains("CRITIQUE_REJECTED"))
    }

    pub fn run_pr(&self, id: &ItemId) -> Result<PhaseReport, WreckitError> {
        self.with_item_lock(id, |_guard| {
            let mut item = self.load_item(id)?;
            let branch = item
                .branch
                .clone()
                .ok_or_else(|| WreckitError::Artifact("pr phase requires a branch from implement".into()))?;

            item.state = transition(&item.state, StateEvent::StartPhase(Phase::Pr))
                .map_err(|e| state_violation(id, &e))?;
            self.save_item(&item)?;

            let allowed = self.effective_allowlist(Phase::Pr)?;
            let _tree = self.working_tree.acquire();

            for check in &self.config.pr_checks {
                let output = wreckit_process::run_command_with_timeout(
                    "sh",
                    &["-c", check],
                    &self.repo_root,
                    Some(self.config.phase_timeout),
                )
                .map_err(|e| WreckitError::Artifact(format!("pr check '{check}' failed to run: {e}")))?;
                if output.exit_code != 0 {
                    item.state = transition(&item.state, StateEvent::PhaseFailed).map_err(|e| state_violation(id, &e))?;
                    self.save_item(&item)?;
                    return Err(WreckitError::Artifact(format!(
                        "pr check '{check}' failed with exit code {}",
                        output.exit_code
                    )));
                }
            }

            self.run_with_retry(&mut item, Phase::Pr, &allowed, &HashMap::new(), None)?;

            let body_path = self.store.item_dir(id).join("pr_body.md");
            let body = std::fs::read_to_string(&body_path)
                .unwrap_or_else(|_| format!("Automated change for {}.", item.title));

            match self.config.merge_mode {
                MergeMode::PullRequest => {
                    let pr = git::open_pr(&self.repo_root, &branch, &self.config.base_branch, &item.title, &body)
                        .map_err(WreckitError::from)?;
                    item.pr_url = Some(pr.url);
                    item.pr_number = pr.number;
                    item.state = transition(&item.state, StateEvent::PhaseSucceeded).map_err(|e| state_violation(id, &e))?;
                }
                MergeMode::DirectMerge => {
                    git::direct_merge(
                        &self.repo_root,
                        &branch,
                        &self.config.base_branch,
                        self.config.allow_unsafe_direct_merge,
                        &self.config.allowed_remote_patterns,
                    )
                    .map_err(WreckitError::from)?;
                    item.state = transition(&item.state, StateEvent::PhaseSucceeded).map_err(|e| state_violation(id, &e))?;
                    item.state = transition(&item.state, StateEvent::PrMerged).map_err(|e| state_violation(id, &e))?;
                }
            }
            self.save_item(&item)?;
            Ok(PhaseReport { item, phase: Phase::Pr, attempts: 1 })
        })
    }

    /// Procedural: detects an external merge, hands off to the `complete`
    /// MCP tool, then applies the branch cleanup policy. Unlike the other
    /// phases this never starts an agent-driven `-ing` state.
    pub fn run_complete(&self, id: &ItemId) -> Result<PhaseReport, WreckitError> {
        self.with_item_lock(id, |_guard| {
            let mut item = self.load_item(id)?;

            if item.state == ItemState::InPr {
                let branch = item.branch.clone().unwrap_or_default();
                let merged = self.detect_merge(&branch)?;
                if !merged {
                    return Err(WreckitError::StateViolation {
                        id: id.clone(),
                        from: item.state.label(),
                        event: "complete (PR not yet merged)".into(),
                    });
                }
                item.state = transition(&item.state, StateEvent::PrMerged).map_err(|e| state_violation(id, &e))?;
                self.save_item(&item)?;
            }

            if item.state != ItemState::Merged {
                return Err(WreckitError::StateViolation {
                    id: id.clone(),
                    from: item.state.label(),
                    event: "complete".into(),
                });
            }

            let allowed = self.effective_allowlist(Phase::Complete)?;
            let mcp = McpServer::new(self.store.clone());
            self.invoke_agent(&item, Phase::Complete, 1, &allowed, &HashMap::new(), Some(&mcp), false, false)?;

            item = self.load_item(id)?;

            if item.state == ItemState::Complete
                && let Some(branch) = &item.branch
            {
                let delete_remote = matches!(self.config.branch_cleanup, wreckit_types::config::BranchCleanupPolicy::DeleteOnMerge);
                if delete_remote {
                    let _ = git::cleanup_branch(&self.repo_root, branch, true);
                }
            }

            Ok(PhaseReport { item, phase: Phase::Complete, attempts: 1 })
        })
    }

    fn detect_merge(&self, branch: &str) -> Result<bool, WreckitError> {
        let output = wreckit_process::run_command_with_timeout(
            "git",
            &["merge-base", "--is-ancestor", branch, &self.config.base_branch],
            &self.repo_root,
            Some(Duration::from_secs(10)),
        );
        match output {
            Ok(out) => Ok(out.exit_code == 0),
            Err(_) => Ok(false),
        }
    }
}

fn v_to_strategy(c: &wreckit_types::config::PerErrorRetryConfig) -> wreckit_retry::RetryStrategyConfig {
    wreckit_retry::RetryStrategyConfig {
        strategy: wreckit_retry::RetryStrategyType::Exponential,
        max_attempts: c.max_attempts,
        base_delay: c.base_delay,
        max_delay: c.base_delay * 16,
        jitter: 0.5,
    }
}

fn state_violation(id: &ItemId, err: &wreckit_statemachine::TransitionError) -> WreckitError {
    WreckitError::StateViolation {
        id: id.clone(),
        from: err.from.clone(),
        event: err.event.clone(),
    }
}

/// Intercepts `ToolStarted` events naming an MCP tool and dispatches them
/// immediately, synthesizing the `ToolResult` the backend would otherwise
/// have produced itself after a round trip through the tool protocol.
fn route_mcp(event: AgentEvent, item_id: &ItemId, mcp: Option<&McpServer>) -> AgentEvent {
    let Some(mcp) = mcp else { return event };
    match event {
        AgentEvent::ToolStarted { id, name, input } if MCP_TOOL_NAMES.contains(&name.as_str()) => {
            let result = mcp.dispatch(item_id, ToolCall { id, name, input });
            AgentEvent::ToolResult {
                id: result.id,
                status: if result.ok { ToolStatus::Ok } else { ToolStatus::Error },
                output_summary: result.output.to_string(),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wreckit_types::agent::AgentConfig;

    fn test_runner(repo_root: std::path::PathBuf, wreckit_dir: std::path::PathBuf) -> PhaseRunner {
        PhaseRunner {
            store: Store::new(wreckit_dir),
            locks: ItemLockRegistry::new(),
            working_tree: WorkingTreeSlot::new(),
            repo_root,
            config: ResolvedConfig {
                default_agent: AgentConfig::Process {
                    command: "true".into(),
                    args: vec![],
                    completion_signal: "DONE".into(),
                },
                phase_agents: Default::default(),
                phase_timeout: Duration::from_secs(5),
                agent_idle_timeout: None,
                max_attempts_default: 1,
                per_error_retry: Default::default(),
                merge_mode: MergeMode::PullRequest,
                branch_cleanup: wreckit_types::config::BranchCleanupPolicy::DeleteOnMerge,
                sandbox: wreckit_types::config::SandboxPolicy::None,
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
            },
            dry_run: false,
            mock: true,
        }
    }

    #[test]
    fn effective_allowlist_narrows_by_configured_tools() {
        let td = tempfile::tempdir().unwrap();
        let mut runner = test_runner(td.path().to_path_buf(), td.path().join(".wreckit"));
        runner.config.tool_allowlist = vec!["read".into(), "glob".into()];
        let allowed = runner.effective_allowlist(Phase::Research).unwrap();
        assert_eq!(allowed, vec!["read".to_string(), "glob".to_string()]);
    }

    #[test]
    fn effective_allowlist_rejects_empty_intersection() {
        let td = tempfile::tempdir().unwrap();
        let mut runner = test_runner(td.path().to_path_buf(), td.path().join(".wreckit"));
        runner.config.tool_allowlist = vec!["nonexistent-tool".into()];
        let err = runner.effective_allowlist(Phase::Research).unwrap_err();
        assert!(matches!(err, WreckitError::Artifact(_)));
    }

    #[test]
    fn run_research_fails_without_research_notes() {
        let td = tempfile::tempdir().unwrap();
        let runner = test_runner(td.path().to_path_buf(), td.path().join(".wreckit"));
        let id = ItemId::new("features", 1, "a");
        let item = Item::new(id.clone(), "Add a thing".into(), "overview".into());
        runner.store.save_item(&item).unwrap();

        let result = runner.run_research(&id);

        assert!(matches!(result, Err(WreckitError::Artifact(_))));
        let reloaded = runner.store.load_item(&id).unwrap().unwrap();
        assert!(matches!(reloaded.state, ItemState::Failed { .. }));
    }

    #[test]
    fn run_research_succeeds_when_notes_are_written() {
        let td = tempfile::tempdir().unwrap();
        let runner = test_runner(td.path().to_path_buf(), td.path().join(".wreckit"));
        let id = ItemId::new("features", 1, "a");
        let item = Item::new(id.clone(), "Add a thing".into(), "overview".into());
        runner.store.save_item(&item).unwrap();
        std::fs::create_dir_all(runner.store.item_dir(&id)).unwrap();
        std::fs::write(runner.store.item_dir(&id).join("research.md"), "notes here").unwrap();

        let report = runner.run_research(&id).unwrap();

        assert_eq!(report.item.state, ItemState::Researched);
    }

    #[test]
    fn run_plan_fails_without_a_saved_prd() {
        let td = tempfile::tempdir().unwrap();
        let runner = test_runner(td.path().to_path_buf(), td.path().join(".wreckit"));
        let id = ItemId::new("features", 1, "a");
        let mut item = Item::new(id.clone(), "Add a thing".into(), "overview".into());
        item.state = ItemState::Researched;
        runner.store.save_item(&item).unwrap();

        let result = runner.run_plan(&id);

        assert!(matches!(result, Err(WreckitError::Artifact(_))));
    }
}
