//! Doctor-lite health check (SPEC_FULL.md §10): the in-scope data
//! collection behind the CLI's `doctor` subcommand. No terminal UI lives
//! here, only the facts a UI would render.

use wreckit_store::Store;
use wreckit_types::ResolvedConfig;
use wreckit_types::item::{ItemId, ItemState};

#[derive(Debug, Clone, Default)]
pub struct DoctorReport {
    /// Items left in a transient `-ing` state: since locks are in-process
    /// only (no cross-process lock file survives a crash), a stuck `-ing`
    /// item is the on-disk signal that a previous run died mid-phase
    /// without reaching `PhaseSucceeded`/`PhaseFailed`.
    pub items_stuck_in_progress: Vec<ItemId>,
    /// Items present in `items/` but absent from `index.json`, or vice
    /// versa — the index is a cache and can drift if a process crashed
    /// between writing an item directory and calling `reindex`.
    pub items_missing_from_index: Vec<ItemId>,
    pub stale_index_entries: Vec<ItemId>,
    /// Env vars the configured default agent backend requires but the
    /// current process doesn't have set.
    pub missing_env_vars: Vec<String>,
}

impl DoctorReport {
    pub fn is_healthy(&self) -> bool {
        self.items_stuck_in_progress.is_empty()
            && self.items_missing_from_index.is_empty()
            && self.stale_index_entries.is_empty()
            && self.missing_env_vars.is_empty()
    }
}

/// Collects `report`'s findings from the store on disk and the process
/// environment. Never mutates anything; `--fix` (a CLI-layer concern) acts
/// on the report rather than this function reaching for fixes itself.
pub fn doctor_report(store: &Store, config: &ResolvedConfig) -> anyhow::Result<DoctorReport> {
    let items = store.scan_items()?;
    let index = store.load_index()?;

    let items_stuck_in_progress = items
        .iter()
        .filter(|item| item.state.is_in_progress())
        .map(|item| item.id.clone())
        .collect();

    let index_ids: std::collections::HashSet<&ItemId> = index.iter().map(|s| &s.id).collect();
    let items_missing_from_index = items
        .iter()
        .filter(|item| !index_ids.contains(&item.id))
        .map(|item| item.id.clone())
        .collect();

    let item_ids: std::collections::HashSet<&ItemId> = items.iter().map(|i| &i.id).collect();
    let stale_index_entries = index
        .iter()
        .filter(|summary| !item_ids.contains(&summary.id))
        .map(|summary| summary.id.clone())
        .collect();

    let mut missing_env_vars = Vec::new();
    if let Some(var) = config.default_agent.required_env_var()
        && std::env::var(var).is_err()
    {
        missing_env_vars.push(var.to_string());
    }
    for agent in config.phase_agents.values() {
        if let Some(var) = agent.required_env_var()
            && std::env::var(var).is_err()
            && !missing_env_vars.iter().any(|v| v == var)
        {
            missing_env_vars.push(var.to_string());
        }
    }

    Ok(DoctorReport {
        items_stuck_in_progress,
        items_missing_from_index,
        stale_index_entries,
        missing_env_vars,
    })
}

/// `--fix`: the one corrective action that's unambiguous and safe without
/// a human in the loop — rebuilding the index from the item directories
/// that are actually on disk. Items stuck `-ing` need a `UserReset`,
/// which touches item state and is deliberately left to an explicit CLI
/// command rather than folded into `--fix`.
pub fn fix_index_drift(store: &Store) -> anyhow::Result<usize> {
    let summaries = store.reindex()?;
    Ok(summaries.len())
}
