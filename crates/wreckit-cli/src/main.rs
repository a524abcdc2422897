//! Thin `clap`-derive front end: every subcommand here does argument
//! parsing, config/store wiring, and output formatting, then hands off to
//! `wreckit-engine`/`wreckit-store`/`wreckit-statemachine` for the actual
//! work. No business logic lives in this crate.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use wreckit_config::{find_repo_root, require_config, save_config};
use wreckit_engine::{
    InterruptSwitch, Orchestrator, PhaseRunner, Reporter, doctor_report, fix_index_drift,
    run_ideas_ingest,
};
use wreckit_events::{EventLog, phase_log_path};
use wreckit_lock::{ItemLockRegistry, WorkingTreeSlot};
use wreckit_store::Store;
use wreckit_types::{AgentConfig, ItemId, Phase, ResolvedConfig, SandboxPolicy, WreckitError};

#[derive(Parser, Debug)]
#[command(name = "wreckit", version)]
#[command(about = "Autonomous engineering orchestrator: idea -> research -> plan -> implement -> pr -> complete")]
struct Cli {
    /// Repo root to operate in; defaults to walking up from the current
    /// directory looking for .wreckit/config.json.
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Emit tracing spans at debug level instead of the default info.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize .wreckit/config.json in the current (or --repo) directory.
    Init {
        /// Per-phase agent timeout, e.g. "30m" or "1h".
        #[arg(long, default_value = "30m")]
        phase_timeout: String,
    },
    /// Create a new idea item.
    Add {
        title: String,
        #[arg(long, default_value = "features")]
        section: String,
    },
    /// Ingest a batch of ideas from a freeform source document.
    Ideas {
        source: PathBuf,
        /// Run the ingest agent without invoking a real backend.
        #[arg(long)]
        mock_agent: bool,
    },
    /// List items, optionally filtered by state.
    List {
        #[arg(long = "state")]
        state: Option<String>,
    },
    /// Show one item's full record.
    Show { id: String },
    /// Run the next runnable phase for one item, or every runnable item.
    Run {
        id: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long = "phase", value_enum)]
        phases: Vec<PhaseArg>,
        /// Run only with an already-configured agent of this backend kind.
        #[arg(long)]
        agent: Option<String>,
        /// Require the sprite sandbox backend for this run regardless of
        /// the repo's configured sandbox policy.
        #[arg(long)]
        sandbox: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        mock_agent: bool,
    },
    /// Run exactly the research phase for one item.
    Research { id: String },
    /// Run exactly the plan phase for one item.
    Plan { id: String },
    /// Run exactly the implement phase for one item.
    Implement { id: String },
    /// Run exactly the pr phase for one item.
    Pr { id: String },
    /// Run exactly the complete phase for one item.
    Complete { id: String },
    /// Report store/index/env-var health.
    Doctor {
        /// Rebuild index.json from the items on disk.
        #[arg(long)]
        fix: bool,
    },
    /// Summarize past phase runs from their event logs.
    Learn {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        item: Option<String>,
        #[arg(long, value_enum)]
        phase: Option<PhaseArg>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PhaseArg {
    Research,
    Plan,
    Implement,
    Pr,
    Complete,
}

impl From<PhaseArg> for Phase {
    fn from(p: PhaseArg) -> Self {
        match p {
            PhaseArg::Research => Phase::Research,
            PhaseArg::Plan => Phase::Plan,
            PhaseArg::Implement => Phase::Implement,
            PhaseArg::Pr => Phase::Pr,
            PhaseArg::Complete => Phase::Complete,
        }
    }
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("wreckit={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        let code = err
            .downcast_ref::<WreckitError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let start_dir = cli
        .repo
        .clone()
        .unwrap_or(std::env::current_dir().context("failed to read current directory")?);

    match cli.cmd {
        Commands::Init { phase_timeout } => cmd_init(&start_dir, &phase_timeout),
        Commands::Add { title, section } => cmd_add(&start_dir, &title, &section),
        Commands::Ideas { source, mock_agent } => cmd_ideas(&start_dir, &source, mock_agent),
        Commands::List { state } => cmd_list(&start_dir, state.as_deref()),
        Commands::Show { id } => cmd_show(&start_dir, &id),
        Commands::Run {
            id,
            all,
            phases,
            agent,
            sandbox,
            dry_run,
            mock_agent,
        } => cmd_run(&start_dir, id, all, phases, agent, sandbox, dry_run, mock_agent),
        Commands::Research { id } => cmd_run_single_phase(&start_dir, &id, Phase::Research),
        Commands::Plan { id } => cmd_run_single_phase(&start_dir, &id, Phase::Plan),
        Commands::Implement { id } => cmd_run_single_phase(&start_dir, &id, Phase::Implement),
        Commands::Pr { id } => cmd_run_single_phase(&start_dir, &id, Phase::Pr),
        Commands::Complete { id } => cmd_run_single_phase(&start_dir, &id, Phase::Complete),
        Commands::Doctor { fix } => cmd_doctor(&start_dir, fix),
        Commands::Learn { all, item, phase } => cmd_learn(&start_dir, all, item, phase),
    }
}

fn repo_root(start_dir: &std::path::Path) -> Result<PathBuf> {
    find_repo_root(start_dir).ok_or_else(|| {
        WreckitError::Usage(format!(
            "no .wreckit/config.json found above {} (run `wreckit init` first)",
            start_dir.display()
        ))
        .into()
    })
}

fn open_store(repo_root: &std::path::Path) -> Store {
    Store::new(repo_root.join(".wreckit"))
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn cmd_init(start_dir: &std::path::Path, phase_timeout: &str) -> Result<()> {
    let config_path = wreckit_config::config_path(start_dir);
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let config = ResolvedConfig {
        default_agent: AgentConfig::Process {
            command: "claude".into(),
            args: vec![],
            completion_signal: "DONE".into(),
        },
        phase_agents: Default::default(),
        phase_timeout: parse_duration(phase_timeout)?,
        agent_idle_timeout: None,
        max_attempts_default: 3,
        per_error_retry: Default::default(),
        merge_mode: Default::default(),
        branch_cleanup: Default::default(),
        sandbox: Default::default(),
        critique: Default::default(),
        branch_prefix: "wreckit/".into(),
        base_branch: "main".into(),
        pr_checks: vec![],
        allow_unsafe_direct_merge: false,
        allowed_remote_patterns: vec![],
        tool_allowlist: vec![],
        worker_count: Some(1),
        webhook_url: None,
        webhook_secret_env: None,
    };

    save_config(start_dir, &config)?;
    println!("initialized {}", config_path.display());
    Ok(())
}

fn cmd_add(start_dir: &std::path::Path, title: &str, section: &str) -> Result<()> {
    let root = repo_root(start_dir)?;
    let store = open_store(&root);
    let item = store.create_item(section, title, "")?;
    store.reindex()?;
    println!("{}", item.id.as_str());
    Ok(())
}

fn cmd_ideas(start_dir: &std::path::Path, source: &std::path::Path, mock: bool) -> Result<()> {
    let root = repo_root(start_dir)?;
    let store = open_store(&root);
    let config = require_config(&root)?;

    let created = run_ideas_ingest(&store, &config, &root, source, false, mock)?;
    println!("created {} item(s):", created.len());
    for id in &created {
        println!("  {id}");
    }
    Ok(())
}

fn cmd_list(start_dir: &std::path::Path, state_filter: Option<&str>) -> Result<()> {
    let root = repo_root(start_dir)?;
    let store = open_store(&root);

    let mut summaries = store.load_index()?;
    if summaries.is_empty() {
        summaries = store.reindex()?;
    }

    for summary in summaries {
        let label = summary.state.label();
        if let Some(filter) = state_filter
            && filter != label
        {
            continue;
        }
        println!("{:<32} {:<14} {}", summary.id, label, summary.title);
    }
    Ok(())
}

fn cmd_show(start_dir: &std::path::Path, id: &str) -> Result<()> {
    let root = repo_root(start_dir)?;
    let store = open_store(&root);
    let id = ItemId::from_raw(id);

    let item = store
        .load_item(&id)?
        .ok_or_else(|| WreckitError::ItemNotFound(id.clone()))?;

    println!("id:          {}", item.id);
    println!("title:       {}", item.title);
    println!("state:       {}", item.state.label());
    println!("branch:      {}", item.branch.as_deref().unwrap_or("-"));
    println!("pr_url:      {}", item.pr_url.as_deref().unwrap_or("-"));
    println!("retry_count: {}", item.retry_count);
    println!("created_at:  {}", item.created_at.to_rfc3339());
    println!("updated_at:  {}", item.updated_at.to_rfc3339());
    if let Some(err) = &item.last_error {
        println!("last_error:  {err}");
    }

    if let Some(prd) = store.load_prd(&id)? {
        println!();
        println!("stories:");
        for story in &prd.stories {
            println!("  [{:?}] {} - {}", story.status, story.story_id, story.title);
        }
    }

    Ok(())
}

fn build_runner(root: PathBuf, config: ResolvedConfig, dry_run: bool, mock: bool) -> PhaseRunner {
    PhaseRunner {
        store: Store::new(root.join(".wreckit")),
        locks: ItemLockRegistry::new(),
        working_tree: WorkingTreeSlot::new(),
        repo_root: root,
        config,
        dry_run,
        mock,
    }
}

fn resolve_agent_override(config: &mut ResolvedConfig, agent_kind: &str) -> Result<()> {
    let matched = std::iter::once(&config.default_agent)
        .chain(config.phase_agents.values())
        .find(|a| a.kind() == agent_kind)
        .cloned();
    match matched {
        Some(agent) => {
            config.default_agent = agent;
            Ok(())
        }
        None => Err(WreckitError::Usage(format!(
            "no configured agent of kind '{agent_kind}'"
        ))
        .into()),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    start_dir: &std::path::Path,
    id: Option<String>,
    all: bool,
    phases: Vec<PhaseArg>,
    agent: Option<String>,
    sandbox: bool,
    dry_run: bool,
    mock_agent: bool,
) -> Result<()> {
    let root = repo_root(start_dir)?;
    let mut config = require_config(&root)?;

    if let Some(kind) = &agent {
        resolve_agent_override(&mut config, kind)?;
    }
    if sandbox {
        config.sandbox = SandboxPolicy::RequireSprite;
    }

    let runner = build_runner(root, config, dry_run, mock_agent);
    let orchestrator = Orchestrator::new(runner);

    if all {
        if id.is_some() {
            bail!(WreckitError::Usage("cannot pass both an item id and --all".into()));
        }
        if !phases.is_empty() {
            bail!(WreckitError::Usage("--phase only applies to a single item, not --all".into()));
        }
        let interrupt = InterruptSwitch::new();
        let reporter: Arc<Mutex<dyn Reporter>> = Arc::new(Mutex::new(CliReporter));
        let outcomes = orchestrator.run_all(&interrupt, reporter)?;
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        println!("ran {} item(s), {} failed", outcomes.len(), failed);
        for outcome in &outcomes {
            match &outcome.result {
                Ok(_) => println!("  {} {}: ok", outcome.id, outcome.phase.as_str()),
                Err(e) => println!("  {} {}: FAILED: {e}", outcome.id, outcome.phase.as_str()),
            }
        }
        if failed > 0 {
            bail!(WreckitError::Agent {
                item: outcomes
                    .iter()
                    .find(|o| o.result.is_err())
                    .map(|o| o.id.clone())
                    .expect("at least one failure"),
                phase: "run".into(),
                kind: wreckit_types::AgentErrorKind::Other,
                message: format!("{failed} item(s) failed"),
            });
        }
        return Ok(());
    }

    let Some(id) = id else {
        bail!(WreckitError::Usage("run requires an item id or --all".into()));
    };
    let id = ItemId::from_raw(id);
    let explicit: Option<Vec<Phase>> = if phases.is_empty() {
        None
    } else {
        Some(phases.into_iter().map(Phase::from).collect())
    };

    let mut reporter = CliReporter;
    let item = orchestrator.run_item(&id, explicit.as_deref(), &mut reporter)?;
    println!("{}: {}", item.id, item.state.label());
    Ok(())
}

fn cmd_run_single_phase(start_dir: &std::path::Path, id: &str, phase: Phase) -> Result<()> {
    let root = repo_root(start_dir)?;
    let config = require_config(&root)?;
    let runner = build_runner(root, config, false, false);
    let orchestrator = Orchestrator::new(runner);

    let id = ItemId::from_raw(id);
    let mut reporter = CliReporter;
    let item = orchestrator.run_item(&id, Some(&[phase]), &mut reporter)?;
    println!("{}: {}", item.id, item.state.label());
    Ok(())
}

fn cmd_doctor(start_dir: &std::path::Path, fix: bool) -> Result<()> {
    let root = repo_root(start_dir)?;
    let store = open_store(&root);
    let config = require_config(&root)?;

    if fix {
        let count = fix_index_drift(&store)?;
        println!("rebuilt index: {count} item(s)");
    }

    let report = doctor_report(&store, &config)?;
    println!("healthy: {}", report.is_healthy());

    if !report.items_stuck_in_progress.is_empty() {
        println!("stuck in progress:");
        for id in &report.items_stuck_in_progress {
            println!("  {id}");
        }
    }
    if !report.items_missing_from_index.is_empty() {
        println!("missing from index:");
        for id in &report.items_missing_from_index {
            println!("  {id}");
        }
    }
    if !report.stale_index_entries.is_empty() {
        println!("stale index entries:");
        for id in &report.stale_index_entries {
            println!("  {id}");
        }
    }
    if !report.missing_env_vars.is_empty() {
        println!("missing env vars:");
        for var in &report.missing_env_vars {
            println!("  {var}");
        }
    }

    Ok(())
}

/// Per-phase tally over one item's or every item's event logs: attempts,
/// terminal outcomes, and errors by classification. There's no dashboard
/// here, only the digest a human reads right after a run to decide what
/// to look at next.
fn cmd_learn(
    start_dir: &std::path::Path,
    all: bool,
    item_filter: Option<String>,
    phase_filter: Option<PhaseArg>,
) -> Result<()> {
    let root = repo_root(start_dir)?;
    let store = open_store(&root);

    if !all && item_filter.is_none() && phase_filter.is_none() {
        bail!(WreckitError::Usage(
            "learn requires --all, --item <id>, or --phase <phase>".into()
        ));
    }

    let items = match &item_filter {
        Some(raw) => {
            let id = ItemId::from_raw(raw.clone());
            let item = store
                .load_item(&id)?
                .ok_or_else(|| WreckitError::ItemNotFound(id.clone()))?;
            vec![item]
        }
        None => store.scan_items()?,
    };

    let phases: Vec<Phase> = match phase_filter {
        Some(p) => vec![p.into()],
        None => vec![Phase::Research, Phase::Plan, Phase::Implement, Phase::Pr, Phase::Complete],
    };

    let mut total_events = 0usize;
    let mut total_errors = 0usize;
    for item in &items {
        let item_dir = store.item_dir(&item.id);
        for &phase in &phases {
            let log_path = phase_log_path(&item_dir, phase);
            let log = EventLog::read_from_file(&log_path)?;
            if log.is_empty() {
                continue;
            }
            let errors = log
                .all_events()
                .iter()
                .filter(|e| matches!(e.event, wreckit_types::AgentEvent::Error { .. }))
                .count();
            total_events += log.len();
            total_errors += errors;
            println!(
                "{} {}: {} event(s), {} error(s)",
                item.id,
                phase.as_str(),
                log.len(),
                errors
            );
        }
    }

    println!();
    println!("total: {total_events} event(s), {total_errors} error(s) across {} item(s)", items.len());
    Ok(())
}
