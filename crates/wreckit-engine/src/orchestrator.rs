//! The worker pool and run-selection policy (§4.8, §5).
//!
//! wreckit runs every agent against one shared working tree
//! ([`wreckit_lock::WorkingTreeSlot`]), so "parallel" here means multiple
//! items queued and dispatched by N worker threads, not N agents touching
//! the filesystem at once — the slot itself still serializes the part
//! that matters. Grounded on the teacher's chunked `thread::spawn` +
//! `JoinHandle` batch loop, adapted from one-shot chunk-and-join into a
//! persistent pool that keeps pulling from a shared queue until it's
//! empty or the run is interrupted.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use wreckit_types::error::WreckitError;
use wreckit_types::item::{Item, ItemId, Phase};

use crate::phase::PhaseRunner;
use crate::webhook::{WebhookEvent, WebhookNotifier, send_notification};

/// Progress sink for a run, mirroring the teacher's `info`/`warn`/`error`
/// trio so the CLI can print exactly what the orchestrator reports
/// without re-deriving messages from raw outcomes.
pub trait Reporter: Send {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Draining,
    Terminated,
}

/// One item's outcome from a `run_all`/`run_item` pass.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub id: ItemId,
    pub phase: Phase,
    pub result: Result<Item, String>,
}

/// Cooperative interrupt switch shared between the orchestrator and
/// whatever installs a signal handler around it. Workers only observe
/// this between items, not mid-phase — an in-flight agent invocation
/// always finishes or times out on its own terms (§5: "interrupt
/// complete|draining").
#[derive(Clone)]
pub struct InterruptSwitch {
    inner: Arc<(Mutex<RunState>, Condvar)>,
}

impl Default for InterruptSwitch {
    fn default() -> Self {
        Self {
            inner: Arc::new((Mutex::new(RunState::Running), Condvar::new())),
        }
    }
}

impl InterruptSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop claiming new work; let whatever's in flight finish.
    pub fn drain(&self) {
        let (mutex, condvar) = &*self.inner;
        *mutex.lock().expect("interrupt switch poisoned") = RunState::Draining;
        condvar.notify_all();
    }

    /// Stop claiming new work immediately, same observable effect as
    /// `drain` from a worker's perspective — wreckit has no mechanism to
    /// preempt an agent subprocess mid-call other than its own timeout.
    pub fn terminate(&self) {
        let (mutex, condvar) = &*self.inner;
        *mutex.lock().expect("interrupt switch poisoned") = RunState::Terminated;
        condvar.notify_all();
    }

    fn should_claim_more(&self) -> bool {
        let (mutex, _) = &*self.inner;
        *mutex.lock().expect("interrupt switch poisoned") == RunState::Running
    }
}

/// Composes a [`PhaseRunner`] with a worker count and the run-selection
/// policy into `run_item`/`run_all`.
pub struct Orchestrator {
    pub runner: PhaseRunner,
    pub worker_count: u32,
}

impl Orchestrator {
    pub fn new(runner: PhaseRunner) -> Self {
        let worker_count = runner.config.worker_count.unwrap_or(1).max(1);
        Self { runner, worker_count }
    }

    /// Builds a notifier from the resolved config if a webhook URL is
    /// configured, reading the secret out of the named env var rather
    /// than trusting anything stored in `config.json` (§6).
    fn webhook_notifier(&self) -> Option<WebhookNotifier> {
        let url = self.runner.config.webhook_url.clone()?;
        let secret = self
            .runner
            .config
            .webhook_secret_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        Some(WebhookNotifier::new(url, secret))
    }

    fn notify(&self, event: WebhookEvent) {
        let Some(notifier) = self.webhook_notifier() else { return };
        if let Err(e) = send_notification(&notifier, &event) {
            tracing::warn!(error = %e, "webhook delivery failed");
        }
    }

    fn dispatch_phase(&self, id: &ItemId, phase: Phase) -> Result<Item, WreckitError> {
        let outcome = match phase {
            Phase::Research => self.runner.run_research(id),
            Phase::Plan => self.runner.run_plan(id),
            Phase::Implement => self.runner.run_implement(id),
            Phase::Pr => self.runner.run_pr(id),
            Phase::Complete => self.runner.run_complete(id),
        };
        match outcome {
            Ok(report) => {
                self.notify(WebhookEvent::PhaseSucceeded { item: id.clone(), phase });
                Ok(report.item)
            }
            Err(e) => {
                self.notify(WebhookEvent::PhaseFailed {
                    item: id.clone(),
                    phase,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Runs the single phase `next_phase` would pick for `id` right now,
    /// or every phase in `phases` in order if the caller names them
    /// explicitly (`wreckit run <id> --phase implement`, or `wreckit
    /// research`/`plan`/... directly).
    pub fn run_item(
        &self,
        id: &ItemId,
        phases: Option<&[Phase]>,
        reporter: &mut dyn Reporter,
    ) -> Result<Item, WreckitError> {
        let Some(explicit) = phases else {
            let item = self
                .runner
                .store
                .load_item(id)
                .map_err(|e| WreckitError::Artifact(e.to_string()))?
                .ok_or_else(|| WreckitError::ItemNotFound(id.clone()))?;
            let stories = self.runner.store.load_prd(id).ok().flatten().map(|p| p.stories).unwrap_or_default();
            let phase = wreckit_statemachine::next_phase(&item.state, &stories).ok_or_else(|| {
                let reason = wreckit_statemachine::blocked_reason(&item.state, &stories)
                    .unwrap_or("nothing is runnable from the current state");
                WreckitError::StateViolation {
                    id: id.clone(),
                    from: item.state.label(),
                    event: reason.to_string(),
                }
            })?;
            reporter.info(&format!("{id}: running {}", phase.as_str()));
            return self.dispatch_phase(id, phase);
        };

        let mut last = None;
        for &phase in explicit {
            reporter.info(&format!("{id}: running {}", phase.as_str()));
            match self.dispatch_phase(id, phase) {
                Ok(item) => last = Some(item),
                Err(e) => {
                    reporter.error(&format!("{id}: {phase:?} failed: {e}"));
                    return Err(e);
                }
            }
        }
        last.ok_or_else(|| WreckitError::Usage("no phases given to run_item".into()))
    }

    /// Scans every item and returns the ones currently runnable, paired
    /// with the phase `next_phase` would pick for them. Ordering: section
    /// name, then item id lexicographically — deterministic, so two scans
    /// over an unchanged store pick items in the same order (§4.8).
    fn scan_runnable(&self) -> Result<Vec<(ItemId, Phase)>, WreckitError> {
        let items = self
            .runner
            .store
            .scan_items()
            .map_err(|e| WreckitError::Artifact(e.to_string()))?;
        let mut runnable: Vec<(ItemId, Phase)> = Vec::new();
        for item in &items {
            let stories = self.runner.store.load_prd(&item.id).ok().flatten().map(|p| p.stories).unwrap_or_default();
            if let Some(phase) = wreckit_statemachine::next_phase(&item.state, &stories) {
                runnable.push((item.id.clone(), phase));
            }
        }
        runnable.sort_by(|a, b| a.0.section().cmp(b.0.section()).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        Ok(runnable)
    }

    /// Repeatedly selects every currently-runnable item, drains that wave
    /// with `worker_count` threads, then re-scans: an item that reaches a
    /// new runnable phase (e.g. `idea` -> `researched` -> `planned`) keeps
    /// advancing in the same call instead of stopping after one phase
    /// (§4.8). Stops once a scan finds nothing runnable, or a wave makes
    /// no progress at all (every item in it errored).
    pub fn run_all(
        &self,
        interrupt: &InterruptSwitch,
        reporter: Arc<Mutex<dyn Reporter>>,
    ) -> Result<Vec<RunOutcome>, WreckitError> {
        let mut all_outcomes: Vec<RunOutcome> = Vec::new();

        loop {
            if !interrupt.should_claim_more() {
                break;
            }

            let runnable = self.scan_runnable()?;
            if runnable.is_empty() {
                break;
            }

            let queue = Arc::new(Mutex::new(VecDeque::from(runnable)));
            let wave_outcomes = Arc::new(Mutex::new(Vec::new()));
            let worker_count = self.worker_count.min(queue.lock().expect("queue poisoned").len().max(1) as u32);

            let mut handles = Vec::new();
            for _ in 0..worker_count {
                let queue = queue.clone();
                let wave_outcomes = wave_outcomes.clone();
                let interrupt = interrupt.clone();
                let runner = self.runner.clone();
                let reporter = reporter.clone();

                handles.push(thread::spawn(move || {
                    loop {
                        if !interrupt.should_claim_more() {
                            break;
                        }
                        let next = {
                            let mut q = queue.lock().expect("queue poisoned");
                            q.pop_front()
                        };
                        let Some((id, phase)) = next else { break };

                        {
                            let mut rep = reporter.lock().expect("reporter poisoned");
                            rep.info(&format!("{id}: starting {}", phase.as_str()));
                        }

                        let result = match phase {
                            Phase::Research => runner.run_research(&id).map(|r| r.item),
                            Phase::Plan => runner.run_plan(&id).map(|r| r.item),
                            Phase::Implement => runner.run_implement(&id).map(|r| r.item),
                            Phase::Pr => runner.run_pr(&id).map(|r| r.item),
                            Phase::Complete => runner.run_complete(&id).map(|r| r.item),
                        };

                        {
                            let mut rep = reporter.lock().expect("reporter poisoned");
                            match &result {
                                Ok(_) => rep.info(&format!("{id}: {} finished", phase.as_str())),
                                Err(e) => rep.warn(&format!("{id}: {} failed: {e}", phase.as_str())),
                            }
                        }

                        wave_outcomes.lock().expect("outcomes poisoned").push(RunOutcome {
                            id,
                            phase,
                            result: result.map_err(|e| e.to_string()),
                        });
                    }
                }));
            }

            for handle in handles {
                handle.join().expect("worker thread panicked");
            }

            let wave_outcomes = Arc::try_unwrap(wave_outcomes)
                .map(|m| m.into_inner().expect("outcomes poisoned"))
                .unwrap_or_else(|arc| arc.lock().expect("outcomes poisoned").clone());

            if wave_outcomes.is_empty() {
                break;
            }
            all_outcomes.extend(wave_outcomes);
        }

        let failed = all_outcomes.iter().filter(|o| o.result.is_err()).count();
        self.notify(WebhookEvent::RunCompleted {
            succeeded: all_outcomes.len() - failed,
            failed,
        });

        Ok(all_outcomes)
    }
}
