//! Append-only JSONL event log for a single item/phase run (§3 "Run log",
//! §4.4). Each phase run writes its own `logs/<phase>.log` under the item's
//! directory; the file is append-only so a crash mid-run leaves a valid
//! prefix behind rather than a truncated or corrupt record.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wreckit_types::{AgentEvent, Phase};

/// A single JSONL line: a timestamped, phase-attributed agent event plus an
/// optional attempt counter for retried phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub attempt: u32,
    pub event: AgentEvent,
}

pub fn phase_log_path(item_dir: &Path, phase: Phase) -> PathBuf {
    item_dir.join("logs").join(format!("{}.log", phase.as_str()))
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<LoggedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, phase: Phase, attempt: u32, event: AgentEvent) {
        self.events.push(LoggedEvent {
            timestamp: Utc::now(),
            phase,
            attempt,
            event,
        });
    }

    /// Append all buffered events to `path`, creating parent directories
    /// (`logs/`) as needed. Existing content is preserved.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush event log")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read line from {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: LoggedEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_attempt(&self, attempt: u32) -> Vec<&LoggedEvent> {
        self.events.iter().filter(|e| e.attempt == attempt).collect()
    }

    pub fn all_events(&self) -> &[LoggedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
