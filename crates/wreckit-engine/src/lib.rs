//! Composes the rest of the workspace into the two operations the CLI
//! drives: running a single item's next phase, and running every
//! runnable item across the store with a worker pool (§4.4, §4.8).

pub mod doctor;
pub mod ideas;
pub mod orchestrator;
pub mod phase;
pub mod webhook;

pub use doctor::{DoctorReport, doctor_report, fix_index_drift};
pub use ideas::run_ideas_ingest;
pub use orchestrator::{InterruptSwitch, NullReporter, Orchestrator, Reporter, RunOutcome};
pub use phase::{PhaseReport, PhaseRunner};
pub use webhook::{send_notification, WebhookEvent, WebhookNotifier};
