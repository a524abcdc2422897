//! Domain model and error taxonomy shared by every wreckit crate.
//!
//! ## Modules
//!
//! - [`item`] — `Item`, `Story`, `Prd`, ids and the durable on-disk record
//!   shapes that `wreckit-store` persists.
//! - [`agent`] — the agent backend configuration union and the event
//!   stream a running agent produces.
//! - [`config`] — the resolved runtime configuration a repo's
//!   `.wreckit/config.json` loads into.
//! - [`error`] — the error taxonomy (§7) with CLI exit-code mapping.
//! - [`duration`] — serde helpers accepting either a humantime string or a
//!   millisecond count, matching the teacher's duration fields.

pub mod agent;
pub mod config;
pub mod duration;
pub mod error;
pub mod item;

pub use agent::{AgentConfig, AgentErrorKind, AgentEvent, AgentOutcome, ToolStatus};
pub use config::{BranchCleanupPolicy, CritiquePolicy, MergeMode, ResolvedConfig, SandboxPolicy};
pub use error::WreckitError;
pub use item::{Item, ItemId, ItemState, ItemSummary, Phase, Prd, Story, StoryStatus};
