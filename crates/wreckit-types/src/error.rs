//! The error taxonomy (§7) and its mapping onto CLI exit codes.

use thiserror::Error;

use crate::agent::AgentErrorKind;
use crate::item::ItemId;

#[derive(Debug, Error)]
pub enum WreckitError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("invalid state transition for {id}: cannot apply {event} from {from}")]
    StateViolation {
        id: ItemId,
        from: String,
        event: String,
    },

    #[error("agent error ({kind:?}) running {item} / {phase}: {message}")]
    Agent {
        item: ItemId,
        phase: String,
        kind: AgentErrorKind,
        message: String,
    },

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("working tree has uncommitted changes outside wreckit's control")]
    WorkingTreeDirty,

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("the configured PR tool ('{0}') was not found on PATH")]
    PrToolMissing(String),

    #[error("direct merge is not allowed by policy for this repository")]
    DirectMergeNotAllowed,

    #[error("git command failed (exit {code:?}): {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },
}

impl WreckitError {
    /// Process exit code, per §7's documented contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            WreckitError::Usage(_) => 2,
            WreckitError::ItemNotFound(_) => 3,
            WreckitError::StateViolation { .. } => 4,
            WreckitError::Agent { .. } => 5,
            WreckitError::Git(_) => 6,
            WreckitError::Artifact(_) => 1,
            WreckitError::Config(_) => 1,
            WreckitError::Interrupted => 7,
            WreckitError::Io(_) | WreckitError::Json(_) => 1,
        }
    }
}
