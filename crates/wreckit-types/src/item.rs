//! Item, Story, PRD and the per-item state machine's vocabulary (§3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `section/NNN-kebab-slug`, unique within its section.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(section: &str, seq: u32, slug: &str) -> Self {
        Self(format!("{section}/{seq:03}-{slug}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The section bucket this item belongs to (the path segment before `/`).
    pub fn section(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// The item normalized for use as a git branch component: slashes kept,
    /// since `branch_prefix + id` is itself the full branch name (§3).
    pub fn normalized_for_branch(&self) -> String {
        self.0.replace('/', "-")
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the five agent-driven steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Plan,
    Implement,
    Pr,
    Complete,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Pr => "pr",
            Phase::Complete => "complete",
        }
    }
}

/// The item lifecycle (§4.2). `-ing` states are transient: a phase runner
/// holds the item there only while that phase is actually executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemState {
    Idea,
    Researching,
    Researched,
    Planning,
    Planned,
    Implementing,
    Implemented,
    InPr,
    Merged,
    Complete,
    /// Error fork from an `-ing` state; `origin` names the state the
    /// failure occurred in, so recovery can be computed deterministically.
    Failed { origin: Box<ItemState> },
}

impl ItemState {
    /// True for `researching`/`planning`/`implementing`/`in_pr`, the
    /// states a phase runner may fail out of.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ItemState::Researching
                | ItemState::Planning
                | ItemState::Implementing
                | ItemState::InPr
        )
    }

    /// The `-ed`/`idea` predecessor recovery returns to for a given
    /// `-ing` origin (§4.2: "recovery returns to the matching `-ed`
    /// predecessor, or `idea` for research").
    pub fn recovery_predecessor(origin: &ItemState) -> Option<ItemState> {
        match origin {
            ItemState::Researching => Some(ItemState::Idea),
            ItemState::Planning => Some(ItemState::Researched),
            ItemState::Implementing => Some(ItemState::Planned),
            ItemState::InPr => Some(ItemState::Implemented),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            ItemState::Failed { origin } => format!("failed:{}", origin.label()),
            other => serde_json::to_value(other)
                .ok()
                .and_then(|v| v.get("kind").and_then(|k| k.as_str().map(str::to_string)))
                .unwrap_or_else(|| format!("{other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub overview: String,
    pub state: ItemState,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    /// Rounds of critique a phase's output has been through this pass
    /// (§4.4); reset to 0 each time a phase starts, incremented on every
    /// rejection that leads to another attempt.
    #[serde(default)]
    pub critique_rounds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every config-legacy-free save; lets `wreckit-store`
    /// migrate older records forward without guessing shape from content.
    #[serde(default = "current_item_schema_version")]
    pub schema_version: String,
}

pub const ITEM_SCHEMA_V1: &str = "wreckit.item.v1";

fn current_item_schema_version() -> String {
    ITEM_SCHEMA_V1.to_string()
}

impl Item {
    pub fn new(id: ItemId, title: String, overview: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            overview,
            state: ItemState::Idea,
            branch: None,
            pr_url: None,
            pr_number: None,
            last_error: None,
            retry_count: 0,
            critique_rounds: 0,
            created_at: now,
            updated_at: now,
            schema_version: ITEM_SCHEMA_V1.to_string(),
        }
    }
}

/// Index entry: summary fields only, fast to scan (§3 "Index").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: ItemId,
    pub title: String,
    pub state: ItemState,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub section: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&Item> for ItemSummary {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            state: item.state.clone(),
            branch: item.branch.clone(),
            pr_url: item.pr_url.clone(),
            section: item.id.section().to_string(),
            updated_at: item.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub story_id: String,
    pub title: String,
    pub status: StoryStatus,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub const PRD_SCHEMA_V1: &str = "wreckit.prd.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prd {
    #[serde(default = "current_prd_schema_version")]
    pub schema_version: String,
    pub problem_statement: String,
    pub goals: Vec<String>,
    pub non_goals: Vec<String>,
    pub stories: Vec<Story>,
    pub open_questions: Vec<String>,
    pub references: Vec<String>,
}

fn current_prd_schema_version() -> String {
    PRD_SCHEMA_V1.to_string()
}
