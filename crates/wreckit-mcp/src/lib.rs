//! In-process MCP tool surface (§4.6).
//!
//! The plan/implement/complete phases inject this server into the agent
//! session. Tools never talk to the agent directly — every call arrives
//! as a [`ToolCall`] envelope and returns a [`ToolCallResult`], with the
//! tool-call id threading through both so the caller can correlate a
//! tool's effect back to the matching `tool_started`/`tool_result` pair
//! in the agent event stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use wreckit_statemachine::{Event as StateEvent, transition};
use wreckit_store::Store;
use wreckit_types::{Item, ItemId, ItemState, Prd, Story, StoryStatus};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),
    #[error("save_prd requires the item to be in 'planning', found '{0}'")]
    NotPlanning(String),
    #[error("unknown story id '{0}'")]
    UnknownStory(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("cannot complete: story '{0}' is not done")]
    StoryNotDone(String),
    #[error("invalid tool input: {0}")]
    InvalidInput(#[from] serde_json::Error),
    #[error(transparent)]
    Transition(#[from] wreckit_statemachine::TransitionError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub id: String,
    pub ok: bool,
    pub output: Value,
}

#[derive(Debug, Deserialize)]
struct SavePrdInput {
    problem_statement: String,
    goals: Vec<String>,
    non_goals: Vec<String>,
    stories: Vec<SavePrdStory>,
    open_questions: Vec<String>,
    references: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SavePrdStory {
    title: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateStoryStatusInput {
    story_id: String,
    status: StoryStatus,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteInput {
    summary: String,
}

#[derive(Debug, Deserialize)]
struct SaveParsedIdeasInput {
    items: Vec<ParsedIdea>,
}

#[derive(Debug, Deserialize)]
struct ParsedIdea {
    section: String,
    title: String,
    overview: String,
}

/// The tool server bound to a single repository's store. One instance is
/// built per phase run and handed to the agent dispatcher alongside the
/// active item's id.
pub struct McpServer {
    store: Store,
}

impl McpServer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn dispatch(&self, item_id: &ItemId, call: ToolCall) -> ToolCallResult {
        let result = match call.name.as_str() {
            "save_prd" => self.save_prd(item_id, call.input),
            "update_story_status" => self.update_story_status(item_id, call.input),
            "complete" => self.complete(item_id, call.input),
            "save_parsed_ideas" => self.save_parsed_ideas(call.input),
            other => Err(ToolError::UnknownTool(other.to_string())),
        };

        tracing::info!(tool_call_id = %call.id, tool = %call.name, ok = result.is_ok(), "mcp tool invoked");

        match result {
            Ok(output) => ToolCallResult {
                id: call.id,
                ok: true,
                output,
            },
            Err(err) => ToolCallResult {
                id: call.id,
                ok: false,
                output: serde_json::json!({ "error": err.to_string() }),
            },
        }
    }

    fn load_item(&self, item_id: &ItemId) -> Result<Item, ToolError> {
        self.store
            .load_item(item_id)?
            .ok_or_else(|| ToolError::ItemNotFound(item_id.clone()))
    }

    fn save_prd(&self, item_id: &ItemId, input: Value) -> Result<Value, ToolError> {
        let item = self.load_item(item_id)?;
        if item.state != ItemState::Planning {
            return Err(ToolError::NotPlanning(item.state.label()));
        }

        let input: SavePrdInput = serde_json::from_value(input)?;
        let stories = input
            .stories
            .into_iter()
            .enumerate()
            .map(|(idx, s)| Story {
                story_id: format!("story-{:02}", idx + 1),
                title: s.title,
                status: StoryStatus::Pending,
                acceptance_criteria: s.acceptance_criteria,
                notes: None,
            })
            .collect();

        let prd = Prd {
            schema_version: wreckit_types::item::PRD_SCHEMA_V1.to_string(),
            problem_statement: input.problem_statement,
            goals: input.goals,
            non_goals: input.non_goals,
            stories,
            open_questions: input.open_questions,
            references: input.references,
        };

        self.store.save_prd(item_id, &prd)?;
        Ok(serde_json::to_value(&prd)?)
    }

    fn update_story_status(&self, item_id: &ItemId, input: Value) -> Result<Value, ToolError> {
        let input: UpdateStoryStatusInput = serde_json::from_value(input)?;
        let mut prd = self
            .store
            .load_prd(item_id)?
            .ok_or_else(|| ToolError::ItemNotFound(item_id.clone()))?;

        let story = prd
            .stories
            .iter_mut()
            .find(|s| s.story_id == input.story_id)
            .ok_or_else(|| ToolError::UnknownStory(input.story_id.clone()))?;

        story.status = input.status;
        if input.notes.is_some() {
            story.notes = input.notes;
        }
        let story_status = story.status;

        self.store.save_prd(item_id, &prd)?;
        tracing::info!(story_id = %input.story_id, status = ?story_status, "story status updated");
        Ok(serde_json::to_value(&prd)?)
    }

    fn complete(&self, item_id: &ItemId, input: Value) -> Result<Value, ToolError> {
        let input: CompleteInput = serde_json::from_value(input)?;
        let mut item = self.load_item(item_id)?;
        let prd = self.store.load_prd(item_id)?;

        if let Some(prd) = &prd
            && let Some(unfinished) = prd.stories.iter().find(|s| s.status != StoryStatus::Done)
        {
            return Err(ToolError::StoryNotDone(unfinished.story_id.clone()));
        }

        item.state = transition(&item.state, StateEvent::CompleteAcknowledged)?;
        item.last_error = None;
        self.store.save_item(&item)?;

        if !input.summary.is_empty() {
            let summary_path = self.store.item_dir(item_id).join("completion_summary.md");
            std::fs::write(&summary_path, &input.summary)
                .map_err(|e| ToolError::Store(anyhow::anyhow!("failed to write completion summary: {e}")))?;
        }

        Ok(serde_json::json!({ "state": item.state.label() }))
    }

    fn save_parsed_ideas(&self, input: Value) -> Result<Value, ToolError> {
        let input: SaveParsedIdeasInput = serde_json::from_value(input)?;
        let mut created = Vec::new();
        for idea in input.items {
            let item = self.store.create_item(&idea.section, &idea.title, &idea.overview)?;
            created.push(item.id.as_str().to_string());
        }
        self.store.reindex()?;
        Ok(serde_json::json!({ "created": created }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_item(state: ItemState) -> (tempfile::TempDir, McpServer, ItemId) {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let id = ItemId::new("features", 1, "add-rate-limiter");
        let mut item = Item::new(id.clone(), "Add rate limiter".into(), "overview".into());
        item.state = state;
        store.save_item(&item).unwrap();
        (td, McpServer::new(store), id)
    }

    #[test]
    fn save_prd_requires_planning_state() {
        let (_td, server, id) = server_with_item(ItemState::Idea);
        let result = server.dispatch(
            &id,
            ToolCall {
                id: "t1".into(),
                name: "save_prd".into(),
                input: serde_json::json!({
                    "problem_statement": "x",
                    "goals": [],
                    "non_goals": [],
                    "stories": [],
                    "open_questions": [],
                    "references": []
                }),
            },
        );
        assert!(!result.ok);
    }

    #[test]
    fn save_prd_assigns_sequential_story_ids() {
        let (_td, server, id) = server_with_item(ItemState::Planning);
        let result = server.dispatch(
            &id,
            ToolCall {
                id: "t1".into(),
                name: "save_prd".into(),
                input: serde_json::json!({
                    "problem_statement": "users can't do X",
                    "goals": ["let them do X"],
                    "non_goals": [],
                    "stories": [{"title": "first"}, {"title": "second"}],
                    "open_questions": [],
                    "references": []
                }),
            },
        );
        assert!(result.ok);
        let prd: Prd = serde_json::from_value(result.output).unwrap();
        assert_eq!(prd.stories[0].story_id, "story-01");
        assert_eq!(prd.stories[1].story_id, "story-02");
    }

    #[test]
    fn update_story_status_rejects_unknown_story() {
        let (_td, server, id) = server_with_item(ItemState::Planning);
        server.dispatch(
            &id,
            ToolCall {
                id: "t1".into(),
                name: "save_prd".into(),
                input: serde_json::json!({
                    "problem_statement": "x", "goals": [], "non_goals": [],
                    "stories": [{"title": "first"}], "open_questions": [], "references": []
                }),
            },
        );
        let result = server.dispatch(
            &id,
            ToolCall {
                id: "t2".into(),
                name: "update_story_status".into(),
                input: serde_json::json!({"story_id": "story-99", "status": "done"}),
            },
        );
        assert!(!result.ok);
    }

    #[test]
    fn complete_fails_when_a_story_is_not_done() {
        let (_td, server, id) = server_with_item(ItemState::Planning);
        server.dispatch(
            &id,
            ToolCall {
                id: "t1".into(),
                name: "save_prd".into(),
                input: serde_json::json!({
                    "problem_statement": "x", "goals": [], "non_goals": [],
                    "stories": [{"title": "first"}], "open_questions": [], "references": []
                }),
            },
        );

        let mut item = server.store.load_item(&id).unwrap().unwrap();
        item.state = ItemState::Merged;
        server.store.save_item(&item).unwrap();

        let result = server.dispatch(
            &id,
            ToolCall {
                id: "t2".into(),
                name: "complete".into(),
                input: serde_json::json!({"summary": "done"}),
            },
        );
        assert!(!result.ok);
    }

    #[test]
    fn complete_persists_summary_as_an_artifact_and_clears_last_error() {
        let (_td, server, id) = server_with_item(ItemState::Merged);
        let mut item = server.store.load_item(&id).unwrap().unwrap();
        item.last_error = Some("implement failed: timeout".into());
        server.store.save_item(&item).unwrap();

        let result = server.dispatch(
            &id,
            ToolCall {
                id: "t1".into(),
                name: "complete".into(),
                input: serde_json::json!({"summary": "shipped the rate limiter"}),
            },
        );
        assert!(result.ok);

        let reloaded = server.store.load_item(&id).unwrap().unwrap();
        assert_eq!(reloaded.state, ItemState::Complete);
        assert_eq!(reloaded.last_error, None);

        let summary_path = server.store.item_dir(&id).join("completion_summary.md");
        let summary = std::fs::read_to_string(summary_path).unwrap();
        assert_eq!(summary, "shipped the rate limiter");
    }

    #[test]
    fn save_parsed_ideas_creates_items_in_bulk() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let server = McpServer::new(store);
        let result = server.dispatch(
            &ItemId::new("features", 1, "placeholder"),
            ToolCall {
                id: "t1".into(),
                name: "save_parsed_ideas".into(),
                input: serde_json::json!({
                    "items": [
                        {"section": "features", "title": "Add Rate Limiter!", "overview": "o1"},
                        {"section": "bugs", "title": "Fix crash", "overview": "o2"}
                    ]
                }),
            },
        );
        assert!(result.ok);
        let created = result.output["created"].as_array().unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0], "features/001-add-rate-limiter");
    }
}
