//! The item lifecycle transition table and `next_phase` derivation (§4.2).
//!
//! There's no close teacher precedent for this module — the teacher drives
//! a single linear publish pipeline with no persisted per-entity state
//! machine. This is built fresh from the lifecycle described in §4.2,
//! keyed the same way the rest of the workspace keys transition tables:
//! `(from, event) -> to`, checked exhaustively rather than inferred.

use thiserror::Error;
use wreckit_types::{ItemState, Phase, Story, StoryStatus};

/// An input to the lifecycle. Distinct from [`wreckit_types::AgentEvent`],
/// which describes what happened *inside* one phase run; this describes
/// what happened *to the item* as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Begin running `phase`'s agent. Only valid for `research`, `plan`,
    /// `implement`, and `pr` — `complete` has no agent-driven "-ing" state
    /// of its own, see [`Event::CompleteAcknowledged`].
    StartPhase(Phase),
    /// The just-started phase's agent finished successfully.
    PhaseSucceeded,
    /// The just-started phase's agent failed; `origin` is implied from the
    /// current state.
    PhaseFailed,
    /// An operator or `wreckit research`/`plan`/`implement` retry resets a
    /// `failed` item back to its pre-failure predecessor state.
    UserReset,
    /// The critique loop rejected `plan`'s or `implement`'s output on its
    /// final round under an enforced critique policy (§9).
    CritiqueRejected,
    /// The configured forge reports the open PR merged.
    PrMerged,
    /// The operator (or an automated follow-up) acknowledges a merged
    /// item as fully closed out.
    CompleteAcknowledged,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} to an item in state {from}")]
pub struct TransitionError {
    pub from: String,
    pub event: String,
}

fn violation(from: &ItemState, event: &Event) -> TransitionError {
    TransitionError {
        from: from.label(),
        event: format!("{event:?}"),
    }
}

/// Apply `event` to `from`, returning the resulting state or an error
/// naming the rejected `(state, event)` pair.
pub fn transition(from: &ItemState, event: Event) -> Result<ItemState, TransitionError> {
    use ItemState::*;
    use Phase::*;

    let result = match (from, &event) {
        (Idea, Event::StartPhase(Research)) => Researching,
        (Researched, Event::StartPhase(Plan)) => Planning,
        (Planned, Event::StartPhase(Implement)) => Implementing,
        (Implemented, Event::StartPhase(Pr)) => InPr,

        (Researching, Event::PhaseSucceeded) => Researched,
        (Planning, Event::PhaseSucceeded) => Planned,
        (Implementing, Event::PhaseSucceeded) => Implemented,

        (Researching, Event::PhaseFailed) => Failed {
            origin: Box::new(Researching),
        },
        (Planning, Event::PhaseFailed) => Failed {
            origin: Box::new(Planning),
        },
        (Implementing, Event::PhaseFailed) => Failed {
            origin: Box::new(Implementing),
        },
        (InPr, Event::PhaseFailed) => Failed {
            origin: Box::new(InPr),
        },

        (Implemented, Event::CritiqueRejected) => Failed {
            origin: Box::new(Implementing),
        },
        (Planned, Event::CritiqueRejected) => Failed {
            origin: Box::new(Planning),
        },

        (Failed { origin }, Event::UserReset) => {
            ItemState::recovery_predecessor(origin).ok_or_else(|| violation(from, &event))?
        }

        (InPr, Event::PrMerged) => Merged,
        (Merged, Event::CompleteAcknowledged) => Complete,

        _ => return Err(violation(from, &event)),
    };

    Ok(result)
}

/// The phase `item` is ready to run next, or `None` if it's waiting on
/// something outside the agent loop (a PR merge, operator recovery from a
/// failure, or it's already `complete`).
///
/// `planned -> implement` requires at least one story (§4.2: "implement
/// has nothing to build from otherwise"); `implemented -> pr` requires
/// every story to be `done` or `blocked` (a PRD with stories still
/// `pending`/`in_progress` means implement didn't actually finish).
pub fn next_phase(state: &ItemState, stories: &[Story]) -> Option<Phase> {
    match state {
        ItemState::Idea => Some(Phase::Research),
        ItemState::Researched => Some(Phase::Plan),
        ItemState::Planned if !stories.is_empty() => Some(Phase::Implement),
        ItemState::Implemented if stories_are_settled(stories) => Some(Phase::Pr),
        _ => None,
    }
}

/// Why [`next_phase`] returned `None` despite the item looking otherwise
/// ready, for CLI error messages. `None` means there's genuinely nothing
/// blocking except the state itself (waiting on a human or external event).
pub fn blocked_reason(state: &ItemState, stories: &[Story]) -> Option<&'static str> {
    match state {
        ItemState::Planned if stories.is_empty() => {
            Some("plan produced no stories; implement has nothing to build")
        }
        ItemState::Implemented if !stories_are_settled(stories) => {
            Some("not all stories are done or blocked yet")
        }
        _ => None,
    }
}

fn stories_are_settled(stories: &[Story]) -> bool {
    stories
        .iter()
        .all(|s| matches!(s.status, StoryStatus::Done | StoryStatus::Blocked))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(status: StoryStatus) -> Story {
        Story {
            story_id: "s1".into(),
            title: "do a thing".into(),
            status,
            acceptance_criteria: vec![],
            notes: None,
        }
    }

    #[test]
    fn happy_path_runs_idea_through_merged() {
        let mut state = ItemState::Idea;
        state = transition(&state, Event::StartPhase(Phase::Research)).unwrap();
        assert_eq!(state, ItemState::Researching);
        state = transition(&state, Event::PhaseSucceeded).unwrap();
        assert_eq!(state, ItemState::Researched);
        state = transition(&state, Event::StartPhase(Phase::Plan)).unwrap();
        state = transition(&state, Event::PhaseSucceeded).unwrap();
        assert_eq!(state, ItemState::Planned);
        state = transition(&state, Event::StartPhase(Phase::Implement)).unwrap();
        state = transition(&state, Event::PhaseSucceeded).unwrap();
        assert_eq!(state, ItemState::Implemented);
        state = transition(&state, Event::StartPhase(Phase::Pr)).unwrap();
        assert_eq!(state, ItemState::InPr);
        state = transition(&state, Event::PrMerged).unwrap();
        assert_eq!(state, ItemState::Merged);
        state = transition(&state, Event::CompleteAcknowledged).unwrap();
        assert_eq!(state, ItemState::Complete);
    }

    #[test]
    fn phase_failed_forks_to_failed_with_origin() {
        let state = transition(&ItemState::Implementing, Event::PhaseFailed).unwrap();
        assert_eq!(
            state,
            ItemState::Failed {
                origin: Box::new(ItemState::Implementing)
            }
        );
    }

    #[test]
    fn user_reset_returns_to_predecessor() {
        let failed = ItemState::Failed {
            origin: Box::new(ItemState::Planning),
        };
        let recovered = transition(&failed, Event::UserReset).unwrap();
        assert_eq!(recovered, ItemState::Researched);
    }

    #[test]
    fn user_reset_without_recoverable_origin_is_rejected() {
        let failed = ItemState::Failed {
            origin: Box::new(ItemState::Complete),
        };
        assert!(transition(&failed, Event::UserReset).is_err());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let err = transition(&ItemState::Idea, Event::PhaseSucceeded).unwrap_err();
        assert!(err.to_string().contains("idea"));
    }

    #[test]
    fn critique_rejected_on_final_round_fails_back_to_implementing_origin() {
        let state = transition(&ItemState::Implemented, Event::CritiqueRejected).unwrap();
        assert_eq!(
            state,
            ItemState::Failed {
                origin: Box::new(ItemState::Implementing)
            }
        );
    }

    #[test]
    fn critique_rejected_on_plan_fails_back_to_planning_origin() {
        let state = transition(&ItemState::Planned, Event::CritiqueRejected).unwrap();
        assert_eq!(
            state,
            ItemState::Failed {
                origin: Box::new(ItemState::Planning)
            }
        );
    }

    #[test]
    fn next_phase_blocks_implement_without_stories() {
        assert_eq!(next_phase(&ItemState::Planned, &[]), None);
        assert_eq!(
            blocked_reason(&ItemState::Planned, &[]),
            Some("plan produced no stories; implement has nothing to build")
        );
    }

    #[test]
    fn next_phase_allows_implement_once_a_story_exists() {
        let stories = vec![story(StoryStatus::Pending)];
        assert_eq!(next_phase(&ItemState::Planned, &stories), Some(Phase::Implement));
    }

    #[test]
    fn next_phase_blocks_pr_until_all_stories_settled() {
        let stories = vec![story(StoryStatus::Done), story(StoryStatus::InProgress)];
        assert_eq!(next_phase(&ItemState::Implemented, &stories), None);

        let settled = vec![story(StoryStatus::Done), story(StoryStatus::Blocked)];
        assert_eq!(
            next_phase(&ItemState::Implemented, &settled),
            Some(Phase::Pr)
        );
    }

    #[test]
    fn next_phase_is_none_while_waiting_on_external_merge() {
        assert_eq!(next_phase(&ItemState::InPr, &[]), None);
        assert_eq!(next_phase(&ItemState::Merged, &[]), None);
        assert_eq!(next_phase(&ItemState::Complete, &[]), None);
    }
}
