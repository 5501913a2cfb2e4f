use serde::Serialize;
use strum::AsRefStr;

/// Lifecycle of one pipeline run.
///
/// `NotStarted -> Planning -> Dispatched -> Aggregating -> Completed`, with
/// `Failed` reachable from every non-terminal state. An empty plan completes
/// straight from `Planning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Planning,
    Dispatched,
    Aggregating,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;

        match (self, next) {
            (NotStarted, Planning)
            | (Planning, Dispatched)
            | (Dispatched, Aggregating)
            | (Aggregating, Completed)
            | (Planning, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}
