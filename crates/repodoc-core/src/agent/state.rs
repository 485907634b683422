//! Orchestrator states and their legal transitions.

use serde::{Deserialize, Serialize};

/// State of a documentation run.
///
/// ```text
/// Init → Planning → ToolDispatch → Observing → Planning … → Completing → Done
///           │                                      ▲
///           └──────── malformed reply ─────────────┘
/// any non-terminal state → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Init,
    Planning,
    ToolDispatch,
    Observing,
    Completing,
    Done,
    Failed,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the orchestrator may move from `self` to `next`.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Init, Planning) => true,
            (Planning, ToolDispatch | Observing | Completing) => true,
            (ToolDispatch, Observing) => true,
            (Observing, Planning) => true,
            (Completing, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::ToolDispatch => "tool_dispatch",
            Self::Observing => "observing",
            Self::Completing => "completing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::AgentState::*;
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Init, Planning, ToolDispatch, Observing, Planning, Completing, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_reachable_from_every_live_state() {
        for state in [Init, Planning, ToolDispatch, Observing, Completing] {
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for next in [Init, Planning, Done, Failed] {
            assert!(!Done.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
        assert!(Done.is_terminal());
        assert!(!Observing.is_terminal());
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!Init.can_transition_to(ToolDispatch));
        assert!(!ToolDispatch.can_transition_to(Planning));
        assert!(!Observing.can_transition_to(Completing));
        assert!(!Planning.can_transition_to(Done));
    }
}
