use serde::Serialize;

use crate::error::GuardError;
use crate::history::TerminalState;
use crate::settings::GuardSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Proposed,
    Validating,
    Rejected,
    Executing,
    Validated,
    Accepted,
    Retrying,
    Exhausted,
    Aborted,
}

impl RetryState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use RetryState::{
            Aborted, Accepted, Executing, Exhausted, Proposed, Rejected, Retrying, Validated,
            Validating,
        };

        matches!(
            (self, next),
            (Proposed, Validating)
                | (Validating, Rejected)
                | (Validating, Executing)
                | (Executing, Validated)
                | (Executing, Aborted)
                | (Validated, Accepted)
                | (Validated, Retrying)
                | (Validated, Exhausted)
                | (Retrying, Validating)
        )
    }

    pub fn is_terminal(self) -> bool {
        self.terminal_state().is_some()
    }

    pub fn terminal_state(self) -> Option<TerminalState> {
        match self {
            Self::Rejected => Some(TerminalState::Rejected),
            Self::Accepted => Some(TerminalState::Accepted),
            Self::Exhausted => Some(TerminalState::Exhausted),
            Self::Aborted => Some(TerminalState::Aborted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Validating => "validating",
            Self::Rejected => "rejected",
            Self::Executing => "executing",
            Self::Validated => "validated",
            Self::Accepted => "accepted",
            Self::Retrying => "retrying",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptDecision {
    pub accepted: bool,
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    Start,
    PreValidated { is_valid: bool },
    Executed,
    ExecutionFailed,
    Scored(AttemptDecision),
    Readjusted,
}

impl RetryEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PreValidated { .. } => "pre_validated",
            Self::Executed => "executed",
            Self::ExecutionFailed => "execution_failed",
            Self::Scored(_) => "scored",
            Self::Readjusted => "readjusted",
        }
    }
}

/// Pure transition function of the per-proposal state machine.
pub fn transition(state: RetryState, event: RetryEvent) -> Result<RetryState, GuardError> {
    let next = match (state, event) {
        (RetryState::Proposed, RetryEvent::Start) => RetryState::Validating,
        (RetryState::Validating, RetryEvent::PreValidated { is_valid: false }) => {
            RetryState::Rejected
        }
        (RetryState::Validating, RetryEvent::PreValidated { is_valid: true }) => {
            RetryState::Executing
        }
        (RetryState::Executing, RetryEvent::Executed) => RetryState::Validated,
        (RetryState::Executing, RetryEvent::ExecutionFailed) => RetryState::Aborted,
        (RetryState::Validated, RetryEvent::Scored(decision)) => {
            if decision.accepted {
                RetryState::Accepted
            } else if decision.attempts < decision.max_attempts {
                RetryState::Retrying
            } else {
                RetryState::Exhausted
            }
        }
        (RetryState::Retrying, RetryEvent::Readjusted) => RetryState::Validating,
        _ => {
            return Err(GuardError::InvalidTransition {
                from: state.as_str().to_string(),
                event: event.as_str().to_string(),
            })
        }
    };
    debug_assert!(state.can_transition_to(next));
    Ok(next)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub acceptance_threshold: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &GuardSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            acceptance_threshold: settings.acceptance_threshold,
        }
    }

    pub fn accepts(&self, confidence: f64, result_success: bool) -> bool {
        result_success && confidence >= self.acceptance_threshold
    }

    pub fn decide(&self, confidence: f64, result_success: bool, attempts: u32) -> AttemptDecision {
        AttemptDecision {
            accepted: self.accepts(confidence, result_success),
            attempts,
            max_attempts: self.max_attempts,
        }
    }
}
