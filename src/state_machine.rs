//! Reactive text state machine: Idle → StaggeredWait → Attempting → Resolved/Failed.
//! Any state returns to Idle when the bound text or language changes.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TextState {
    /// Showing source text; nothing scheduled.
    Idle,
    /// Waiting out the stagger delay before the first attempt.
    StaggeredWait,
    /// A scheduler request is outstanding.
    Attempting,
    /// Showing the translation.
    Resolved,
    /// Attempts exhausted; showing source text until text or language changes.
    Failed,
}

impl std::fmt::Display for TextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextState::Idle => write!(f, "Idle"),
            TextState::StaggeredWait => write!(f, "StaggeredWait"),
            TextState::Attempting => write!(f, "Attempting"),
            TextState::Resolved => write!(f, "Resolved"),
            TextState::Failed => write!(f, "Failed"),
        }
    }
}

impl TextState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: TextState) -> bool {
        matches!(
            (self, next),
            (TextState::Idle, TextState::StaggeredWait)
                | (TextState::StaggeredWait, TextState::Attempting)
                | (TextState::Attempting, TextState::Attempting) // next attempt
                | (TextState::Attempting, TextState::Resolved)
                | (TextState::Attempting, TextState::Failed)
                | (_, TextState::Idle)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TextState,
    pub to: TextState,
}

/// Thread-safe state holder with a watch channel for subscribers.
pub struct TextStateMachine {
    state: RwLock<TextState>,
    state_tx: watch::Sender<TextState>,
}

impl Default for TextStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TextStateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(TextState::Idle);
        Self {
            state: RwLock::new(TextState::Idle),
            state_tx,
        }
    }

    pub fn current(&self) -> TextState {
        *self.state.read()
    }

    /// Attempt a transition. Returns the new state or the rejected pair.
    pub fn transition(&self, next: TextState) -> Result<TextState, InvalidTransition> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            let err = InvalidTransition { from: current, to: next };
            warn!("{}", err);
            return Err(err);
        }
        *state = next;
        self.state_tx.send_replace(next);
        debug!(from = %current, to = %next, "text_state_transition");
        Ok(next)
    }

    /// Back to Idle from any state (text or language changed).
    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = TextState::Idle;
        self.state_tx.send_replace(TextState::Idle);
    }

    pub fn subscribe(&self) -> watch::Receiver<TextState> {
        self.state_tx.subscribe()
    }
}
