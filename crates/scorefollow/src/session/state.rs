//! Session lifecycle states.

use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Running,
    Stopping,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Closed)
                | (Stopping, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Closed => "closed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Current status plus every state visited.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    history: Vec<SessionStatus>,
    started: Instant,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            history: vec![SessionStatus::Initializing],
            started: Instant::now(),
        }
    }

    /// Time since the session was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn current(&self) -> SessionStatus {
        self.history
            .last()
            .copied()
            .unwrap_or(SessionStatus::Initializing)
    }

    pub fn advance(&mut self, next: SessionStatus) -> Result<(), InvalidTransition> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        tracing::debug!(session.status = %next, "session {} -> {}", from, next);
        self.history.push(next);
        Ok(())
    }

    pub fn history(&self) -> &[SessionStatus] {
        &self.history
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
