//! Worker lifecycle state machine.
//!
//! ```text
//! Parsed ──► Installing ──► Installed ──► Activating ──► Activated
//!                │                            │
//!                └────────► Redundant ◄───────┘
//! ```

use std::time::Instant;

use flashcache_common::{OfflineError, Result};
use serde::{Deserialize, Serialize};

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Precaching (install event).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Evicting old stores (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install or activation failed.
    Redundant,
}

impl WorkerState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installing, Redundant)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Activating, Redundant)
        )
    }
}

/// Tracks the current state and when it was entered.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: WorkerState,
    changed_at: Instant,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: WorkerState::Parsed,
            changed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn changed_at(&self) -> Instant {
        self.changed_at
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: WorkerState) -> Result<WorkerState> {
        if !self.state.can_transition_to(next) {
            return Err(OfflineError::state(format!(
                "cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        let previous = self.state;
        self.state = next;
        self.changed_at = Instant::now();
        Ok(previous)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
