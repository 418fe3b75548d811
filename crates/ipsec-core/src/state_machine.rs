//! Scenario lifecycle state machine
//!
//! `Idle -> ModeRequested -> Converging -> ModeConverged -> [CertProvisioned -> PolicyApplied]
//! -> Verified -> TearingDown -> Idle`. Any active state may jump to `TearingDown`.

use crate::error::RolloutError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenarioState {
    Idle,
    ModeRequested,
    Converging,
    ModeConverged,
    CertProvisioned,
    PolicyApplied,
    Verified,
    TearingDown,
}

impl ScenarioState {
    pub const ALL: [ScenarioState; 8] = [
        Self::Idle,
        Self::ModeRequested,
        Self::Converging,
        Self::ModeConverged,
        Self::CertProvisioned,
        Self::PolicyApplied,
        Self::Verified,
        Self::TearingDown,
    ];
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Validates a state transition.
pub fn validate_transition(from: ScenarioState, to: ScenarioState) -> Result<(), RolloutError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(RolloutError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: ScenarioState) -> Vec<ScenarioState> {
    use ScenarioState::*;
    match from {
        Idle => vec![ModeRequested],
        ModeRequested => vec![Converging, TearingDown],
        Converging => vec![ModeConverged, TearingDown],
        ModeConverged => vec![CertProvisioned, Verified, TearingDown],
        CertProvisioned => vec![PolicyApplied, TearingDown],
        PolicyApplied => vec![Verified, TearingDown],
        Verified => vec![TearingDown],
        TearingDown => vec![Idle],
    }
}

fn allowed(from: ScenarioState, to: ScenarioState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

/// Current state plus every state visited so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioTracker {
    current: ScenarioState,
    history: Vec<ScenarioState>,
}

impl ScenarioTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ScenarioState::Idle,
            history: vec![ScenarioState::Idle],
        }
    }

    #[inline]
    #[must_use]
    pub fn current(&self) -> ScenarioState {
        self.current
    }

    #[inline]
    #[must_use]
    pub fn history(&self) -> &[ScenarioState] {
        &self.history
    }

    /// Whether the tracker has left `Idle` and not returned yet
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current != ScenarioState::Idle
    }

    /// Move to `to` if the table allows it
    pub fn advance(&mut self, to: ScenarioState) -> Result<(), RolloutError> {
        validate_transition(self.current, to)?;
        tracing::info!(from = %self.current, to = %to, "scenario state transition");
        self.current = to;
        self.history.push(to);
        Ok(())
    }

    pub fn into_history(self) -> Vec<ScenarioState> {
        self.history
    }
}

impl Default for ScenarioTracker {
    fn default() -> Self {
        Self::new()
    }
}
