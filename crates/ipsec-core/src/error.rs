//! Error types for the rollout engine
//!
//! Two layers:
//! - `ClusterError` is what a backend reports for a single API call or remote command
//! - `RolloutError` is what the engine reports for a probe, trial or scenario

use crate::types::{EncapSignature, TrialSide};

/// Errors reported by cluster backends
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Control plane dropped the connection (component restarting mid-rollout)
    #[error("transient control-plane error: {0}")]
    Transient(String),

    /// Optimistic-concurrency version mismatch
    #[error("conflict: {0}")]
    Conflict(String),

    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote command exited non-zero
    #[error("command exited with status {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// Any other API failure
    #[error("api error: {0}")]
    Api(String),

    /// Response could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Local IO failure (reading files or exec streams)
    #[error("io error: {0}")]
    Io(String),
}

impl ClusterError {
    /// Connection-reset class, swallowed by the readiness poller
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Version mismatch on write
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Object lookup returned nothing
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// One failed side of a traffic trial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideFailure {
    /// Which task failed
    pub side: TrialSide,
    /// Rendered cause
    pub cause: String,
}

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    /// Backend call failed
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Mode string on the cluster record is not recognised
    #[error("invalid ipsec mode: '{0}'")]
    InvalidMode(String),

    /// Conflicting writers kept winning
    #[error("mode update still conflicting after {attempts} attempts")]
    ConflictBudgetExhausted { attempts: u32 },

    /// Probe did not become true inside the deadline
    #[error("{probe} did not converge within {waited_secs}s")]
    ConvergenceTimeout { probe: String, waited_secs: u64 },

    /// Traffic was not observed as expected
    #[error("failed to detect {signature} traffic: {}", render_failures(.failures))]
    TrialFailure {
        signature: EncapSignature,
        failures: Vec<SideFailure>,
    },

    /// Negative control observed the signature that must be absent
    #[error("{signature} traffic observed by {} but it must be absent", render_sides(.sides))]
    UnexpectedSignature {
        signature: EncapSignature,
        sides: Vec<TrialSide>,
    },

    /// A prerequisite is no longer valid (expired certificates)
    #[error("expired prerequisite: {0}")]
    ExpiredPrerequisite(String),

    /// Scenario state machine rejected a transition
    #[error("illegal scenario transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: crate::state_machine::ScenarioState,
        to: crate::state_machine::ScenarioState,
    },

    /// Node policies were not rendered in time
    #[error("node policy {0} not configured")]
    PolicyNotConfigured(String),

    /// Trial pair could not be assembled
    #[error("trial setup failed: {0}")]
    Setup(String),

    /// Teardown left the cluster dirty
    #[error("teardown failed: {}", .0.join("; "))]
    Teardown(Vec<String>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl RolloutError {
    /// Connection-reset class, swallowed inside polling
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_transient())
    }

    /// Whether a caller may safely run the operation again
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Cluster(ClusterError::Transient(_) | ClusterError::Conflict(_))
                | Self::ConflictBudgetExhausted { .. }
        )
    }

    /// Sides that failed, if this is a trial failure
    #[must_use]
    pub fn failed_sides(&self) -> Vec<TrialSide> {
        match self {
            Self::TrialFailure { failures, .. } => failures.iter().map(|f| f.side).collect(),
            _ => Vec::new(),
        }
    }

    /// Build a trial failure
    pub fn trial_failure(signature: EncapSignature, failures: Vec<SideFailure>) -> Self {
        Self::TrialFailure {
            signature,
            failures,
        }
    }
}

fn render_sides(sides: &[TrialSide]) -> String {
    sides
        .iter()
        .map(TrialSide::describe)
        .collect::<Vec<_>>()
        .join(" and ")
}

fn render_failures(failures: &[SideFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.side.describe(), f.cause))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let err = RolloutError::from(ClusterError::Transient("connection reset by peer".into()));
        assert!(err.is_transient());
        assert!(err.is_retryable());

        let err = RolloutError::from(ClusterError::Api("forbidden".into()));
        assert!(!err.is_transient());
        assert!(!err.is_retryable());
    }

    #[test]
    fn trial_failure_names_sides() {
        let err = RolloutError::trial_failure(
            EncapSignature::Esp,
            vec![
                SideFailure {
                    side: TrialSide::Source,
                    cause: "exit 124".into(),
                },
                SideFailure {
                    side: TrialSide::Destination,
                    cause: "exit 124".into(),
                },
            ],
        );
        let msg = err.to_string();
        assert!(msg.contains("source node"));
        assert!(msg.contains("destination node"));
        assert_eq!(
            err.failed_sides(),
            vec![TrialSide::Source, TrialSide::Destination]
        );
    }

    #[test]
    fn timeout_display() {
        let err = RolloutError::ConvergenceTimeout {
            probe: "machine-config rollout".into(),
            waited_secs: 1200,
        };
        assert_eq!(
            err.to_string(),
            "machine-config rollout did not converge within 1200s"
        );
    }

    #[test]
    fn teardown_joins_causes() {
        let err = RolloutError::Teardown(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "teardown failed: a; b");
    }
}
