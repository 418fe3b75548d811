//! Traffic oracle
//!
//! A trial runs three tasks concurrently on a `TrialPair`:
//! - egress capture on the source node, filtered to `src -> dst`
//! - egress capture on the destination node, filtered to `dst -> src`
//! - ping from the source traffic pod to the destination traffic pod
//!
//! The trial passes only when both captures see one packet of the expected
//! encapsulation and the ping succeeds. Every verification pairs the positive
//! trial with a negative control for the complementary encapsulation.

use crate::api::PodExec;
use crate::config::TrialSettings;
use crate::error::{RolloutError, SideFailure};
use crate::task_group::TaskGroup;
use crate::types::{CaptureFilter, EncapSignature, PodRef, TrialPair, TrialSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Result of one trial that reached a verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: Uuid,
    pub signature: EncapSignature,
    /// Whether the signature had to be seen (`false` for a negative control)
    pub expected: bool,
    /// Whether both captures saw it
    pub observed: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl TrialRecord {
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.expected == self.observed
    }
}

/// Runs capture trials through pod exec
#[derive(Clone)]
pub struct TrafficOracle {
    exec: Arc<dyn PodExec>,
    settings: TrialSettings,
}

impl TrafficOracle {
    #[must_use]
    pub fn new(exec: Arc<dyn PodExec>, settings: TrialSettings) -> Self {
        Self { exec, settings }
    }

    /// Run one positive trial.
    ///
    /// # Errors
    /// `RolloutError::TrialFailure` naming every side that failed; all three
    /// tasks always run to completion first.
    pub async fn run_trial(
        &self,
        pair: &TrialPair,
        expect_encrypted: bool,
    ) -> Result<TrialRecord, RolloutError> {
        let signature = EncapSignature::for_encrypted(expect_encrypted);
        let started_at = Utc::now();
        let start = Instant::now();
        let (src_filter, dst_filter) = CaptureFilter::for_pair(pair, signature);

        tracing::info!(
            signature = %signature,
            src = %pair.src.node_name,
            dst = %pair.dst.node_name,
            "starting traffic trial"
        );

        let mut group: TaskGroup<'_, TrialSide, String, String> = TaskGroup::new();
        group.spawn(
            TrialSide::Source,
            self.bounded(
                &pair.src.capture_probe,
                self.capture_command(&pair.src.interface, &src_filter),
            ),
        );
        group.spawn(
            TrialSide::Destination,
            self.bounded(
                &pair.dst.capture_probe,
                self.capture_command(&pair.dst.interface, &dst_filter),
            ),
        );
        group.spawn(
            TrialSide::Traffic,
            self.bounded(
                &pair.src.traffic_probe,
                self.ping_command(&pair.dst.traffic_probe),
            ),
        );

        let outcome = group.join().await;
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let failures: Vec<SideFailure> = outcome
            .failures()
            .map(|(side, cause)| {
                tracing::debug!(side = ?side, cause = %cause, "trial side failed");
                SideFailure {
                    side: *side,
                    cause: cause.clone(),
                }
            })
            .collect();

        if !failures.is_empty() {
            return Err(RolloutError::trial_failure(signature, failures));
        }

        tracing::info!(signature = %signature, elapsed_ms, "traffic observed on both nodes");
        Ok(TrialRecord {
            id: Uuid::new_v4(),
            signature,
            expected: true,
            observed: true,
            started_at,
            elapsed_ms,
        })
    }

    /// Run a negative control: the signature must not be seen.
    ///
    /// Succeeds when traffic was generated and no capture side saw the
    /// signature.
    ///
    /// # Errors
    /// - `RolloutError::UnexpectedSignature` naming the capture sides that saw it
    /// - the original `TrialFailure` when traffic generation itself failed,
    ///   since the absence is then meaningless
    pub async fn run_control(
        &self,
        pair: &TrialPair,
        forbid_encrypted: bool,
    ) -> Result<TrialRecord, RolloutError> {
        let signature = EncapSignature::for_encrypted(forbid_encrypted);
        let started_at = Utc::now();
        let start = Instant::now();

        let result = self.run_trial(pair, forbid_encrypted).await;
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let failed = match result {
            Ok(_) => Vec::new(),
            Err(e @ RolloutError::TrialFailure { .. }) => {
                let failed = e.failed_sides();
                if failed.contains(&TrialSide::Traffic) {
                    return Err(e);
                }
                failed
            }
            Err(e) => return Err(e),
        };

        let observed_by: Vec<TrialSide> = [TrialSide::Source, TrialSide::Destination]
            .into_iter()
            .filter(|side| !failed.contains(side))
            .collect();
        if !observed_by.is_empty() {
            tracing::warn!(signature = %signature, sides = ?observed_by, "negative control observed traffic");
            return Err(RolloutError::UnexpectedSignature {
                signature,
                sides: observed_by,
            });
        }

        tracing::info!(signature = %signature, "negative control saw no traffic");
        Ok(TrialRecord {
            id: Uuid::new_v4(),
            signature,
            expected: false,
            observed: false,
            started_at,
            elapsed_ms,
        })
    }

    /// Positive trial followed by the complementary negative control
    pub async fn verify_exclusive(
        &self,
        pair: &TrialPair,
        expect_encrypted: bool,
    ) -> Result<Vec<TrialRecord>, RolloutError> {
        let positive = self.run_trial(pair, expect_encrypted).await?;
        let control = self.run_control(pair, !expect_encrypted).await?;
        Ok(vec![positive, control])
    }

    fn capture_command(&self, interface: &str, filter: &CaptureFilter) -> Vec<String> {
        vec![
            "timeout".into(),
            self.settings.capture_timeout_secs.to_string(),
            "tcpdump".into(),
            "-i".into(),
            interface.to_string(),
            "-c".into(),
            "1".into(),
            "-v".into(),
            "--direction=out".into(),
            filter.expression(),
        ]
    }

    fn ping_command(&self, target: &PodRef) -> Vec<String> {
        vec![
            "ping".into(),
            "-c".into(),
            self.settings.ping_count.to_string(),
            target.ip.to_string(),
        ]
    }

    async fn bounded(&self, pod: &PodRef, command: Vec<String>) -> Result<String, String> {
        let deadline: Duration = self.settings.task_deadline();
        match tokio::time::timeout(deadline, self.exec.exec(pod, &command)).await {
            Ok(Ok(stdout)) => Ok(stdout),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no result within {}s", deadline.as_secs())),
        }
    }
}

impl std::fmt::Debug for TrafficOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficOracle")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
