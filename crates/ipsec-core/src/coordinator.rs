//! Scenario orchestration
//!
//! A scenario moves the cluster from its current mode to a target mode and
//! proves the wire behaviour on both sides of the change:
//! 1. verify traffic for the original mode
//! 2. request the target mode and wait for the fleet to converge
//! 3. verify traffic for the target mode
//! 4. (north-south only) provision certificates and tunnel policies, verify again
//!
//! Teardown always runs. It restores the original mode, removes only the
//! artefacts the scenario created, then releases the probe pods.

use crate::api::{ClusterHandles, TrialPodApi};
use crate::config::RolloutConfig;
use crate::convergence::FleetConvergenceChecker;
use crate::error::{ClusterError, RolloutError};
use crate::mode_store::ModeStore;
use crate::north_south::{NorthSouthProvisioner, ProvisionedArtifacts};
use crate::oracle::{TrafficOracle, TrialRecord};
use crate::state_machine::{ScenarioState, ScenarioTracker};
use crate::task_group::TaskGroup;
use crate::types::{NodeEndpoint, NodeInfo, SecurityMode, TrialPair, TrialSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// What a scenario does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioKind {
    /// Move the fleet to the given mode
    ModeTransition(SecurityMode),
    /// External mode plus host-to-host tunnels between the pair
    NorthSouth,
}

impl ScenarioKind {
    #[inline]
    #[must_use]
    pub fn target_mode(&self) -> SecurityMode {
        match self {
            Self::ModeTransition(mode) => *mode,
            Self::NorthSouth => SecurityMode::External,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_north_south(&self) -> bool {
        matches!(self, Self::NorthSouth)
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModeTransition(mode) => write!(f, "mode-transition({mode})"),
            Self::NorthSouth => f.write_str("north-south"),
        }
    }
}

/// Outcome of a successful scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub id: Uuid,
    pub kind: ScenarioKind,
    pub original_mode: SecurityMode,
    pub target_mode: SecurityMode,
    pub states: Vec<ScenarioState>,
    pub trials: Vec<TrialRecord>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Mutable progress of one scenario
#[derive(Debug, Default)]
struct ScenarioRun {
    tracker: ScenarioTracker,
    trials: Vec<TrialRecord>,
    artifacts: ProvisionedArtifacts,
}

/// Runs rollout scenarios against one cluster
#[derive(Clone)]
pub struct RolloutCoordinator {
    pods: Arc<dyn TrialPodApi>,
    store: ModeStore,
    checker: FleetConvergenceChecker,
    oracle: TrafficOracle,
    north_south: NorthSouthProvisioner,
    config: RolloutConfig,
}

impl RolloutCoordinator {
    #[must_use]
    pub fn new(handles: ClusterHandles, config: RolloutConfig) -> Self {
        let store = ModeStore::new(handles.network.clone(), config.mode_store);
        let checker = FleetConvergenceChecker::new(
            handles.fleet.clone(),
            config.fleet.clone(),
            config.convergence.deadline(),
        );
        let oracle = TrafficOracle::new(handles.exec.clone(), config.trial);
        let north_south = NorthSouthProvisioner::new(
            handles.policy.clone(),
            handles.extensions.clone(),
            checker.clone(),
            config.north_south.clone(),
            config.policy_wait.deadline(),
        );

        Self {
            pods: handles.pods,
            store,
            checker,
            oracle,
            north_south,
            config,
        }
    }

    #[inline]
    #[must_use]
    pub fn mode_store(&self) -> &ModeStore {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn checker(&self) -> &FleetConvergenceChecker {
        &self.checker
    }

    #[inline]
    #[must_use]
    pub fn oracle(&self) -> &TrafficOracle {
        &self.oracle
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Run one scenario end to end.
    ///
    /// # Errors
    /// The first failure of the scenario body. When the body succeeded but
    /// teardown did not, `RolloutError::Teardown` listing every teardown failure.
    pub async fn run(&self, kind: ScenarioKind) -> Result<ScenarioReport, RolloutError> {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("scenario", scenario = %kind, id = %id);
        self.run_scenario(id, kind).instrument(span).await
    }

    async fn run_scenario(
        &self,
        id: Uuid,
        kind: ScenarioKind,
    ) -> Result<ScenarioReport, RolloutError> {
        let started_at = Utc::now();
        let start = Instant::now();

        if kind.is_north_south() {
            self.north_south.check_certificates(started_at)?;
        }

        let original = self.store.get_mode().await?;
        let target = kind.target_mode();
        tracing::info!(original = %original, target = %target, "scenario starting");

        let pair = self.setup_pair().await?;
        let mut run = ScenarioRun::default();

        let body = self.execute(kind, original, &pair, &mut run).await;
        if let Err(e) = &body {
            tracing::error!(error = %e, state = %run.tracker.current(), "scenario failed");
        }

        let mut failures = self.teardown(original, &mut run).await;
        let failed = body.is_err() || !failures.is_empty();
        failures.extend(self.release_pair(&pair, failed).await);

        for failure in &failures {
            tracing::error!(failure = %failure, "teardown step failed");
        }

        body?;
        if !failures.is_empty() {
            return Err(RolloutError::Teardown(failures));
        }

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(elapsed_ms, "scenario passed");
        Ok(ScenarioReport {
            id,
            kind,
            original_mode: original,
            target_mode: target,
            states: run.tracker.into_history(),
            trials: run.trials,
            started_at,
            elapsed_ms,
        })
    }

    async fn execute(
        &self,
        kind: ScenarioKind,
        original: SecurityMode,
        pair: &TrialPair,
        run: &mut ScenarioRun,
    ) -> Result<(), RolloutError> {
        let target = kind.target_mode();

        run.trials.extend(
            self.oracle
                .verify_exclusive(pair, original.encrypts_pod_traffic())
                .await?,
        );

        run.tracker.advance(ScenarioState::ModeRequested)?;
        self.store.set_mode(target).await?;

        run.tracker.advance(ScenarioState::Converging)?;
        self.checker.wait_for_mode(target).await?;
        run.tracker.advance(ScenarioState::ModeConverged)?;

        run.trials.extend(
            self.oracle
                .verify_exclusive(pair, target.encrypts_pod_traffic())
                .await?,
        );

        if kind.is_north_south() {
            self.north_south
                .provision_certificates(&mut run.artifacts)
                .await?;
            run.tracker.advance(ScenarioState::CertProvisioned)?;

            self.north_south
                .apply_policies(pair, &mut run.artifacts)
                .await?;
            run.tracker.advance(ScenarioState::PolicyApplied)?;

            run.trials
                .extend(self.oracle.verify_exclusive(pair, true).await?);
        }

        run.tracker.advance(ScenarioState::Verified)
    }

    /// Restore `original` and remove provisioned artefacts; returns every failure
    async fn teardown(&self, original: SecurityMode, run: &mut ScenarioRun) -> Vec<String> {
        let mut failures = Vec::new();
        let active = run.tracker.is_active();
        if active {
            if let Err(e) = run.tracker.advance(ScenarioState::TearingDown) {
                failures.push(e.to_string());
            }
        }

        match self.store.set_mode(original).await {
            Ok(change) if change.was_written() => {
                tracing::info!(mode = %original, "restoring original mode");
                if let Err(e) = self.checker.wait_for_mode(original).await {
                    failures.push(format!("restore {original}: {e}"));
                }
            }
            Ok(_) => {}
            Err(e) => failures.push(format!("restore {original}: {e}")),
        }

        if !run.artifacts.is_empty() {
            failures.extend(self.north_south.teardown(&mut run.artifacts).await);
        }

        if active {
            if let Err(e) = run.tracker.advance(ScenarioState::Idle) {
                failures.push(e.to_string());
            }
        }
        failures
    }

    /// Pick two nodes and launch probe pods on both concurrently
    async fn setup_pair(&self) -> Result<TrialPair, RolloutError> {
        let nodes = self.pods.schedulable_nodes().await?;
        let (src_node, dst_node) = pick_pair(&nodes)?;
        let image = self.pods.capture_image().await?;
        tracing::info!(src = %src_node.name, dst = %dst_node.name, "launching probe pods");

        let mut group: TaskGroup<'_, TrialSide, NodeEndpoint, ClusterError> = TaskGroup::new();
        group.spawn(TrialSide::Source, self.launch_endpoint(src_node, &image));
        group.spawn(TrialSide::Destination, self.launch_endpoint(dst_node, &image));
        let outcome = group.join().await;

        if outcome.all_succeeded() {
            let mut endpoints = outcome
                .into_result()
                .map_err(RolloutError::from)?
                .into_iter()
                .map(|(_, ep)| ep);
            return match (endpoints.next(), endpoints.next()) {
                (Some(src), Some(dst)) => Ok(TrialPair { src, dst }),
                _ => Err(RolloutError::Setup("probe pod launch incomplete".into())),
            };
        }

        let summary = outcome.failure_summary().join(", ");
        let launched: Vec<NodeEndpoint> = outcome
            .into_results()
            .into_iter()
            .filter_map(|(_, r)| r.ok())
            .collect();
        for endpoint in &launched {
            for failure in self.release_endpoint(endpoint, true).await {
                tracing::error!(failure = %failure, "probe pod cleanup failed");
            }
        }
        Err(RolloutError::Setup(summary))
    }

    async fn launch_endpoint(
        &self,
        node: &NodeInfo,
        image: &str,
    ) -> Result<NodeEndpoint, ClusterError> {
        let interface = self
            .pods
            .bridge_interface(&node.name, &self.config.fleet.bridge)
            .await?;
        let pods = self
            .pods
            .launch_probe_pods(&node.name, image, &self.config.fleet.pod_name_prefix)
            .await?;
        Ok(NodeEndpoint {
            node_name: node.name.clone(),
            interface,
            node_ip: node.internal_ip,
            traffic_probe: pods.traffic,
            capture_probe: pods.capture,
        })
    }

    async fn release_pair(&self, pair: &TrialPair, failed: bool) -> Vec<String> {
        let mut failures = self.release_endpoint(&pair.src, failed).await;
        failures.extend(self.release_endpoint(&pair.dst, failed).await);
        failures
    }

    async fn release_endpoint(&self, endpoint: &NodeEndpoint, failed: bool) -> Vec<String> {
        if failed && !self.config.delete_pods_on_failure {
            for pod in endpoint.pods() {
                tracing::warn!(pod = %pod, node = %endpoint.node_name, "leaving probe pod for inspection");
            }
            return Vec::new();
        }

        let mut failures = Vec::new();
        for pod in endpoint.pods() {
            match self.pods.delete_pod(pod).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => failures.push(format!("delete pod {pod}: {e}")),
            }
        }
        failures
    }
}

impl fmt::Debug for RolloutCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RolloutCoordinator")
            .field("store", &self.store)
            .field("checker", &self.checker)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// First two nodes with distinct names
fn pick_pair(nodes: &[NodeInfo]) -> Result<(&NodeInfo, &NodeInfo), RolloutError> {
    let src = nodes.first();
    let dst = src.and_then(|s| nodes.iter().find(|n| n.name != s.name));
    match (src, dst) {
        (Some(s), Some(d)) => Ok((s, d)),
        _ => Err(RolloutError::Setup(format!(
            "need two schedulable nodes, found {}",
            nodes.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, ip: &str) -> NodeInfo {
        NodeInfo {
            name: name.into(),
            internal_ip: ip.parse().unwrap(),
        }
    }

    #[test]
    fn pick_pair_needs_two_distinct_nodes() {
        assert!(pick_pair(&[]).is_err());
        assert!(pick_pair(&[node("a", "10.0.0.1")]).is_err());
        assert!(pick_pair(&[node("a", "10.0.0.1"), node("a", "10.0.0.1")]).is_err());

        let nodes = [node("a", "10.0.0.1"), node("b", "10.0.0.2"), node("c", "10.0.0.3")];
        let (src, dst) = pick_pair(&nodes).unwrap();
        assert_eq!((src.name.as_str(), dst.name.as_str()), ("a", "b"));
    }

    #[test]
    fn north_south_targets_external() {
        assert_eq!(ScenarioKind::NorthSouth.target_mode(), SecurityMode::External);
        assert_eq!(
            ScenarioKind::ModeTransition(SecurityMode::Full).to_string(),
            "mode-transition(Full)"
        );
    }
}
