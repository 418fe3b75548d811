//! Ready-made clusters and coordinators for scenario tests

use crate::SimCluster;
use ipsec_core::{RolloutConfig, RolloutCoordinator, SecurityMode};
use std::sync::Arc;

/// Simulated cluster already running `mode`
#[must_use]
pub fn sim_cluster(mode: SecurityMode) -> Arc<SimCluster> {
    Arc::new(SimCluster::new().with_mode(mode))
}

/// Coordinator over `sim` with production defaults
#[must_use]
pub fn coordinator(sim: &Arc<SimCluster>) -> RolloutCoordinator {
    coordinator_with(sim, RolloutConfig::new())
}

#[must_use]
pub fn coordinator_with(sim: &Arc<SimCluster>, config: RolloutConfig) -> RolloutCoordinator {
    RolloutCoordinator::new(sim.handles(), config)
}

/// Every ordered pair of distinct modes
#[must_use]
pub fn all_transitions() -> Vec<(SecurityMode, SecurityMode)> {
    SecurityMode::ALL
        .into_iter()
        .flat_map(|from| {
            SecurityMode::ALL
                .into_iter()
                .filter(move |to| *to != from)
                .map(move |to| (from, to))
        })
        .collect()
}
