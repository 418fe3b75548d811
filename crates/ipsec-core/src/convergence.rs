//! Fleet convergence probes
//!
//! Each probe is a single `(bool, error)` check that can be polled on its own.
//! Structural checks run first; operator health is only consulted once the
//! structure reports done.

use crate::api::FleetStatusApi;
use crate::config::FleetSettings;
use crate::error::RolloutError;
use crate::poller::poll_or_timeout;
use crate::types::{ConvergenceDeadline, SecurityMode};
use std::fmt;
use std::sync::Arc;

/// Closed set of pollable readiness checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceProbe {
    /// Every pool settled with the ipsec extensions present (or absent), operators healthy
    MachineConfigRollout { extensions_present: bool },
    /// Security daemon ready on every node, operators healthy
    WorkloadPresence,
    /// Security daemon object gone, operators healthy
    WorkloadAbsence,
    /// Every worker pool settled with the named extension present (or absent)
    WorkerExtension { name: String, present: bool },
}

impl ConvergenceProbe {
    /// Probes that together mean "the fleet runs `mode`", in polling order
    #[must_use]
    pub fn plan_for(mode: SecurityMode) -> Vec<Self> {
        let rollout = Self::MachineConfigRollout {
            extensions_present: mode.requires_extensions(),
        };
        match mode {
            SecurityMode::Disabled => vec![rollout, Self::WorkloadAbsence],
            SecurityMode::External => vec![rollout],
            SecurityMode::Full => vec![rollout, Self::WorkloadPresence],
        }
    }
}

impl fmt::Display for ConvergenceProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MachineConfigRollout { extensions_present } => write!(
                f,
                "machine-config rollout (extensions {})",
                if *extensions_present { "present" } else { "absent" }
            ),
            Self::WorkloadPresence => f.write_str("security daemon presence"),
            Self::WorkloadAbsence => f.write_str("security daemon absence"),
            Self::WorkerExtension { name, present } => write!(
                f,
                "worker pools with {name} {}",
                if *present { "applied" } else { "removed" }
            ),
        }
    }
}

/// Evaluates convergence probes against fleet status
#[derive(Clone)]
pub struct FleetConvergenceChecker {
    fleet: Arc<dyn FleetStatusApi>,
    settings: FleetSettings,
    deadline: ConvergenceDeadline,
}

impl FleetConvergenceChecker {
    #[must_use]
    pub fn new(
        fleet: Arc<dyn FleetStatusApi>,
        settings: FleetSettings,
        deadline: ConvergenceDeadline,
    ) -> Self {
        Self {
            fleet,
            settings,
            deadline,
        }
    }

    #[inline]
    #[must_use]
    pub fn deadline(&self) -> ConvergenceDeadline {
        self.deadline
    }

    /// Evaluate one probe once
    pub async fn check(&self, probe: &ConvergenceProbe) -> Result<bool, RolloutError> {
        let structural = match probe {
            ConvergenceProbe::MachineConfigRollout { extensions_present } => {
                self.pools_rolled_out(*extensions_present).await?
            }
            ConvergenceProbe::WorkloadPresence => self
                .fleet
                .security_daemon()
                .await?
                .is_some_and(|ds| ds.is_fully_ready()),
            ConvergenceProbe::WorkloadAbsence => self.security_daemon_absent().await?,
            ConvergenceProbe::WorkerExtension { name, present } => {
                return self.worker_pools_ready(name, *present).await;
            }
        };

        if !structural {
            return Ok(false);
        }
        self.operators_healthy().await
    }

    /// Every probe of `mode`'s plan holds right now
    pub async fn is_converged(&self, mode: SecurityMode) -> Result<bool, RolloutError> {
        for probe in ConvergenceProbe::plan_for(mode) {
            if !self.check(&probe).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Poll one probe until it holds.
    ///
    /// # Errors
    /// `RolloutError::ConvergenceTimeout` when the deadline passes first.
    pub async fn wait_for(&self, probe: &ConvergenceProbe) -> Result<(), RolloutError> {
        tracing::info!(probe = %probe, "waiting for convergence");
        poll_or_timeout(&probe.to_string(), self.deadline, || self.check(probe)).await
    }

    /// Poll every probe of `mode`'s plan in order, each with the full deadline
    pub async fn wait_for_mode(&self, mode: SecurityMode) -> Result<(), RolloutError> {
        for probe in ConvergenceProbe::plan_for(mode) {
            self.wait_for(&probe).await?;
        }
        tracing::info!(mode = %mode, "fleet converged");
        Ok(())
    }

    async fn pools_rolled_out(&self, extensions_present: bool) -> Result<bool, RolloutError> {
        let pools = self.fleet.machine_config_pools().await?;
        if pools.is_empty() {
            return Ok(false);
        }
        Ok(pools.iter().all(|pool| {
            let ext = self.settings.extension_for_pool(pool);
            pool.is_settled() && pool.has_source(ext) == extensions_present
        }))
    }

    async fn worker_pools_ready(&self, name: &str, present: bool) -> Result<bool, RolloutError> {
        let pools = self.fleet.machine_config_pools().await?;
        let mut workers = pools.iter().filter(|p| !p.is_master()).peekable();
        if workers.peek().is_none() {
            return Ok(false);
        }
        Ok(workers.all(|pool| pool.is_settled() && pool.has_source(name) == present))
    }

    async fn security_daemon_absent(&self) -> Result<bool, RolloutError> {
        match self.fleet.security_daemon().await {
            Ok(ds) => Ok(ds.is_none()),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn operators_healthy(&self) -> Result<bool, RolloutError> {
        let operators = self.fleet.cluster_operators().await?;
        let unhealthy: Vec<&str> = operators
            .iter()
            .filter(|co| !co.is_healthy())
            .map(|co| co.name.as_str())
            .collect();
        if !unhealthy.is_empty() {
            tracing::debug!(operators = ?unhealthy, "cluster operators not ready");
        }
        Ok(unhealthy.is_empty())
    }
}

impl fmt::Debug for FleetConvergenceChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetConvergenceChecker")
            .field("settings", &self.settings)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
