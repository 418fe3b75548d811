//! IPsec Core - security-mode rollout and verification engine
//!
//! Drives a cluster-wide IPsec mode change to convergence and proves the wire
//! behaviour afterwards:
//! - Reads and writes the mode record with compare-and-swap retries
//! - Polls fleet rollout, workload and operator health under a fixed deadline
//! - Captures egress traffic on two peer nodes while generating traffic between them
//! - Provisions host-to-host tunnels for the north-south case
//! - Restores the original mode whatever happens
//!
//! # Example
//!
//! ```rust,ignore
//! use ipsec_core::{ClusterHandles, RolloutConfig, RolloutCoordinator, ScenarioKind, SecurityMode};
//!
//! # async fn example(handles: ClusterHandles) -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = RolloutCoordinator::new(handles, RolloutConfig::new());
//! let report = coordinator
//!     .run(ScenarioKind::ModeTransition(SecurityMode::Full))
//!     .await?;
//!
//! println!("{} trials passed", report.trials.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod api;
pub mod config;
pub mod convergence;
pub mod coordinator;
pub mod error;
pub mod mode_store;
pub mod north_south;
pub mod oracle;
pub mod poller;
pub mod state_machine;
pub mod task_group;
pub mod types;

// Re-exports for convenience
pub use api::{
    ClusterBackend, ClusterHandles, ExtensionApi, FleetStatusApi, NetworkConfigApi,
    NodePolicyApi, PodExec, TrialPodApi,
};
pub use config::{
    FleetSettings, NorthSouthSettings, PollSettings, RetrySettings, RolloutConfig, TrialSettings,
};
pub use convergence::{ConvergenceProbe, FleetConvergenceChecker};
pub use coordinator::{RolloutCoordinator, ScenarioKind, ScenarioReport};
pub use error::{ClusterError, RolloutError, SideFailure};
pub use mode_store::{ModeChange, ModeStore};
pub use north_south::{policy_converged, NodePolicy, NorthSouthProvisioner, ProvisionedArtifacts};
pub use oracle::{TrafficOracle, TrialRecord};
pub use poller::{poll_or_timeout, poll_until, poll_with};
pub use state_machine::{ScenarioState, ScenarioTracker};
pub use task_group::{GroupOutcome, TaskGroup};
pub use types::{
    CaptureFilter, ClusterOperatorStatus, ConvergenceDeadline, EncapSignature, IpsecConfig,
    MachineConfigPoolStatus, NetworkConfig, NodeEndpoint, NodeInfo, PodRef, ProbePods,
    SecurityMode, TrialPair, TrialSide, WorkloadStatus,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving rollouts
    pub use crate::{
        ClusterHandles, ConvergenceDeadline, RolloutConfig, RolloutCoordinator, RolloutError,
        ScenarioKind, ScenarioReport, SecurityMode,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
