//! Cluster collaborator interfaces
//!
//! The engine never talks to a cluster directly. Each external capability it
//! consumes is a trait here; `ipsec-kube` implements them against a live
//! cluster and `ipsec-test-utils` against an in-memory simulation.

use crate::error::ClusterError;
use crate::types::{
    ClusterOperatorStatus, MachineConfigPoolStatus, NetworkConfig, NodeInfo, PodRef, ProbePods,
    WorkloadStatus,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Access to the single cluster network configuration record
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkConfigApi: Send + Sync {
    /// Read the current record, including its version token
    async fn get_network_config(&self) -> Result<NetworkConfig, ClusterError>;

    /// Write the record back.
    ///
    /// # Errors
    /// `ClusterError::Conflict` when `config.resource_version` is stale.
    async fn update_network_config(
        &self,
        config: &NetworkConfig,
    ) -> Result<NetworkConfig, ClusterError>;
}

/// Read-only fleet status
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FleetStatusApi: Send + Sync {
    async fn machine_config_pools(&self) -> Result<Vec<MachineConfigPoolStatus>, ClusterError>;

    async fn cluster_operators(&self) -> Result<Vec<ClusterOperatorStatus>, ClusterError>;

    /// Per-node security daemon; `None` when the workload object does not exist
    async fn security_daemon(&self) -> Result<Option<WorkloadStatus>, ClusterError>;
}

/// Remote command execution inside a pod
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run `command` in `pod`, returning stdout.
    ///
    /// # Errors
    /// `ClusterError::CommandFailed` when the command exits non-zero.
    async fn exec(&self, pod: &PodRef, command: &[String]) -> Result<String, ClusterError>;
}

/// Node discovery and probe pod lifecycle
#[async_trait]
pub trait TrialPodApi: Send + Sync {
    async fn schedulable_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    /// Physical interface attached to `bridge` on `node`
    async fn bridge_interface(&self, node: &str, bridge: &str) -> Result<String, ClusterError>;

    /// Image providing tcpdump and ping
    async fn capture_image(&self) -> Result<String, ClusterError>;

    /// Launch the traffic pod and the host-networked capture pod pinned to `node`
    async fn launch_probe_pods(
        &self,
        node: &str,
        image: &str,
        name_prefix: &str,
    ) -> Result<ProbePods, ClusterError>;

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ClusterError>;
}

/// Declarative per-node network policy submission
#[async_trait]
pub trait NodePolicyApi: Send + Sync {
    /// Deploy the handler that renders node policies
    async fn deploy_handler(&self) -> Result<(), ClusterError>;

    async fn undeploy_handler(&self) -> Result<(), ClusterError>;

    async fn apply_policy(&self, manifest: &str) -> Result<(), ClusterError>;

    /// Rendered status of the named policy, as free text
    async fn policy_status(&self, name: &str) -> Result<String, ClusterError>;

    async fn delete_policy(&self, name: &str) -> Result<(), ClusterError>;
}

/// Configuration-extension objects distributed to worker pools
#[async_trait]
pub trait ExtensionApi: Send + Sync {
    async fn create_extension(&self, name: &str, manifest: &str) -> Result<(), ClusterError>;

    async fn delete_extension(&self, name: &str) -> Result<(), ClusterError>;
}

/// A backend that provides every capability
pub trait ClusterBackend:
    NetworkConfigApi + FleetStatusApi + PodExec + TrialPodApi + NodePolicyApi + ExtensionApi
{
}

impl<T> ClusterBackend for T where
    T: NetworkConfigApi + FleetStatusApi + PodExec + TrialPodApi + NodePolicyApi + ExtensionApi
{
}

/// One handle per capability, shared by the engine components
#[derive(Clone)]
pub struct ClusterHandles {
    pub network: Arc<dyn NetworkConfigApi>,
    pub fleet: Arc<dyn FleetStatusApi>,
    pub exec: Arc<dyn PodExec>,
    pub pods: Arc<dyn TrialPodApi>,
    pub policy: Arc<dyn NodePolicyApi>,
    pub extensions: Arc<dyn ExtensionApi>,
}

impl ClusterHandles {
    /// Split a full backend into per-capability handles
    #[must_use]
    pub fn from_backend<B: ClusterBackend + 'static>(backend: Arc<B>) -> Self {
        Self {
            network: backend.clone(),
            fleet: backend.clone(),
            exec: backend.clone(),
            pods: backend.clone(),
            policy: backend.clone(),
            extensions: backend,
        }
    }
}

impl std::fmt::Debug for ClusterHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandles").finish_non_exhaustive()
    }
}
