//! Core types for the rollout engine
//!
//! Defines:
//! - The security mode and the cluster record holding it
//! - Fleet status snapshots read back from the control plane
//! - Node endpoints, trial pairs and capture filters used by the traffic oracle

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Cluster-wide IPsec mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityMode {
    /// No node-to-node encryption
    Disabled,
    /// Overlay unencrypted, host-to-host tunnels provisioned separately
    External,
    /// All inter-node pod traffic encrypted
    Full,
}

impl SecurityMode {
    /// All modes, in declaration order
    pub const ALL: [SecurityMode; 3] = [Self::Disabled, Self::External, Self::Full];

    /// Wire name used on the cluster record
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::External => "External",
            Self::Full => "Full",
        }
    }

    /// Whether overlay pod traffic is ESP-encapsulated in this mode
    #[inline]
    #[must_use]
    pub fn encrypts_pod_traffic(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Whether the fleet carries the ipsec machine-config extensions
    #[inline]
    #[must_use]
    pub fn requires_extensions(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityMode {
    type Err = crate::error::RolloutError;

    /// Exact wire names only; the network record never carries other spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Disabled" => Ok(Self::Disabled),
            "External" => Ok(Self::External),
            "Full" => Ok(Self::Full),
            _ => Err(crate::error::RolloutError::InvalidMode(s.to_string())),
        }
    }
}

/// IPsec sub-record of the cluster network configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpsecConfig {
    /// Raw mode string; empty means the legacy default
    pub mode: String,
}

/// The single cluster network configuration record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Version token for optimistic concurrency
    pub resource_version: String,
    /// IPsec sub-record, absent when never configured
    pub ipsec: Option<IpsecConfig>,
}

impl NetworkConfig {
    /// Effective mode of this record.
    ///
    /// A missing sub-record means no IPsec config at all. An empty mode string
    /// is the legacy default and reads as `Full`; that interpretation depends on
    /// how older clusters were deployed.
    pub fn effective_mode(&self) -> Result<SecurityMode, crate::error::RolloutError> {
        match &self.ipsec {
            None => Ok(SecurityMode::Disabled),
            Some(c) if c.mode.is_empty() => Ok(SecurityMode::Full),
            Some(c) => c.mode.parse(),
        }
    }

    /// Apply `desired` in place. Returns false when nothing changed.
    pub fn apply_mode(&mut self, desired: SecurityMode) -> bool {
        match &mut self.ipsec {
            None => {
                self.ipsec = Some(IpsecConfig {
                    mode: desired.as_str().to_string(),
                });
                true
            }
            Some(c) if c.mode != desired.as_str() => {
                c.mode = desired.as_str().to_string();
                true
            }
            Some(_) => false,
        }
    }
}

/// Rollout status of one machine-config pool
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineConfigPoolStatus {
    pub name: String,
    pub machine_count: u32,
    pub updated_machine_count: u32,
    pub degraded_machine_count: u32,
    pub updating: bool,
    pub degraded: bool,
    /// Names of the machine configs rendered into this pool
    pub configuration_sources: Vec<String>,
}

impl MachineConfigPoolStatus {
    /// Pool name reserved for control-plane nodes
    pub const MASTER: &'static str = "master";

    /// No node mid-update and nothing degraded
    #[inline]
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.updated_machine_count == self.machine_count
            && self.degraded_machine_count == 0
            && !self.updating
            && !self.degraded
    }

    /// Whether the named machine config is part of the rendered configuration
    #[inline]
    #[must_use]
    pub fn has_source(&self, name: &str) -> bool {
        self.configuration_sources.iter().any(|s| s == name)
    }

    #[inline]
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.name == Self::MASTER
    }
}

/// Health of one cluster operator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterOperatorStatus {
    pub name: String,
    pub available: bool,
    pub progressing: bool,
    pub degraded: bool,
}

impl ClusterOperatorStatus {
    #[inline]
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.available && !self.progressing && !self.degraded
    }
}

/// Replica counts of the per-node security daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub desired_number_scheduled: u32,
    pub number_ready: u32,
}

impl WorkloadStatus {
    /// One ready instance on every node it should run on
    #[inline]
    #[must_use]
    pub fn is_fully_ready(&self) -> bool {
        self.desired_number_scheduled == self.number_ready
    }
}

/// Schedulable node as returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub internal_ip: IpAddr,
}

/// Reference to a running pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub ip: IpAddr,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The two probe pods launched on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePods {
    /// Pod-network pod used to generate ping traffic
    pub traffic: PodRef,
    /// Host-networked pod used to run tcpdump
    pub capture: PodRef,
}

/// One side of a trial pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub node_name: String,
    /// Physical interface behind the external bridge
    pub interface: String,
    pub node_ip: IpAddr,
    pub traffic_probe: PodRef,
    pub capture_probe: PodRef,
}

impl NodeEndpoint {
    /// Pods owned by this endpoint
    #[must_use]
    pub fn pods(&self) -> [&PodRef; 2] {
        [&self.traffic_probe, &self.capture_probe]
    }
}

/// Source and destination endpoints of one scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPair {
    pub src: NodeEndpoint,
    pub dst: NodeEndpoint,
}

/// Encapsulation signature a capture looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncapSignature {
    /// IPsec ESP
    Esp,
    /// Plain Geneve overlay (UDP 6081)
    Geneve,
}

impl EncapSignature {
    /// Signature for the encrypted or the plain overlay
    #[inline]
    #[must_use]
    pub fn for_encrypted(encrypted: bool) -> Self {
        if encrypted {
            Self::Esp
        } else {
            Self::Geneve
        }
    }

    /// The mutually exclusive signature
    #[inline]
    #[must_use]
    pub fn complement(&self) -> Self {
        match self {
            Self::Esp => Self::Geneve,
            Self::Geneve => Self::Esp,
        }
    }

    /// BPF primitive matching this signature
    #[inline]
    #[must_use]
    pub fn bpf_primitive(&self) -> &'static str {
        match self {
            Self::Esp => "esp",
            Self::Geneve => "udp port 6081",
        }
    }
}

impl fmt::Display for EncapSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esp => f.write_str("esp"),
            Self::Geneve => f.write_str("geneve"),
        }
    }
}

/// Directional (egress) packet-classification rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFilter {
    pub signature: EncapSignature,
    pub source: IpAddr,
    pub destination: IpAddr,
}

impl CaptureFilter {
    /// Filters for the source node and for the destination node of `pair`
    #[must_use]
    pub fn for_pair(pair: &TrialPair, signature: EncapSignature) -> (Self, Self) {
        let src = Self {
            signature,
            source: pair.src.node_ip,
            destination: pair.dst.node_ip,
        };
        let dst = Self {
            signature,
            source: pair.dst.node_ip,
            destination: pair.src.node_ip,
        };
        (src, dst)
    }

    /// Render as a tcpdump filter expression
    #[must_use]
    pub fn expression(&self) -> String {
        format!(
            "{} and src {} and dst {}",
            self.signature.bpf_primitive(),
            self.source,
            self.destination
        )
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// Task of a traffic trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialSide {
    /// Capture on the source node
    Source,
    /// Capture on the destination node
    Destination,
    /// Ping from source to destination
    Traffic,
}

impl TrialSide {
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Source => "source node capture",
            Self::Destination => "destination node capture",
            Self::Traffic => "traffic generation",
        }
    }
}

/// Fixed polling bounds for fleet-wide convergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceDeadline {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl ConvergenceDeadline {
    #[inline]
    #[must_use]
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval,
            max_wait,
        }
    }
}

impl Default for ConvergenceDeadline {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(20 * 60),
        }
    }
}
