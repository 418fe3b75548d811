//! Decoding of API objects into engine types
//!
//! OpenShift resources are read as `DynamicObject`; the serde views below
//! pick out the fields the engine needs. Core resources arrive typed.

use ipsec_core::{
    ClusterError, ClusterOperatorStatus, IpsecConfig, MachineConfigPoolStatus, NetworkConfig,
    NodeInfo, PodRef, WorkloadStatus,
};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;

/// Failure to decode an API object
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid address '{0}'")]
    BadAddress(String),
}

impl From<ParseError> for ClusterError {
    fn from(e: ParseError) -> Self {
        ClusterError::Decode(e.to_string())
    }
}

/// `data[key]` decoded as `T`; absent or null reads as `T::default()`
fn section<T: DeserializeOwned + Default>(data: &Value, key: &str) -> Result<T, ParseError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => Ok(T::deserialize(v)?),
    }
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    #[serde(default)]
    message: String,
}

fn condition_true(conditions: &[Condition], kind: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.kind == kind && c.status == "True")
}

#[derive(Debug, Default, Deserialize)]
struct Conditions {
    #[serde(default)]
    conditions: Vec<Condition>,
}

// operator.openshift.io/v1 Network "cluster"

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkSpec {
    #[serde(default)]
    default_network: DefaultNetwork,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefaultNetwork {
    ovn_kubernetes_config: Option<OvnKubernetesConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OvnKubernetesConfig {
    ipsec_config: Option<IpsecConfigView>,
}

#[derive(Debug, Default, Deserialize)]
struct IpsecConfigView {
    #[serde(default)]
    mode: String,
}

pub fn network_config(obj: &DynamicObject) -> Result<NetworkConfig, ParseError> {
    let spec: NetworkSpec = section(&obj.data, "spec")?;
    Ok(NetworkConfig {
        resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
        ipsec: spec
            .default_network
            .ovn_kubernetes_config
            .and_then(|ovn| ovn.ipsec_config)
            .map(|c| IpsecConfig { mode: c.mode }),
    })
}

/// Merge patch writing the ipsec sub-record, guarded by the read version.
///
/// The API server rejects it with 409 when `resourceVersion` is stale.
#[must_use]
pub fn network_patch(config: &NetworkConfig) -> Value {
    let ipsec = config
        .ipsec
        .as_ref()
        .map_or(Value::Null, |c| json!({ "mode": c.mode }));
    json!({
        "metadata": { "resourceVersion": config.resource_version },
        "spec": { "defaultNetwork": { "ovnKubernetesConfig": { "ipsecConfig": ipsec } } },
    })
}

// machineconfiguration.openshift.io/v1 MachineConfigPool

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolStatus {
    #[serde(default)]
    machine_count: u32,
    #[serde(default)]
    updated_machine_count: u32,
    #[serde(default)]
    degraded_machine_count: u32,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    configuration: PoolConfiguration,
}

#[derive(Debug, Default, Deserialize)]
struct PoolConfiguration {
    #[serde(default)]
    source: Vec<SourceRef>,
}

#[derive(Debug, Deserialize)]
struct SourceRef {
    #[serde(default)]
    name: String,
}

pub fn machine_config_pool(obj: &DynamicObject) -> Result<MachineConfigPoolStatus, ParseError> {
    let status: PoolStatus = section(&obj.data, "status")?;
    Ok(MachineConfigPoolStatus {
        name: obj.name_any(),
        machine_count: status.machine_count,
        updated_machine_count: status.updated_machine_count,
        degraded_machine_count: status.degraded_machine_count,
        updating: condition_true(&status.conditions, "Updating"),
        degraded: condition_true(&status.conditions, "Degraded"),
        configuration_sources: status
            .configuration
            .source
            .into_iter()
            .map(|s| s.name)
            .collect(),
    })
}

// config.openshift.io/v1 ClusterOperator

pub fn cluster_operator(obj: &DynamicObject) -> Result<ClusterOperatorStatus, ParseError> {
    let status: Conditions = section(&obj.data, "status")?;
    Ok(ClusterOperatorStatus {
        name: obj.name_any(),
        available: condition_true(&status.conditions, "Available"),
        progressing: condition_true(&status.conditions, "Progressing"),
        degraded: condition_true(&status.conditions, "Degraded"),
    })
}

// nmstate.io/v1 NMState and NodeNetworkConfigurationPolicy

/// Message of the `Available` condition, empty when not rendered yet
pub fn policy_status(obj: &DynamicObject) -> Result<String, ParseError> {
    let status: Conditions = section(&obj.data, "status")?;
    Ok(status
        .conditions
        .into_iter()
        .find(|c| c.kind == "Available")
        .map(|c| c.message)
        .unwrap_or_default())
}

/// Whether an object reports `Available=True`
#[must_use]
pub fn is_available(obj: &DynamicObject) -> bool {
    section::<Conditions>(&obj.data, "status")
        .is_ok_and(|s| condition_true(&s.conditions, "Available"))
}

/// Parse a YAML or JSON manifest into an untyped object
pub fn dynamic_object(manifest: &str) -> Result<DynamicObject, ParseError> {
    Ok(serde_yaml::from_str(manifest)?)
}

// core and apps resources

#[must_use]
pub fn workload_status(ds: &DaemonSet) -> WorkloadStatus {
    let (desired, ready) = ds
        .status
        .as_ref()
        .map_or((0, 0), |s| (s.desired_number_scheduled, s.number_ready));
    WorkloadStatus {
        desired_number_scheduled: u32::try_from(desired).unwrap_or(0),
        number_ready: u32::try_from(ready).unwrap_or(0),
    }
}

/// Schedulable nodes with their internal address
pub fn schedulable_nodes(nodes: &[Node]) -> Result<Vec<NodeInfo>, ParseError> {
    nodes
        .iter()
        .filter(|n| {
            !n.spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false)
        })
        .map(|n| {
            let addr = n
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
                .ok_or(ParseError::MissingField("status.addresses[InternalIP]"))?;
            let internal_ip: IpAddr = addr
                .address
                .parse()
                .map_err(|_| ParseError::BadAddress(addr.address.clone()))?;
            Ok(NodeInfo {
                name: n.name_any(),
                internal_ip,
            })
        })
        .collect()
}

/// Ready condition of a pod; a missing pod is not ready
#[must_use]
pub fn pod_ready(pod: Option<&Pod>) -> bool {
    pod.and_then(|p| p.status.as_ref())
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn pod_ref(pod: &Pod) -> Result<PodRef, ParseError> {
    let ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .ok_or(ParseError::MissingField("status.podIP"))?;
    Ok(PodRef {
        ip: ip.parse().map_err(|_| ParseError::BadAddress(ip.clone()))?,
        name: pod.name_any(),
        namespace: pod
            .namespace()
            .ok_or(ParseError::MissingField("metadata.namespace"))?,
    })
}

/// Exit code carried by the status frame of an exec session
#[must_use]
pub fn exit_code(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(1)
}

/// Physical port of a bridge from `ovs-vsctl list-ports` output
#[must_use]
pub fn bridge_port(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|port| !port.is_empty() && !port.starts_with("patch-"))
        .map(str::to_string)
}
