//! Resource descriptors and objects the backend submits on the engine's behalf

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, SecurityContext};
use kube::api::{DynamicObject, ObjectMeta};
use kube::discovery::ApiResource;
use std::collections::BTreeMap;

/// Handler object that makes nmstate render node policies
pub const NMSTATE_NAME: &str = "nmstate";

/// Name of the cluster-scoped network operator record
pub const NETWORK_RECORD: &str = "cluster";

fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: format!("{group}/{version}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

#[must_use]
pub fn network_operator() -> ApiResource {
    resource("operator.openshift.io", "v1", "Network", "networks")
}

#[must_use]
pub fn machine_config_pool() -> ApiResource {
    resource(
        "machineconfiguration.openshift.io",
        "v1",
        "MachineConfigPool",
        "machineconfigpools",
    )
}

#[must_use]
pub fn machine_config() -> ApiResource {
    resource(
        "machineconfiguration.openshift.io",
        "v1",
        "MachineConfig",
        "machineconfigs",
    )
}

#[must_use]
pub fn cluster_operator() -> ApiResource {
    resource("config.openshift.io", "v1", "ClusterOperator", "clusteroperators")
}

#[must_use]
pub fn nmstate() -> ApiResource {
    resource("nmstate.io", "v1", "NMState", "nmstates")
}

#[must_use]
pub fn node_network_policy() -> ApiResource {
    resource(
        "nmstate.io",
        "v1",
        "NodeNetworkConfigurationPolicy",
        "nodenetworkconfigurationpolicies",
    )
}

fn probe_labels(role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "ipsec-probe".to_string()),
        ("probe".to_string(), role.to_string()),
    ])
}

fn idle_container(name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        ..Default::default()
    }
}

/// Traffic probe: ordinary pod network, pinned to `node`
#[must_use]
pub fn traffic_pod(name_prefix: &str, namespace: &str, node: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name_prefix}ping-")),
            namespace: Some(namespace.to_string()),
            labels: Some(probe_labels("traffic")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            containers: vec![idle_container("probe", image)],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Capture probe: host network and privileged so tcpdump sees the physical port
#[must_use]
pub fn capture_pod(name_prefix: &str, namespace: &str, node: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name_prefix}dump-")),
            namespace: Some(namespace.to_string()),
            labels: Some(probe_labels("capture")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            host_network: Some(true),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            containers: vec![Container {
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                ..idle_container("tcpdump", image)
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[must_use]
pub fn nmstate_handler() -> DynamicObject {
    DynamicObject::new(NMSTATE_NAME, &nmstate()).data(serde_json::json!({ "spec": {} }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn capture_pod_is_host_networked_and_pinned() {
        let pod = capture_pod("ipsec-probe-", "probes", "worker-0", "network-tools:latest");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.host_network, Some(true));
        assert_eq!(spec.node_name.as_deref(), Some("worker-0"));
        assert_eq!(
            pod.metadata.generate_name.as_deref(),
            Some("ipsec-probe-dump-")
        );
        let privileged = spec.containers[0]
            .security_context
            .as_ref()
            .and_then(|s| s.privileged);
        assert_eq!(privileged, Some(true));
    }

    #[test]
    fn traffic_pod_uses_pod_network() {
        let pod = traffic_pod("ipsec-probe-", "probes", "worker-1", "img");
        assert_eq!(pod.spec.unwrap().host_network, None);
        assert_eq!(pod.metadata.namespace.as_deref(), Some("probes"));
        assert_eq!(
            pod.metadata.labels.unwrap().get("probe").map(String::as_str),
            Some("traffic")
        );
    }

    #[test]
    fn resources_carry_group_version() {
        let network = network_operator();
        assert_eq!(network.api_version, "operator.openshift.io/v1");
        assert_eq!(network.plural, "networks");
        assert_eq!(node_network_policy().group, "nmstate.io");
    }

    #[test]
    fn handler_object_is_typed() {
        let handler = nmstate_handler();
        assert_eq!(handler.metadata.name.as_deref(), Some(NMSTATE_NAME));
        let types = handler.types.unwrap();
        assert_eq!(types.kind, "NMState");
        assert_eq!(types.api_version, "nmstate.io/v1");
    }
}
