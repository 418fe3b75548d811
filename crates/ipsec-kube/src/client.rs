//! Cluster access through the Kubernetes API
//!
//! OpenShift resources are addressed as `DynamicObject`s, core resources as
//! typed `k8s-openapi` objects. API failures are mapped onto `ClusterError`
//! from the response status code:
//! - 409 is an optimistic-concurrency rejection and becomes `Conflict`
//! - 404 becomes `NotFound`
//! - 429/5xx and dropped connections become `Transient`
//!
//! Remote commands run over the pod exec subresource and keep their exit code.

use crate::manifests::{self, NETWORK_RECORD, NMSTATE_NAME};
use crate::parse;
use async_trait::async_trait;
use ipsec_core::{
    ClusterError, ClusterOperatorStatus, ExtensionApi, FleetSettings, FleetStatusApi,
    MachineConfigPoolStatus, NetworkConfig, NetworkConfigApi, NodeInfo, NodePolicyApi, PodExec,
    PodRef, ProbePods, TrialPodApi, WorkloadStatus,
};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::wait::await_condition;
use kube::{Client, ResourceExt};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

pub const DEFAULT_NAMESPACE: &str = "ipsec-probes";

/// Image with tcpdump, ping and ovs tooling
pub const DEFAULT_CAPTURE_IMAGE: &str = "quay.io/openshift/origin-network-tools:latest";

const FIELD_MANAGER: &str = "ipsec-rollout";
const WORKER_SELECTOR: &str = "node-role.kubernetes.io/worker";
const OVNKUBE_NODE_SELECTOR: &str = "app=ovnkube-node";
const OVS_CONTAINER: &str = "ovn-controller";
const HANDLER_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Map an API failure onto the engine's error classes
#[must_use]
pub fn classify(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => ClusterError::NotFound(ae.message),
            409 => ClusterError::Conflict(ae.message),
            429 | 500 | 502 | 503 | 504 => ClusterError::Transient(ae.message),
            code => ClusterError::Api(format!("{} ({code}): {}", ae.reason, ae.message)),
        },
        e @ (kube::Error::HyperError(_) | kube::Error::Service(_)) => {
            ClusterError::Transient(e.to_string())
        }
        e => ClusterError::Api(e.to_string()),
    }
}

async fn drain(reader: Option<impl AsyncRead + Unpin>) -> Result<String, ClusterError> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_string(&mut out)
            .await
            .map_err(|e| ClusterError::Io(format!("read exec stream: {e}")))?;
    }
    Ok(out)
}

/// Kubernetes API backend
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    namespace: String,
    fleet: FleetSettings,
    capture_image: String,
    pod_ready_timeout: Duration,
}

impl std::fmt::Debug for KubeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBackend")
            .field("namespace", &self.namespace)
            .field("capture_image", &self.capture_image)
            .field("pod_ready_timeout", &self.pod_ready_timeout)
            .finish_non_exhaustive()
    }
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: DEFAULT_NAMESPACE.to_string(),
            fleet: FleetSettings::default(),
            capture_image: DEFAULT_CAPTURE_IMAGE.to_string(),
            pod_ready_timeout: Duration::from_secs(180),
        }
    }

    /// Backend using the ambient configuration (in-cluster or `$KUBECONFIG`)
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Api(format!("infer client config: {e}")))?;
        Ok(Self::new(client))
    }

    pub async fn from_kubeconfig(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let path = path.as_ref();
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| ClusterError::Api(format!("read {}: {e}", path.display())))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Api(format!("load {}: {e}", path.display())))?;
        let client = Client::try_from(config)
            .map_err(|e| ClusterError::Api(format!("create client: {e}")))?;
        Ok(Self::new(client))
    }

    /// Namespace the probe pods are created in
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_fleet_settings(mut self, fleet: FleetSettings) -> Self {
        self.fleet = fleet;
        self
    }

    #[must_use]
    pub fn with_capture_image(mut self, image: impl Into<String>) -> Self {
        self.capture_image = image.into();
        self
    }

    #[must_use]
    pub fn with_pod_ready_timeout(mut self, timeout: Duration) -> Self {
        self.pod_ready_timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn dynamic(&self, resource: &kube::discovery::ApiResource) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), resource)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Run `command` in a pod, returning stdout
    async fn run_in(
        &self,
        pods: &Api<Pod>,
        name: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<String, ClusterError> {
        let mut params = AttachParams::default().stdout(true).stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }
        debug!(pod = name, ?command, "exec");

        let mut attached = pods.exec(name, command, &params).await.map_err(classify)?;
        let status = attached.take_status();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::join!(drain(stdout), drain(stderr));
        let (stdout, stderr) = (stdout?, stderr?);

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            debug!(pod = name, error = %e, "exec session closed with error");
        }

        match status.map(|s| parse::exit_code(&s)) {
            None | Some(0) => Ok(stdout),
            Some(exit_code) => Err(ClusterError::CommandFailed {
                exit_code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }

    async fn create_pod(&self, pod: &Pod) -> Result<PodRef, ClusterError> {
        let api = self.pods(&self.namespace);
        let created = api
            .create(&PostParams::default(), pod)
            .await
            .map_err(classify)?;
        let name = created.name_any();

        let ready = tokio::time::timeout(
            self.pod_ready_timeout,
            await_condition(api.clone(), &name, parse::pod_ready),
        )
        .await;
        let ready = match ready {
            Ok(Ok(Some(pod))) => parse::pod_ref(&pod).map_err(ClusterError::from),
            Ok(Ok(None)) => Err(ClusterError::NotFound(format!("pod {name} disappeared"))),
            Ok(Err(e)) => Err(ClusterError::Api(format!("watch pod {name}: {e}"))),
            Err(_) => Err(ClusterError::Api(format!(
                "pod {name} not ready after {}s",
                self.pod_ready_timeout.as_secs()
            ))),
        };
        if ready.is_err() {
            self.remove_pod(&name).await;
        }
        ready
    }

    /// Best-effort removal of a pod that never became usable
    async fn remove_pod(&self, name: &str) {
        let res = self
            .pods(&self.namespace)
            .delete(name, &DeleteParams::default().grace_period(0))
            .await;
        match res {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => warn!(pod = name, error = %e, "could not remove probe pod"),
        }
    }

    async fn apply(
        &self,
        resource: &kube::discovery::ApiResource,
        obj: &DynamicObject,
    ) -> Result<(), ClusterError> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or(parse::ParseError::MissingField("metadata.name"))?;
        self.dynamic(resource)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(obj),
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(
        &self,
        resource: &kube::discovery::ApiResource,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.dynamic(resource)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

#[async_trait]
impl NetworkConfigApi for KubeBackend {
    async fn get_network_config(&self) -> Result<NetworkConfig, ClusterError> {
        let obj = self
            .dynamic(&manifests::network_operator())
            .get(NETWORK_RECORD)
            .await
            .map_err(classify)?;
        Ok(parse::network_config(&obj)?)
    }

    async fn update_network_config(
        &self,
        config: &NetworkConfig,
    ) -> Result<NetworkConfig, ClusterError> {
        let patch = parse::network_patch(config);
        let obj = self
            .dynamic(&manifests::network_operator())
            .patch(
                NETWORK_RECORD,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(classify)?;
        Ok(parse::network_config(&obj)?)
    }
}

#[async_trait]
impl FleetStatusApi for KubeBackend {
    async fn machine_config_pools(&self) -> Result<Vec<MachineConfigPoolStatus>, ClusterError> {
        let pools = self
            .dynamic(&manifests::machine_config_pool())
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        pools
            .iter()
            .map(|p| parse::machine_config_pool(p).map_err(ClusterError::from))
            .collect()
    }

    async fn cluster_operators(&self) -> Result<Vec<ClusterOperatorStatus>, ClusterError> {
        let operators = self
            .dynamic(&manifests::cluster_operator())
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        operators
            .iter()
            .map(|o| parse::cluster_operator(o).map_err(ClusterError::from))
            .collect()
    }

    async fn security_daemon(&self) -> Result<Option<WorkloadStatus>, ClusterError> {
        let api: Api<DaemonSet> =
            Api::namespaced(self.client.clone(), &self.fleet.daemon_namespace);
        let ds = api
            .get_opt(&self.fleet.daemon_name)
            .await
            .map_err(classify)?;
        Ok(ds.as_ref().map(parse::workload_status))
    }
}

#[async_trait]
impl PodExec for KubeBackend {
    async fn exec(&self, pod: &PodRef, command: &[String]) -> Result<String, ClusterError> {
        self.run_in(&self.pods(&pod.namespace), &pod.name, None, command.to_vec())
            .await
    }
}

#[async_trait]
impl TrialPodApi for KubeBackend {
    async fn schedulable_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().labels(WORKER_SELECTOR))
            .await
            .map_err(classify)?;
        Ok(parse::schedulable_nodes(&nodes.items)?)
    }

    async fn bridge_interface(&self, node: &str, bridge: &str) -> Result<String, ClusterError> {
        let pods = self.pods(&self.fleet.daemon_namespace);
        let on_node = pods
            .list(
                &ListParams::default()
                    .labels(OVNKUBE_NODE_SELECTOR)
                    .fields(&format!("spec.nodeName={node}")),
            )
            .await
            .map_err(classify)?;
        let ovnkube = on_node
            .items
            .first()
            .map(ResourceExt::name_any)
            .ok_or_else(|| ClusterError::NotFound(format!("ovnkube-node pod on {node}")))?;

        let command = ["ovs-vsctl", "list-ports", bridge]
            .map(str::to_string)
            .to_vec();
        let out = self
            .run_in(&pods, &ovnkube, Some(OVS_CONTAINER), command)
            .await?;
        parse::bridge_port(&out)
            .ok_or_else(|| ClusterError::NotFound(format!("physical port on {bridge} of {node}")))
    }

    async fn capture_image(&self) -> Result<String, ClusterError> {
        Ok(self.capture_image.clone())
    }

    async fn launch_probe_pods(
        &self,
        node: &str,
        image: &str,
        name_prefix: &str,
    ) -> Result<ProbePods, ClusterError> {
        let traffic = manifests::traffic_pod(name_prefix, &self.namespace, node, image);
        let capture = manifests::capture_pod(name_prefix, &self.namespace, node, image);

        let (traffic, capture) = tokio::join!(self.create_pod(&traffic), self.create_pod(&capture));
        match (traffic, capture) {
            (Ok(traffic), Ok(capture)) => Ok(ProbePods { traffic, capture }),
            (Ok(pod), Err(e)) | (Err(e), Ok(pod)) => {
                self.remove_pod(&pod.name).await;
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ClusterError> {
        self.pods(&pod.namespace)
            .delete(&pod.name, &DeleteParams::default().grace_period(0))
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

#[async_trait]
impl NodePolicyApi for KubeBackend {
    async fn deploy_handler(&self) -> Result<(), ClusterError> {
        let resource = manifests::nmstate();
        self.apply(&resource, &manifests::nmstate_handler()).await?;

        let available = |obj: Option<&DynamicObject>| obj.is_some_and(parse::is_available);
        match tokio::time::timeout(
            HANDLER_READY_TIMEOUT,
            await_condition(self.dynamic(&resource), NMSTATE_NAME, available),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ClusterError::Api(format!("watch {NMSTATE_NAME}: {e}"))),
            Err(_) => Err(ClusterError::Api(format!(
                "{NMSTATE_NAME} not available after {}s",
                HANDLER_READY_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn undeploy_handler(&self) -> Result<(), ClusterError> {
        self.delete(&manifests::nmstate(), NMSTATE_NAME).await
    }

    async fn apply_policy(&self, manifest: &str) -> Result<(), ClusterError> {
        let obj = parse::dynamic_object(manifest)?;
        self.apply(&manifests::node_network_policy(), &obj).await
    }

    async fn policy_status(&self, name: &str) -> Result<String, ClusterError> {
        let obj = self
            .dynamic(&manifests::node_network_policy())
            .get(name)
            .await
            .map_err(classify)?;
        Ok(parse::policy_status(&obj)?)
    }

    async fn delete_policy(&self, name: &str) -> Result<(), ClusterError> {
        self.delete(&manifests::node_network_policy(), name).await
    }
}

#[async_trait]
impl ExtensionApi for KubeBackend {
    async fn create_extension(&self, name: &str, manifest: &str) -> Result<(), ClusterError> {
        let mut obj = parse::dynamic_object(manifest)?;
        if obj.metadata.name.is_none() {
            obj.metadata.name = Some(name.to_string());
        }
        debug!(extension = name, "creating machine config");
        self.dynamic(&manifests::machine_config())
            .create(&PostParams::default(), &obj)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_extension(&self, name: &str) -> Result<(), ClusterError> {
        self.delete(&manifests::machine_config(), name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn stale_version_is_conflict() {
        let err = classify(api_error(
            409,
            "Conflict",
            "Operation cannot be fulfilled on networks.operator.openshift.io \"cluster\": the object has been modified",
        ));
        assert!(err.is_conflict());
    }

    #[test]
    fn missing_object_is_not_found() {
        let err = classify(api_error(404, "NotFound", "pods \"x\" not found"));
        assert!(err.is_not_found());
    }

    #[test]
    fn unavailable_server_is_transient() {
        assert!(classify(api_error(503, "ServiceUnavailable", "etcdserver: leader changed")).is_transient());
        assert!(classify(api_error(429, "TooManyRequests", "slow down")).is_transient());
    }

    #[test]
    fn not_found_text_without_404_is_not_absence() {
        let err = classify(api_error(
            403,
            "Forbidden",
            "namespaces \"prod\" not found in allowed scope",
        ));
        assert!(!err.is_not_found());
        assert!(matches!(err, ClusterError::Api(ref msg) if msg.contains("Forbidden (403)")));
    }

    #[tokio::test]
    async fn unreadable_kubeconfig_is_not_absence() {
        let err = KubeBackend::from_kubeconfig("/nonexistent/kubeconfig")
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(err, ClusterError::Api(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let backend = KubeBackend::new(Client::try_from(config).unwrap());
        let err = backend.security_daemon().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn builder_sets_namespace_and_image() {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let backend = KubeBackend::new(Client::try_from(config).unwrap())
            .with_namespace("probes")
            .with_capture_image("registry.local/network-tools:4.16");
        assert_eq!(backend.namespace(), "probes");
        assert_eq!(
            backend.capture_image().await.unwrap(),
            "registry.local/network-tools:4.16"
        );
    }
}
