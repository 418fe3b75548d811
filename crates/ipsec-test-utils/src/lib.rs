//! Testing utilities for the IPsec rollout workspace
//!
//! `SimCluster` implements every collaborator trait in memory:
//! - the mode record with version-checked updates
//! - time-based machine-config rollouts driven by `tokio::time`
//! - a wire model answering tcpdump and ping according to the applied mode
//! - one-shot fault, conflict and transient-error injection

#![allow(missing_docs)]

pub mod fixtures;

use async_trait::async_trait;
use ipsec_core::north_south::NodePolicy;
use ipsec_core::{
    ClusterError, ClusterHandles, ClusterOperatorStatus, EncapSignature, ExtensionApi,
    FleetSettings, FleetStatusApi, IpsecConfig, MachineConfigPoolStatus, NetworkConfig,
    NetworkConfigApi, NodeInfo, NodePolicyApi, PodExec, PodRef, ProbePods, SecurityMode,
    TrialPodApi, WorkloadStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Namespace probe pods are created in
pub const PROBE_NAMESPACE: &str = "ipsec-probe";

const CAPTURE_IMAGE: &str = "quay.io/openshift/network-tools:latest";
const PHYSICAL_INTERFACE: &str = "ens3";

/// Backend call that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    GetNetworkConfig,
    UpdateNetworkConfig,
    MachineConfigPools,
    ClusterOperators,
    SecurityDaemon,
    Exec,
    SchedulableNodes,
    BridgeInterface,
    CaptureImage,
    LaunchProbePods,
    DeletePod,
    DeployHandler,
    UndeployHandler,
    ApplyPolicy,
    PolicyStatus,
    DeletePolicy,
    CreateExtension,
    DeleteExtension,
}

#[derive(Debug, Clone, Copy)]
struct ModeRollout {
    target: SecurityMode,
    started: Instant,
}

#[derive(Debug, Clone, Copy)]
struct ExtensionState {
    /// Whether the extension object exists (rollout towards present)
    present: bool,
    since: Instant,
}

#[derive(Debug, Clone)]
struct SimPod {
    pod: PodRef,
    node: String,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    op: SimOp,
    skip: u32,
}

#[derive(Debug)]
struct SimState {
    record: NetworkConfig,
    version: u64,
    writes: u32,
    applied: SecurityMode,
    rollout: Option<ModeRollout>,
    nodes: Vec<NodeInfo>,
    extensions: BTreeMap<String, ExtensionState>,
    handler_deployed: bool,
    policies: BTreeMap<String, NodePolicy>,
    pods: BTreeMap<String, SimPod>,
    pod_seq: u32,
    faults: Vec<Fault>,
    conflicts: u32,
    transients: u32,
    stalled: bool,
    blackholed: BTreeSet<String>,
}

/// In-memory cluster implementing every collaborator trait
#[derive(Debug)]
pub struct SimCluster {
    state: Mutex<SimState>,
    fleet: FleetSettings,
    rollout_duration: Duration,
}

impl SimCluster {
    /// Three worker nodes, IPsec never configured
    #[must_use]
    pub fn new() -> Self {
        Self::with_workers(3)
    }

    #[must_use]
    pub fn with_workers(count: u8) -> Self {
        let nodes = (0..count)
            .map(|i| NodeInfo {
                name: format!("worker-{i}"),
                internal_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + i)),
            })
            .collect();
        Self {
            state: Mutex::new(SimState {
                record: NetworkConfig {
                    resource_version: "1".into(),
                    ipsec: None,
                },
                version: 1,
                writes: 0,
                applied: SecurityMode::Disabled,
                rollout: None,
                nodes,
                extensions: BTreeMap::new(),
                handler_deployed: false,
                policies: BTreeMap::new(),
                pods: BTreeMap::new(),
                pod_seq: 0,
                faults: Vec::new(),
                conflicts: 0,
                transients: 0,
                stalled: false,
                blackholed: BTreeSet::new(),
            }),
            fleet: FleetSettings::default(),
            rollout_duration: Duration::from_secs(5 * 60),
        }
    }

    /// Start with `mode` already applied everywhere
    #[must_use]
    pub fn with_mode(self, mode: SecurityMode) -> Self {
        {
            let mut st = self.state.lock();
            st.record.ipsec = Some(IpsecConfig {
                mode: mode.as_str().to_string(),
            });
            st.applied = mode;
        }
        self
    }

    /// Start with the legacy empty mode string, which clusters run as Full
    #[must_use]
    pub fn with_legacy_default(self) -> Self {
        {
            let mut st = self.state.lock();
            st.record.ipsec = Some(IpsecConfig::default());
            st.applied = SecurityMode::Full;
        }
        self
    }

    /// Time a machine-config rollout takes to settle
    #[must_use]
    pub fn with_rollout_duration(mut self, duration: Duration) -> Self {
        self.rollout_duration = duration;
        self
    }

    /// Split into per-capability handles
    #[must_use]
    pub fn handles(self: &Arc<Self>) -> ClusterHandles {
        ClusterHandles::from_backend(self.clone())
    }

    // Fault injection

    /// Rollouts in progress, and any started later, stop settling
    pub fn stall_rollouts(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Next call of `op` fails
    pub fn fail_on(&self, op: SimOp) {
        self.fail_after(op, 0);
    }

    /// Call `op` succeeds `skip` more times, then fails once
    pub fn fail_after(&self, op: SimOp, skip: u32) {
        self.state.lock().faults.push(Fault { op, skip });
    }

    /// Next `count` record updates report a version conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().conflicts = count;
    }

    /// Next `count` fleet status reads drop the connection
    pub fn inject_transient(&self, count: u32) {
        self.state.lock().transients = count;
    }

    /// `node` neither sends nor receives anything
    pub fn blackhole_node(&self, node: &str) {
        self.state.lock().blackholed.insert(node.to_string());
    }

    // Inspection

    #[must_use]
    pub fn record(&self) -> NetworkConfig {
        self.state.lock().record.clone()
    }

    /// Mode the record asks for
    #[must_use]
    pub fn requested_mode(&self) -> SecurityMode {
        self.state
            .lock()
            .record
            .effective_mode()
            .unwrap_or(SecurityMode::Disabled)
    }

    /// Mode the fleet actually runs
    #[must_use]
    pub fn applied_mode(&self) -> SecurityMode {
        let mut st = self.state.lock();
        self.tick(&mut st);
        st.applied
    }

    /// Successful record updates so far
    #[must_use]
    pub fn write_count(&self) -> u32 {
        self.state.lock().writes
    }

    #[must_use]
    pub fn live_pods(&self) -> Vec<PodRef> {
        self.state.lock().pods.values().map(|p| p.pod.clone()).collect()
    }

    #[must_use]
    pub fn policy_names(&self) -> Vec<String> {
        self.state.lock().policies.keys().cloned().collect()
    }

    #[must_use]
    pub fn handler_deployed(&self) -> bool {
        self.state.lock().handler_deployed
    }

    /// Extension objects that still exist, including ones being removed
    #[must_use]
    pub fn extension_names(&self) -> Vec<String> {
        let mut st = self.state.lock();
        self.tick(&mut st);
        st.extensions.keys().cloned().collect()
    }

    // Internals

    fn settled(&self, since: Instant, stalled: bool) -> bool {
        !stalled && since.elapsed() >= self.rollout_duration
    }

    /// Apply any rollout whose time has come
    fn tick(&self, st: &mut SimState) {
        if let Some(rollout) = st.rollout {
            if self.settled(rollout.started, st.stalled) {
                tracing::debug!(mode = %rollout.target, "sim rollout settled");
                st.applied = rollout.target;
                st.rollout = None;
            }
        }
        let stalled = st.stalled;
        st.extensions
            .retain(|_, ext| ext.present || !self.settled(ext.since, stalled));
    }

    fn trip(&self, op: SimOp) -> Result<(), ClusterError> {
        let mut st = self.state.lock();
        if let Some(idx) = st.faults.iter().position(|f| f.op == op) {
            if st.faults[idx].skip == 0 {
                st.faults.remove(idx);
                return Err(ClusterError::Api(format!("injected failure on {op:?}")));
            }
            st.faults[idx].skip -= 1;
        }
        Ok(())
    }

    fn trip_transient(&self) -> Result<(), ClusterError> {
        let mut st = self.state.lock();
        if st.transients > 0 {
            st.transients -= 1;
            return Err(ClusterError::Transient("connection reset by peer".into()));
        }
        Ok(())
    }

    fn extensions_rolling(&self, st: &SimState) -> bool {
        st.extensions
            .values()
            .any(|ext| !self.settled(ext.since, st.stalled))
    }

    /// Worker-pool sources contributed by extension objects
    fn rendered_extensions(&self, st: &SimState) -> Vec<String> {
        st.extensions
            .iter()
            .filter(|(_, ext)| ext.present == self.settled(ext.since, st.stalled))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn pool(&self, st: &SimState, name: &str, count: u32, rolling: bool) -> MachineConfigPoolStatus {
        let master = name == MachineConfigPoolStatus::MASTER;
        let mut sources = vec![format!("00-{name}"), format!("01-{name}-kubelet")];
        if st.applied.requires_extensions() {
            sources.push(if master {
                self.fleet.master_extension.clone()
            } else {
                self.fleet.worker_extension.clone()
            });
        }
        if !master {
            sources.extend(self.rendered_extensions(st));
        }
        MachineConfigPoolStatus {
            name: name.to_string(),
            machine_count: count,
            updated_machine_count: if rolling { count.saturating_sub(1) } else { count },
            degraded_machine_count: 0,
            updating: rolling,
            degraded: false,
            configuration_sources: sources,
        }
    }

    fn node_of_ip(st: &SimState, ip: IpAddr) -> Option<&NodeInfo> {
        st.nodes.iter().find(|n| n.internal_ip == ip)
    }

    /// Host-to-host tunnel rendered in both directions between `a` and `b`
    fn tunnel_between(&self, st: &SimState, a: IpAddr, b: IpAddr) -> bool {
        if !st.handler_deployed || self.rendered_extensions(st).is_empty() {
            return false;
        }
        let has = |left: IpAddr, right: IpAddr| {
            st.policies
                .values()
                .filter_map(NodePolicy::tunnel)
                .any(|t| t.left == left && t.right == right)
        };
        has(a, b) && has(b, a)
    }

    /// Encapsulation carried on the wire from `src` to `dst`
    fn wire_signature(&self, st: &SimState, src: IpAddr, dst: IpAddr) -> EncapSignature {
        EncapSignature::for_encrypted(
            st.applied.encrypts_pod_traffic() || self.tunnel_between(st, src, dst),
        )
    }

    fn run_capture(&self, st: &SimState, pod: &SimPod, filter: &str) -> Result<String, ClusterError> {
        let no_match = || ClusterError::CommandFailed {
            exit_code: 124,
            stderr: "0 packets captured".into(),
        };
        let (signature, rest) = if let Some(rest) = filter.strip_prefix("esp and ") {
            (EncapSignature::Esp, rest)
        } else if let Some(rest) = filter.strip_prefix("udp port 6081 and ") {
            (EncapSignature::Geneve, rest)
        } else {
            return Err(no_match());
        };
        let (src, dst) = parse_endpoints(rest).ok_or_else(no_match)?;

        let Some(node) = st.nodes.iter().find(|n| n.name == pod.node) else {
            return Err(no_match());
        };
        let dst_node = Self::node_of_ip(st, dst);
        let reachable = !st.blackholed.contains(&node.name)
            && dst_node.is_some_and(|n| !st.blackholed.contains(&n.name));

        if node.internal_ip == src && reachable && self.wire_signature(st, src, dst) == signature {
            Ok(format!(
                "{src} > {dst}: {signature}\n1 packet captured\n"
            ))
        } else {
            Err(no_match())
        }
    }

    fn run_ping(&self, st: &SimState, pod: &SimPod, count: &str, target: &str) -> Result<String, ClusterError> {
        let unreachable = || ClusterError::CommandFailed {
            exit_code: 1,
            stderr: format!("{count} packets transmitted, 0 received, 100% packet loss"),
        };
        let target_ip: IpAddr = target.parse().map_err(|_| unreachable())?;
        let Some(peer) = st.pods.values().find(|p| p.pod.ip == target_ip) else {
            return Err(unreachable());
        };
        if st.blackholed.contains(&pod.node) || st.blackholed.contains(&peer.node) {
            return Err(unreachable());
        }
        Ok(format!("{count} packets transmitted, {count} received, 0% packet loss\n"))
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `src A and dst B`
fn parse_endpoints(rest: &str) -> Option<(IpAddr, IpAddr)> {
    let rest = rest.strip_prefix("src ")?;
    let (src, dst) = rest.split_once(" and dst ")?;
    Some((src.trim().parse().ok()?, dst.trim().parse().ok()?))
}

#[async_trait]
impl NetworkConfigApi for SimCluster {
    async fn get_network_config(&self) -> Result<NetworkConfig, ClusterError> {
        self.trip(SimOp::GetNetworkConfig)?;
        let snapshot = self.state.lock().record.clone();
        // let concurrent writers interleave between read and write
        tokio::task::yield_now().await;
        Ok(snapshot)
    }

    async fn update_network_config(
        &self,
        config: &NetworkConfig,
    ) -> Result<NetworkConfig, ClusterError> {
        self.trip(SimOp::UpdateNetworkConfig)?;
        let mut st = self.state.lock();
        self.tick(&mut st);

        if st.conflicts > 0 {
            st.conflicts -= 1;
            return Err(ClusterError::Conflict("the object has been modified".into()));
        }
        if config.resource_version != st.record.resource_version {
            return Err(ClusterError::Conflict(format!(
                "the object has been modified; stale version {}",
                config.resource_version
            )));
        }

        let requested = config
            .effective_mode()
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        let previous = st.record.effective_mode().ok();
        st.version += 1;
        st.writes += 1;
        let version = st.version.to_string();
        st.record = NetworkConfig {
            resource_version: version,
            ipsec: config.ipsec.clone(),
        };

        if previous != Some(requested) {
            st.rollout = Some(ModeRollout {
                target: requested,
                started: Instant::now(),
            });
        }
        Ok(st.record.clone())
    }
}

#[async_trait]
impl FleetStatusApi for SimCluster {
    async fn machine_config_pools(&self) -> Result<Vec<MachineConfigPoolStatus>, ClusterError> {
        self.trip(SimOp::MachineConfigPools)?;
        self.trip_transient()?;
        let mut st = self.state.lock();
        self.tick(&mut st);
        let mode_rolling = st.rollout.is_some();
        let workers = u32::try_from(st.nodes.len()).unwrap_or(u32::MAX);
        let extensions_rolling = self.extensions_rolling(&st);
        Ok(vec![
            self.pool(&st, MachineConfigPoolStatus::MASTER, 3, mode_rolling),
            self.pool(&st, "worker", workers, mode_rolling || extensions_rolling),
        ])
    }

    async fn cluster_operators(&self) -> Result<Vec<ClusterOperatorStatus>, ClusterError> {
        self.trip(SimOp::ClusterOperators)?;
        self.trip_transient()?;
        let mut st = self.state.lock();
        self.tick(&mut st);
        let rolling = st.rollout.is_some();
        Ok(["dns", "machine-config", "network"]
            .into_iter()
            .map(|name| ClusterOperatorStatus {
                name: name.to_string(),
                available: true,
                progressing: rolling && name != "dns",
                degraded: false,
            })
            .collect())
    }

    async fn security_daemon(&self) -> Result<Option<WorkloadStatus>, ClusterError> {
        self.trip(SimOp::SecurityDaemon)?;
        self.trip_transient()?;
        let mut st = self.state.lock();
        self.tick(&mut st);
        if st.applied != SecurityMode::Full {
            return Ok(None);
        }
        let nodes = u32::try_from(st.nodes.len()).unwrap_or(u32::MAX) + 3;
        Ok(Some(WorkloadStatus {
            desired_number_scheduled: nodes,
            number_ready: nodes,
        }))
    }
}

#[async_trait]
impl PodExec for SimCluster {
    async fn exec(&self, pod: &PodRef, command: &[String]) -> Result<String, ClusterError> {
        self.trip(SimOp::Exec)?;
        let mut st = self.state.lock();
        self.tick(&mut st);
        let Some(sim_pod) = st.pods.get(&pod.name).cloned() else {
            return Err(ClusterError::NotFound(format!("pod {pod}")));
        };

        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["timeout", _, "tcpdump", .., filter] => self.run_capture(&st, &sim_pod, filter),
            ["ping", "-c", count, target] => self.run_ping(&st, &sim_pod, count, target),
            _ => Err(ClusterError::CommandFailed {
                exit_code: 127,
                stderr: format!("unsupported command: {}", command.join(" ")),
            }),
        }
    }
}

#[async_trait]
impl TrialPodApi for SimCluster {
    async fn schedulable_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        self.trip(SimOp::SchedulableNodes)?;
        Ok(self.state.lock().nodes.clone())
    }

    async fn bridge_interface(&self, node: &str, _bridge: &str) -> Result<String, ClusterError> {
        self.trip(SimOp::BridgeInterface)?;
        if self.state.lock().nodes.iter().any(|n| n.name == node) {
            Ok(PHYSICAL_INTERFACE.to_string())
        } else {
            Err(ClusterError::NotFound(format!("node {node}")))
        }
    }

    async fn capture_image(&self) -> Result<String, ClusterError> {
        self.trip(SimOp::CaptureImage)?;
        Ok(CAPTURE_IMAGE.to_string())
    }

    async fn launch_probe_pods(
        &self,
        node: &str,
        _image: &str,
        name_prefix: &str,
    ) -> Result<ProbePods, ClusterError> {
        self.trip(SimOp::LaunchProbePods)?;
        let mut st = self.state.lock();
        let Some(idx) = st.nodes.iter().position(|n| n.name == node) else {
            return Err(ClusterError::NotFound(format!("node {node}")));
        };
        let node_ip = st.nodes[idx].internal_ip;
        st.pod_seq += 1;
        let seq = st.pod_seq;

        let octet = u8::try_from(idx).unwrap_or(u8::MAX);
        let last = u8::try_from(seq % 250 + 2).unwrap_or(2);
        let traffic = PodRef {
            name: format!("{name_prefix}ping-{node}-{seq}"),
            namespace: PROBE_NAMESPACE.to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 128, octet, last)),
        };
        let capture = PodRef {
            name: format!("{name_prefix}dump-{node}-{seq}"),
            namespace: PROBE_NAMESPACE.to_string(),
            ip: node_ip,
        };
        for pod in [&traffic, &capture] {
            st.pods.insert(
                pod.name.clone(),
                SimPod {
                    pod: pod.clone(),
                    node: node.to_string(),
                },
            );
        }
        Ok(ProbePods { traffic, capture })
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ClusterError> {
        self.trip(SimOp::DeletePod)?;
        match self.state.lock().pods.remove(&pod.name) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(format!("pod {pod}"))),
        }
    }
}

#[async_trait]
impl NodePolicyApi for SimCluster {
    async fn deploy_handler(&self) -> Result<(), ClusterError> {
        self.trip(SimOp::DeployHandler)?;
        self.state.lock().handler_deployed = true;
        Ok(())
    }

    async fn undeploy_handler(&self) -> Result<(), ClusterError> {
        self.trip(SimOp::UndeployHandler)?;
        self.state.lock().handler_deployed = false;
        Ok(())
    }

    async fn apply_policy(&self, manifest: &str) -> Result<(), ClusterError> {
        self.trip(SimOp::ApplyPolicy)?;
        let policy =
            NodePolicy::from_yaml(manifest).map_err(|e| ClusterError::Decode(e.to_string()))?;
        self.state
            .lock()
            .policies
            .insert(policy.name().to_string(), policy);
        Ok(())
    }

    async fn policy_status(&self, name: &str) -> Result<String, ClusterError> {
        self.trip(SimOp::PolicyStatus)?;
        let mut st = self.state.lock();
        self.tick(&mut st);
        let Some(policy) = st.policies.get(name) else {
            return Err(ClusterError::NotFound(format!("policy {name}")));
        };
        let node_known = policy
            .node()
            .is_some_and(|node| st.nodes.iter().any(|n| n.name == node));
        let rendered = st.handler_deployed && !self.rendered_extensions(&st).is_empty();
        if node_known && rendered {
            Ok("SuccessfullyConfigured: 1/1 nodes successfully configured".into())
        } else {
            Ok("ConfigurationProgressing: 0/1 nodes successfully configured".into())
        }
    }

    async fn delete_policy(&self, name: &str) -> Result<(), ClusterError> {
        self.trip(SimOp::DeletePolicy)?;
        match self.state.lock().policies.remove(name) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(format!("policy {name}"))),
        }
    }
}

#[async_trait]
impl ExtensionApi for SimCluster {
    async fn create_extension(&self, name: &str, manifest: &str) -> Result<(), ClusterError> {
        self.trip(SimOp::CreateExtension)?;
        serde_yaml::from_str::<serde_yaml::Value>(manifest)
            .map_err(|e| ClusterError::Decode(e.to_string()))?;
        let mut st = self.state.lock();
        self.tick(&mut st);
        if st.extensions.get(name).is_some_and(|ext| ext.present) {
            return Err(ClusterError::Api(format!("extension {name} already exists")));
        }
        st.extensions.insert(
            name.to_string(),
            ExtensionState {
                present: true,
                since: Instant::now(),
            },
        );
        Ok(())
    }

    async fn delete_extension(&self, name: &str) -> Result<(), ClusterError> {
        self.trip(SimOp::DeleteExtension)?;
        let mut st = self.state.lock();
        self.tick(&mut st);
        match st.extensions.get_mut(name) {
            Some(ext) if ext.present => {
                ext.present = false;
                ext.since = Instant::now();
                Ok(())
            }
            _ => Err(ClusterError::NotFound(format!("extension {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rollout_settles_after_duration() {
        let sim = SimCluster::new();
        let mut cfg = sim.get_network_config().await.unwrap();
        cfg.apply_mode(SecurityMode::Full);
        sim.update_network_config(&cfg).await.unwrap();

        assert_eq!(sim.applied_mode(), SecurityMode::Disabled);
        assert!(sim.machine_config_pools().await.unwrap()[0].updating);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(sim.applied_mode(), SecurityMode::Full);
        assert!(sim.security_daemon().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let sim = SimCluster::new();
        let mut stale = sim.get_network_config().await.unwrap();
        let mut fresh = stale.clone();
        fresh.apply_mode(SecurityMode::External);
        sim.update_network_config(&fresh).await.unwrap();

        stale.apply_mode(SecurityMode::Full);
        let err = sim.update_network_config(&stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(sim.write_count(), 1);
    }

    #[tokio::test]
    async fn capture_follows_applied_mode() {
        let sim = SimCluster::new().with_mode(SecurityMode::Full);
        let pods = sim.launch_probe_pods("worker-0", CAPTURE_IMAGE, "p-").await.unwrap();
        let cmd = |filter: &str| -> Vec<String> {
            ["timeout", "10", "tcpdump", "-i", "ens3", "-c", "1", "-v", "--direction=out", filter]
                .into_iter()
                .map(String::from)
                .collect()
        };

        let esp = cmd("esp and src 10.0.0.10 and dst 10.0.0.11");
        assert!(sim.exec(&pods.capture, &esp).await.is_ok());

        let geneve = cmd("udp port 6081 and src 10.0.0.10 and dst 10.0.0.11");
        let err = sim.exec(&pods.capture, &geneve).await.unwrap_err();
        assert!(matches!(err, ClusterError::CommandFailed { exit_code: 124, .. }));
    }

    #[tokio::test]
    async fn faults_are_one_shot() {
        let sim = SimCluster::new();
        sim.fail_after(SimOp::CaptureImage, 1);
        assert!(sim.capture_image().await.is_ok());
        assert!(sim.capture_image().await.is_err());
        assert!(sim.capture_image().await.is_ok());
    }
}
