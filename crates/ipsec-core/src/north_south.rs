//! Host-to-host (north-south) tunnel provisioning
//!
//! Layered on top of External mode:
//! - a certificate bundle shipped to worker pools as a configuration extension
//! - a policy-rendering handler
//! - one declarative ipsec interface policy per side of the trial pair
//!
//! Every artefact is recorded in `ProvisionedArtifacts` as soon as it exists,
//! so teardown removes exactly what was created.

use crate::api::{ExtensionApi, NodePolicyApi};
use crate::config::NorthSouthSettings;
use crate::convergence::{ConvergenceProbe, FleetConvergenceChecker};
use crate::error::RolloutError;
use crate::poller::poll_or_timeout;
use crate::types::{ConvergenceDeadline, NodeEndpoint, TrialPair};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Interface name of the host-to-host tunnel
pub const TUNNEL_INTERFACE: &str = "hosta_conn";

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

static CONFIGURED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)/(\d+) nodes successfully configured").expect("valid status pattern")
});

/// Whether a rendered policy status reports every selected node configured
#[must_use]
pub fn policy_converged(status: &str) -> bool {
    CONFIGURED.captures(status).is_some_and(|caps| {
        let done = caps[1].parse::<u32>().ok();
        let total = caps[2].parse::<u32>().ok();
        matches!((done, total), (Some(d), Some(t)) if t > 0 && d == t)
    })
}

/// Fail if the certificate bundle is no longer valid at `now`
pub fn check_certificate_validity(
    expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), RolloutError> {
    if now >= expiry {
        return Err(RolloutError::ExpiredPrerequisite(format!(
            "north-south certificates expired at {}",
            expiry.to_rfc3339()
        )));
    }
    Ok(())
}

/// Declarative per-node network policy carrying one ipsec interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePolicy {
    pub api_version: String,
    pub kind: String,
    pub metadata: PolicyMetadata,
    pub spec: PolicySpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub node_selector: BTreeMap<String, String>,
    pub desired_state: DesiredState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub interfaces: Vec<TunnelInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInterface {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ipv4: Ipv4Settings,
    pub libreswan: LibreswanConn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Settings {
    pub enabled: bool,
    pub dhcp: bool,
}

/// Libreswan connection, field names as libreswan spells them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibreswanConn {
    pub leftrsasigkey: String,
    pub left: IpAddr,
    pub leftid: String,
    pub leftcert: String,
    pub leftmodecfgclient: bool,
    pub right: IpAddr,
    pub rightrsasigkey: String,
    pub rightid: String,
    pub rightsubnet: String,
    pub ike: String,
    pub esp: String,
    pub ikev2: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Inputs for one side's tunnel policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec<'a> {
    pub policy_name: &'a str,
    pub local: &'a NodeEndpoint,
    pub remote_ip: IpAddr,
    pub cert: &'a str,
}

impl NodePolicy {
    pub const API_VERSION: &'static str = "nmstate.io/v1";
    pub const KIND: &'static str = "NodeNetworkConfigurationPolicy";

    /// Transport-mode tunnel from `spec.local` to `spec.remote_ip`
    #[must_use]
    pub fn ipsec_tunnel(spec: &TunnelSpec<'_>) -> Self {
        let mut node_selector = BTreeMap::new();
        node_selector.insert(HOSTNAME_LABEL.to_string(), spec.local.node_name.clone());

        Self {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata: PolicyMetadata {
                name: spec.policy_name.to_string(),
            },
            spec: PolicySpec {
                node_selector,
                desired_state: DesiredState {
                    interfaces: vec![TunnelInterface {
                        name: TUNNEL_INTERFACE.to_string(),
                        kind: "ipsec".to_string(),
                        ipv4: Ipv4Settings {
                            enabled: true,
                            dhcp: true,
                        },
                        libreswan: LibreswanConn {
                            leftrsasigkey: "%cert".to_string(),
                            left: spec.local.node_ip,
                            leftid: "%fromcert".to_string(),
                            leftcert: spec.cert.to_string(),
                            leftmodecfgclient: false,
                            right: spec.remote_ip,
                            rightrsasigkey: "%cert".to_string(),
                            rightid: "%fromcert".to_string(),
                            rightsubnet: format!("{}/32", spec.remote_ip),
                            ike: "aes_gcm256-sha2_256".to_string(),
                            esp: "aes_gcm256".to_string(),
                            ikev2: "insist".to_string(),
                            kind: "transport".to_string(),
                        },
                    }],
                },
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, RolloutError> {
        serde_yaml::to_string(self).map_err(|e| RolloutError::Setup(format!("render policy: {e}")))
    }

    pub fn from_yaml(text: &str) -> Result<Self, RolloutError> {
        serde_yaml::from_str(text).map_err(|e| RolloutError::Setup(format!("parse policy: {e}")))
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Node the policy is pinned to
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        self.spec.node_selector.get(HOSTNAME_LABEL).map(String::as_str)
    }

    /// The ipsec connection, if the policy carries one
    #[must_use]
    pub fn tunnel(&self) -> Option<&LibreswanConn> {
        self.spec
            .desired_state
            .interfaces
            .iter()
            .find(|i| i.kind == "ipsec")
            .map(|i| &i.libreswan)
    }
}

/// Artefacts created so far, in creation order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedArtifacts {
    pub extension: bool,
    pub handler: bool,
    pub left_policy: bool,
    pub right_policy: bool,
}

impl ProvisionedArtifacts {
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives certificate, handler and policy provisioning
#[derive(Clone)]
pub struct NorthSouthProvisioner {
    policy: Arc<dyn NodePolicyApi>,
    extensions: Arc<dyn ExtensionApi>,
    checker: FleetConvergenceChecker,
    settings: NorthSouthSettings,
    policy_wait: ConvergenceDeadline,
}

impl NorthSouthProvisioner {
    #[must_use]
    pub fn new(
        policy: Arc<dyn NodePolicyApi>,
        extensions: Arc<dyn ExtensionApi>,
        checker: FleetConvergenceChecker,
        settings: NorthSouthSettings,
        policy_wait: ConvergenceDeadline,
    ) -> Self {
        Self {
            policy,
            extensions,
            checker,
            settings,
            policy_wait,
        }
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &NorthSouthSettings {
        &self.settings
    }

    /// Certificates must outlive the scenario start
    pub fn check_certificates(&self, now: DateTime<Utc>) -> Result<(), RolloutError> {
        check_certificate_validity(self.settings.cert_expiry, now)
    }

    /// Manifest of the certificate extension.
    ///
    /// Read from `manifest_path` when set; otherwise an empty worker-role
    /// extension is rendered.
    pub async fn extension_manifest(&self) -> Result<String, RolloutError> {
        if let Some(path) = &self.settings.manifest_path {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RolloutError::Config(format!("{}: {e}", path.display())));
        }
        tracing::warn!(
            extension = %self.settings.extension_name,
            "no certificate manifest configured, rendering an empty extension"
        );
        let manifest = serde_json::json!({
            "apiVersion": "machineconfiguration.openshift.io/v1",
            "kind": "MachineConfig",
            "metadata": {
                "name": self.settings.extension_name,
                "labels": { "machineconfiguration.openshift.io/role": "worker" },
            },
            "spec": { "config": { "ignition": { "version": "3.2.0" } } },
        });
        serde_yaml::to_string(&manifest)
            .map_err(|e| RolloutError::Setup(format!("render extension: {e}")))
    }

    /// Create the certificate extension and wait for every worker pool to carry it
    pub async fn provision_certificates(
        &self,
        artifacts: &mut ProvisionedArtifacts,
    ) -> Result<(), RolloutError> {
        let manifest = self.extension_manifest().await?;
        self.extensions
            .create_extension(&self.settings.extension_name, &manifest)
            .await?;
        artifacts.extension = true;
        tracing::info!(extension = %self.settings.extension_name, "certificate extension created");

        self.checker
            .wait_for(&ConvergenceProbe::WorkerExtension {
                name: self.settings.extension_name.clone(),
                present: true,
            })
            .await
    }

    /// Deploy the handler, then apply and await both tunnel policies
    pub async fn apply_policies(
        &self,
        pair: &TrialPair,
        artifacts: &mut ProvisionedArtifacts,
    ) -> Result<(), RolloutError> {
        self.policy.deploy_handler().await?;
        artifacts.handler = true;
        tracing::info!("policy handler deployed");

        let left = NodePolicy::ipsec_tunnel(&TunnelSpec {
            policy_name: &self.settings.left_policy,
            local: &pair.src,
            remote_ip: pair.dst.node_ip,
            cert: &self.settings.left_cert,
        });
        let right = NodePolicy::ipsec_tunnel(&TunnelSpec {
            policy_name: &self.settings.right_policy,
            local: &pair.dst,
            remote_ip: pair.src.node_ip,
            cert: &self.settings.right_cert,
        });

        self.policy.apply_policy(&left.to_yaml()?).await?;
        artifacts.left_policy = true;
        self.policy.apply_policy(&right.to_yaml()?).await?;
        artifacts.right_policy = true;

        for name in [left.name(), right.name()] {
            self.wait_policy(name).await?;
        }
        Ok(())
    }

    async fn wait_policy(&self, name: &str) -> Result<(), RolloutError> {
        let probe = || async move {
            let status = self.policy.policy_status(name).await?;
            Ok::<_, RolloutError>(policy_converged(&status))
        };
        match poll_or_timeout(name, self.policy_wait, probe).await {
            Ok(()) => {
                tracing::info!(policy = name, "node policy configured");
                Ok(())
            }
            Err(RolloutError::ConvergenceTimeout { .. }) => {
                Err(RolloutError::PolicyNotConfigured(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Remove what `artifacts` records, right policy first.
    ///
    /// Keeps going after a failure; returns every failure rendered.
    pub async fn teardown(&self, artifacts: &mut ProvisionedArtifacts) -> Vec<String> {
        let mut failures = Vec::new();

        for (present, name) in [
            (&mut artifacts.right_policy, &self.settings.right_policy),
            (&mut artifacts.left_policy, &self.settings.left_policy),
        ] {
            if *present {
                match self.policy.delete_policy(name).await {
                    Ok(()) => *present = false,
                    Err(e) => failures.push(format!("delete policy {name}: {e}")),
                }
            }
        }

        if artifacts.handler {
            match self.policy.undeploy_handler().await {
                Ok(()) => artifacts.handler = false,
                Err(e) => failures.push(format!("undeploy policy handler: {e}")),
            }
        }

        if artifacts.extension {
            let name = &self.settings.extension_name;
            match self.extensions.delete_extension(name).await {
                Ok(()) => {
                    artifacts.extension = false;
                    let removed = self
                        .checker
                        .wait_for(&ConvergenceProbe::WorkerExtension {
                            name: name.clone(),
                            present: false,
                        })
                        .await;
                    if let Err(e) = removed {
                        failures.push(e.to_string());
                    }
                }
                Err(e) => failures.push(format!("delete extension {name}: {e}")),
            }
        }

        failures
    }
}

impl std::fmt::Debug for NorthSouthProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NorthSouthProvisioner")
            .field("settings", &self.settings)
            .field("policy_wait", &self.policy_wait)
            .finish_non_exhaustive()
    }
}
