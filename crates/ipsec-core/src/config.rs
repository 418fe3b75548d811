//! Rollout configuration
//!
//! Every field has a default matching the values used against production
//! clusters; a TOML file only needs to name what it overrides. Loaded
//! configuration is validated before use.

use crate::error::RolloutError;
use crate::types::ConvergenceDeadline;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Fleet-wide convergence polling
    #[serde(deserialize_with = "convergence_settings")]
    pub convergence: PollSettings,
    /// Node policy rendering wait
    #[serde(deserialize_with = "policy_wait_settings")]
    pub policy_wait: PollSettings,
    pub trial: TrialSettings,
    pub mode_store: RetrySettings,
    pub fleet: FleetSettings,
    pub north_south: NorthSouthSettings,
    /// Delete probe pods even when the scenario failed
    pub delete_pods_on_failure: bool,
}

impl RolloutConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, RolloutError> {
        let config: Self = toml::from_str(text).map_err(|e| RolloutError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), RolloutError> {
        self.convergence.validate("convergence")?;
        self.policy_wait.validate("policy_wait")?;
        self.trial.validate()?;
        if self.mode_store.max_attempts == 0 {
            return Err(RolloutError::Config(
                "mode_store.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RolloutError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RolloutError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// With convergence deadline
    #[inline]
    #[must_use]
    pub fn with_convergence(mut self, deadline: ConvergenceDeadline) -> Self {
        self.convergence = PollSettings::from(deadline);
        self
    }

    /// With policy wait bounds
    #[inline]
    #[must_use]
    pub fn with_policy_wait(mut self, deadline: ConvergenceDeadline) -> Self {
        self.policy_wait = PollSettings::from(deadline);
        self
    }

    /// With certificate bundle manifest path
    #[inline]
    #[must_use]
    pub fn with_cert_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.north_south.manifest_path = Some(path.into());
        self
    }

    /// With certificate expiry
    #[inline]
    #[must_use]
    pub fn with_cert_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.north_south.cert_expiry = expiry;
        self
    }

    /// With pod cleanup policy on failure
    #[inline]
    #[must_use]
    pub fn with_delete_pods_on_failure(mut self, delete: bool) -> Self {
        self.delete_pods_on_failure = delete;
        self
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            convergence: PollSettings::CONVERGENCE,
            policy_wait: PollSettings::POLICY_WAIT,
            trial: TrialSettings::default(),
            mode_store: RetrySettings::default(),
            fleet: FleetSettings::default(),
            north_south: NorthSouthSettings::default(),
            delete_pods_on_failure: true,
        }
    }
}

/// Interval and bound of one poll loop, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl PollSettings {
    /// Fleet rollout: once a minute for 20 minutes
    pub const CONVERGENCE: Self = Self {
        interval_secs: 60,
        timeout_secs: 1200,
    };

    /// Node policy rendering: once a second for 30 seconds
    pub const POLICY_WAIT: Self = Self {
        interval_secs: 1,
        timeout_secs: 30,
    };

    #[inline]
    #[must_use]
    pub fn deadline(&self) -> ConvergenceDeadline {
        ConvergenceDeadline::new(
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.timeout_secs),
        )
    }

    fn validate(&self, section: &str) -> Result<(), RolloutError> {
        if self.interval_secs == 0 {
            return Err(RolloutError::Config(format!(
                "{section}.interval_secs must be at least 1"
            )));
        }
        if self.timeout_secs < self.interval_secs {
            return Err(RolloutError::Config(format!(
                "{section}.timeout_secs ({}) is shorter than interval_secs ({})",
                self.timeout_secs, self.interval_secs
            )));
        }
        Ok(())
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::CONVERGENCE
    }
}

impl From<ConvergenceDeadline> for PollSettings {
    fn from(d: ConvergenceDeadline) -> Self {
        Self {
            interval_secs: d.poll_interval.as_secs(),
            timeout_secs: d.max_wait.as_secs(),
        }
    }
}

/// A `[convergence]` or `[policy_wait]` table; missing keys keep the section's own default
#[derive(Deserialize)]
struct PollOverrides {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

impl PollOverrides {
    fn over(self, base: PollSettings) -> PollSettings {
        PollSettings {
            interval_secs: self.interval_secs.unwrap_or(base.interval_secs),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
        }
    }
}

fn convergence_settings<'de, D: Deserializer<'de>>(d: D) -> Result<PollSettings, D::Error> {
    Ok(PollOverrides::deserialize(d)?.over(PollSettings::CONVERGENCE))
}

fn policy_wait_settings<'de, D: Deserializer<'de>>(d: D) -> Result<PollSettings, D::Error> {
    Ok(PollOverrides::deserialize(d)?.over(PollSettings::POLICY_WAIT))
}

/// Upper bound on a single capture
pub const MAX_CAPTURE_SECS: u64 = 10;

/// Traffic trial bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialSettings {
    /// Per-capture deadline handed to `timeout`
    pub capture_timeout_secs: u64,
    /// Echo requests per trial
    pub ping_count: u32,
    /// Extra time allowed for the exec round trip itself
    pub exec_grace_secs: u64,
}

impl TrialSettings {
    #[inline]
    #[must_use]
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    /// Hard bound on any single trial task
    #[inline]
    #[must_use]
    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs.saturating_add(self.exec_grace_secs))
    }

    fn validate(&self) -> Result<(), RolloutError> {
        if !(1..=MAX_CAPTURE_SECS).contains(&self.capture_timeout_secs) {
            return Err(RolloutError::Config(format!(
                "trial.capture_timeout_secs must be within 1..={MAX_CAPTURE_SECS}, got {}",
                self.capture_timeout_secs
            )));
        }
        if self.ping_count == 0 {
            return Err(RolloutError::Config(
                "trial.ping_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            capture_timeout_secs: 10,
            ping_count: 3,
            exec_grace_secs: 30,
        }
    }
}

/// Conflict retry budget for mode writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 10,
        }
    }
}

/// Names of fleet objects the convergence probes look at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub master_extension: String,
    pub worker_extension: String,
    pub daemon_namespace: String,
    pub daemon_name: String,
    /// Bridge whose physical port carries node traffic
    pub bridge: String,
    pub pod_name_prefix: String,
}

impl FleetSettings {
    /// Extension that `pool` carries when IPsec is on
    #[must_use]
    pub fn extension_for_pool(&self, pool: &crate::types::MachineConfigPoolStatus) -> &str {
        if pool.is_master() {
            &self.master_extension
        } else {
            &self.worker_extension
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            master_extension: "80-ipsec-master-extensions".to_string(),
            worker_extension: "80-ipsec-worker-extensions".to_string(),
            daemon_namespace: "openshift-ovn-kubernetes".to_string(),
            daemon_name: "ovn-ipsec-host".to_string(),
            bridge: "br-ex".to_string(),
            pod_name_prefix: "ipsec-probe-".to_string(),
        }
    }
}

/// Host-to-host tunnel provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NorthSouthSettings {
    /// Name of the certificate extension object
    pub extension_name: String,
    /// Certificate extension manifest
    pub manifest_path: Option<PathBuf>,
    pub left_cert: String,
    pub right_cert: String,
    pub left_policy: String,
    pub right_policy: String,
    /// Certificates in the bundle stop being valid at this instant
    pub cert_expiry: DateTime<Utc>,
}

impl Default for NorthSouthSettings {
    fn default() -> Self {
        Self {
            extension_name: "99-worker-north-south-ipsec-config".to_string(),
            manifest_path: None,
            left_cert: "left_server".to_string(),
            right_cert: "right_server".to_string(),
            left_policy: "left-node-ipsec-policy".to_string(),
            right_policy: "right-node-ipsec-policy".to_string(),
            cert_expiry: Utc
                .with_ymd_and_hms(2034, 4, 10, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_match_production_values() {
        let cfg = RolloutConfig::new();
        assert_eq!(cfg.convergence.deadline(), ConvergenceDeadline::default());
        assert_eq!(cfg.convergence.interval_secs, 60);
        assert_eq!(cfg.convergence.timeout_secs, 1200);
        assert_eq!(cfg.trial.capture_timeout_secs, 10);
        assert_eq!(cfg.trial.ping_count, 3);
        assert_eq!(cfg.mode_store.max_attempts, 5);
        assert!(cfg.delete_pods_on_failure);
        assert_eq!(cfg.north_south.cert_expiry.to_rfc3339(), "2034-04-10T00:00:00+00:00");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = RolloutConfig::from_toml_str(
            r#"
            delete_pods_on_failure = false

            [convergence]
            interval_secs = 5
            timeout_secs = 60

            [fleet]
            bridge = "br-phys"
            "#,
        )
        .unwrap();
        assert!(!cfg.delete_pods_on_failure);
        assert_eq!(cfg.convergence.interval_secs, 5);
        assert_eq!(cfg.fleet.bridge, "br-phys");
        assert_eq!(cfg.fleet.daemon_name, "ovn-ipsec-host");
        assert_eq!(cfg.trial, TrialSettings::default());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[north_south]\nmanifest_path = \"/etc/ipsec/certs.yaml\"").unwrap();
        let cfg = RolloutConfig::load(file.path()).unwrap();
        assert_eq!(
            cfg.north_south.manifest_path,
            Some(PathBuf::from("/etc/ipsec/certs.yaml"))
        );
    }

    #[test]
    fn partial_policy_wait_keeps_its_own_defaults() {
        let cfg = RolloutConfig::from_toml_str("[policy_wait]\ninterval_secs = 2").unwrap();
        assert_eq!(
            cfg.policy_wait,
            PollSettings {
                interval_secs: 2,
                timeout_secs: 30,
            }
        );

        let cfg = RolloutConfig::from_toml_str("[convergence]\ntimeout_secs = 600").unwrap();
        assert_eq!(cfg.convergence.interval_secs, 60);
        assert_eq!(cfg.policy_wait, PollSettings::POLICY_WAIT);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = RolloutConfig::from_toml_str("[convergence]\ninterval_secs = 0").unwrap_err();
        match err {
            RolloutError::Config(msg) => assert!(msg.contains("convergence.interval_secs")),
            other => panic!("expected Config, got {other:?}"),
        }
    }

    #[test]
    fn timeout_shorter_than_interval_is_rejected() {
        let err = RolloutConfig::from_toml_str("[policy_wait]\ninterval_secs = 45").unwrap_err();
        assert!(matches!(err, RolloutError::Config(_)));
    }

    #[test]
    fn capture_bound_is_enforced() {
        for text in [
            "[trial]\ncapture_timeout_secs = 0",
            "[trial]\ncapture_timeout_secs = 11",
            "[trial]\nping_count = 0",
            "[mode_store]\nmax_attempts = 0",
        ] {
            let err = RolloutConfig::from_toml_str(text).unwrap_err();
            assert!(matches!(err, RolloutError::Config(_)), "{text}");
        }
        assert!(RolloutConfig::from_toml_str("[trial]\ncapture_timeout_secs = 10").is_ok());
    }

    #[test]
    fn task_deadline_saturates() {
        let trial = TrialSettings {
            exec_grace_secs: u64::MAX,
            ..TrialSettings::default()
        };
        assert_eq!(trial.task_deadline(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[trial]\ncapture_timeout_secs = 120").unwrap();
        assert!(matches!(
            RolloutConfig::load(file.path()),
            Err(RolloutError::Config(_))
        ));
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = RolloutConfig::from_toml_str("convergence = 3").unwrap_err();
        assert!(matches!(err, RolloutError::Config(_)));
    }
}
