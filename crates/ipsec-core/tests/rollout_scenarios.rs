//! Scenario tests driving `RolloutCoordinator` against the simulated cluster.
//!
//! Core guarantees exercised here:
//! - Every mode transition converges and is proven on the wire in both
//!   directions (positive trial plus negative control).
//! - Teardown restores the original mode whatever step failed.
//! - A stalled rollout is a fatal `ConvergenceTimeout`, not an endless wait.
//! - The north-south scenario provisions tunnels and removes exactly what it
//!   created.
//!
//! All tests run on paused tokio time, so 20 minute deadlines pass instantly.

use chrono::{TimeZone, Utc};
use ipsec_core::prelude::*;
use ipsec_core::{ModeChange, ScenarioState, TrialSide};
use ipsec_test_utils::fixtures::{all_transitions, coordinator, coordinator_with, sim_cluster};
use ipsec_test_utils::{SimCluster, SimOp};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;

/// Tenet: every transition between distinct modes converges, verifies and restores.
#[tokio::test(start_paused = true)]
async fn every_mode_transition_passes_and_restores() {
    for (from, to) in all_transitions() {
        let sim = sim_cluster(from);
        let report = coordinator(&sim)
            .run(ScenarioKind::ModeTransition(to))
            .await
            .unwrap_or_else(|e| panic!("{from} -> {to} failed: {e}"));

        assert_eq!(report.original_mode, from);
        assert_eq!(report.target_mode, to);
        // pre-check and post-check, each a positive trial plus a control
        assert_eq!(report.trials.len(), 4);
        assert!(report.trials.iter().all(|t| t.passed()));

        assert_eq!(sim.requested_mode(), from);
        assert_eq!(sim.applied_mode(), from);
        assert!(sim.live_pods().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn visited_states_follow_the_lifecycle() {
    let sim = sim_cluster(SecurityMode::Disabled);
    let report = coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::Full))
        .await
        .unwrap();

    assert_eq!(
        report.states,
        vec![
            ScenarioState::Idle,
            ScenarioState::ModeRequested,
            ScenarioState::Converging,
            ScenarioState::ModeConverged,
            ScenarioState::Verified,
            ScenarioState::TearingDown,
            ScenarioState::Idle,
        ]
    );
}

/// Tenet: requesting the mode already in force writes nothing.
#[tokio::test(start_paused = true)]
async fn same_mode_scenario_writes_nothing() {
    let sim = sim_cluster(SecurityMode::External);
    coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::External))
        .await
        .unwrap();
    assert_eq!(sim.write_count(), 0);
}

/// Tenet: the legacy empty mode string runs as Full and is restored as Full.
#[tokio::test(start_paused = true)]
async fn legacy_default_is_full() {
    let sim = Arc::new(SimCluster::new().with_legacy_default());
    let report = coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::Disabled))
        .await
        .unwrap();
    assert_eq!(report.original_mode, SecurityMode::Full);
    assert_eq!(sim.applied_mode(), SecurityMode::Full);
}

/// Tenet: a rollout that never settles fails the scenario, and the record is
/// still put back.
#[tokio::test(start_paused = true)]
async fn stalled_rollout_times_out_and_restores_record() {
    let sim = sim_cluster(SecurityMode::Disabled);
    sim.stall_rollouts(true);

    let err = coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::Full))
        .await
        .unwrap_err();

    match err {
        RolloutError::ConvergenceTimeout { waited_secs, .. } => assert_eq!(waited_secs, 1200),
        other => panic!("expected ConvergenceTimeout, got {other}"),
    }
    assert_eq!(sim.requested_mode(), SecurityMode::Disabled);
    assert!(sim.live_pods().is_empty());
}

/// Tenet: the External plan (a single rollout probe) is bounded the same way.
#[tokio::test(start_paused = true)]
async fn stalled_external_rollout_times_out_and_restores_record() {
    let sim = sim_cluster(SecurityMode::Disabled);
    sim.stall_rollouts(true);

    let err = coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::External))
        .await
        .unwrap_err();

    match err {
        RolloutError::ConvergenceTimeout { probe, waited_secs } => {
            assert_eq!(waited_secs, 1200);
            assert!(probe.contains("machine-config"), "{probe}");
        }
        other => panic!("expected ConvergenceTimeout, got {other}"),
    }
    assert_eq!(sim.requested_mode(), SecurityMode::Disabled);
    assert!(sim.live_pods().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_fleet_errors_are_ridden_out() {
    let sim = sim_cluster(SecurityMode::Disabled);
    sim.inject_transient(3);
    coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::External))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn conflicting_writes_are_retried() {
    let sim = sim_cluster(SecurityMode::Disabled);
    sim.inject_conflicts(2);
    coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::Full))
        .await
        .unwrap();
    // one write out, one write back
    assert_eq!(sim.write_count(), 2);
}

/// Tenet: teardown restores the original mode even when the scenario body
/// fails mid-way, whichever step fails.
#[tokio::test(start_paused = true)]
async fn fault_at_every_step_restores_mode() {
    let faults = [
        (SimOp::Exec, 0),
        (SimOp::UpdateNetworkConfig, 0),
        (SimOp::MachineConfigPools, 0),
        (SimOp::ClusterOperators, 0),
        (SimOp::SecurityDaemon, 0),
        // first exec of the post-convergence trial
        (SimOp::Exec, 6),
        // traffic generation of the post-convergence control
        (SimOp::Exec, 11),
    ];

    for (op, skip) in faults {
        let sim = sim_cluster(SecurityMode::Disabled);
        sim.fail_after(op, skip);

        let result = coordinator(&sim)
            .run(ScenarioKind::ModeTransition(SecurityMode::Full))
            .await;

        assert!(result.is_err(), "{op:?} after {skip} should fail the scenario");
        assert_eq!(sim.requested_mode(), SecurityMode::Disabled, "{op:?}/{skip}");
        assert_eq!(sim.applied_mode(), SecurityMode::Disabled, "{op:?}/{skip}");
        assert!(sim.live_pods().is_empty(), "{op:?}/{skip}");
    }
}

#[tokio::test(start_paused = true)]
async fn partial_pod_launch_is_cleaned_up() {
    let sim = sim_cluster(SecurityMode::Full);
    sim.fail_after(SimOp::LaunchProbePods, 1);

    let err = coordinator(&sim)
        .run(ScenarioKind::ModeTransition(SecurityMode::Disabled))
        .await
        .unwrap_err();

    assert!(matches!(err, RolloutError::Setup(_)));
    assert!(sim.live_pods().is_empty());
    assert_eq!(sim.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_scenario_can_keep_pods() {
    let sim = sim_cluster(SecurityMode::Disabled);
    sim.blackhole_node("worker-1");
    let config = RolloutConfig::new().with_delete_pods_on_failure(false);

    let err = coordinator_with(&sim, config)
        .run(ScenarioKind::ModeTransition(SecurityMode::Full))
        .await
        .unwrap_err();

    assert!(err.failed_sides().contains(&TrialSide::Destination));
    assert_eq!(sim.live_pods().len(), 4);
}

/// Tenet: the north-south scenario ends with ESP between the pair and leaves
/// nothing behind.
#[tokio::test(start_paused = true)]
async fn north_south_provisions_and_cleans_up() {
    let sim = sim_cluster(SecurityMode::Disabled);
    let report = coordinator(&sim).run(ScenarioKind::NorthSouth).await.unwrap();

    assert_eq!(report.target_mode, SecurityMode::External);
    assert_eq!(report.trials.len(), 6);
    assert!(report.states.contains(&ScenarioState::CertProvisioned));
    assert!(report.states.contains(&ScenarioState::PolicyApplied));

    assert_eq!(sim.requested_mode(), SecurityMode::Disabled);
    assert!(sim.policy_names().is_empty());
    assert!(!sim.handler_deployed());
    assert!(sim.extension_names().is_empty());
    assert!(sim.live_pods().is_empty());
}

#[tokio::test(start_paused = true)]
async fn north_south_fault_removes_partial_artifacts() {
    for (op, skip) in [
        (SimOp::CreateExtension, 0),
        (SimOp::DeployHandler, 0),
        (SimOp::ApplyPolicy, 0),
        (SimOp::ApplyPolicy, 1),
        (SimOp::PolicyStatus, 0),
    ] {
        let sim = sim_cluster(SecurityMode::Disabled);
        sim.fail_after(op, skip);

        let result = coordinator(&sim).run(ScenarioKind::NorthSouth).await;

        assert!(result.is_err(), "{op:?}/{skip}");
        assert_eq!(sim.requested_mode(), SecurityMode::Disabled, "{op:?}/{skip}");
        assert!(sim.policy_names().is_empty(), "{op:?}/{skip}");
        assert!(!sim.handler_deployed(), "{op:?}/{skip}");
        assert!(sim.extension_names().is_empty(), "{op:?}/{skip}");
    }
}

#[tokio::test(start_paused = true)]
async fn teardown_failure_after_success_is_reported() {
    let sim = sim_cluster(SecurityMode::Disabled);
    sim.fail_on(SimOp::DeletePolicy);

    let err = coordinator(&sim).run(ScenarioKind::NorthSouth).await.unwrap_err();

    match err {
        RolloutError::Teardown(failures) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].contains("right-node-ipsec-policy"));
        }
        other => panic!("expected Teardown, got {other}"),
    }
    assert_eq!(sim.requested_mode(), SecurityMode::Disabled);
}

/// Tenet: expired certificates stop the scenario before any network change.
#[tokio::test(start_paused = true)]
async fn expired_certificates_touch_nothing() {
    let sim = sim_cluster(SecurityMode::Disabled);
    let expired = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let config = RolloutConfig::new().with_cert_expiry(expired);

    let err = coordinator_with(&sim, config)
        .run(ScenarioKind::NorthSouth)
        .await
        .unwrap_err();

    assert!(matches!(err, RolloutError::ExpiredPrerequisite(_)));
    assert_eq!(sim.write_count(), 0);
    assert!(sim.live_pods().is_empty());
}

#[tokio::test(start_paused = true)]
async fn north_south_reads_certificate_manifest_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "apiVersion: machineconfiguration.openshift.io/v1\nkind: MachineConfig\nmetadata:\n  name: 99-worker-north-south-ipsec-config"
    )
    .unwrap();
    let sim = sim_cluster(SecurityMode::Disabled);
    let config = RolloutConfig::new().with_cert_manifest(file.path());

    coordinator_with(&sim, config)
        .run(ScenarioKind::NorthSouth)
        .await
        .unwrap();
    assert!(sim.extension_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_certificate_manifest_is_config_error() {
    let sim = sim_cluster(SecurityMode::Disabled);
    let config = RolloutConfig::new().with_cert_manifest("/nonexistent/north-south-certs.yaml");

    let err = coordinator_with(&sim, config)
        .run(ScenarioKind::NorthSouth)
        .await
        .unwrap_err();

    assert!(matches!(err, RolloutError::Config(_)), "{err}");
    assert_eq!(sim.requested_mode(), SecurityMode::Disabled);
    assert!(sim.extension_names().is_empty());
    assert!(sim.policy_names().is_empty());
}

/// Tenet: once a mode has converged, checking again does not flip the answer.
#[tokio::test(start_paused = true)]
async fn convergence_recheck_is_idempotent() {
    for (from, to) in all_transitions() {
        let sim = sim_cluster(from);
        let coordinator = coordinator(&sim);

        coordinator.mode_store().set_mode(to).await.unwrap();
        coordinator.checker().wait_for_mode(to).await.unwrap();

        assert!(coordinator.checker().is_converged(to).await.unwrap());
        assert!(coordinator.checker().is_converged(to).await.unwrap());
    }
}

/// Tenet: racing writers produce exactly one winner and never a merge.
#[tokio::test(start_paused = true)]
async fn racing_writers_have_single_winner() {
    let sim = sim_cluster(SecurityMode::Disabled);
    let a = coordinator(&sim);
    let b = coordinator(&sim);

    let (ra, rb) = tokio::join!(
        a.mode_store().set_mode(SecurityMode::Full),
        b.mode_store().set_mode(SecurityMode::External),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert!(ra.was_written() && rb.was_written());
    assert_eq!(sim.write_count(), 2);
    // whoever had to retry wrote last
    let last = if matches!(rb, ModeChange::Applied { attempts } if attempts > 1) {
        SecurityMode::External
    } else {
        SecurityMode::Full
    };
    assert_eq!(sim.requested_mode(), last);
    assert_eq!(
        sim.record().ipsec.map(|c| c.mode),
        Some(last.as_str().to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_set_mode_writes_once() {
    let sim = sim_cluster(SecurityMode::Disabled);
    let coordinator = coordinator(&sim);
    coordinator.mode_store().set_mode(SecurityMode::Full).await.unwrap();
    coordinator.mode_store().set_mode(SecurityMode::Full).await.unwrap();
    assert_eq!(sim.write_count(), 1);
}
