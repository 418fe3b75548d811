use ipsec_core::state_machine::{allowed_transitions, validate_transition, ScenarioTracker};
use ipsec_core::ScenarioState;
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = ScenarioState> {
    prop::sample::select(ScenarioState::ALL.to_vec())
}

#[test]
fn test_idle_transitions() {
    assert!(validate_transition(ScenarioState::Idle, ScenarioState::ModeRequested).is_ok());

    // Nothing else leaves Idle
    assert!(validate_transition(ScenarioState::Idle, ScenarioState::Converging).is_err());
    assert!(validate_transition(ScenarioState::Idle, ScenarioState::Verified).is_err());
}

#[test]
fn test_tearing_down_only_returns_to_idle() {
    assert_eq!(
        allowed_transitions(ScenarioState::TearingDown),
        vec![ScenarioState::Idle]
    );
}

proptest! {
    #[test]
    fn prop_validation_matches_table(from in any_state(), to in any_state()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn prop_every_active_state_can_tear_down(from in any_state()) {
        let active = !matches!(from, ScenarioState::Idle | ScenarioState::TearingDown);
        prop_assert_eq!(
            validate_transition(from, ScenarioState::TearingDown).is_ok(),
            active
        );
    }

    /// Random walks never record a state the table did not allow
    #[test]
    fn prop_tracker_history_is_a_legal_path(steps in prop::collection::vec(any_state(), 0..32)) {
        let mut tracker = ScenarioTracker::new();
        for step in steps {
            let _ = tracker.advance(step);
        }
        for w in tracker.history().windows(2) {
            prop_assert!(validate_transition(w[0], w[1]).is_ok());
        }
    }
}
