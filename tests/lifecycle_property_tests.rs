//! Property-based tests for the unit lifecycle state machine and trace chain
//!
//! These use proptest to throw arbitrary transition sequences at the
//! registry and check the invariants that must hold no matter what
//! callers do: the recorded trace chain is always a legal walk of the
//! lifecycle graph, the hash chain always verifies, and the expiry sweep
//! is idempotent.
//!
//! These tests cover:
//!
//! 1. Legal-walk invariant - the audit chain can never show an illegal edge
//! 2. Chain integrity - arbitrary operation mixes never break hash links
//! 3. Stored state matches the state derived by replaying the chain
//! 4. Sweep idempotence - a second sweep over the same state is a no-op
//! 5. Edge-table sanity - terminal states only ever step to Recalled
//!
//! What these tests DON'T cover (deliberately):
//!
//! - Reservation/allocation behavior (covered by integration scenarios)
//! - Alert rule thresholds (covered by scenario and smoke tests)

use std::collections::HashMap;
use std::sync::Arc;

use hemoledger::{
    alerts::Thresholds,
    registry::UnitState,
    service::BloodBankService,
    trace::TraceKind,
    types::{BloodType, Component, TimeStamp},
};
use proptest::prelude::*;

const ALL_STATES: [UnitState; 12] = [
    UnitState::Collected,
    UnitState::Processing,
    UnitState::QaPending,
    UnitState::QaPassed,
    UnitState::QaFailed,
    UnitState::Available,
    UnitState::Reserved,
    UnitState::Issued,
    UnitState::Transfused,
    UnitState::Expired,
    UnitState::Discarded,
    UnitState::Recalled,
];

/// Strategy to generate any lifecycle state as a transition target
fn unit_state_strategy() -> impl Strategy<Value = UnitState> {
    prop::sample::select(ALL_STATES.to_vec())
}

fn open_service(dir: &tempfile::TempDir) -> BloodBankService {
    let db = sled::open(dir.path().join("prop.db")).unwrap();
    let thresholds = Thresholds {
        low_stock_minimum: 0,
        low_stock_overrides: HashMap::new(),
        expiry_warning_days: 0,
    };
    BloodBankService::open(Arc::new(db), thresholds).unwrap()
}

// create a donor with confirmed serology and one collected unit
fn seed_unit(service: &BloodBankService) -> (String, u64) {
    let donor = service.create_donor("Prop Donor", "actor_prop").unwrap();
    service
        .record_serology(&donor.donor_id, BloodType::OPos, true, "actor_prop")
        .unwrap();
    let unit = service
        .record_donation(
            &donor.donor_id,
            Component::RedBloodCells,
            450,
            "bay-1",
            "actor_prop",
        )
        .unwrap();
    (unit.unit_id, unit.version)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: whatever transition sequence callers attempt, the trace
    /// chain records only legal edges and replays to the stored state.
    #[test]
    fn trace_chain_is_always_a_legal_walk(
        targets in prop::collection::vec(unit_state_strategy(), 1..12)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let service = open_service(&dir);
        let (unit_id, mut version) = seed_unit(&service);

        for target in targets {
            // rejected transitions are fine, they must just leave no mark
            if let Ok(updated) =
                service.advance_unit_state(&unit_id, target, version, "actor_prop", Some("qa note"))
            {
                version = updated.version;
            }
        }

        let chain = service.trace_chain(&unit_id).unwrap();
        let mut state: Option<UnitState> = None;
        for event in &chain {
            match &event.kind {
                TraceKind::UnitCollected { .. } => {
                    prop_assert_eq!(state, None);
                    state = Some(UnitState::Collected);
                }
                TraceKind::UnitStateChanged { before, after, .. } => {
                    prop_assert_eq!(state, Some(*before));
                    prop_assert!(before.can_transition_to(*after), "{:?} -> {:?}", before, after);
                    state = Some(*after);
                }
                _ => {}
            }
        }
        prop_assert_eq!(state, Some(service.unit(&unit_id).unwrap().state));

        // and the hash chain still verifies
        service.verify_trace(&unit_id).unwrap();
    }

    /// Property: sweeping twice over the same state never produces more
    /// transitions the second time.
    #[test]
    fn expiry_sweep_is_idempotent(
        targets in prop::collection::vec(unit_state_strategy(), 0..8)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let service = open_service(&dir);
        let (unit_id, mut version) = seed_unit(&service);

        for target in targets {
            if let Ok(updated) =
                service.advance_unit_state(&unit_id, target, version, "actor_prop", Some("qa note"))
            {
                version = updated.version;
            }
        }

        // far enough out that anything with an expiry is over-age
        let far_future = TimeStamp::new().plus_days(400);
        let first = service.run_expiry_sweep(far_future).unwrap();
        let second = service.run_expiry_sweep(far_future).unwrap();

        prop_assert!(second.expired.is_empty());
        prop_assert!(second.released_requests.is_empty());

        if first.expired.contains(&unit_id) {
            prop_assert_eq!(service.unit(&unit_id).unwrap().state, UnitState::Expired);
        }
    }
}

proptest! {
    /// Property: terminal states admit no outgoing edge except the
    /// regulatory recall override.
    #[test]
    fn terminal_states_only_step_to_recalled(
        from in unit_state_strategy(),
        to in unit_state_strategy()
    ) {
        if from.is_terminal() && from.can_transition_to(to) {
            prop_assert_eq!(to, UnitState::Recalled);
        }
        // allocatable is an attribute of exactly one state
        prop_assert_eq!(from.is_allocatable(), from == UnitState::Available);
    }
}
