//! Smoke screen unit tests for the engine components
//!
//! These tests span the codebase, testing behavior in isolation from the
//! full workflow scenarios. Generally the happy path plus the guard
//! rails each module promises.

use std::collections::HashMap;
use std::sync::Arc;

use hemoledger::{
    alerts::{AlertEngine, AlertKind, AlertPriority, AlertStatus, Thresholds},
    error::EngineError,
    events::{DomainEvent, EventBus},
    ledger::InventoryLedger,
    registry::{UnitRegistry, UnitState},
    service::BloodBankService,
    trace::{TraceDraft, TraceIndex, TraceKind},
    types::{BloodType, Component, TimeStamp, Urgency},
    utils,
};
use tempfile::tempdir;

fn quiet_thresholds() -> Thresholds {
    Thresholds {
        low_stock_minimum: 0,
        low_stock_overrides: HashMap::new(),
        expiry_warning_days: 0,
    }
}

fn open_service(dir: &tempfile::TempDir, name: &str) -> BloodBankService {
    let db = sled::open(dir.path().join(name)).unwrap();
    BloodBankService::open(Arc::new(db), quiet_thresholds()).unwrap()
}

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// IDs are bech32 with the requested human-readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let result = utils::new_uuid_to_bech32("unit_");
        assert!(result.is_ok());

        let encoded = result.unwrap();
        assert!(encoded.starts_with("unit_1"));
        assert!(encoded.len() > 10);
    }

    #[test]
    fn handles_empty_hrp() {
        let result = utils::new_uuid_to_bech32("");
        assert!(result.is_err());
    }

    #[test]
    fn generates_unique_ids() {
        let id1 = utils::new_id("donor_");
        let id2 = utils::new_id("donor_");
        assert_ne!(id1, id2);
        assert!(id1.starts_with("donor_"));
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(utils::new_event_id(), utils::new_event_id());
    }
}

// TYPES MODULE TESTS
#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn shelf_lives_match_component_rules() {
        assert_eq!(Component::WholeBlood.shelf_life_days(), 35);
        assert_eq!(Component::RedBloodCells.shelf_life_days(), 42);
        assert_eq!(Component::Platelets.shelf_life_days(), 5);
        assert_eq!(Component::SingleDonorPlatelets.shelf_life_days(), 5);
        assert_eq!(Component::FreshFrozenPlasma.shelf_life_days(), 365);
        assert_eq!(Component::Cryoprecipitate.shelf_life_days(), 365);
    }

    #[test]
    fn compatibility_substitutions() {
        // A- takes O- but never A+
        assert!(BloodType::ANeg.can_receive_from(BloodType::ONeg));
        assert!(!BloodType::ANeg.can_receive_from(BloodType::APos));
        // B+ takes the O and B pool
        assert!(BloodType::BPos.can_receive_from(BloodType::OPos));
        assert!(!BloodType::BPos.can_receive_from(BloodType::ANeg));
    }

    #[test]
    fn display_codes() {
        assert_eq!(BloodType::AbNeg.to_string(), "AB-");
        assert_eq!(Component::Cryoprecipitate.to_string(), "CRYO");
    }

    #[test]
    fn timestamp_ordering_follows_time() {
        let earlier = TimeStamp::new();
        let later = earlier.plus_days(1);
        assert!(later > earlier);
    }
}

// REGISTRY TESTS (through the service facade)
#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn qa_failure_requires_a_discard_reason() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "qa_fail.db");

        let donor = service.create_donor("Test Donor", "actor_x").unwrap();
        service
            .record_serology(&donor.donor_id, BloodType::OPos, true, "actor_x")
            .unwrap();
        let unit = service
            .record_donation(&donor.donor_id, Component::WholeBlood, 450, "bay-1", "actor_x")
            .unwrap();
        let unit = service
            .advance_unit_state(&unit.unit_id, UnitState::Processing, unit.version, "actor_x", None)
            .unwrap();
        let unit = service
            .advance_unit_state(&unit.unit_id, UnitState::QaPending, unit.version, "actor_x", None)
            .unwrap();

        // no reason, no qa-fail
        let refused = service.advance_unit_state(
            &unit.unit_id,
            UnitState::QaFailed,
            unit.version,
            "actor_x",
            None,
        );
        assert!(refused.is_err());

        let failed = service
            .advance_unit_state(
                &unit.unit_id,
                UnitState::QaFailed,
                unit.version,
                "actor_x",
                Some("positive HBsAg screen"),
            )
            .unwrap();
        assert_eq!(failed.state, UnitState::QaFailed);

        // qa-failed blocks Available, only discard remains
        let blocked = service.advance_unit_state(
            &unit.unit_id,
            UnitState::Available,
            failed.version,
            "actor_x",
            None,
        );
        assert!(blocked.is_err());
    }

    #[test]
    fn stale_version_is_rejected() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "stale.db");

        let donor = service.create_donor("Test Donor", "actor_x").unwrap();
        service
            .record_serology(&donor.donor_id, BloodType::OPos, true, "actor_x")
            .unwrap();
        let unit = service
            .record_donation(&donor.donor_id, Component::WholeBlood, 450, "bay-1", "actor_x")
            .unwrap();
        let stale = unit.version;

        service
            .advance_unit_state(&unit.unit_id, UnitState::Processing, stale, "actor_x", None)
            .unwrap();

        // a second writer holding the old token loses
        let refused =
            service.advance_unit_state(&unit.unit_id, UnitState::QaPending, stale, "actor_x", None);
        assert!(refused.is_err());
    }

    #[test]
    fn expiry_is_set_once_at_qa_pass() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "expiry.db");

        let donor = service.create_donor("Test Donor", "actor_x").unwrap();
        service
            .record_serology(&donor.donor_id, BloodType::APos, true, "actor_x")
            .unwrap();
        let unit = service
            .record_donation(&donor.donor_id, Component::RedBloodCells, 450, "bay-1", "actor_x")
            .unwrap();
        assert_eq!(unit.expires_at, None);

        let mut version = unit.version;
        for target in [UnitState::Processing, UnitState::QaPending, UnitState::QaPassed] {
            version = service
                .advance_unit_state(&unit.unit_id, target, version, "actor_x", None)
                .unwrap()
                .version;
        }

        let stored = service.unit(&unit.unit_id).unwrap();
        let expires_at = stored.expires_at.expect("qa-pass freezes expiry");
        assert!(expires_at > TimeStamp::new().plus_days(41));
        assert!(expires_at < TimeStamp::new().plus_days(43));
    }

    #[test]
    fn serology_confirms_blood_type_on_existing_units() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "serology.db");

        let donor = service.create_donor("Test Donor", "actor_x").unwrap();
        // donation first, typing later
        let unit = service
            .record_donation(&donor.donor_id, Component::WholeBlood, 450, "bay-1", "actor_x")
            .unwrap();
        assert_eq!(unit.blood_type, None);

        service
            .record_serology(&donor.donor_id, BloodType::BNeg, true, "actor_x")
            .unwrap();

        assert_eq!(
            service.unit(&unit.unit_id).unwrap().blood_type,
            Some(BloodType::BNeg)
        );
        assert_eq!(
            service.donor(&donor.donor_id).unwrap().blood_type,
            Some(BloodType::BNeg)
        );
    }

    #[test]
    fn reservations_cannot_bypass_the_ledger() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "bypass.db");

        let donor = service.create_donor("Test Donor", "actor_x").unwrap();
        service
            .record_serology(&donor.donor_id, BloodType::OPos, true, "actor_x")
            .unwrap();
        let unit = service
            .record_donation(&donor.donor_id, Component::WholeBlood, 450, "bay-1", "actor_x")
            .unwrap();

        let refused = service.advance_unit_state(
            &unit.unit_id,
            UnitState::Reserved,
            unit.version,
            "actor_x",
            None,
        );
        assert!(refused.is_err());

        let refused = service.advance_unit_state(
            &unit.unit_id,
            UnitState::Expired,
            unit.version,
            "actor_x",
            None,
        );
        assert!(refused.is_err());
    }
}

// TRACE INDEX TESTS
#[cfg(test)]
mod trace_tests {
    use super::*;

    #[test]
    fn tampering_breaks_the_chain() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("tamper.db")).unwrap();
        let index = TraceIndex::open(&db).unwrap();

        for i in 0..3 {
            index
                .append(TraceDraft::new(
                    "unit_tampered",
                    "actor_x",
                    TraceKind::CriticalOverride {
                        detail: format!("entry {i}"),
                    },
                ))
                .unwrap();
        }
        assert_eq!(index.verify_integrity("unit_tampered").unwrap(), 3);

        // rewrite the middle event with a different actor
        let tree = db.open_tree("trace").unwrap();
        let mut prefix = b"unit_tampered".to_vec();
        prefix.push(0);
        let (key, bytes) = tree.scan_prefix(&prefix).nth(1).unwrap().unwrap();
        let mut event: hemoledger::trace::TraceEvent = utils::from_cbor(&bytes).unwrap();
        event.actor = "actor_forged".into();
        tree.insert(key, utils::to_cbor(&event).unwrap()).unwrap();

        let err = index.verify_integrity("unit_tampered").unwrap_err();
        assert!(matches!(
            err,
            EngineError::IntegrityViolation { seq: 1, .. }
        ));
    }

    #[test]
    fn chains_are_isolated_per_subject() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("isolated.db")).unwrap();
        let index = TraceIndex::open(&db).unwrap();

        for subject in ["unit_a", "unit_ab"] {
            index
                .append(TraceDraft::new(
                    subject,
                    "actor_x",
                    TraceKind::CriticalOverride {
                        detail: "entry".into(),
                    },
                ))
                .unwrap();
        }

        // "unit_a" must not pick up "unit_ab" entries via prefix overlap
        let chain: Vec<_> = index.chain_for("unit_a").collect::<Result<_, _>>().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].subject_id, "unit_a");
    }
}

// ALERT ENGINE TESTS
#[cfg(test)]
mod alert_tests {
    use super::*;

    fn open_engine(dir: &tempfile::TempDir) -> (AlertEngine, Arc<TraceIndex>) {
        let db = sled::open(dir.path().join("alerts.db")).unwrap();
        let trace = Arc::new(TraceIndex::open(&db).unwrap());
        let bus = Arc::new(EventBus::new());
        let engine = AlertEngine::open(&db, Thresholds::default(), trace.clone(), bus).unwrap();
        (engine, trace)
    }

    #[test]
    fn open_alerts_deduplicate_by_kind_and_subject() {
        let dir = tempdir().unwrap();
        let (engine, _) = open_engine(&dir);

        let first = engine
            .raise(AlertKind::LowStock, AlertPriority::Warning, "O-/RBC")
            .unwrap();
        assert!(first.is_some());

        // the second raise extends the open alert instead
        let second = engine
            .raise(AlertKind::LowStock, AlertPriority::Warning, "O-/RBC")
            .unwrap();
        assert!(second.is_none());

        let open = engine.open_alerts().unwrap();
        assert_eq!(open.len(), 1);

        // a different subject is its own alert
        let other = engine
            .raise(AlertKind::LowStock, AlertPriority::Warning, "A+/RBC")
            .unwrap();
        assert!(other.is_some());
    }

    #[test]
    fn alert_status_lifecycle() {
        let dir = tempdir().unwrap();
        let (engine, _) = open_engine(&dir);

        let alert = engine
            .raise(AlertKind::ExpiryWarning, AlertPriority::Info, "unit_1")
            .unwrap()
            .unwrap();
        assert_eq!(alert.status, AlertStatus::Pending);

        let snoozed = engine
            .snooze(&alert.alert_id, TimeStamp::new().plus_days(1), "actor_op")
            .unwrap();
        assert_eq!(snoozed.status, AlertStatus::Snoozed);
        assert!(snoozed.snoozed_until.is_some());

        let acked = engine.acknowledge(&alert.alert_id, "actor_op").unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);

        let resolved = engine.dismiss(&alert.alert_id, "actor_op").unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);

        // resolved alerts stay resolved
        assert!(engine.dismiss(&alert.alert_id, "actor_op").is_err());
    }

    #[test]
    fn evaluation_is_idempotent_per_event_id() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("idempotent.db")).unwrap();
        let trace = Arc::new(TraceIndex::open(&db).unwrap());
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(UnitRegistry::open(&db, trace.clone(), bus.clone()).unwrap());
        let ledger = InventoryLedger::new(registry);
        let engine = AlertEngine::open(&db, Thresholds::default(), trace, bus).unwrap();

        let event = DomainEvent::UnitStateChanged {
            event_id: "evt-recall-1".into(),
            unit_id: "unit_r1".into(),
            donor_id: "donor_r1".into(),
            blood_type: None,
            component: Component::RedBloodCells,
            expires_at: None,
            before: Some(UnitState::Reserved),
            after: UnitState::Recalled,
            released_request: None,
        };

        let first = engine.evaluate(&event, &ledger).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, AlertKind::AdverseEvent);

        // redelivery of the same event id must not double-record, even
        // for a recall that bypasses (kind, subject) deduplication
        let second = engine.evaluate(&event, &ledger).unwrap();
        assert!(second.is_empty());
        assert_eq!(engine.alerts_for("unit_r1").unwrap().len(), 1);
    }

    #[test]
    fn dismissing_pending_critical_leaves_an_override_entry() {
        let dir = tempdir().unwrap();
        let (engine, trace) = open_engine(&dir);

        let alert = engine
            .raise(AlertKind::AdverseEvent, AlertPriority::Critical, "unit_9")
            .unwrap()
            .unwrap();

        engine.dismiss(&alert.alert_id, "actor_supervisor").unwrap();

        let chain: Vec<_> = trace
            .chain_for(&alert.alert_id)
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(chain
            .iter()
            .any(|e| matches!(e.kind, TraceKind::CriticalOverride { .. })));
    }
}

// REQUEST COORDINATOR TESTS (through the service facade)
#[cfg(test)]
mod request_tests {
    use super::*;

    #[test]
    fn boundary_validation_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "validation.db");

        assert!(service
            .submit_request("", BloodType::OPos, Component::RedBloodCells, 1, Urgency::Routine)
            .is_err());
        assert!(service
            .submit_request("patient-1", BloodType::OPos, Component::RedBloodCells, 0, Urgency::Routine)
            .is_err());
        assert!(service.create_donor("  ", "actor_x").is_err());

        let donor = service.create_donor("Test Donor", "actor_x").unwrap();
        assert!(service
            .record_donation(&donor.donor_id, Component::WholeBlood, 0, "bay-1", "actor_x")
            .is_err());
    }

    #[test]
    fn fulfilment_requires_every_unit_issued() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "fulfil.db");

        let donor = service.create_donor("Test Donor", "actor_x").unwrap();
        service
            .record_serology(&donor.donor_id, BloodType::OPos, true, "actor_x")
            .unwrap();
        let unit = service
            .record_donation(&donor.donor_id, Component::RedBloodCells, 450, "bay-1", "actor_x")
            .unwrap();
        let mut version = unit.version;
        for target in [
            UnitState::Processing,
            UnitState::QaPending,
            UnitState::QaPassed,
            UnitState::Available,
        ] {
            version = service
                .advance_unit_state(&unit.unit_id, target, version, "actor_x", None)
                .unwrap()
                .version;
        }

        let request = service
            .submit_request("patient-1", BloodType::OPos, Component::RedBloodCells, 1, Urgency::Routine)
            .unwrap();
        service
            .approve_request(&request.request_id, false, "actor_ward")
            .unwrap();

        // still reserved, not issued
        assert!(service.fulfil_request(&request.request_id, "actor_ward").is_err());

        service.issue_request(&request.request_id, "actor_ward").unwrap();
        let fulfilled = service.fulfil_request(&request.request_id, "actor_ward").unwrap();
        assert_eq!(fulfilled.allocated_units.len(), 1);
    }

    #[test]
    fn reject_only_from_pending() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "reject.db");

        let request = service
            .submit_request("patient-1", BloodType::ONeg, Component::Platelets, 1, Urgency::Routine)
            .unwrap();
        let rejected = service
            .reject_request(&request.request_id, "no clinical justification", "actor_md")
            .unwrap();

        assert!(service
            .reject_request(&rejected.request_id, "again", "actor_md")
            .is_err());
        assert!(service
            .approve_request(&rejected.request_id, false, "actor_ward")
            .is_err());
    }

    #[test]
    fn substitution_uses_the_compatibility_table() {
        let dir = tempdir().unwrap();
        let service = open_service(&dir, "substitution.db");

        // only an O- unit in stock
        let donor = service.create_donor("Universal Donor", "actor_x").unwrap();
        service
            .record_serology(&donor.donor_id, BloodType::ONeg, true, "actor_x")
            .unwrap();
        let unit = service
            .record_donation(&donor.donor_id, Component::RedBloodCells, 450, "bay-1", "actor_x")
            .unwrap();
        let mut version = unit.version;
        for target in [
            UnitState::Processing,
            UnitState::QaPending,
            UnitState::QaPassed,
            UnitState::Available,
        ] {
            version = service
                .advance_unit_state(&unit.unit_id, target, version, "actor_x", None)
                .unwrap()
                .version;
        }

        // exact match only: nothing compatible
        let request = service
            .submit_request("patient-1", BloodType::APos, Component::RedBloodCells, 1, Urgency::Urgent)
            .unwrap();
        let (_, reservation) = service
            .approve_request(&request.request_id, false, "actor_ward")
            .unwrap();
        assert_eq!(reservation.allocated.len(), 0);

        // with substitution the O- unit qualifies for an A+ recipient
        let request = service
            .submit_request("patient-2", BloodType::APos, Component::RedBloodCells, 1, Urgency::Urgent)
            .unwrap();
        let (_, reservation) = service
            .approve_request(&request.request_id, true, "actor_ward")
            .unwrap();
        assert_eq!(reservation.allocated, vec![unit.unit_id]);
    }
}
