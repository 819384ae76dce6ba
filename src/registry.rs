//! Unit Registry: canonical owner of donor and blood unit state.
//!
//! All mutation goes through here. Every write is optimistic-concurrency
//! checked (read, compute, compare-and-swap), appends to the trace chain
//! and publishes a domain event for the downstream ledger and alert
//! engine. Nothing is ever physically deleted; donors receive appended
//! corrections and units only ever reach a terminal state.

use std::sync::Arc;

use chrono::Utc;

use crate::error::EngineError;
use crate::events::{DomainEvent, EventBus};
use crate::trace::{TraceDraft, TraceIndex, TraceKind};
use crate::types::{BloodType, Component, TimeStamp};
use crate::utils::{self, from_cbor, to_cbor};

const DONOR_TREE: &str = "donors";
const UNIT_TREE: &str = "units";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    #[n(0)]
    Collected,
    #[n(1)]
    Processing,
    #[n(2)]
    QaPending,
    #[n(3)]
    QaPassed,
    #[n(4)]
    QaFailed,
    #[n(5)]
    Available,
    #[n(6)]
    Reserved,
    #[n(7)]
    Issued,
    #[n(8)]
    Transfused,
    #[n(9)]
    Expired,
    #[n(10)]
    Discarded,
    #[n(11)]
    Recalled,
}

/// Declarative per-state attributes, replacing stringly-typed dispatch
/// on status names.
pub struct StateAttributes {
    pub label: &'static str,
    pub allocatable: bool,
    pub terminal: bool,
}

impl UnitState {
    pub const fn attributes(self) -> StateAttributes {
        macro_rules! attrs {
            ($label:expr, $alloc:expr, $term:expr) => {
                StateAttributes {
                    label: $label,
                    allocatable: $alloc,
                    terminal: $term,
                }
            };
        }
        match self {
            UnitState::Collected => attrs!("collected", false, false),
            UnitState::Processing => attrs!("processing", false, false),
            UnitState::QaPending => attrs!("qa-pending", false, false),
            UnitState::QaPassed => attrs!("qa-passed", false, false),
            UnitState::QaFailed => attrs!("qa-failed", false, false),
            UnitState::Available => attrs!("available", true, false),
            UnitState::Reserved => attrs!("reserved", false, false),
            UnitState::Issued => attrs!("issued", false, false),
            UnitState::Transfused => attrs!("transfused", false, true),
            UnitState::Expired => attrs!("expired", false, true),
            UnitState::Discarded => attrs!("discarded", false, true),
            UnitState::Recalled => attrs!("recalled", false, true),
        }
    }

    pub const fn is_terminal(self) -> bool {
        self.attributes().terminal
    }

    pub const fn is_allocatable(self) -> bool {
        self.attributes().allocatable
    }

    /// The lifecycle edge set. Recall is legal from any state, the
    /// regulatory override trumps everything else.
    pub fn can_transition_to(self, target: UnitState) -> bool {
        use UnitState::*;
        if target == Recalled {
            return true;
        }
        matches!(
            (self, target),
            (Collected, Processing)
                | (Processing, QaPending)
                | (QaPending, QaPassed)
                | (QaPending, QaFailed)
                | (QaPassed, Available)
                | (Available, Reserved)
                | (Available, Expired)
                | (Available, Discarded)
                | (Reserved, Issued)
                | (Reserved, Available)
                | (Reserved, Expired)
                | (Issued, Transfused)
                | (QaFailed, Discarded)
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    #[n(0)]
    Eligible,
    #[n(1)]
    TemporarilyDeferred {
        #[n(0)]
        reason: String,
        #[n(1)]
        until: TimeStamp<Utc>,
    },
    #[n(2)]
    PermanentlyDeferred {
        #[n(0)]
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub enum Deferral {
    Temporary(TimeStamp<Utc>),
    Permanent,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Donor {
    #[n(0)]
    pub donor_id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub eligibility: Eligibility,
    // None until serology confirms it
    #[n(3)]
    pub blood_type: Option<BloodType>,
    #[n(4)]
    pub registered_at: TimeStamp<Utc>,
}

impl Donor {
    /// A lapsed temporary deferral counts as eligible again.
    pub fn is_eligible_at(&self, now: TimeStamp<Utc>) -> bool {
        match &self.eligibility {
            Eligibility::Eligible => true,
            Eligibility::TemporarilyDeferred { until, .. } => now > *until,
            Eligibility::PermanentlyDeferred { .. } => false,
        }
    }

    fn ineligibility_reason(&self) -> String {
        match &self.eligibility {
            Eligibility::Eligible => String::new(),
            Eligibility::TemporarilyDeferred { reason, .. }
            | Eligibility::PermanentlyDeferred { reason } => reason.clone(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BloodUnit {
    #[n(0)]
    pub unit_id: String,
    #[n(1)]
    pub donor_id: String,
    #[n(2)]
    pub component: Component,
    #[n(3)]
    pub blood_type: Option<BloodType>,
    #[n(4)]
    pub volume_ml: u32,
    #[n(5)]
    pub collected_at: TimeStamp<Utc>,
    // set once when QA passes, immutable afterwards
    #[n(6)]
    pub expires_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub state: UnitState,
    #[n(8)]
    pub location: String,
    // at most one open reservation per unit
    #[n(9)]
    pub reserved_for: Option<String>,
    // optimistic concurrency token
    #[n(10)]
    pub version: u64,
}

pub struct UnitRegistry {
    donor_tree: sled::Tree,
    unit_tree: sled::Tree,
    trace: Arc<TraceIndex>,
    bus: Arc<EventBus>,
}

// which way the unit/request linkage moves during a transition
enum ReservationChange<'a> {
    Keep,
    Attach(&'a str),
}

impl UnitRegistry {
    pub fn open(
        db: &sled::Db,
        trace: Arc<TraceIndex>,
        bus: Arc<EventBus>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            donor_tree: db.open_tree(DONOR_TREE)?,
            unit_tree: db.open_tree(UNIT_TREE)?,
            trace,
            bus,
        })
    }

    pub fn create_donor(&self, name: &str, actor: &str) -> Result<Donor, EngineError> {
        validate_non_empty("donor name", name)?;
        validate_non_empty("actor", actor)?;

        let donor = Donor {
            donor_id: utils::new_id("donor_"),
            name: name.to_string(),
            eligibility: Eligibility::Eligible,
            blood_type: None,
            registered_at: TimeStamp::new(),
        };
        self.donor_tree
            .insert(donor.donor_id.as_bytes(), to_cbor(&donor)?)?;

        self.trace_or_degrade(TraceDraft::new(
            &donor.donor_id,
            actor,
            TraceKind::DonorRegistered {
                name: name.to_string(),
            },
        ));
        tracing::info!(donor = %donor.donor_id, "donor registered");

        Ok(donor)
    }

    pub fn donor(&self, donor_id: &str) -> Result<Donor, EngineError> {
        let bytes = self
            .donor_tree
            .get(donor_id.as_bytes())?
            .ok_or_else(|| EngineError::NotFound {
                kind: "donor",
                id: donor_id.to_string(),
            })?;
        from_cbor(&bytes)
    }

    pub fn unit(&self, unit_id: &str) -> Result<BloodUnit, EngineError> {
        let bytes = self
            .unit_tree
            .get(unit_id.as_bytes())?
            .ok_or_else(|| EngineError::NotFound {
                kind: "unit",
                id: unit_id.to_string(),
            })?;
        from_cbor(&bytes)
    }

    /// Record a successful collection. The donor must be eligible at the
    /// time of recording; the unit starts its lifecycle in `Collected`.
    pub fn record_donation(
        &self,
        donor_id: &str,
        component: Component,
        volume_ml: u32,
        location: &str,
        actor: &str,
    ) -> Result<BloodUnit, EngineError> {
        validate_non_empty("location", location)?;
        validate_non_empty("actor", actor)?;
        if volume_ml == 0 {
            return Err(EngineError::Validation(
                "collected volume must be positive".into(),
            ));
        }

        let donor = self.donor(donor_id)?;
        if !donor.is_eligible_at(TimeStamp::new()) {
            return Err(EngineError::IneligibleDonor {
                donor: donor_id.to_string(),
                reason: donor.ineligibility_reason(),
            });
        }

        let unit = BloodUnit {
            unit_id: utils::new_id("unit_"),
            donor_id: donor_id.to_string(),
            component,
            blood_type: donor.blood_type,
            volume_ml,
            collected_at: TimeStamp::new(),
            expires_at: None,
            state: UnitState::Collected,
            location: location.to_string(),
            reserved_for: None,
            version: 0,
        };
        self.unit_tree
            .insert(unit.unit_id.as_bytes(), to_cbor(&unit)?)?;

        self.trace_or_degrade(TraceDraft::new(
            &unit.unit_id,
            actor,
            TraceKind::UnitCollected {
                donor_id: donor_id.to_string(),
                component,
                volume_ml,
            },
        ));
        tracing::info!(unit = %unit.unit_id, donor = %donor_id, %component, "donation recorded");
        self.publish_unit_event(&unit, None, None);

        Ok(unit)
    }

    /// Advance a unit along the lifecycle graph. `Expired` and `Reserved`
    /// are not reachable here: expiry belongs to the scheduled sweep and
    /// reservations to the inventory ledger, which track the extra
    /// bookkeeping those transitions need.
    pub fn advance_unit_state(
        &self,
        unit_id: &str,
        target: UnitState,
        expected_version: u64,
        actor: &str,
        evidence: Option<&str>,
    ) -> Result<BloodUnit, EngineError> {
        validate_non_empty("actor", actor)?;
        match target {
            UnitState::Expired => {
                return Err(EngineError::Validation(
                    "units expire only via the scheduled sweep".into(),
                ));
            }
            UnitState::Reserved => {
                return Err(EngineError::Validation(
                    "reservations are made through the inventory ledger".into(),
                ));
            }
            _ => {}
        }
        self.transition(
            unit_id,
            expected_version,
            target,
            actor,
            evidence,
            ReservationChange::Keep,
        )
    }

    pub fn defer_donor(
        &self,
        donor_id: &str,
        reason: &str,
        deferral: Deferral,
        actor: &str,
    ) -> Result<Donor, EngineError> {
        validate_non_empty("deferral reason", reason)?;
        validate_non_empty("actor", actor)?;

        let donor = self.update_donor(donor_id, |donor| {
            donor.eligibility = match deferral {
                Deferral::Temporary(until) => Eligibility::TemporarilyDeferred {
                    reason: reason.to_string(),
                    until,
                },
                Deferral::Permanent => Eligibility::PermanentlyDeferred {
                    reason: reason.to_string(),
                },
            };
        })?;

        let until = match deferral {
            Deferral::Temporary(until) => Some(until),
            Deferral::Permanent => None,
        };
        self.trace_or_degrade(TraceDraft::new(
            donor_id,
            actor,
            TraceKind::DonorDeferred {
                reason: reason.to_string(),
                permanent: until.is_none(),
                until,
            },
        ));
        tracing::info!(donor = %donor_id, %reason, "donor deferred");
        self.bus.publish(&DomainEvent::DonorEligibilityChanged {
            event_id: utils::new_event_id(),
            donor_id: donor_id.to_string(),
            eligible: false,
        });

        Ok(donor)
    }

    /// Serology outcome: confirms the donor's blood type (and copies it
    /// onto the donor's units that still lack one); a failed screen
    /// permanently defers the donor.
    pub fn record_serology(
        &self,
        donor_id: &str,
        blood_type: BloodType,
        passed: bool,
        actor: &str,
    ) -> Result<Donor, EngineError> {
        validate_non_empty("actor", actor)?;

        let donor = self.update_donor(donor_id, |donor| {
            donor.blood_type = Some(blood_type);
            if !passed {
                donor.eligibility = Eligibility::PermanentlyDeferred {
                    reason: "failed serology screening".into(),
                };
            }
        })?;

        self.trace_or_degrade(TraceDraft::new(
            donor_id,
            actor,
            TraceKind::SerologyRecorded {
                blood_type: Some(blood_type),
                passed,
            },
        ));
        if !passed {
            tracing::warn!(donor = %donor_id, "serology failed, donor permanently deferred");
            self.bus.publish(&DomainEvent::DonorEligibilityChanged {
                event_id: utils::new_event_id(),
                donor_id: donor_id.to_string(),
                eligible: false,
            });
        }

        for unit in self.units_for_donor(donor_id) {
            let unit = unit?;
            if unit.blood_type.is_none() && !unit.state.is_terminal() {
                self.confirm_unit_blood_type(&unit.unit_id, blood_type, actor)?;
            }
        }

        Ok(donor)
    }

    /// Scan over every unit record. Read-only; used by the ledger for
    /// stock, candidate selection and the expiry sweep.
    pub fn units(&self) -> impl Iterator<Item = Result<BloodUnit, EngineError>> + '_ {
        self.unit_tree.iter().map(|kv| match kv {
            Ok((_, bytes)) => from_cbor(&bytes),
            Err(e) => Err(EngineError::Storage(e)),
        })
    }

    pub fn units_for_donor<'a>(
        &'a self,
        donor_id: &'a str,
    ) -> impl Iterator<Item = Result<BloodUnit, EngineError>> + 'a {
        self.units().filter(move |unit| match unit {
            Ok(unit) => unit.donor_id == donor_id,
            Err(_) => true,
        })
    }

    pub(crate) fn reserve_for_request(
        &self,
        unit_id: &str,
        expected_version: u64,
        request_id: &str,
        actor: &str,
    ) -> Result<BloodUnit, EngineError> {
        self.transition(
            unit_id,
            expected_version,
            UnitState::Reserved,
            actor,
            Some(request_id),
            ReservationChange::Attach(request_id),
        )
    }

    pub(crate) fn release_reservation(
        &self,
        unit_id: &str,
        expected_version: u64,
        actor: &str,
    ) -> Result<BloodUnit, EngineError> {
        self.transition(
            unit_id,
            expected_version,
            UnitState::Available,
            actor,
            None,
            ReservationChange::Keep,
        )
    }

    pub(crate) fn issue_unit(
        &self,
        unit_id: &str,
        expected_version: u64,
        actor: &str,
    ) -> Result<BloodUnit, EngineError> {
        self.transition(
            unit_id,
            expected_version,
            UnitState::Issued,
            actor,
            None,
            ReservationChange::Keep,
        )
    }

    /// Sweep-only entry point; refuses units that are not past expiry.
    pub(crate) fn expire_unit(
        &self,
        unit_id: &str,
        expected_version: u64,
        now: TimeStamp<Utc>,
        actor: &str,
    ) -> Result<BloodUnit, EngineError> {
        let unit = self.unit(unit_id)?;
        match unit.expires_at {
            Some(expires_at) if now > expires_at => {}
            _ => {
                return Err(EngineError::Validation(
                    "unit is not past its expiry timestamp".into(),
                ));
            }
        }
        self.transition(
            unit_id,
            expected_version,
            UnitState::Expired,
            actor,
            None,
            ReservationChange::Keep,
        )
    }

    fn transition(
        &self,
        unit_id: &str,
        expected_version: u64,
        target: UnitState,
        actor: &str,
        evidence: Option<&str>,
        reservation: ReservationChange<'_>,
    ) -> Result<BloodUnit, EngineError> {
        let key = unit_id.as_bytes();
        let old_bytes = self
            .unit_tree
            .get(key)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "unit",
                id: unit_id.to_string(),
            })?;
        let mut unit: BloodUnit = from_cbor(&old_bytes)?;

        if unit.version != expected_version {
            return Err(EngineError::ConcurrentModification);
        }
        let before = unit.state;
        if !before.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                from: before,
                to: target,
            });
        }

        match target {
            UnitState::Processing => {
                let donor = self.donor(&unit.donor_id)?;
                if !donor.is_eligible_at(TimeStamp::new()) {
                    return Err(EngineError::IneligibleDonor {
                        donor: unit.donor_id.clone(),
                        reason: donor.ineligibility_reason(),
                    });
                }
            }
            UnitState::QaFailed => {
                if evidence.is_none() {
                    return Err(EngineError::Validation(
                        "qa failure requires a discard reason".into(),
                    ));
                }
            }
            UnitState::QaPassed => {
                // the expiry timestamp is frozen here and never rewritten
                if unit.expires_at.is_none() {
                    unit.expires_at =
                        Some(TimeStamp::new().plus_days(unit.component.shelf_life_days()));
                }
            }
            _ => {}
        }

        let mut released_request = None;
        match reservation {
            ReservationChange::Attach(request_id) => {
                unit.reserved_for = Some(request_id.to_string());
            }
            ReservationChange::Keep => {
                // these transitions detach the unit from any request
                if matches!(
                    target,
                    UnitState::Available | UnitState::Expired | UnitState::Recalled
                ) {
                    released_request = unit.reserved_for.take();
                }
            }
        }

        unit.state = target;
        unit.version += 1;

        let new_bytes = to_cbor(&unit)?;
        self.unit_tree
            .compare_and_swap(key, Some(old_bytes), Some(new_bytes))?
            .map_err(|_| EngineError::ConcurrentModification)?;

        let mut draft = TraceDraft::new(
            unit_id,
            actor,
            TraceKind::UnitStateChanged {
                before,
                after: target,
                evidence: evidence.map(str::to_string),
            },
        );
        if target == UnitState::Recalled {
            draft = draft.critical();
        }
        self.trace_or_degrade(draft);

        tracing::info!(unit = %unit_id, from = ?before, to = ?target, "unit state advanced");
        self.publish_unit_event(&unit, Some(before), released_request);

        Ok(unit)
    }

    fn update_donor(
        &self,
        donor_id: &str,
        mutate: impl Fn(&mut Donor),
    ) -> Result<Donor, EngineError> {
        let key = donor_id.as_bytes();
        let old_bytes = self
            .donor_tree
            .get(key)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "donor",
                id: donor_id.to_string(),
            })?;
        let mut donor: Donor = from_cbor(&old_bytes)?;
        mutate(&mut donor);

        let new_bytes = to_cbor(&donor)?;
        self.donor_tree
            .compare_and_swap(key, Some(old_bytes), Some(new_bytes))?
            .map_err(|_| EngineError::ConcurrentModification)?;

        Ok(donor)
    }

    fn confirm_unit_blood_type(
        &self,
        unit_id: &str,
        blood_type: BloodType,
        actor: &str,
    ) -> Result<(), EngineError> {
        for _ in 0..3 {
            let key = unit_id.as_bytes();
            let Some(old_bytes) = self.unit_tree.get(key)? else {
                return Ok(());
            };
            let mut unit: BloodUnit = from_cbor(&old_bytes)?;
            if unit.blood_type.is_some() {
                return Ok(());
            }
            unit.blood_type = Some(blood_type);
            unit.version += 1;

            let new_bytes = to_cbor(&unit)?;
            match self
                .unit_tree
                .compare_and_swap(key, Some(old_bytes), Some(new_bytes))?
            {
                Ok(()) => {
                    self.trace_or_degrade(TraceDraft::new(
                        unit_id,
                        actor,
                        TraceKind::SerologyRecorded {
                            blood_type: Some(blood_type),
                            passed: true,
                        },
                    ));
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
        Err(EngineError::ConcurrentModification)
    }

    fn publish_unit_event(
        &self,
        unit: &BloodUnit,
        before: Option<UnitState>,
        released_request: Option<String>,
    ) {
        self.bus.publish(&DomainEvent::UnitStateChanged {
            event_id: utils::new_event_id(),
            unit_id: unit.unit_id.clone(),
            donor_id: unit.donor_id.clone(),
            blood_type: unit.blood_type,
            component: unit.component,
            expires_at: unit.expires_at,
            before,
            after: unit.state,
            released_request,
        });
    }

    // trace failures are logged and surfaced as a degraded-mode event,
    // never allowed to fail the mutation that already committed
    fn trace_or_degrade(&self, draft: TraceDraft) {
        let subject = draft.subject_id.clone();
        if let Err(err) = self.trace.append_with_retry(draft) {
            tracing::error!(subject = %subject, error = %err, "trace append exhausted retries");
            self.bus.publish(&DomainEvent::TraceDegraded {
                event_id: utils::new_event_id(),
                subject_id: subject,
            });
        }
    }
}

fn validate_non_empty(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recall_is_legal_from_every_state() {
        use UnitState::*;
        for state in [
            Collected, Processing, QaPending, QaPassed, QaFailed, Available, Reserved, Issued,
            Transfused, Expired, Discarded, Recalled,
        ] {
            assert!(state.can_transition_to(Recalled));
        }
    }

    #[test]
    fn no_edge_skips_qa() {
        use UnitState::*;
        for state in [Collected, Processing, QaPending, QaFailed] {
            assert!(!state.can_transition_to(Available));
        }
        assert!(QaPassed.can_transition_to(Available));
    }

    #[test]
    fn terminal_states_only_allow_recall() {
        use UnitState::*;
        for state in [Transfused, Expired, Discarded, Recalled] {
            assert!(state.is_terminal());
            for target in [
                Collected, Processing, QaPending, QaPassed, QaFailed, Available, Reserved, Issued,
                Transfused, Expired, Discarded,
            ] {
                assert!(!state.can_transition_to(target), "{state:?} -> {target:?}");
            }
        }
    }

    #[test]
    fn lapsed_temporary_deferral_is_eligible() {
        let donor = Donor {
            donor_id: "donor_1".into(),
            name: "Ada".into(),
            eligibility: Eligibility::TemporarilyDeferred {
                reason: "low haemoglobin".into(),
                until: TimeStamp::new(),
            },
            blood_type: None,
            registered_at: TimeStamp::new(),
        };
        assert!(donor.is_eligible_at(TimeStamp::new().plus_days(1)));
        assert!(!donor.is_eligible_at(TimeStamp::new().plus_days(-1)));
    }
}
