//! Request/Allocation Coordinator.
//!
//! Matches clinical requests against inventory through the ledger and
//! tracks the request state machine. The coordinator also listens on the
//! event bus: when a reserved unit expires or is recalled it prunes the
//! unit from the request's allocation list.

use std::sync::Arc;

use chrono::Utc;

use crate::alerts::{AlertEngine, AlertKind, AlertPriority};
use crate::error::EngineError;
use crate::events::{DomainEvent, EventBus, EventSubscriber};
use crate::ledger::{InventoryLedger, Reservation, ReserveCriteria, ReserveOutcome};
use crate::registry::{UnitRegistry, UnitState};
use crate::trace::{TraceDraft, TraceIndex, TraceKind};
use crate::types::{BloodType, Component, TimeStamp, Urgency};
use crate::utils::{self, from_cbor, to_cbor};

const REQUEST_TREE: &str = "requests";
const PRUNE_ATTEMPTS: u32 = 5;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Fulfilled,
    #[n(3)]
    Rejected,
    #[n(4)]
    Cancelled,
}

impl RequestStatus {
    pub fn can_transition_to(self, target: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, target),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Approved, Fulfilled)
                | (Approved, Cancelled)
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub patient_ref: String,
    #[n(2)]
    pub blood_type: BloodType,
    #[n(3)]
    pub component: Component,
    #[n(4)]
    pub quantity: u32,
    #[n(5)]
    pub urgency: Urgency,
    #[n(6)]
    pub status: RequestStatus,
    #[n(7)]
    pub allocated_units: Vec<String>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    // optimistic concurrency token
    #[n(9)]
    pub version: u64,
}

pub struct RequestCoordinator {
    tree: sled::Tree,
    registry: Arc<UnitRegistry>,
    ledger: Arc<InventoryLedger>,
    alerts: Arc<AlertEngine>,
    trace: Arc<TraceIndex>,
    bus: Arc<EventBus>,
}

impl RequestCoordinator {
    pub fn open(
        db: &sled::Db,
        registry: Arc<UnitRegistry>,
        ledger: Arc<InventoryLedger>,
        alerts: Arc<AlertEngine>,
        trace: Arc<TraceIndex>,
        bus: Arc<EventBus>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            tree: db.open_tree(REQUEST_TREE)?,
            registry,
            ledger,
            alerts,
            trace,
            bus,
        })
    }

    pub fn submit(
        &self,
        patient_ref: &str,
        blood_type: BloodType,
        component: Component,
        quantity: u32,
        urgency: Urgency,
    ) -> Result<Request, EngineError> {
        if patient_ref.trim().is_empty() {
            return Err(EngineError::Validation(
                "patient reference must not be empty".into(),
            ));
        }
        if quantity == 0 {
            return Err(EngineError::Validation(
                "requested quantity must be positive".into(),
            ));
        }

        let request = Request {
            request_id: utils::new_id("req_"),
            patient_ref: patient_ref.to_string(),
            blood_type,
            component,
            quantity,
            urgency,
            status: RequestStatus::Pending,
            allocated_units: Vec::new(),
            created_at: TimeStamp::new(),
            version: 0,
        };
        self.tree
            .insert(request.request_id.as_bytes(), to_cbor(&request)?)?;
        tracing::info!(request = %request.request_id, %blood_type, %component, quantity, "request submitted");

        Ok(request)
    }

    pub fn request(&self, request_id: &str) -> Result<Request, EngineError> {
        let bytes = self
            .tree
            .get(request_id.as_bytes())?
            .ok_or_else(|| EngineError::NotFound {
                kind: "request",
                id: request_id.to_string(),
            })?;
        from_cbor(&bytes)
    }

    /// Approve a pending request and reserve inventory for it. A partial
    /// reservation leaves the request approved with what was allocated;
    /// for an emergency request the shortfall additionally raises a
    /// Critical alert rather than waiting silently.
    pub fn approve(
        &self,
        request_id: &str,
        allow_substitution: bool,
        actor: &str,
    ) -> Result<(Request, Reservation), EngineError> {
        let request = self.request(request_id)?;
        if !request.status.can_transition_to(RequestStatus::Approved) {
            return Err(EngineError::Validation(format!(
                "request {request_id} cannot be approved from {:?}",
                request.status
            )));
        }

        let criteria = ReserveCriteria {
            blood_type: request.blood_type,
            component: request.component,
            allow_substitution,
        };
        let reservation = self.ledger.reserve(request_id, &criteria, request.quantity)?;

        let approved = match self.update(request_id, actor, RequestStatus::Approved, |request| {
            request.allocated_units = reservation.allocated.clone();
        }) {
            Ok(approved) => approved,
            Err(err) => {
                // a racing writer settled the request while inventory was
                // being reserved; hand the just-reserved units back
                self.ledger.release(request_id)?;
                return Err(err);
            }
        };

        if let ReserveOutcome::PartialFulfillment { missing } = reservation.outcome {
            tracing::warn!(request = %request_id, missing, "request only partially fulfilled");
            if request.urgency == Urgency::Emergency {
                self.alerts.raise(
                    AlertKind::EmergencyShortfall,
                    AlertPriority::Critical,
                    request_id,
                )?;
            }
        }

        Ok((approved, reservation))
    }

    pub fn cancel(&self, request_id: &str, actor: &str) -> Result<Request, EngineError> {
        let cancelled = self.update(request_id, actor, RequestStatus::Cancelled, |request| {
            request.allocated_units.clear();
        })?;
        // units go back to stock only after the cancellation committed,
        // so a racing approve cannot re-attach them mid-release
        self.ledger.release(request_id)?;
        Ok(cancelled)
    }

    pub fn reject(
        &self,
        request_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<Request, EngineError> {
        self.update_with_evidence(request_id, actor, RequestStatus::Rejected, Some(reason), |_| {})
    }

    /// Issue the reserved units to the ward.
    pub fn issue(&self, request_id: &str, actor: &str) -> Result<Request, EngineError> {
        let request = self.request(request_id)?;
        if request.status != RequestStatus::Approved {
            return Err(EngineError::Validation(format!(
                "request {request_id} must be approved before issue, is {:?}",
                request.status
            )));
        }
        self.ledger.mark_issued(request_id)?;
        tracing::info!(request = %request_id, actor, "reserved units issued");
        Ok(self.request(request_id)?)
    }

    /// A request is fulfilled only once every allocated unit has reached
    /// `Issued`.
    pub fn fulfil(&self, request_id: &str, actor: &str) -> Result<Request, EngineError> {
        let request = self.request(request_id)?;
        for unit_id in &request.allocated_units {
            let unit = self.registry.unit(unit_id)?;
            if unit.state != UnitState::Issued {
                return Err(EngineError::Validation(format!(
                    "unit {unit_id} is {:?}, all allocated units must be issued",
                    unit.state
                )));
            }
        }
        self.update(request_id, actor, RequestStatus::Fulfilled, |_| {})
    }

    // read-validate-CAS; concurrent writers get ConcurrentModification
    fn update(
        &self,
        request_id: &str,
        actor: &str,
        target: RequestStatus,
        mutate: impl Fn(&mut Request),
    ) -> Result<Request, EngineError> {
        self.update_with_evidence(request_id, actor, target, None, mutate)
    }

    // the edge is checked against the freshly read status, not against
    // whatever the caller saw earlier; a writer that lost the race gets
    // an error instead of overwriting the winner's transition
    fn update_with_evidence(
        &self,
        request_id: &str,
        actor: &str,
        target: RequestStatus,
        evidence: Option<&str>,
        mutate: impl Fn(&mut Request),
    ) -> Result<Request, EngineError> {
        let key = request_id.as_bytes();
        let old_bytes = self
            .tree
            .get(key)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "request",
                id: request_id.to_string(),
            })?;
        let mut request: Request = from_cbor(&old_bytes)?;
        let before = request.status;
        if !before.can_transition_to(target) {
            return Err(EngineError::Validation(format!(
                "request {request_id} cannot move from {before:?} to {target:?}"
            )));
        }
        request.status = target;
        mutate(&mut request);
        request.version += 1;

        let new_bytes = to_cbor(&request)?;
        self.tree
            .compare_and_swap(key, Some(old_bytes), Some(new_bytes))?
            .map_err(|_| EngineError::ConcurrentModification)?;

        if let Err(err) = self.trace.append_with_retry(TraceDraft::new(
            request_id,
            actor,
            TraceKind::RequestStatusChanged {
                before,
                after: target,
                evidence: evidence.map(str::to_string),
            },
        )) {
            tracing::error!(request = %request_id, error = %err, "trace append exhausted retries");
            self.bus.publish(&DomainEvent::TraceDegraded {
                event_id: utils::new_event_id(),
                subject_id: request_id.to_string(),
            });
        }
        self.bus.publish(&DomainEvent::RequestStatusChanged {
            event_id: utils::new_event_id(),
            request_id: request_id.to_string(),
            before,
            after: target,
        });

        Ok(request)
    }

    // idempotent: pruning a unit that is already gone is a no-op
    fn remove_allocation(&self, request_id: &str, unit_id: &str) -> Result<(), EngineError> {
        for _ in 0..PRUNE_ATTEMPTS {
            let key = request_id.as_bytes();
            let Some(old_bytes) = self.tree.get(key)? else {
                return Ok(());
            };
            let mut request: Request = from_cbor(&old_bytes)?;
            if !request.allocated_units.iter().any(|u| u == unit_id) {
                return Ok(());
            }
            request.allocated_units.retain(|u| u != unit_id);
            request.version += 1;

            let new_bytes = to_cbor(&request)?;
            match self
                .tree
                .compare_and_swap(key, Some(old_bytes), Some(new_bytes))?
            {
                Ok(()) => {
                    tracing::info!(request = %request_id, unit = %unit_id, "unit pruned from allocation");
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
        Err(EngineError::ConcurrentModification)
    }
}

impl EventSubscriber for RequestCoordinator {
    fn on_event(&self, event: &DomainEvent) {
        if let DomainEvent::UnitStateChanged {
            unit_id,
            after: UnitState::Expired | UnitState::Recalled,
            released_request: Some(request_id),
            ..
        } = event
        {
            if let Err(err) = self.remove_allocation(request_id, unit_id) {
                tracing::warn!(
                    request = %request_id,
                    unit = %unit_id,
                    error = %err,
                    "failed to prune expired or recalled unit from allocation"
                );
            }
        }
    }
}
