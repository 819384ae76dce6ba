//! Domain events published by the core components.
//!
//! Writes flow one way: Registry mutations -> Ledger recomputation ->
//! Alert evaluation -> Trace append. The bus carries the typed events
//! between those stages and out to external consumers (dashboards,
//! notification services). Consumers must treat delivery as
//! at-least-once and dedupe on the event id.

use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::alerts::{AlertKind, AlertPriority, AlertStatus};
use crate::registry::UnitState;
use crate::requests::RequestStatus;
use crate::types::{BloodType, Component, TimeStamp};
use crate::utils::lock_recover;

#[derive(Debug, Clone)]
pub enum DomainEvent {
    UnitStateChanged {
        event_id: String,
        unit_id: String,
        donor_id: String,
        blood_type: Option<BloodType>,
        component: Component,
        expires_at: Option<TimeStamp<Utc>>,
        before: Option<UnitState>,
        after: UnitState,
        /// set when the transition detached the unit from a request
        released_request: Option<String>,
    },
    DonorEligibilityChanged {
        event_id: String,
        donor_id: String,
        eligible: bool,
    },
    AlertRaised {
        event_id: String,
        alert_id: String,
        kind: AlertKind,
        priority: AlertPriority,
        subject: String,
    },
    AlertStatusChanged {
        event_id: String,
        alert_id: String,
        status: AlertStatus,
    },
    RequestStatusChanged {
        event_id: String,
        request_id: String,
        before: RequestStatus,
        after: RequestStatus,
    },
    /// trace append exhausted its retries; operators need to know
    TraceDegraded {
        event_id: String,
        subject_id: String,
    },
}

impl DomainEvent {
    pub fn event_id(&self) -> &str {
        match self {
            DomainEvent::UnitStateChanged { event_id, .. }
            | DomainEvent::DonorEligibilityChanged { event_id, .. }
            | DomainEvent::AlertRaised { event_id, .. }
            | DomainEvent::AlertStatusChanged { event_id, .. }
            | DomainEvent::RequestStatusChanged { event_id, .. }
            | DomainEvent::TraceDegraded { event_id, .. } => event_id,
        }
    }
}

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &DomainEvent);
}

/// In-process fan-out bus. Subscribers are invoked on the publishing
/// thread; the list is snapshotted before delivery so a subscriber may
/// itself publish without deadlocking.
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        lock_recover(&self.subscribers).push(subscriber);
    }

    pub fn publish(&self, event: &DomainEvent) {
        let snapshot: Vec<_> = lock_recover(&self.subscribers).clone();
        for subscriber in snapshot {
            subscriber.on_event(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
