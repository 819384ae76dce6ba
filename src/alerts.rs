//! Threshold & Alert Engine.
//!
//! `evaluate` is a pure function of the incoming event and the current
//! aggregate counts; it owns alert creation but never mutates alerts it
//! did not just create. A seen-event-id tree makes at-least-once event
//! redelivery safe, and an open alert of the same (kind, subject) only
//! has its last-seen timestamp bumped so repeated low-stock events do not
//! become an alert storm.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::error::EngineError;
use crate::events::{DomainEvent, EventBus};
use crate::ledger::InventoryLedger;
use crate::registry::UnitState;
use crate::trace::{TraceDraft, TraceIndex, TraceKind};
use crate::types::{BloodType, Component, TimeStamp};
use crate::utils::{self, from_cbor, to_cbor};

const ALERT_TREE: &str = "alerts";
const SEEN_TREE: &str = "alert_seen_events";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    #[n(0)]
    LowStock,
    #[n(1)]
    ExpiryWarning,
    #[n(2)]
    ReservationExpired,
    #[n(3)]
    AdverseEvent,
    #[n(4)]
    EmergencyShortfall,
    #[n(5)]
    TraceDegraded,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertPriority {
    #[n(0)]
    Info,
    #[n(1)]
    Warning,
    #[n(2)]
    Critical,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Acknowledged,
    #[n(2)]
    Snoozed,
    #[n(3)]
    Resolved,
}

impl AlertStatus {
    /// Open alerts participate in deduplication.
    pub fn is_open(self) -> bool {
        matches!(self, AlertStatus::Pending | AlertStatus::Snoozed)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    #[n(0)]
    pub alert_id: String,
    #[n(1)]
    pub kind: AlertKind,
    #[n(2)]
    pub priority: AlertPriority,
    #[n(3)]
    pub subject: String,
    #[n(4)]
    pub status: AlertStatus,
    #[n(5)]
    pub raised_at: TimeStamp<Utc>,
    #[n(6)]
    pub last_seen: TimeStamp<Utc>,
    #[n(7)]
    pub snoozed_until: Option<TimeStamp<Utc>>,
    // actor of the last status change
    #[n(8)]
    pub actor: Option<String>,
}

/// Externalized threshold configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub low_stock_minimum: u64,
    pub low_stock_overrides: HashMap<(BloodType, Component), u64>,
    pub expiry_warning_days: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_stock_minimum: 10,
            low_stock_overrides: HashMap::new(),
            expiry_warning_days: 7,
        }
    }
}

impl Thresholds {
    fn minimum_for(&self, blood_type: BloodType, component: Component) -> u64 {
        self.low_stock_overrides
            .get(&(blood_type, component))
            .copied()
            .unwrap_or(self.low_stock_minimum)
    }
}

pub struct AlertEngine {
    tree: sled::Tree,
    seen: sled::Tree,
    thresholds: Thresholds,
    trace: Arc<TraceIndex>,
    bus: Arc<EventBus>,
}

impl AlertEngine {
    pub fn open(
        db: &sled::Db,
        thresholds: Thresholds,
        trace: Arc<TraceIndex>,
        bus: Arc<EventBus>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            tree: db.open_tree(ALERT_TREE)?,
            seen: db.open_tree(SEEN_TREE)?,
            thresholds,
            trace,
            bus,
        })
    }

    /// Evaluate the configured rules against one event. Returns the
    /// alerts created by this call; deduplicated matches only get their
    /// last-seen bumped. Idempotent per event id.
    pub fn evaluate(
        &self,
        event: &DomainEvent,
        ledger: &InventoryLedger,
    ) -> Result<Vec<Alert>, EngineError> {
        if self.seen.get(event.event_id().as_bytes())?.is_some() {
            return Ok(Vec::new());
        }

        let mut raised = Vec::new();
        match event {
            DomainEvent::UnitStateChanged {
                unit_id,
                blood_type,
                component,
                expires_at,
                after,
                released_request,
                ..
            } => {
                if *after == UnitState::Recalled {
                    // regulatory recall bypasses dedup: every recall is
                    // its own alert no matter what is already open
                    raised.push(self.create_alert(
                        AlertKind::AdverseEvent,
                        AlertPriority::Critical,
                        unit_id,
                    )?);
                }
                if *after == UnitState::Expired {
                    if let Some(request_id) = released_request {
                        if let Some(alert) = self.raise(
                            AlertKind::ReservationExpired,
                            AlertPriority::Warning,
                            request_id,
                        )? {
                            raised.push(alert);
                        }
                    }
                }
                if *after == UnitState::Available {
                    if let Some(expires_at) = expires_at {
                        let horizon =
                            TimeStamp::new().plus_days(self.thresholds.expiry_warning_days);
                        if *expires_at <= horizon {
                            if let Some(alert) = self.raise(
                                AlertKind::ExpiryWarning,
                                AlertPriority::Info,
                                unit_id,
                            )? {
                                raised.push(alert);
                            }
                        }
                    }
                }
                if let Some(blood_type) = blood_type {
                    let stock = ledger.current_stock(*blood_type, *component)?;
                    if stock < self.thresholds.minimum_for(*blood_type, *component) {
                        let subject = format!("{blood_type}/{component}");
                        if let Some(alert) =
                            self.raise(AlertKind::LowStock, AlertPriority::Warning, &subject)?
                        {
                            raised.push(alert);
                        }
                    }
                }
            }
            DomainEvent::TraceDegraded { subject_id, .. } => {
                if let Some(alert) = self.raise(
                    AlertKind::TraceDegraded,
                    AlertPriority::Critical,
                    subject_id,
                )? {
                    raised.push(alert);
                }
            }
            _ => {}
        }

        // marked seen only once every rule ran; a redelivery after a
        // mid-evaluation storage failure is still processed
        self.seen.insert(event.event_id().as_bytes(), &[])?;
        Ok(raised)
    }

    /// Raise an alert with deduplication: an open alert of the same
    /// (kind, subject) is extended instead. `None` means deduplicated.
    pub fn raise(
        &self,
        kind: AlertKind,
        priority: AlertPriority,
        subject: &str,
    ) -> Result<Option<Alert>, EngineError> {
        for existing in self.iter_alerts() {
            let mut existing = existing?;
            if existing.kind == kind && existing.subject == subject && existing.status.is_open() {
                existing.last_seen = TimeStamp::new();
                self.save(&existing)?;
                return Ok(None);
            }
        }
        Ok(Some(self.create_alert(kind, priority, subject)?))
    }

    pub fn acknowledge(&self, alert_id: &str, actor: &str) -> Result<Alert, EngineError> {
        self.change_status(alert_id, actor, AlertStatus::Acknowledged, |status| {
            status.is_open()
        })
    }

    pub fn snooze(
        &self,
        alert_id: &str,
        until: TimeStamp<Utc>,
        actor: &str,
    ) -> Result<Alert, EngineError> {
        let mut alert = self.change_status(alert_id, actor, AlertStatus::Snoozed, |status| {
            status == AlertStatus::Pending
        })?;
        alert.snoozed_until = Some(until);
        self.save(&alert)?;
        Ok(alert)
    }

    /// Dismissing a pending Critical alert is allowed, but never silent:
    /// it leaves an explicit override entry in the trace chain.
    pub fn dismiss(&self, alert_id: &str, actor: &str) -> Result<Alert, EngineError> {
        let before = self.alert(alert_id)?;
        let alert = self.change_status(alert_id, actor, AlertStatus::Resolved, |status| {
            status != AlertStatus::Resolved
        })?;

        if before.status == AlertStatus::Pending && before.priority == AlertPriority::Critical {
            let draft = TraceDraft::new(
                alert_id,
                actor,
                TraceKind::CriticalOverride {
                    detail: format!("pending critical {:?} alert dismissed", before.kind),
                },
            )
            .critical();
            self.trace.append_with_retry(draft)?;
        }
        Ok(alert)
    }

    pub fn alert(&self, alert_id: &str) -> Result<Alert, EngineError> {
        let bytes = self
            .tree
            .get(alert_id.as_bytes())?
            .ok_or_else(|| EngineError::NotFound {
                kind: "alert",
                id: alert_id.to_string(),
            })?;
        from_cbor(&bytes)
    }

    pub fn open_alerts(&self) -> Result<Vec<Alert>, EngineError> {
        let mut open = Vec::new();
        for alert in self.iter_alerts() {
            let alert = alert?;
            if alert.status.is_open() {
                open.push(alert);
            }
        }
        open.sort_by(|a, b| a.raised_at.cmp(&b.raised_at));
        Ok(open)
    }

    pub fn alerts_for(&self, subject: &str) -> Result<Vec<Alert>, EngineError> {
        let mut matching = Vec::new();
        for alert in self.iter_alerts() {
            let alert = alert?;
            if alert.subject == subject {
                matching.push(alert);
            }
        }
        matching.sort_by(|a, b| a.raised_at.cmp(&b.raised_at));
        Ok(matching)
    }

    fn create_alert(
        &self,
        kind: AlertKind,
        priority: AlertPriority,
        subject: &str,
    ) -> Result<Alert, EngineError> {
        let now = TimeStamp::new();
        let alert = Alert {
            alert_id: utils::new_id("alert_"),
            kind,
            priority,
            subject: subject.to_string(),
            status: AlertStatus::Pending,
            raised_at: now,
            last_seen: now,
            snoozed_until: None,
            actor: None,
        };
        self.save(&alert)?;

        tracing::info!(alert = %alert.alert_id, kind = ?kind, %subject, "alert raised");
        self.bus.publish(&DomainEvent::AlertRaised {
            event_id: utils::new_event_id(),
            alert_id: alert.alert_id.clone(),
            kind,
            priority,
            subject: subject.to_string(),
        });

        Ok(alert)
    }

    fn change_status(
        &self,
        alert_id: &str,
        actor: &str,
        target: AlertStatus,
        allowed: impl Fn(AlertStatus) -> bool,
    ) -> Result<Alert, EngineError> {
        let mut alert = self.alert(alert_id)?;
        if !allowed(alert.status) {
            return Err(EngineError::Validation(format!(
                "alert {alert_id} cannot move from {:?} to {target:?}",
                alert.status
            )));
        }
        alert.status = target;
        alert.actor = Some(actor.to_string());
        self.save(&alert)?;

        self.bus.publish(&DomainEvent::AlertStatusChanged {
            event_id: utils::new_event_id(),
            alert_id: alert_id.to_string(),
            status: target,
        });
        Ok(alert)
    }

    fn save(&self, alert: &Alert) -> Result<(), EngineError> {
        self.tree
            .insert(alert.alert_id.as_bytes(), to_cbor(alert)?)?;
        Ok(())
    }

    fn iter_alerts(&self) -> impl Iterator<Item = Result<Alert, EngineError>> + '_ {
        self.tree.iter().map(|kv| match kv {
            Ok((_, bytes)) => from_cbor(&bytes),
            Err(e) => Err(EngineError::Storage(e)),
        })
    }
}
