//! Service layer API wiring the engine components over one sled database.
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::alerts::{Alert, AlertEngine, Thresholds};
use crate::events::{DomainEvent, EventBus, EventSubscriber};
use crate::ledger::{InventoryLedger, Reservation, StockLevel, SweepReport};
use crate::registry::{BloodUnit, Deferral, Donor, UnitRegistry, UnitState};
use crate::requests::{Request, RequestCoordinator};
use crate::trace::{TraceEvent, TraceIndex};
use crate::types::{BloodType, Component, TimeStamp, Urgency};
use crate::utils::lock_recover;

/// Connects alert evaluation to the event stream. Evaluation errors are
/// logged, never allowed to poison the publishing mutation.
struct AlertEvaluator {
    alerts: Arc<AlertEngine>,
    ledger: Arc<InventoryLedger>,
}

impl EventSubscriber for AlertEvaluator {
    fn on_event(&self, event: &DomainEvent) {
        if let Err(err) = self.alerts.evaluate(event, &self.ledger) {
            tracing::error!(event = event.event_id(), error = %err, "alert evaluation failed");
        }
    }
}

pub struct BloodBankService {
    bus: Arc<EventBus>,
    trace: Arc<TraceIndex>,
    registry: Arc<UnitRegistry>,
    ledger: Arc<InventoryLedger>,
    alerts: Arc<AlertEngine>,
    requests: Arc<RequestCoordinator>,
}

impl BloodBankService {
    pub fn open(instance: Arc<sled::Db>, thresholds: Thresholds) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::new());
        let trace = Arc::new(TraceIndex::open(&instance)?);
        let registry = Arc::new(UnitRegistry::open(&instance, trace.clone(), bus.clone())?);
        let ledger = Arc::new(InventoryLedger::new(registry.clone()));
        let alerts = Arc::new(AlertEngine::open(
            &instance,
            thresholds,
            trace.clone(),
            bus.clone(),
        )?);
        let requests = Arc::new(RequestCoordinator::open(
            &instance,
            registry.clone(),
            ledger.clone(),
            alerts.clone(),
            trace.clone(),
            bus.clone(),
        )?);

        bus.subscribe(Arc::new(AlertEvaluator {
            alerts: alerts.clone(),
            ledger: ledger.clone(),
        }));
        bus.subscribe(requests.clone());

        Ok(Self {
            bus,
            trace,
            registry,
            ledger,
            alerts,
            requests,
        })
    }

    /// External consumers (dashboards, notification delivery) hook in here.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.bus.subscribe(subscriber);
    }

    // donor & unit registry

    pub fn create_donor(&self, name: &str, actor: &str) -> anyhow::Result<Donor> {
        Ok(self.registry.create_donor(name, actor)?)
    }

    pub fn donor(&self, donor_id: &str) -> anyhow::Result<Donor> {
        Ok(self.registry.donor(donor_id)?)
    }

    pub fn defer_donor(
        &self,
        donor_id: &str,
        reason: &str,
        deferral: Deferral,
        actor: &str,
    ) -> anyhow::Result<Donor> {
        Ok(self.registry.defer_donor(donor_id, reason, deferral, actor)?)
    }

    pub fn record_serology(
        &self,
        donor_id: &str,
        blood_type: BloodType,
        passed: bool,
        actor: &str,
    ) -> anyhow::Result<Donor> {
        Ok(self
            .registry
            .record_serology(donor_id, blood_type, passed, actor)?)
    }

    pub fn record_donation(
        &self,
        donor_id: &str,
        component: Component,
        volume_ml: u32,
        location: &str,
        actor: &str,
    ) -> anyhow::Result<BloodUnit> {
        Ok(self
            .registry
            .record_donation(donor_id, component, volume_ml, location, actor)?)
    }

    pub fn unit(&self, unit_id: &str) -> anyhow::Result<BloodUnit> {
        Ok(self.registry.unit(unit_id)?)
    }

    pub fn advance_unit_state(
        &self,
        unit_id: &str,
        target: UnitState,
        expected_version: u64,
        actor: &str,
        evidence: Option<&str>,
    ) -> anyhow::Result<BloodUnit> {
        Ok(self
            .registry
            .advance_unit_state(unit_id, target, expected_version, actor, evidence)?)
    }

    // requests

    pub fn submit_request(
        &self,
        patient_ref: &str,
        blood_type: BloodType,
        component: Component,
        quantity: u32,
        urgency: Urgency,
    ) -> anyhow::Result<Request> {
        Ok(self
            .requests
            .submit(patient_ref, blood_type, component, quantity, urgency)?)
    }

    pub fn request(&self, request_id: &str) -> anyhow::Result<Request> {
        Ok(self.requests.request(request_id)?)
    }

    pub fn approve_request(
        &self,
        request_id: &str,
        allow_substitution: bool,
        actor: &str,
    ) -> anyhow::Result<(Request, Reservation)> {
        Ok(self.requests.approve(request_id, allow_substitution, actor)?)
    }

    pub fn cancel_request(&self, request_id: &str, actor: &str) -> anyhow::Result<Request> {
        Ok(self.requests.cancel(request_id, actor)?)
    }

    pub fn reject_request(
        &self,
        request_id: &str,
        reason: &str,
        actor: &str,
    ) -> anyhow::Result<Request> {
        Ok(self.requests.reject(request_id, reason, actor)?)
    }

    pub fn issue_request(&self, request_id: &str, actor: &str) -> anyhow::Result<Request> {
        Ok(self.requests.issue(request_id, actor)?)
    }

    pub fn fulfil_request(&self, request_id: &str, actor: &str) -> anyhow::Result<Request> {
        Ok(self.requests.fulfil(request_id, actor)?)
    }

    // read-only queries

    pub fn current_stock(
        &self,
        blood_type: BloodType,
        component: Component,
    ) -> anyhow::Result<u64> {
        Ok(self.ledger.current_stock(blood_type, component)?)
    }

    pub fn stock_levels(&self) -> anyhow::Result<Vec<StockLevel>> {
        Ok(self.ledger.stock_levels()?)
    }

    pub fn expiring_within(&self, days: i64) -> anyhow::Result<Vec<BloodUnit>> {
        Ok(self.ledger.expiring_within(days, TimeStamp::new())?)
    }

    pub fn trace_chain(&self, subject_id: &str) -> anyhow::Result<Vec<TraceEvent>> {
        Ok(self
            .trace
            .chain_for(subject_id)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn verify_trace(&self, subject_id: &str) -> anyhow::Result<u64> {
        Ok(self.trace.verify_integrity(subject_id)?)
    }

    pub fn open_alerts(&self) -> anyhow::Result<Vec<Alert>> {
        Ok(self.alerts.open_alerts()?)
    }

    pub fn alerts_for(&self, subject: &str) -> anyhow::Result<Vec<Alert>> {
        Ok(self.alerts.alerts_for(subject)?)
    }

    // alert lifecycle

    pub fn acknowledge_alert(&self, alert_id: &str, actor: &str) -> anyhow::Result<Alert> {
        Ok(self.alerts.acknowledge(alert_id, actor)?)
    }

    pub fn snooze_alert(
        &self,
        alert_id: &str,
        until: TimeStamp<Utc>,
        actor: &str,
    ) -> anyhow::Result<Alert> {
        Ok(self.alerts.snooze(alert_id, until, actor)?)
    }

    pub fn dismiss_alert(&self, alert_id: &str, actor: &str) -> anyhow::Result<Alert> {
        Ok(self.alerts.dismiss(alert_id, actor)?)
    }

    // maintenance

    pub fn run_expiry_sweep(&self, now: TimeStamp<Utc>) -> anyhow::Result<SweepReport> {
        Ok(self.ledger.run_expiry_sweep(now)?)
    }

    /// Run the expiry sweep on a fixed interval until the handle is
    /// dropped or stopped.
    pub fn spawn_expiry_sweeper(&self, interval: Duration) -> anyhow::Result<SweeperHandle> {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shared = shared.clone();
        let ledger = self.ledger.clone();

        let handle = std::thread::Builder::new()
            .name("expiry-sweeper".into())
            .spawn(move || {
                let (stop, cv) = &*thread_shared;
                let mut stopped = lock_recover(stop);
                loop {
                    if *stopped {
                        return;
                    }
                    let (guard, timeout) = cv
                        .wait_timeout(stopped, interval)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    stopped = guard;
                    if *stopped {
                        return;
                    }
                    if timeout.timed_out() {
                        drop(stopped);
                        if let Err(err) = ledger.run_expiry_sweep(TimeStamp::new()) {
                            tracing::error!(error = %err, "scheduled expiry sweep failed");
                        }
                        stopped = lock_recover(stop);
                    }
                }
            })?;

        Ok(SweeperHandle {
            shared,
            handle: Some(handle),
        })
    }
}

pub struct SweeperHandle {
    shared: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (stop, cv) = &*self.shared;
        *lock_recover(stop) = true;
        cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
