//! Inventory Ledger: stock levels, FEFO reservation and the expiry sweep.
//!
//! The ledger never mutates unit records directly; every transition goes
//! through the registry so versioning, tracing and event publication stay
//! in one place. Reservation is serialized per blood-type/component
//! bucket; the registry's compare-and-swap settles any race the bucket
//! lock cannot see (substitution candidates live in other buckets).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::EngineError;
use crate::registry::{BloodUnit, UnitRegistry, UnitState};
use crate::types::{BloodType, Component, TimeStamp};
use crate::utils::lock_recover;

const LEDGER_ACTOR: &str = "inventory-ledger";
const SWEEP_ACTOR: &str = "expiry-sweep";
const RESERVE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ReserveCriteria {
    pub blood_type: BloodType,
    pub component: Component,
    /// opt in to the documented compatibility substitution table;
    /// exact blood-type match is the default
    pub allow_substitution: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Fulfilled,
    /// Not an error: the caller decides whether a short allocation is
    /// acceptable.
    PartialFulfillment { missing: u32 },
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub allocated: Vec<String>,
    pub outcome: ReserveOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub blood_type: BloodType,
    pub component: Component,
    pub available: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub scanned: u64,
    pub expired: Vec<String>,
    /// requests left under-allocated because a reserved unit expired
    pub released_requests: Vec<String>,
}

pub struct InventoryLedger {
    registry: Arc<UnitRegistry>,
    bucket_locks: Mutex<HashMap<(BloodType, Component), Arc<Mutex<()>>>>,
}

impl InventoryLedger {
    pub fn new(registry: Arc<UnitRegistry>) -> Self {
        Self {
            registry,
            bucket_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn current_stock(
        &self,
        blood_type: BloodType,
        component: Component,
    ) -> Result<u64, EngineError> {
        let mut count = 0;
        for unit in self.registry.units() {
            let unit = unit?;
            if unit.state.is_allocatable()
                && unit.component == component
                && unit.blood_type == Some(blood_type)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn stock_levels(&self) -> Result<Vec<StockLevel>, EngineError> {
        let mut buckets: HashMap<(BloodType, Component), u64> = HashMap::new();
        for unit in self.registry.units() {
            let unit = unit?;
            if let (true, Some(blood_type)) = (unit.state.is_allocatable(), unit.blood_type) {
                *buckets.entry((blood_type, unit.component)).or_default() += 1;
            }
        }
        let mut levels: Vec<_> = buckets
            .into_iter()
            .map(|((blood_type, component), available)| StockLevel {
                blood_type,
                component,
                available,
            })
            .collect();
        levels.sort_by_key(|l| (l.blood_type, l.component));
        Ok(levels)
    }

    /// Allocatable or reserved units whose expiry falls inside the window.
    pub fn expiring_within(
        &self,
        days: i64,
        now: TimeStamp<Utc>,
    ) -> Result<Vec<BloodUnit>, EngineError> {
        let horizon = now.plus_days(days);
        let mut soon = Vec::new();
        for unit in self.registry.units() {
            let unit = unit?;
            if !matches!(unit.state, UnitState::Available | UnitState::Reserved) {
                continue;
            }
            if let Some(expires_at) = unit.expires_at {
                if expires_at <= horizon {
                    soon.push(unit);
                }
            }
        }
        soon.sort_by(|a, b| (a.expires_at, &a.unit_id).cmp(&(b.expires_at, &b.unit_id)));
        Ok(soon)
    }

    /// Reserve up to `quantity` compatible units for a request, oldest
    /// expiry first (FEFO), ties broken by unit id. A short candidate set
    /// yields `PartialFulfillment` rather than an error.
    pub fn reserve(
        &self,
        request_id: &str,
        criteria: &ReserveCriteria,
        quantity: u32,
    ) -> Result<Reservation, EngineError> {
        if quantity == 0 {
            return Err(EngineError::Validation(
                "reservation quantity must be positive".into(),
            ));
        }

        let lock = self.bucket_lock(criteria.blood_type, criteria.component);
        let _guard = lock_recover(&lock);

        let mut candidates: Vec<(TimeStamp<Utc>, String, u64)> = Vec::new();
        for unit in self.registry.units() {
            let unit = unit?;
            if !unit.state.is_allocatable() || unit.component != criteria.component {
                continue;
            }
            let Some(blood_type) = unit.blood_type else {
                continue;
            };
            let compatible = blood_type == criteria.blood_type
                || (criteria.allow_substitution
                    && criteria.blood_type.can_receive_from(blood_type));
            if !compatible {
                continue;
            }
            let Some(expires_at) = unit.expires_at else {
                continue;
            };
            candidates.push((expires_at, unit.unit_id, unit.version));
        }
        candidates.sort();

        let mut allocated = Vec::new();
        for (_, unit_id, version) in candidates {
            if allocated.len() as u32 == quantity {
                break;
            }
            if self.try_reserve_unit(&unit_id, version, request_id)? {
                allocated.push(unit_id);
            }
        }

        let outcome = if allocated.len() as u32 == quantity {
            ReserveOutcome::Fulfilled
        } else {
            ReserveOutcome::PartialFulfillment {
                missing: quantity - allocated.len() as u32,
            }
        };
        tracing::info!(
            request = %request_id,
            allocated = allocated.len(),
            requested = quantity,
            "reservation completed"
        );

        Ok(Reservation { allocated, outcome })
    }

    /// Revert every unit still reserved for this request to `Available`.
    pub fn release(&self, request_id: &str) -> Result<Vec<String>, EngineError> {
        let mut released = Vec::new();
        for unit in self.units_for_request(request_id)? {
            if unit.state != UnitState::Reserved {
                continue;
            }
            self.retry_transition(&unit.unit_id, unit.version, |unit_id, version| {
                self.registry
                    .release_reservation(unit_id, version, LEDGER_ACTOR)
            })?;
            released.push(unit.unit_id);
        }
        Ok(released)
    }

    /// Advance every unit reserved for this request to `Issued`.
    pub fn mark_issued(&self, request_id: &str) -> Result<Vec<String>, EngineError> {
        let mut issued = Vec::new();
        for unit in self.units_for_request(request_id)? {
            if unit.state != UnitState::Reserved {
                continue;
            }
            self.retry_transition(&unit.unit_id, unit.version, |unit_id, version| {
                self.registry.issue_unit(unit_id, version, LEDGER_ACTOR)
            })?;
            issued.push(unit.unit_id);
        }
        Ok(issued)
    }

    /// Drive every over-age `Available`/`Reserved` unit to `Expired`.
    /// Idempotent: already-expired units are skipped, so interrupting and
    /// re-running the sweep never double-expires anything.
    pub fn run_expiry_sweep(&self, now: TimeStamp<Utc>) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        for unit in self.registry.units() {
            let unit = unit?;
            report.scanned += 1;
            if !matches!(unit.state, UnitState::Available | UnitState::Reserved) {
                continue;
            }
            let Some(expires_at) = unit.expires_at else {
                continue;
            };
            if now <= expires_at {
                continue;
            }
            self.retry_transition(&unit.unit_id, unit.version, |unit_id, version| {
                self.registry.expire_unit(unit_id, version, now, SWEEP_ACTOR)
            })?;
            if let Some(request_id) = unit.reserved_for {
                report.released_requests.push(request_id);
            }
            report.expired.push(unit.unit_id);
        }
        if !report.expired.is_empty() {
            tracing::info!(
                expired = report.expired.len(),
                scanned = report.scanned,
                "expiry sweep completed"
            );
        }
        Ok(report)
    }

    pub(crate) fn units_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<BloodUnit>, EngineError> {
        let mut units = Vec::new();
        for unit in self.registry.units() {
            let unit = unit?;
            if unit.reserved_for.as_deref() == Some(request_id) {
                units.push(unit);
            }
        }
        Ok(units)
    }

    fn bucket_lock(&self, blood_type: BloodType, component: Component) -> Arc<Mutex<()>> {
        let mut locks = lock_recover(&self.bucket_locks);
        locks
            .entry((blood_type, component))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // one CAS attempt per fresh read; a racing actor that takes the unit
    // out of the expected state ends the retries for it
    fn try_reserve_unit(
        &self,
        unit_id: &str,
        mut version: u64,
        request_id: &str,
    ) -> Result<bool, EngineError> {
        for _ in 0..RESERVE_ATTEMPTS {
            match self
                .registry
                .reserve_for_request(unit_id, version, request_id, LEDGER_ACTOR)
            {
                Ok(_) => return Ok(true),
                Err(EngineError::ConcurrentModification) => {
                    let unit = self.registry.unit(unit_id)?;
                    if !unit.state.is_allocatable() {
                        return Ok(false);
                    }
                    version = unit.version;
                }
                Err(EngineError::InvalidTransition { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn retry_transition(
        &self,
        unit_id: &str,
        mut version: u64,
        attempt: impl Fn(&str, u64) -> Result<BloodUnit, EngineError>,
    ) -> Result<(), EngineError> {
        for _ in 0..RESERVE_ATTEMPTS {
            match attempt(unit_id, version) {
                Ok(_) => return Ok(()),
                Err(EngineError::ConcurrentModification) => {
                    let unit = self.registry.unit(unit_id)?;
                    if unit.state.is_terminal() {
                        // a racing recall or sweep already finished the job
                        return Ok(());
                    }
                    version = unit.version;
                }
                // the unit moved to a state this transition no longer
                // applies to; a racing actor won, nothing left to do
                Err(EngineError::InvalidTransition { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::ConcurrentModification)
    }
}
