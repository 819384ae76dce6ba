//! Blood unit lifecycle and traceability engine.
//!
//! Tracks every donation from collection through processing, QA,
//! storage and final disposition, with an append-only hash-chained
//! trace per unit and donor. The [`service::BloodBankService`] facade
//! wires the components over a shared sled database:
//!
//! - [`registry`] owns donor and unit state and the lifecycle graph
//! - [`ledger`] derives stock, reserves FEFO and runs the expiry sweep
//! - [`alerts`] evaluates thresholds against every state change
//! - [`trace`] keeps the tamper-evident audit chain
//! - [`requests`] coordinates clinical requests against inventory

pub mod alerts;
pub mod error;
pub mod events;
pub mod ledger;
pub mod registry;
pub mod requests;
pub mod service;
pub mod trace;
pub mod types;
pub mod utils;
