//! Payment settlement and reconciliation engine for a freelance marketplace.
//!
//! Moves a client's payment for a contract or milestone from intent creation
//! through gateway confirmation to settlement: payment record, double-entry
//! ledger, payee balance and contract activation, plus a scheduler that
//! reconciles state the webhooks missed.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod payments;
pub mod services;
pub mod workers;
