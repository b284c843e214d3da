//! Payment transaction and risk engine for homestay bookings.
//!
//! Payments are initiated against a booking, risk-scored, sent to a gateway
//! (MoMo wallet, bank transfer or cash at the property) and settled through
//! signed callbacks, staff confirmation or reconciliation. Every attempt is
//! recorded in an append-only transaction ledger.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
