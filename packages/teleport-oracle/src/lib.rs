//! Teleport oracle - library interface
//!
//! One-way bridge relay: watches an EVM contract for `Teleport` events and
//! issues exactly one EOSIO token transfer per event. Modules are public
//! for the binary and for integration tests.

pub mod alert;
pub mod amount;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod destination;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod retry;
pub mod source;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
