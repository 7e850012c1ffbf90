//! Call ledger: reconciles provider call events into canonical records.

pub mod calls;
pub mod config;
pub mod error;
pub mod store;
