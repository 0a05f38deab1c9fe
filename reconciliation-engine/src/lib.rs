//! Reconciliation Engine - bank-to-book transaction matching with oracle-assisted classification.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;
