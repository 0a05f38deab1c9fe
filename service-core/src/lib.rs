//! service-core: Shared infrastructure for the reconciliation workspace.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
