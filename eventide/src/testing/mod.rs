//! Testing utilities for eventide backends and applications.
//!
//! - [`generators`]: `proptest` strategies for identifiers and query filters
//! - [`contract`]: the behaviour every [`crate::EventLog`] backend must
//!   show, packaged as reusable scenarios and the
//!   [`event_log_contract_tests!`](crate::event_log_contract_tests) macro
//!
//! Enabled in this crate's own tests and, for other crates, with the
//! `testing` feature.

pub mod contract;
pub mod generators;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use super::contract::{ContractEvent, ContractTestFailure, ContractTestResult};
    pub use super::generators::*;
}
