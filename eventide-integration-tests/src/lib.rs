//! Integration tests for eventide
//!
//! This crate holds a small order-management domain shared by the tests in
//! `tests/`: an [`orders::Order`] aggregate, two projections over its events
//! and a [`harness::Harness`] that wires them to the in-memory backends.

#![forbid(unsafe_code)]
// Test support only; never published.
#![allow(missing_docs)]

pub mod harness;
pub mod orders;
pub mod projections;
