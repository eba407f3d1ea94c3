//! Pure utility functions.
//!
//! Startup helpers for the binaries and the redelivery backoff schedule.

pub mod bootstrap;
pub mod retry;
