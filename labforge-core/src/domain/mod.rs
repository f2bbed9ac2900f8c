//! Core domain types
//!
//! These types describe a provisioning job and are shared between the
//! orchestrator (which stores, persists and executes jobs) and the CLI
//! (which displays them).

pub mod job;
