//! Repository Module
//!
//! Data access layer for job records: the in-memory store and the
//! file-per-job persistence that backs it.

pub mod job;
pub mod persistence;

pub use job::{JobStore, LoadReport};
pub use persistence::JobPersistence;
