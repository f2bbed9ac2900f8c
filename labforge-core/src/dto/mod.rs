//! Data Transfer Objects
//!
//! Request and summary shapes used by collaborators of the job subsystem.

pub mod job;
