//! Labforge Orchestrator
//!
//! The job subsystem behind lab provisioning:
//! - Repository: the in-memory job record store and its on-disk persistence
//! - Execution: per-job workspaces, credentials, provisioners and the executor
//!   that drives a job from `Pending` to a terminal state
//! - Service: the facade collaborators call (create, get, list, remove, recreate)
//!
//! Startup wiring lives in `bootstrap`; shutdown signalling in `shutdown`.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod execution;
pub mod recovery;
pub mod repository;
pub mod service;
pub mod shutdown;

pub use config::OrchestratorConfig;
pub use error::{JobError, Result};
pub use service::JobService;
