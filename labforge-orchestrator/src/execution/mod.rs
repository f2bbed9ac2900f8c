//! Execution layer
//!
//! Everything needed to run a job out-of-process:
//! - workspace: per-job working directories and input files
//! - credentials: secrets handed to the provisioning program
//! - environment: translation of a job into environment entries
//! - provisioner: the external-program and in-process provisioning modes
//! - executor: the lifecycle driver tying these to the job store

pub mod credentials;
pub mod environment;
pub mod executor;
pub mod provisioner;
pub mod workspace;

pub use credentials::{CredentialProvider, EnvFileCredentials, StaticCredentials};
pub use executor::{ActiveGuard, Executor};
pub use provisioner::{
    InProcessProvisioner, OutputSink, ProcessProvisioner, ProvisionOutcome, ProvisionRequest,
    Provisioner,
};
pub use workspace::WorkspaceManager;
