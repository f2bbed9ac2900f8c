//! Provisioners
//!
//! A provisioner performs the actual infrastructure work for one job. Two
//! modes are available:
//! - [`ProcessProvisioner`] launches an external program (e.g. a Pulumi
//!   project) in the job's workspace and streams its stdout/stderr
//! - [`InProcessProvisioner`] calls a Rust function with an error return
//!
//! Both report progress through an [`OutputSink`] and finish with a
//! [`ProvisionOutcome`]; neither touches the job store directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labforge_core::domain::job::{JobArtifacts, JobConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Structured results written by the program on success
pub const OUTPUTS_FILE: &str = "outputs.json";

/// Fallback location of a generated kubeconfig
pub const KUBECONFIG_FILE: &str = "kubeconfig";

/// Everything a provisioner needs for one run
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub job_id: Uuid,
    pub workspace: PathBuf,
    pub config: JobConfig,
    /// Extra environment entries on top of the inherited environment
    pub env: HashMap<String, String>,
}

/// How a provisioning run ended
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    Succeeded(JobArtifacts),
    Failed(String),
    /// Stopped by shutdown; the real outcome is unknown
    Interrupted,
}

/// Ordered stream of output lines from a run
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<String>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits one line; returns false once nobody is listening
    pub fn line(&self, line: impl Into<String>) -> bool {
        self.tx.send(line.into()).is_ok()
    }
}

/// Performs the provisioning work for a job
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Runs to completion, or until `cancel` fires
    async fn provision(
        &self,
        request: &ProvisionRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> ProvisionOutcome;
}

// =============================================================================
// External program
// =============================================================================

/// Runs an external provisioning program as a child process
#[derive(Debug, Clone)]
pub struct ProcessProvisioner {
    program: String,
    args: Vec<String>,
    grace: Duration,
    /// Time buffered output gets to arrive once the program has exited
    drain: Duration,
}

impl ProcessProvisioner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            grace: Duration::from_secs(30),
            drain: Duration::from_secs(5),
        }
    }

    /// Time the program gets between SIGTERM and SIGKILL on shutdown
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Upper bound on reading leftover output after the program exits
    ///
    /// Background processes the program started can keep its pipes open
    /// long after it is gone.
    pub fn with_drain_timeout(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    /// Asks the child to stop, then kills it once the grace period runs out
    async fn terminate(&self, child: &mut Child, job_id: Uuid) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                #[allow(clippy::cast_possible_wrap)]
                let target = Pid::from_raw(pid as i32);
                if let Err(e) = kill(target, Signal::SIGTERM) {
                    warn!(job_id = %job_id, pid, error = %e, "Failed to send SIGTERM");
                }
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(job_id = %job_id, status = %status, "Provisioning program stopped")
            }
            Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "Failed to wait for program"),
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    grace = ?self.grace,
                    "Provisioning program ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(job_id = %job_id, error = %e, "Failed to kill program");
                }
            }
        }
    }
}

#[async_trait]
impl Provisioner for ProcessProvisioner {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> ProvisionOutcome {
        let job_id = request.job_id;
        debug!(job_id = %job_id, program = %self.program, args = ?self.args, "Launching provisioning program");

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.workspace)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return ProvisionOutcome::Failed(format!(
                    "failed to launch provisioning program `{}`: {}",
                    self.program, e
                ));
            }
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, output.clone(), job_id));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, output.clone(), job_id));
        }
        drop(output);

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                info!(job_id = %job_id, "Shutdown requested, stopping provisioning program");
                self.terminate(&mut child, job_id).await;
                // Orphaned grandchildren may still hold the pipes open
                join_readers(&mut readers, self.grace).await;
                return ProvisionOutcome::Interrupted;
            }
        };

        tokio::select! {
            _ = join_readers(&mut readers, self.drain) => {}
            _ = cancel.cancelled() => {
                info!(job_id = %job_id, "Shutdown requested while draining program output");
                for reader in &readers {
                    reader.abort();
                }
                return ProvisionOutcome::Interrupted;
            }
        }

        match status {
            Ok(status) if status.success() => match collect_artifacts(&request.workspace).await {
                Ok(artifacts) => ProvisionOutcome::Succeeded(artifacts),
                Err(reason) => ProvisionOutcome::Failed(reason),
            },
            Ok(status) => ProvisionOutcome::Failed(describe_exit(status)),
            Err(e) => {
                ProvisionOutcome::Failed(format!("failed to wait for provisioning program: {e}"))
            }
        }
    }
}

/// Forwards a stream line by line; invalid UTF-8 is replaced, not dropped
fn spawn_line_reader<R>(stream: R, output: OutputSink, job_id: Uuid) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    if !output.line(String::from_utf8_lossy(&buf).into_owned()) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to read program output");
                    break;
                }
            }
        }
    })
}

/// Waits for the readers to reach EOF; any still reading after `limit` is aborted
async fn join_readers(readers: &mut [JoinHandle<()>], limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    for reader in readers.iter_mut() {
        if tokio::time::timeout_at(deadline, &mut *reader).await.is_err() {
            warn!(limit = ?limit, "Program output still open, abandoning it");
            break;
        }
    }
    for reader in readers.iter() {
        reader.abort();
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("provisioning program exited with code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("provisioning program terminated by signal {signal}");
        }
    }

    format!("provisioning program failed: {status}")
}

/// Reads the artifacts a successful run left in its workspace
///
/// `outputs.json` wins; otherwise a bare `kubeconfig` file is picked up.
/// Neither being present is a success without artifacts.
pub async fn collect_artifacts(workspace: &Path) -> Result<JobArtifacts, String> {
    let outputs_path = workspace.join(OUTPUTS_FILE);
    match tokio::fs::read(&outputs_path).await {
        Ok(raw) => {
            return serde_json::from_slice(&raw)
                .map_err(|e| format!("invalid {OUTPUTS_FILE} written by provisioning program: {e}"));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("failed to read {}: {}", outputs_path.display(), e)),
    }

    match tokio::fs::read_to_string(workspace.join(KUBECONFIG_FILE)).await {
        Ok(kubeconfig) => Ok(JobArtifacts {
            kubeconfig: Some(kubeconfig),
            coder_config: None,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobArtifacts::default()),
        Err(e) => Err(format!("failed to read {KUBECONFIG_FILE}: {e}")),
    }
}

// =============================================================================
// In-process callable
// =============================================================================

type ProvisionFn =
    dyn Fn(&ProvisionRequest, &OutputSink) -> Result<JobArtifacts, String> + Send + Sync;

/// Runs a Rust function on the blocking pool as the provisioning step
#[derive(Clone)]
pub struct InProcessProvisioner {
    func: Arc<ProvisionFn>,
}

impl InProcessProvisioner {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&ProvisionRequest, &OutputSink) -> Result<JobArtifacts, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }
}

impl std::fmt::Debug for InProcessProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessProvisioner").finish_non_exhaustive()
    }
}

#[async_trait]
impl Provisioner for InProcessProvisioner {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> ProvisionOutcome {
        if cancel.is_cancelled() {
            return ProvisionOutcome::Interrupted;
        }

        let func = Arc::clone(&self.func);
        let request = request.clone();
        let task = tokio::task::spawn_blocking(move || func(&request, &output));

        tokio::select! {
            joined = task => match joined {
                Ok(Ok(artifacts)) => ProvisionOutcome::Succeeded(artifacts),
                Ok(Err(reason)) => ProvisionOutcome::Failed(reason),
                Err(e) => ProvisionOutcome::Failed(format!("provisioning task panicked: {e}")),
            },
            _ = cancel.cancelled() => ProvisionOutcome::Interrupted,
        }
    }
}
