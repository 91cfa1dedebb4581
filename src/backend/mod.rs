//! External collaborators the executors call into.
//!
//! The core never talks to a cluster or an operating system directly. It goes
//! through these two traits, which keeps the scheduling logic testable with
//! scripted fakes:
//!
//! - [`BatchScheduler`]: submit / query / cancel on a cluster scheduler
//!   (implemented for Slurm's command-line tools by [`SlurmCli`]).
//! - [`ProcessSpawner`]: start a shell command and hand back a
//!   [`ProcessHandle`] (implemented with `tokio::process` by [`ShellSpawner`]).

mod shell;
mod slurm;

pub use shell::ShellSpawner;
pub use slurm::{SlurmCli, SlurmConfig, map_slurm_state, parse_submission_output, shell_quote};

use crate::error::{CancelError, LaunchError, PollError};
use crate::types::ExternalJobId;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// State of a batch job as reported by the external scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Queued,
    Running,
    CompletedSuccess,
    /// Completed unsuccessfully; carries the scheduler's state name.
    CompletedFailure(String),
    /// The identifier was not found.
    Unknown,
}

#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submit the commands as one batch job and return the scheduler's id.
    async fn submit(
        &self,
        commands: &[String],
        config: &SlurmConfig,
    ) -> Result<ExternalJobId, LaunchError>;

    /// Single point-in-time status query.
    async fn query(&self, id: &ExternalJobId) -> Result<RemoteState, PollError>;

    async fn cancel(&self, id: &ExternalJobId) -> Result<(), CancelError>;

    /// Get the scheduler name (e.g., "slurm")
    fn name(&self) -> &str;
}

/// How a spawned process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, or `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Live handle to a spawned process.
pub trait ProcessHandle: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness check; `Ok(None)` while the process runs.
    fn try_wait(&mut self) -> std::io::Result<Option<ProcessExit>>;

    /// Ask the process to terminate without waiting for it.
    fn start_kill(&mut self) -> std::io::Result<()>;

    /// Last lines the process wrote to stderr, if they were captured.
    fn stderr_tail(&self) -> Option<String> {
        None
    }
}

pub trait ProcessSpawner: Send + Sync {
    /// Start `command` in a shell and return immediately.
    fn spawn(
        &self,
        command: &str,
        working_dir: Option<&Path>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// The collaborators a manager hands to the executors it binds.
#[derive(Clone)]
pub struct Backends {
    pub batch: Arc<dyn BatchScheduler>,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl Backends {
    pub fn new(batch: Arc<dyn BatchScheduler>, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { batch, spawner }
    }
}
