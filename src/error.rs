//! Error types for the job manager and its executors.
//!
//! Per-job errors (`LaunchError`, `PollError`, `CancelError`) are folded into
//! the job's terminal outcome and never stop the run loop. `ManagerError` is
//! reserved for broken bookkeeping inside the manager itself.

use crate::core::JobState;
use crate::types::JobId;

/// Rejections raised by `add_job` before a job ever reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The mode string does not name a known execution mode.
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// The command sequence produced no commands.
    #[error("A job needs at least one command")]
    EmptyCommands,

    /// The manager that owns the queue has been dropped.
    #[error("Job manager is no longer accepting jobs")]
    ManagerClosed,
}

/// The executor could not start the external unit of work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    /// The batch resource request is malformed.
    #[error("Invalid batch configuration: {0}")]
    InvalidConfig(String),

    /// The submission tool ran but refused the job; carries its diagnostics.
    #[error("Submission rejected: {0}")]
    Rejected(String),

    /// The submission tool answered with something that holds no job id.
    #[error("Unexpected submission output: {0:?}")]
    UnparsableResponse(String),

    /// The process could not be spawned at all.
    #[error("Failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },
}

/// A status query did not produce an answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The query itself failed (tool missing, non-zero exit, I/O error).
    #[error("Status query failed: {0}")]
    Query(String),

    /// The scheduler does not know the identifier (yet, or any more).
    #[error("External job {0} is unknown to the scheduler")]
    Unknown(String),

    /// Retries ran out; the job is escalated to failed.
    #[error("Gave up after {attempts} failed status queries: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Best-effort cancellation could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to cancel {target}: {message}")]
pub struct CancelError {
    pub target: String,
    pub message: String,
}

impl CancelError {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Invalid manager settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid configuration for `{key}`: {message}")]
pub struct ConfigError {
    pub key: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Fatal errors in the manager's own bookkeeping.
///
/// Seeing one of these means an invariant of the run loop was broken; the loop
/// stops instead of continuing with corrupt state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("Concurrency ceiling violated: {in_flight} jobs in flight, ceiling is {ceiling}")]
    CeilingViolated { in_flight: usize, ceiling: usize },

    #[error("Illegal state transition for {job}: {from:?} -> {to:?}")]
    IllegalTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },
}
