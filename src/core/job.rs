// Job records and their lifecycle

use crate::backend::SlurmConfig;
use crate::error::{EnqueueError, ManagerError};
use crate::types::{ExternalJobId, JobId, JobLabel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a job is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    /// Submitted to the cluster scheduler; runs outside this host.
    RemoteBatch,
    /// Spawned directly as one process.
    LocalProcess,
    /// Commands run one after another as local processes.
    SequentialChain,
}

impl JobMode {
    /// Parse a mode string as accepted by `add_job`.
    ///
    /// `srun` is a local process that is wrapped in the cluster launcher, so it
    /// returns `Launcher::Srun` alongside the mode.
    pub fn parse(mode: &str) -> Result<(Self, Option<Launcher>), EnqueueError> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "local-process" | "local" | "bash" => Ok((Self::LocalProcess, None)),
            "srun" => Ok((Self::LocalProcess, Some(Launcher::Srun))),
            "remote-batch" | "batch" | "sbatch" => Ok((Self::RemoteBatch, None)),
            "sequential-chain" | "chain" => Ok((Self::SequentialChain, None)),
            _ => Err(EnqueueError::InvalidMode(mode.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteBatch => "remote-batch",
            Self::LocalProcess => "local-process",
            Self::SequentialChain => "sequential-chain",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a local command is wrapped in before it reaches the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Launcher {
    /// Run the command as-is.
    #[default]
    Shell,
    /// Prefix the command with `srun` and the job's resource request.
    Srun,
}

/// Mode-specific settings attached to a job at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Resource request for `remote-batch` jobs and `srun` launches.
    #[serde(default)]
    pub slurm: Option<SlurmConfig>,

    /// Working directory for locally spawned processes.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub launcher: Launcher,
}

impl JobConfig {
    pub fn with_slurm(slurm: SlurmConfig) -> Self {
        Self {
            slurm: Some(slurm),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` moves forward along the lifecycle.
    ///
    /// Failure is reachable from every non-terminal state; success only from
    /// `Running`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Submitted)
                | (Self::Pending, Self::Failed)
                | (Self::Submitted, Self::Running)
                | (Self::Submitted, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The executor could not start the job.
    Launch(String),
    /// The process exited with a non-zero code.
    ExitCode(i32),
    /// The process was terminated by a signal.
    Signal,
    /// The external scheduler reported a failed completion.
    External(String),
    /// Status queries kept failing until the retry budget ran out.
    PollExhausted(String),
    Timeout,
    Cancelled,
    /// One command of a sequential chain failed; later commands never ran.
    Step {
        index: usize,
        cause: Box<FailureReason>,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launch(msg) => write!(f, "launch failed: {msg}"),
            Self::ExitCode(code) => write!(f, "exited with code {code}"),
            Self::Signal => write!(f, "terminated by signal"),
            Self::External(state) => write!(f, "scheduler reported {state}"),
            Self::PollExhausted(msg) => write!(f, "status unavailable: {msg}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Step { index, cause } => write!(f, "step {} {}", index + 1, cause),
        }
    }
}

/// One unit of work as tracked by the manager.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub label: JobLabel,
    pub mode: JobMode,
    pub commands: Vec<String>,
    pub config: JobConfig,
    state: JobState,
    history: Vec<(JobState, DateTime<Utc>)>,
}

impl Job {
    /// Build a pending job, materializing the command sequence.
    pub fn new<I, S>(
        id: JobId,
        mode: JobMode,
        commands: I,
        config: JobConfig,
    ) -> Result<Self, EnqueueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: Vec<String> = commands.into_iter().map(Into::into).collect();
        if commands.is_empty() {
            return Err(EnqueueError::EmptyCommands);
        }

        let label = config
            .slurm
            .as_ref()
            .and_then(|slurm| slurm.job_name.clone())
            .map(JobLabel::from)
            .unwrap_or_else(|| JobLabel::new(id.to_string()));

        Ok(Self {
            id,
            label,
            mode,
            commands,
            config,
            state: JobState::Pending,
            history: vec![(JobState::Pending, Utc::now())],
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state the job has been in, oldest first.
    pub fn history(&self) -> &[(JobState, DateTime<Utc>)] {
        &self.history
    }

    /// When the job left `Pending`.
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.entered(JobState::Submitted)
    }

    fn entered(&self, state: JobState) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, at)| *at)
    }

    /// Move the job forward; backward or skipping moves are fatal.
    pub fn transition(&mut self, next: JobState) -> Result<(), ManagerError> {
        if !self.state.can_transition_to(next) {
            return Err(ManagerError::IllegalTransition {
                job: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }

    /// Move the job to a terminal state, passing through `Running` when the
    /// executor reported completion before it was ever seen running.
    pub fn finish(&mut self, terminal: JobState) -> Result<(), ManagerError> {
        if terminal == JobState::Succeeded && self.state == JobState::Submitted {
            self.transition(JobState::Running)?;
        }
        self.transition(terminal)
    }
}

/// Terminal record of one job, as reported by `run()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub id: JobId,
    pub label: JobLabel,
    pub mode: JobMode,
    pub state: JobState,
    pub failure: Option<FailureReason>,
    pub external_id: Option<ExternalJobId>,
    /// Last stderr lines of a failed local job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn from_job(
        job: &Job,
        failure: Option<FailureReason>,
        external_id: Option<ExternalJobId>,
    ) -> Self {
        Self {
            id: job.id,
            label: job.label.clone(),
            mode: job.mode,
            state: job.state,
            failure,
            external_id,
            stderr_tail: None,
            submitted_at: job.submitted_at(),
            finished_at: Utc::now(),
        }
    }

    pub fn with_stderr_tail(mut self, tail: Option<String>) -> Self {
        self.stderr_tail = tail;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}
