// Job execution strategies

use crate::backend::{Backends, BatchScheduler, ProcessExit, ProcessHandle, ProcessSpawner, RemoteState, SlurmConfig};
use crate::core::job::{FailureReason, Job, JobMode, Launcher};
use crate::core::poller::{RetryPolicy, StatusPoller};
use crate::error::{CancelError, LaunchError, PollError};
use crate::types::ExternalJobId;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Liveness reported by `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// Handed to an external queue; not known to be running yet.
    Submitted,
    /// Already executing.
    Running,
}

/// Result of a single point-in-time status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Still waiting in the external scheduler's queue.
    Queued,
    Running,
    Succeeded,
    Failed(FailureReason),
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }

    fn from_exit(exit: ProcessExit) -> Self {
        match exit.code {
            Some(0) => Self::Succeeded,
            Some(code) => Self::Failed(FailureReason::ExitCode(code)),
            None => Self::Failed(FailureReason::Signal),
        }
    }
}

/// The executor bound to one job for its whole lifetime.
///
/// Job modes form a closed set, so executors are an enum rather than trait
/// objects and every dispatch below is an exhaustive match.
pub enum JobExecutor {
    RemoteBatch(RemoteBatchExecutor),
    LocalProcess(LocalProcessExecutor),
    SequentialChain(ChainExecutor),
}

impl JobExecutor {
    /// Bind the executor matching the job's mode.
    pub fn bind(job: &Job, backends: &Backends, retry: RetryPolicy) -> Self {
        let poller = StatusPoller::new(retry);
        match job.mode {
            JobMode::RemoteBatch => Self::RemoteBatch(RemoteBatchExecutor {
                scheduler: backends.batch.clone(),
                commands: job.commands.clone(),
                slurm: job.config.slurm.clone().unwrap_or_else(SlurmConfig::standard),
                external_id: None,
                last_seen: PollStatus::Queued,
                poller,
                finished: None,
            }),
            JobMode::LocalProcess => {
                let command = match job.config.launcher {
                    Launcher::Shell => job.commands.join("; "),
                    Launcher::Srun => srun_config(job).srun_command(&job.commands),
                };
                Self::LocalProcess(LocalProcessExecutor {
                    spawner: backends.spawner.clone(),
                    command,
                    working_dir: job.config.working_dir.clone(),
                    handle: None,
                    poller,
                    finished: None,
                })
            }
            JobMode::SequentialChain => {
                let steps = match job.config.launcher {
                    Launcher::Shell => job.commands.clone(),
                    Launcher::Srun => {
                        let slurm = srun_config(job);
                        job.commands
                            .iter()
                            .map(|c| slurm.srun_command(std::slice::from_ref(c)))
                            .collect()
                    }
                };
                Self::SequentialChain(ChainExecutor {
                    spawner: backends.spawner.clone(),
                    steps,
                    working_dir: job.config.working_dir.clone(),
                    cursor: 0,
                    current: None,
                    last_stderr: None,
                    poller,
                    finished: None,
                })
            }
        }
    }

    pub async fn start(&mut self) -> Result<StartStatus, LaunchError> {
        match self {
            Self::RemoteBatch(exec) => exec.start().await,
            Self::LocalProcess(exec) => exec.start(),
            Self::SequentialChain(exec) => exec.start(),
        }
    }

    pub async fn poll(&mut self) -> PollStatus {
        match self {
            Self::RemoteBatch(exec) => exec.poll().await,
            Self::LocalProcess(exec) => exec.poll(),
            Self::SequentialChain(exec) => exec.poll(),
        }
    }

    pub async fn cancel(&mut self) -> Result<(), CancelError> {
        match self {
            Self::RemoteBatch(exec) => exec.cancel().await,
            Self::LocalProcess(exec) => exec.cancel(),
            Self::SequentialChain(exec) => exec.cancel(),
        }
    }

    pub fn external_id(&self) -> Option<&ExternalJobId> {
        match self {
            Self::RemoteBatch(exec) => exec.external_id.as_ref(),
            Self::LocalProcess(_) | Self::SequentialChain(_) => None,
        }
    }

    /// Captured stderr of the local process (or last chain step) that ran.
    pub fn stderr_tail(&self) -> Option<String> {
        match self {
            Self::RemoteBatch(_) => None,
            Self::LocalProcess(exec) => exec.handle.as_ref().and_then(|h| h.stderr_tail()),
            Self::SequentialChain(exec) => match &exec.current {
                Some(handle) => handle.stderr_tail(),
                None => exec.last_stderr.clone(),
            },
        }
    }
}

fn srun_config(job: &Job) -> SlurmConfig {
    job.config.slurm.clone().unwrap_or_else(SlurmConfig::standard)
}

/// Record the first terminal status and replay it on every later poll.
fn settle(finished: &mut Option<PollStatus>, status: PollStatus) -> PollStatus {
    if status.is_terminal() {
        *finished = Some(status.clone());
    }
    status
}

/// Map a poller escalation onto the job's failure.
fn escalate(error: PollError) -> PollStatus {
    PollStatus::Failed(FailureReason::PollExhausted(error.to_string()))
}

/// Submits the job to the cluster scheduler and tracks it by external id.
pub struct RemoteBatchExecutor {
    scheduler: Arc<dyn BatchScheduler>,
    commands: Vec<String>,
    slurm: SlurmConfig,
    external_id: Option<ExternalJobId>,
    /// Last non-terminal answer, repeated while no fresh one is available.
    last_seen: PollStatus,
    poller: StatusPoller,
    finished: Option<PollStatus>,
}

impl RemoteBatchExecutor {
    async fn start(&mut self) -> Result<StartStatus, LaunchError> {
        self.slurm.validate()?;
        let id = self.scheduler.submit(&self.commands, &self.slurm).await?;
        info!("Submitted batch job {} via {}", id, self.scheduler.name());
        self.external_id = Some(id);
        Ok(StartStatus::Submitted)
    }

    async fn poll(&mut self) -> PollStatus {
        if let Some(done) = &self.finished {
            return done.clone();
        }
        let Some(id) = self.external_id.clone() else {
            return settle(
                &mut self.finished,
                PollStatus::Failed(FailureReason::Launch("batch job was never submitted".into())),
            );
        };

        let now = Instant::now();
        if !self.poller.is_due(now) {
            return self.last_seen.clone();
        }

        let error = match self.scheduler.query(&id).await {
            Ok(RemoteState::Unknown) => PollError::Unknown(id.to_string()),
            Ok(state) => {
                self.poller.record_success();
                let status = match state {
                    RemoteState::Queued => PollStatus::Queued,
                    RemoteState::Running => PollStatus::Running,
                    RemoteState::CompletedSuccess => PollStatus::Succeeded,
                    RemoteState::CompletedFailure(reason) => {
                        PollStatus::Failed(FailureReason::External(reason))
                    }
                    RemoteState::Unknown => PollStatus::Running,
                };
                debug!("Batch job {} is {:?}", id, status);
                if !status.is_terminal() {
                    self.last_seen = status.clone();
                }
                return settle(&mut self.finished, status);
            }
            Err(error) => error,
        };

        match self.poller.record_failure(now, &error) {
            Ok(()) => self.last_seen.clone(),
            Err(exhausted) => settle(&mut self.finished, escalate(exhausted)),
        }
    }

    async fn cancel(&mut self) -> Result<(), CancelError> {
        match &self.external_id {
            Some(id) => self.scheduler.cancel(id).await,
            None => Ok(()),
        }
    }
}

/// Runs all of the job's commands in a single shell process.
pub struct LocalProcessExecutor {
    spawner: Arc<dyn ProcessSpawner>,
    command: String,
    working_dir: Option<PathBuf>,
    handle: Option<Box<dyn ProcessHandle>>,
    poller: StatusPoller,
    finished: Option<PollStatus>,
}

impl LocalProcessExecutor {
    pub fn command(&self) -> &str {
        &self.command
    }

    fn start(&mut self) -> Result<StartStatus, LaunchError> {
        let handle = self
            .spawner
            .spawn(&self.command, self.working_dir.as_deref())?;
        info!("Started `{}` (pid {:?})", self.command, handle.id());
        self.handle = Some(handle);
        Ok(StartStatus::Running)
    }

    fn poll(&mut self) -> PollStatus {
        if let Some(done) = &self.finished {
            return done.clone();
        }
        let Some(handle) = self.handle.as_mut() else {
            return settle(
                &mut self.finished,
                PollStatus::Failed(FailureReason::Launch("process was never started".into())),
            );
        };

        let now = Instant::now();
        if !self.poller.is_due(now) {
            return PollStatus::Running;
        }

        match handle.try_wait() {
            Ok(Some(exit)) => {
                self.poller.record_success();
                settle(&mut self.finished, PollStatus::from_exit(exit))
            }
            Ok(None) => {
                self.poller.record_success();
                PollStatus::Running
            }
            Err(e) => match self.poller.record_failure(now, &PollError::Query(e.to_string())) {
                Ok(()) => PollStatus::Running,
                Err(exhausted) => settle(&mut self.finished, escalate(exhausted)),
            },
        }
    }

    fn cancel(&mut self) -> Result<(), CancelError> {
        match self.handle.as_mut() {
            Some(handle) => handle
                .start_kill()
                .map_err(|e| CancelError::new(self.command.clone(), e.to_string())),
            None => Ok(()),
        }
    }
}

/// Runs the job's commands one at a time, stopping at the first failure.
pub struct ChainExecutor {
    spawner: Arc<dyn ProcessSpawner>,
    steps: Vec<String>,
    working_dir: Option<PathBuf>,
    cursor: usize,
    current: Option<Box<dyn ProcessHandle>>,
    last_stderr: Option<String>,
    poller: StatusPoller,
    finished: Option<PollStatus>,
}

impl ChainExecutor {
    /// Index of the step currently running (or the last one that ran).
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    fn launch(&mut self, index: usize) -> Result<(), LaunchError> {
        let command = &self.steps[index];
        let handle = self.spawner.spawn(command, self.working_dir.as_deref())?;
        info!(
            "Chain step {}/{} started `{}` (pid {:?})",
            index + 1,
            self.steps.len(),
            command,
            handle.id()
        );
        self.cursor = index;
        self.current = Some(handle);
        Ok(())
    }

    fn start(&mut self) -> Result<StartStatus, LaunchError> {
        self.launch(0)?;
        Ok(StartStatus::Running)
    }

    fn poll(&mut self) -> PollStatus {
        if let Some(done) = &self.finished {
            return done.clone();
        }
        let Some(handle) = self.current.as_mut() else {
            return settle(
                &mut self.finished,
                PollStatus::Failed(FailureReason::Launch("chain was never started".into())),
            );
        };

        let now = Instant::now();
        if !self.poller.is_due(now) {
            return PollStatus::Running;
        }

        let exit = match handle.try_wait() {
            Ok(Some(exit)) => exit,
            Ok(None) => {
                self.poller.record_success();
                return PollStatus::Running;
            }
            Err(e) => {
                return match self.poller.record_failure(now, &PollError::Query(e.to_string())) {
                    Ok(()) => PollStatus::Running,
                    Err(exhausted) => settle(&mut self.finished, escalate(exhausted)),
                };
            }
        };
        self.poller.record_success();
        self.last_stderr = self.current.take().and_then(|h| h.stderr_tail());

        let index = self.cursor;
        if let PollStatus::Failed(cause) = PollStatus::from_exit(exit) {
            return settle(
                &mut self.finished,
                PollStatus::Failed(FailureReason::Step {
                    index,
                    cause: Box::new(cause),
                }),
            );
        }

        let next = index + 1;
        if next == self.steps.len() {
            return settle(&mut self.finished, PollStatus::Succeeded);
        }

        match self.launch(next) {
            Ok(()) => PollStatus::Running,
            Err(err) => settle(
                &mut self.finished,
                PollStatus::Failed(FailureReason::Step {
                    index: next,
                    cause: Box::new(FailureReason::Launch(err.to_string())),
                }),
            ),
        }
    }

    fn cancel(&mut self) -> Result<(), CancelError> {
        match self.current.as_mut() {
            Some(handle) => handle
                .start_kill()
                .map_err(|e| CancelError::new(self.steps[self.cursor].clone(), e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobConfig;
    use crate::core::testing::{FakeScheduler, FakeSpawner};
    use crate::types::JobId;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn bind(mode: JobMode, commands: &[&str], config: JobConfig, backends: &Backends) -> JobExecutor {
        let job = Job::new(JobId::new(0), mode, commands.iter().copied(), config).unwrap();
        JobExecutor::bind(&job, backends, fast_retry())
    }

    fn chain(exec: &JobExecutor) -> &ChainExecutor {
        match exec {
            JobExecutor::SequentialChain(chain) => chain,
            _ => panic!("not a chain executor"),
        }
    }

    fn local(exec: &JobExecutor) -> &LocalProcessExecutor {
        match exec {
            JobExecutor::LocalProcess(local) => local,
            _ => panic!("not a local-process executor"),
        }
    }

    #[tokio::test]
    async fn test_local_process_joins_commands() {
        let spawner = FakeSpawner::new();
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(spawner.clone()));
        let mut exec = bind(
            JobMode::LocalProcess,
            &["ok:1", "ok:0"],
            JobConfig::default(),
            &backends,
        );

        assert_eq!(local(&exec).command(), "ok:1; ok:0");
        assert_eq!(exec.start().await.unwrap(), StartStatus::Running);
        assert_eq!(spawner.launched(), vec!["ok:1; ok:0".to_string()]);
    }

    #[tokio::test]
    async fn test_local_process_maps_exit_codes() {
        let spawner = FakeSpawner::new();
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(spawner.clone()));

        let mut ok = bind(JobMode::LocalProcess, &["ok:1"], JobConfig::default(), &backends);
        ok.start().await.unwrap();
        assert_eq!(ok.poll().await, PollStatus::Running);
        assert_eq!(ok.poll().await, PollStatus::Succeeded);

        let mut bad = bind(JobMode::LocalProcess, &["fail:0"], JobConfig::default(), &backends);
        bad.start().await.unwrap();
        assert_eq!(bad.poll().await, PollStatus::Failed(FailureReason::ExitCode(1)));
    }

    #[tokio::test]
    async fn test_terminal_poll_is_idempotent() {
        let spawner = FakeSpawner::new();
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(spawner.clone()));
        let mut exec = bind(JobMode::LocalProcess, &["fail:0"], JobConfig::default(), &backends);
        exec.start().await.unwrap();

        let first = exec.poll().await;
        let checks = spawner.wait_calls();
        let second = exec.poll().await;
        assert_eq!(first, second);
        assert!(first.is_terminal());
        assert_eq!(spawner.wait_calls(), checks);
    }

    #[tokio::test]
    async fn test_srun_launcher_wraps_command() {
        let spawner = FakeSpawner::new();
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(spawner.clone()));
        let config = JobConfig {
            slurm: Some(SlurmConfig::default().with_job_name("t0")),
            launcher: Launcher::Srun,
            ..Default::default()
        };
        let mut exec = bind(JobMode::LocalProcess, &["echo hi"], config, &backends);
        assert_eq!(local(&exec).command(), "srun --job-name=t0 bash -c 'echo hi'");
        exec.start().await.unwrap();
        assert_eq!(
            spawner.launched(),
            vec!["srun --job-name=t0 bash -c 'echo hi'".to_string()]
        );
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_and_stops_on_failure() {
        let spawner = FakeSpawner::new();
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(spawner.clone()));
        let mut exec = bind(
            JobMode::SequentialChain,
            &["ok:0", "fail:1", "ok:0"],
            JobConfig::default(),
            &backends,
        );

        assert_eq!(chain(&exec).steps(), ["ok:0", "fail:1", "ok:0"]);
        exec.start().await.unwrap();
        assert_eq!(spawner.launched(), vec!["ok:0"]);
        assert_eq!(chain(&exec).cursor(), 0);

        // step 1 finishes, step 2 starts
        assert_eq!(exec.poll().await, PollStatus::Running);
        assert_eq!(spawner.launched(), vec!["ok:0", "fail:1"]);
        assert_eq!(chain(&exec).cursor(), 1);

        assert_eq!(exec.poll().await, PollStatus::Running);
        assert_eq!(chain(&exec).cursor(), 1);
        assert_eq!(
            exec.poll().await,
            PollStatus::Failed(FailureReason::Step {
                index: 1,
                cause: Box::new(FailureReason::ExitCode(1)),
            })
        );
        assert_eq!(spawner.launched().len(), 2);
        assert!(exec.poll().await.is_terminal());
        assert_eq!(spawner.launched().len(), 2);
    }

    #[test]
    fn test_srun_chain_wraps_each_step() {
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(FakeSpawner::new()));
        let config = JobConfig {
            slurm: Some(SlurmConfig::default().with_job_name("prep")),
            launcher: Launcher::Srun,
            ..Default::default()
        };
        let exec = bind(JobMode::SequentialChain, &["a", "b c"], config, &backends);
        assert_eq!(
            chain(&exec).steps(),
            [
                "srun --job-name=prep bash -c a",
                "srun --job-name=prep bash -c 'b c'",
            ]
        );
    }

    #[tokio::test]
    async fn test_chain_succeeds_after_last_step() {
        let spawner = FakeSpawner::new();
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(spawner.clone()));
        let mut exec = bind(
            JobMode::SequentialChain,
            &["ok:0", "ok:0", "ok:0"],
            JobConfig::default(),
            &backends,
        );

        exec.start().await.unwrap();
        for step in 1..3 {
            assert_eq!(exec.poll().await, PollStatus::Running);
            assert_eq!(chain(&exec).cursor(), step);
        }
        assert_eq!(exec.poll().await, PollStatus::Succeeded);
        assert_eq!(chain(&exec).cursor(), 2);
        assert_eq!(spawner.launched(), vec!["ok:0", "ok:0", "ok:0"]);
        assert_eq!(spawner.max_live(), 1);
    }

    #[tokio::test]
    async fn test_remote_batch_lifecycle() {
        let scheduler = FakeScheduler::new();
        scheduler.script(
            "100",
            vec![
                Ok(RemoteState::Queued),
                Ok(RemoteState::Running),
                Ok(RemoteState::CompletedSuccess),
            ],
        );
        let backends = Backends::new(Arc::new(scheduler.clone()), Arc::new(FakeSpawner::new()));
        let mut exec = bind(JobMode::RemoteBatch, &["python train.py"], JobConfig::default(), &backends);

        assert_eq!(exec.start().await.unwrap(), StartStatus::Submitted);
        assert_eq!(exec.external_id(), Some(&ExternalJobId::new("100")));
        assert_eq!(exec.poll().await, PollStatus::Queued);
        assert_eq!(exec.poll().await, PollStatus::Running);
        assert_eq!(exec.poll().await, PollStatus::Succeeded);
        assert_eq!(exec.poll().await, PollStatus::Succeeded);

        let submitted = scheduler.submissions();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1.job_name.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_remote_unknown_escalates_after_retries() {
        let scheduler = FakeScheduler::new();
        scheduler.script("100", vec![Ok(RemoteState::Unknown); 5]);
        let backends = Backends::new(Arc::new(scheduler.clone()), Arc::new(FakeSpawner::new()));
        let mut exec = bind(JobMode::RemoteBatch, &["true"], JobConfig::default(), &backends);
        exec.start().await.unwrap();

        assert_eq!(exec.poll().await, PollStatus::Running);
        assert_eq!(exec.poll().await, PollStatus::Running);
        match exec.poll().await {
            PollStatus::Failed(FailureReason::PollExhausted(msg)) => assert!(msg.contains("100")),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_transient_error_then_recovery() {
        let scheduler = FakeScheduler::new();
        scheduler.script(
            "100",
            vec![
                Err(PollError::Query("slurmctld not responding".into())),
                Err(PollError::Query("slurmctld not responding".into())),
                Ok(RemoteState::CompletedFailure("FAILED".into())),
            ],
        );
        let backends = Backends::new(Arc::new(scheduler.clone()), Arc::new(FakeSpawner::new()));
        let mut exec = bind(JobMode::RemoteBatch, &["true"], JobConfig::default(), &backends);
        exec.start().await.unwrap();

        // no answer yet, so the job is still assumed to be queued
        assert_eq!(exec.poll().await, PollStatus::Queued);
        assert_eq!(exec.poll().await, PollStatus::Queued);
        assert_eq!(
            exec.poll().await,
            PollStatus::Failed(FailureReason::External("FAILED".into()))
        );
    }

    #[tokio::test]
    async fn test_remote_failed_query_repeats_last_answer() {
        let scheduler = FakeScheduler::new();
        scheduler.script(
            "100",
            vec![
                Ok(RemoteState::Queued),
                Err(PollError::Query("socket timed out".into())),
                Ok(RemoteState::Running),
                Err(PollError::Query("socket timed out".into())),
                Ok(RemoteState::CompletedSuccess),
            ],
        );
        let backends = Backends::new(Arc::new(scheduler.clone()), Arc::new(FakeSpawner::new()));
        let mut exec = bind(JobMode::RemoteBatch, &["true"], JobConfig::default(), &backends);
        exec.start().await.unwrap();

        assert_eq!(exec.poll().await, PollStatus::Queued);
        assert_eq!(exec.poll().await, PollStatus::Queued);
        assert_eq!(exec.poll().await, PollStatus::Running);
        assert_eq!(exec.poll().await, PollStatus::Running);
        assert_eq!(exec.poll().await, PollStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_remote_invalid_config_never_submits() {
        let scheduler = FakeScheduler::new();
        let backends = Backends::new(Arc::new(scheduler.clone()), Arc::new(FakeSpawner::new()));
        let config = JobConfig::with_slurm(SlurmConfig::default().with_job_name("bad\nname"));
        let mut exec = bind(JobMode::RemoteBatch, &["true"], config, &backends);

        assert!(matches!(exec.start().await, Err(LaunchError::InvalidConfig(_))));
        assert!(scheduler.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_kills_running_step() {
        let spawner = FakeSpawner::new();
        let backends = Backends::new(Arc::new(FakeScheduler::new()), Arc::new(spawner.clone()));
        let mut exec = bind(JobMode::SequentialChain, &["hang", "ok:0"], JobConfig::default(), &backends);
        exec.start().await.unwrap();
        assert_eq!(exec.poll().await, PollStatus::Running);

        exec.cancel().await.unwrap();
        assert_eq!(
            exec.poll().await,
            PollStatus::Failed(FailureReason::Step {
                index: 0,
                cause: Box::new(FailureReason::Signal),
            })
        );
        assert_eq!(spawner.launched(), vec!["hang"]);
    }
}
