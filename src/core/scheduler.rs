// Job admission and supervision loop

use crate::backend::{Backends, SlurmConfig};
use crate::config::ManagerConfig;
use crate::core::executor::{JobExecutor, PollStatus, StartStatus};
use crate::core::job::{FailureReason, Job, JobConfig, JobMode, JobOutcome, JobState, Launcher};
use crate::error::{ConfigError, EnqueueError, ManagerError};
use crate::types::JobId;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ManagerMessage {
    Schedule(Job),
    Cancel(JobId),
    Shutdown,
}

/// Aggregate report returned by [`JobManager::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobManagerResult {
    pub succeeded: usize,
    pub failed: usize,
    /// Terminal outcomes in the order jobs finished.
    pub outcomes: Vec<JobOutcome>,
    /// Jobs in the order they were admitted.
    pub admission_order: Vec<JobId>,
    /// Pending jobs discarded by a shutdown without being started.
    pub dropped: Vec<JobId>,
    /// Highest number of jobs that were in flight at once.
    pub peak_in_flight: usize,
}

impl JobManagerResult {
    pub fn outcome(&self, id: JobId) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.dropped.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome.state {
            JobState::Succeeded => {
                info!("{} ({}) succeeded", outcome.id, outcome.label);
                self.succeeded += 1;
            }
            _ => {
                let reason = outcome
                    .failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown reason".to_string());
                warn!("{} ({}) failed: {}", outcome.id, outcome.label, reason);
                self.failed += 1;
            }
        }
        self.outcomes.push(outcome);
    }
}

/// Cloneable producer side of a manager.
///
/// Jobs, cancellations and shutdown requests travel over a channel to the
/// single loop inside [`JobManager::run`], which is the only place job state
/// changes. A handle may be used from any task or thread.
#[derive(Clone)]
pub struct JobManagerHandle {
    sender: mpsc::UnboundedSender<ManagerMessage>,
    next_id: Arc<Mutex<u64>>,
}

impl JobManagerHandle {
    /// Enqueue a job. See [`JobManager::add_job`].
    pub fn add_job<I, S>(
        &self,
        mode: &str,
        commands: I,
        config: Option<JobConfig>,
    ) -> Result<JobId, EnqueueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (mode, launcher) = JobMode::parse(mode)?;
        let mut config = config.unwrap_or_default();
        if let Some(launcher) = launcher {
            config.launcher = launcher;
        }
        let needs_slurm = mode == JobMode::RemoteBatch || config.launcher == Launcher::Srun;
        if needs_slurm && config.slurm.is_none() {
            warn!("Slurm config is not provided, using the standard request");
            config.slurm = Some(SlurmConfig::standard());
        }

        // Holding the counter while sending keeps ids in queue order when
        // several threads enqueue at once.
        let mut next_id = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = JobId::new(*next_id);
        let job = Job::new(id, mode, commands, config)?;
        self.sender
            .send(ManagerMessage::Schedule(job))
            .map_err(|_| EnqueueError::ManagerClosed)?;
        *next_id += 1;

        debug!("Enqueued {} ({})", id, mode);
        Ok(id)
    }

    /// Cancel a pending or in-flight job. Returns false if the manager is gone.
    pub fn cancel_job(&self, id: JobId) -> bool {
        self.sender.send(ManagerMessage::Cancel(id)).is_ok()
    }

    /// Cancel everything in flight and drop everything pending.
    ///
    /// Takes effect at the next iteration of a running loop. A request sent
    /// while no run is active is discarded when the next `run()` starts.
    pub fn shutdown(&self) -> bool {
        self.sender.send(ManagerMessage::Shutdown).is_ok()
    }
}

/// A job that has been started and not yet reported.
struct InFlight {
    job: Job,
    executor: JobExecutor,
    /// When the job was first seen running; queued batch jobs have none yet.
    running_since: Option<Instant>,
    stop: Option<StopRequest>,
}

/// A cancellation the manager issued and is waiting to see take effect.
struct StopRequest {
    reason: FailureReason,
    requested_at: Instant,
}

/// Queues jobs and runs them under a concurrency ceiling.
pub struct JobManager {
    config: ManagerConfig,
    backends: Backends,
    handle: JobManagerHandle,
    receiver: mpsc::UnboundedReceiver<ManagerMessage>,
    pending: VecDeque<Job>,
    in_flight: BTreeMap<JobId, InFlight>,
    shutdown_requested: bool,
}

impl JobManager {
    pub fn with_backends(config: ManagerConfig, backends: Backends) -> Result<Self, ConfigError> {
        config.validate()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            backends,
            handle: JobManagerHandle {
                sender,
                next_id: Arc::new(Mutex::new(0)),
            },
            receiver,
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            shutdown_requested: false,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Producer handle for enqueueing from other tasks while `run()` is active.
    pub fn handle(&self) -> JobManagerHandle {
        self.handle.clone()
    }

    /// Enqueue a job in `Pending` state.
    ///
    /// `commands` is consumed immediately; later changes to whatever produced
    /// it have no effect. Fails with `InvalidMode` for an unknown mode and
    /// `EmptyCommands` when the sequence is empty.
    pub fn add_job<I, S>(
        &self,
        mode: &str,
        commands: I,
        config: Option<JobConfig>,
    ) -> Result<JobId, EnqueueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handle.add_job(mode, commands, config)
    }

    pub fn cancel_job(&self, id: JobId) -> bool {
        self.handle.cancel_job(id)
    }

    pub fn shutdown(&self) -> bool {
        self.handle.shutdown()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run until the queue is drained and every admitted job has finished.
    ///
    /// Per-job failures are recorded in the result; only broken bookkeeping
    /// returns an error. Afterwards the manager is empty and can be run again.
    pub async fn run(&mut self) -> Result<JobManagerResult, ManagerError> {
        let mut result = JobManagerResult::default();
        let mut last_progress = String::new();

        // A shutdown that arrived while no run was active belongs to the
        // previous run; the jobs queued for this one must still start.
        self.drain_messages(&mut result).await?;
        if self.shutdown_requested {
            debug!("Discarding shutdown request left over from an earlier run");
            self.shutdown_requested = false;
        }

        loop {
            let mut progressed = self.drain_messages(&mut result).await?;

            if self.shutdown_requested {
                self.shutdown_now(&mut result).await?;
                break;
            }
            if self.pending.is_empty() && self.in_flight.is_empty() {
                break;
            }

            progressed |= self.admit(&mut result).await?;
            progressed |= self.poll_in_flight(&mut result).await?;
            progressed |= self.enforce_timeouts().await;

            let progress = format!(
                "todo/active/done jobs: {}/{}/{}",
                self.pending.len(),
                self.in_flight.len(),
                result.outcomes.len()
            );
            if progress != last_progress {
                info!("{}", progress);
                last_progress = progress;
            }

            if !progressed && !(self.pending.is_empty() && self.in_flight.is_empty()) {
                let interval = self.config.poll_interval;
                let woken_by = tokio::select! {
                    _ = tokio::time::sleep(interval) => None,
                    message = self.receiver.recv() => message,
                };
                if let Some(message) = woken_by {
                    self.handle_message(message, &mut result).await?;
                }
            }
        }

        self.shutdown_requested = false;
        info!(
            "Run finished: {} succeeded, {} failed, {} dropped",
            result.succeeded,
            result.failed,
            result.dropped.len()
        );
        Ok(result)
    }

    async fn drain_messages(&mut self, result: &mut JobManagerResult) -> Result<bool, ManagerError> {
        let mut changed = false;
        while let Ok(message) = self.receiver.try_recv() {
            changed |= self.handle_message(message, result).await?;
        }
        Ok(changed)
    }

    async fn handle_message(
        &mut self,
        message: ManagerMessage,
        result: &mut JobManagerResult,
    ) -> Result<bool, ManagerError> {
        match message {
            ManagerMessage::Schedule(job) => {
                self.pending.push_back(job);
                Ok(true)
            }
            ManagerMessage::Cancel(id) => self.cancel(id, result).await,
            ManagerMessage::Shutdown => {
                self.shutdown_requested = true;
                Ok(true)
            }
        }
    }

    async fn cancel(&mut self, id: JobId, result: &mut JobManagerResult) -> Result<bool, ManagerError> {
        if let Some(pos) = self.pending.iter().position(|job| job.id == id) {
            if let Some(mut job) = self.pending.remove(pos) {
                info!("Cancelled {} before it started", id);
                job.transition(JobState::Failed)?;
                result.record(JobOutcome::from_job(&job, Some(FailureReason::Cancelled), None));
            }
            return Ok(true);
        }

        if let Some(entry) = self.in_flight.get_mut(&id) {
            if entry.stop.is_none() {
                info!("Cancelling {}", id);
                request_stop(entry, FailureReason::Cancelled).await;
            }
            return Ok(true);
        }

        debug!("Ignoring cancel for {}: not pending or in flight", id);
        Ok(false)
    }

    /// Start pending jobs in FIFO order while slots are free.
    async fn admit(&mut self, result: &mut JobManagerResult) -> Result<bool, ManagerError> {
        let mut admitted = false;

        while self.in_flight.len() < self.config.max_running {
            let Some(mut job) = self.pending.pop_front() else {
                break;
            };
            admitted = true;
            result.admission_order.push(job.id);

            let mut executor = JobExecutor::bind(&job, &self.backends, self.config.retry);
            match executor.start().await {
                Ok(status) => {
                    job.transition(JobState::Submitted)?;
                    let running_since = if status == StartStatus::Running {
                        job.transition(JobState::Running)?;
                        Some(Instant::now())
                    } else {
                        None
                    };
                    info!("Submit {} ({}): {}", job.id, job.mode, job.commands.join("; "));
                    self.in_flight.insert(
                        job.id,
                        InFlight {
                            job,
                            executor,
                            running_since,
                            stop: None,
                        },
                    );
                }
                Err(err) => {
                    warn!("Failed to launch {}: {}", job.id, err);
                    job.transition(JobState::Failed)?;
                    result.record(JobOutcome::from_job(
                        &job,
                        Some(FailureReason::Launch(err.to_string())),
                        None,
                    ));
                }
            }
        }

        if self.in_flight.len() > self.config.max_running {
            return Err(ManagerError::CeilingViolated {
                in_flight: self.in_flight.len(),
                ceiling: self.config.max_running,
            });
        }
        result.peak_in_flight = result.peak_in_flight.max(self.in_flight.len());
        Ok(admitted)
    }

    /// Poll every in-flight job once and retire those that finished.
    async fn poll_in_flight(&mut self, result: &mut JobManagerResult) -> Result<bool, ManagerError> {
        let mut changed = false;
        let grace = self.config.cancel_grace;
        let ids: Vec<JobId> = self.in_flight.keys().copied().collect();

        for id in ids {
            let Some(entry) = self.in_flight.get_mut(&id) else {
                continue;
            };
            let status = entry.executor.poll().await;

            // A job we asked to stop ends with the stop reason, whatever the
            // executor reports, once it stops or the grace period runs out.
            if let Some(stop) = &entry.stop {
                let expired = stop.requested_at.elapsed() >= grace;
                if status.is_terminal() || expired {
                    if !status.is_terminal() {
                        warn!("{} did not stop within {:?}; giving up on it", id, grace);
                    }
                    let reason = stop.reason.clone();
                    self.retire(id, PollStatus::Failed(reason), result)?;
                    changed = true;
                }
                continue;
            }

            match status {
                PollStatus::Queued => {}
                PollStatus::Running => {
                    if entry.job.state() == JobState::Submitted {
                        entry.job.transition(JobState::Running)?;
                        entry.running_since = Some(Instant::now());
                        info!("{} is running", id);
                        changed = true;
                    }
                }
                terminal => {
                    self.retire(id, terminal, result)?;
                    changed = true;
                }
            }
        }

        Ok(changed)
    }

    /// Cancel jobs that have been running longer than the configured timeout.
    async fn enforce_timeouts(&mut self) -> bool {
        let Some(timeout) = self.config.job_timeout else {
            return false;
        };

        let mut changed = false;
        for (id, entry) in self.in_flight.iter_mut() {
            let overdue = entry
                .running_since
                .is_some_and(|since| since.elapsed() >= timeout);
            if entry.stop.is_none() && overdue {
                warn!("{} exceeded its {:?} time limit, cancelling", id, timeout);
                request_stop(entry, FailureReason::Timeout).await;
                changed = true;
            }
        }
        changed
    }

    fn retire(
        &mut self,
        id: JobId,
        status: PollStatus,
        result: &mut JobManagerResult,
    ) -> Result<(), ManagerError> {
        let Some(mut entry) = self.in_flight.remove(&id) else {
            return Ok(());
        };

        let failure = match status {
            PollStatus::Succeeded => {
                entry.job.finish(JobState::Succeeded)?;
                None
            }
            PollStatus::Failed(reason) => {
                entry.job.finish(JobState::Failed)?;
                Some(reason)
            }
            PollStatus::Queued | PollStatus::Running => return Ok(()),
        };

        let stderr_tail = match failure {
            Some(_) => entry.executor.stderr_tail(),
            None => None,
        };
        let external_id = entry.executor.external_id().cloned();
        result.record(
            JobOutcome::from_job(&entry.job, failure, external_id).with_stderr_tail(stderr_tail),
        );
        Ok(())
    }

    /// Cancel everything in flight and drop everything pending.
    async fn shutdown_now(&mut self, result: &mut JobManagerResult) -> Result<(), ManagerError> {
        info!(
            "Shutting down: cancelling {} running jobs, dropping {} pending",
            self.in_flight.len(),
            self.pending.len()
        );

        let in_flight = std::mem::take(&mut self.in_flight);
        for (id, mut entry) in in_flight {
            if let Err(err) = entry.executor.cancel().await {
                warn!("Failed to cancel {}: {}", id, err);
            }
            entry.job.finish(JobState::Failed)?;
            let external_id = entry.executor.external_id().cloned();
            result.record(JobOutcome::from_job(
                &entry.job,
                Some(FailureReason::Cancelled),
                external_id,
            ));
        }

        result.dropped.extend(self.pending.drain(..).map(|job| job.id));
        Ok(())
    }
}

async fn request_stop(entry: &mut InFlight, reason: FailureReason) {
    if let Err(err) = entry.executor.cancel().await {
        warn!("Failed to cancel {}: {}", entry.job.id, err);
    }
    entry.stop = Some(StopRequest {
        reason,
        requested_at: Instant::now(),
    });
}
