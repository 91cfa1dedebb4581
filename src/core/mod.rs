// Job model, executors and the manager loop

pub mod executor;
pub mod job;
pub mod poller;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::{JobExecutor, PollStatus, StartStatus};
pub use job::{FailureReason, Job, JobConfig, JobMode, JobOutcome, JobState, Launcher};
pub use poller::{RetryPolicy, StatusPoller};
pub use scheduler::{JobManager, JobManagerHandle, JobManagerResult, ManagerMessage};
