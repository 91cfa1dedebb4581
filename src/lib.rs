// Core modules
pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod types;

// Re-export key types and functions
pub use backend::{Backends, BatchScheduler, ProcessSpawner, ShellSpawner, SlurmCli, SlurmConfig};
pub use config::{JobsFile, ManagerConfig, load_jobs_file, resolve_jobs_path};
pub use crate::core::{
    FailureReason, JobConfig, JobManager, JobManagerHandle, JobManagerResult, JobMode,
    JobOutcome, JobState, RetryPolicy,
};
pub use error::{CancelError, ConfigError, EnqueueError, LaunchError, ManagerError, PollError};
pub use types::{ExternalJobId, JobId, JobLabel};

use std::sync::Arc;

/// Convenience function to create a manager backed by the Slurm command-line
/// tools and a local shell.
pub fn create_manager(config: ManagerConfig) -> Result<JobManager, ConfigError> {
    let batch = SlurmCli::new().with_accounting(config.slurm_accounting);
    let spawner = ShellSpawner::new(config.shell.clone());
    let backends = Backends::new(Arc::new(batch), Arc::new(spawner));
    JobManager::with_backends(config, backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_manager_validates_config() {
        assert!(create_manager(ManagerConfig::default().with_max_running(0)).is_err());

        let manager = create_manager(ManagerConfig::default().with_max_running(4)).unwrap();
        assert_eq!(manager.config().max_running, 4);
        assert_eq!(manager.pending_count(), 0);
    }
}
