use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use job_orchestrator::{
    JobConfig, JobManager, JobManagerResult, JobMode, ManagerConfig, SlurmConfig, create_manager,
    load_jobs_file, resolve_jobs_path,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "job-orchestrator")]
#[command(about = "Run shell, srun and sbatch jobs under a concurrency ceiling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job listed in a jobs file
    Run {
        /// Jobs file (defaults to ./jobs.json)
        #[arg(long, env = "JOB_ORCHESTRATOR_JOBS")]
        jobs: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Run commands given on the command line
    Exec {
        /// Execution mode: local-process, srun, remote-batch or sequential-chain
        #[arg(long, default_value = "local-process")]
        mode: String,
        /// Slurm resource request (JSON) for srun and batch jobs
        #[arg(long)]
        slurm: Option<PathBuf>,
        /// Enqueue the whole command list this many times
        #[arg(long, default_value_t = 1)]
        repeat: usize,
        #[command(flatten)]
        overrides: Overrides,
        #[arg(last = true, required = true)]
        commands: Vec<String>,
    },
    /// Print the srun command or sbatch script that would be used
    Render {
        /// Slurm resource request (JSON); the standard request if omitted
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        mode: RenderMode,
        #[arg(last = true, required = true)]
        commands: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RenderMode {
    Srun,
    Sbatch,
}

#[derive(clap::Args)]
struct Overrides {
    /// Maximum number of jobs submitted or running at once
    #[arg(long, env = "JOB_ORCHESTRATOR_MAX_RUNNING")]
    max_running: Option<usize>,
    /// Seconds between status checks
    #[arg(long)]
    poll_interval: Option<f64>,
    /// Cancel jobs running longer than this many seconds
    #[arg(long)]
    timeout: Option<f64>,
}

impl Overrides {
    fn apply(&self, mut config: ManagerConfig) -> Result<ManagerConfig> {
        if let Some(n) = self.max_running {
            config.max_running = n;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval = seconds("--poll-interval", secs)?;
        }
        if let Some(secs) = self.timeout {
            config.job_timeout = Some(seconds("--timeout", secs)?);
        }
        Ok(config)
    }
}

fn seconds(flag: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("{} must be a non-negative number", flag))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("job_orchestrator=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { jobs, overrides } => {
            let path = resolve_jobs_path(jobs.as_deref())?;
            info!("Loading jobs from {}", path.display());
            let file = load_jobs_file(&path)?;

            let config = file.manager_config(ManagerConfig::from_env()?)?;
            let manager = create_manager(overrides.apply(config)?)?;
            for entry in &file.jobs {
                manager.add_job(&entry.mode, entry.commands.clone().into_vec(), Some(file.job_config(entry)))?;
            }
            run_until_done(manager).await?
        }
        Commands::Exec {
            mode,
            slurm,
            repeat,
            overrides,
            commands,
        } => {
            let config = overrides.apply(ManagerConfig::from_env()?)?;
            let manager = create_manager(config)?;
            let job_config = match slurm {
                Some(path) => Some(JobConfig::with_slurm(SlurmConfig::from_json_file(&path)?)),
                None => None,
            };

            let (parsed, _) = JobMode::parse(&mode)?;
            for _ in 0..repeat {
                if parsed == JobMode::SequentialChain {
                    manager.add_job(&mode, commands.iter().cloned(), job_config.clone())?;
                } else {
                    for command in &commands {
                        manager.add_job(&mode, [command.clone()], job_config.clone())?;
                    }
                }
            }
            run_until_done(manager).await?
        }
        Commands::Render {
            config,
            mode,
            commands,
        } => {
            let slurm = match config {
                Some(path) => SlurmConfig::standard().merge(&SlurmConfig::from_json_file(&path)?),
                None => SlurmConfig::standard(),
            };
            slurm.validate()?;
            match mode {
                RenderMode::Srun => println!("{}", slurm.srun_command(&commands)),
                RenderMode::Sbatch => print!("{}", slurm.batch_script(&commands)),
            }
            return Ok(());
        }
    };

    print_summary(&result);
    if !result.all_succeeded() {
        std::process::exit(1);
    }

    Ok(())
}

/// Drive the manager to completion, turning Ctrl-C into a global shutdown.
async fn run_until_done(mut manager: JobManager) -> Result<JobManagerResult> {
    let handle = manager.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running jobs");
            handle.shutdown();
        }
    });

    let result = manager.run().await?;
    Ok(result)
}

fn print_summary(result: &JobManagerResult) {
    println!();
    println!(
        "{:<10} {:<20} {:<18} {:<10} {:<12} {}",
        "JOB", "LABEL", "MODE", "STATE", "EXTERNAL", "DETAIL"
    );
    println!("{}", "-".repeat(90));

    for outcome in &result.outcomes {
        let external = outcome
            .external_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut detail = outcome
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default();
        if let Some(last) = outcome.stderr_tail.as_deref().and_then(|t| t.lines().last()) {
            detail.push_str(&format!(" ({})", last.trim()));
        }
        println!(
            "{:<10} {:<20} {:<18} {:<10} {:<12} {}",
            outcome.id.to_string(),
            outcome.label.to_string(),
            outcome.mode.as_str(),
            format!("{:?}", outcome.state),
            external,
            detail
        );
    }
    for id in &result.dropped {
        println!("{:<10} {:<20} {:<18} {:<10}", id.to_string(), "-", "-", "Dropped");
    }

    println!();
    println!(
        "{} succeeded, {} failed, {} dropped",
        result.succeeded,
        result.failed,
        result.dropped.len()
    );
}
