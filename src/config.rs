use crate::backend::SlurmConfig;
use crate::core::{JobConfig, JobMode, Launcher, RetryPolicy};
use crate::error::ConfigError;
use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

/// Settings of the manager's run loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Concurrency ceiling: jobs allowed in Submitted or Running at once.
    pub max_running: usize,
    /// Sleep between poll cycles that made no progress.
    pub poll_interval: Duration,
    /// Running-time bound after which a job is cancelled.
    pub job_timeout: Option<Duration>,
    /// How long a cancelled job may take to stop before it is written off.
    pub cancel_grace: Duration,
    pub retry: RetryPolicy,
    /// Shell used for local processes and chain steps.
    pub shell: String,
    /// Whether `sacct` can be used to learn how a batch job ended.
    pub slurm_accounting: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_running: 1,
            poll_interval: Duration::from_secs(10),
            job_timeout: None,
            cancel_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            shell: "bash".to_string(),
            slurm_accounting: true,
        }
    }
}

impl ManagerConfig {
    pub fn with_max_running(mut self, max_running: usize) -> Self {
        self.max_running = max_running;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_running == 0 {
            return Err(ConfigError::new("max_running", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::new("poll_interval", "must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::new("retry.max_attempts", "must be at least 1"));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::new("shell", "must not be empty"));
        }
        Ok(())
    }

    /// Overlay `JOB_ORCHESTRATOR_*` environment variables on the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let section = ManagerSection {
            max_running: env_parse("JOB_ORCHESTRATOR_MAX_RUNNING")?,
            poll_interval_secs: env_parse("JOB_ORCHESTRATOR_POLL_INTERVAL_SECS")?,
            job_timeout_secs: env_parse("JOB_ORCHESTRATOR_JOB_TIMEOUT_SECS")?,
            cancel_grace_secs: env_parse("JOB_ORCHESTRATOR_CANCEL_GRACE_SECS")?,
            shell: env::var("JOB_ORCHESTRATOR_SHELL").ok(),
            slurm_accounting: env_parse("JOB_ORCHESTRATOR_SLURM_ACCOUNTING")?,
            ..Default::default()
        };

        let mut config = Self::default();
        section.apply(&mut config)?;
        Ok(config)
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
        Err(_) => Ok(None),
    }
}

fn seconds(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::new(key, e.to_string()))
}

/// `manager` section of a jobs file. Every field is optional and overrides the
/// corresponding `ManagerConfig` value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerSection {
    pub max_running: Option<usize>,
    pub poll_interval_secs: Option<f64>,
    pub job_timeout_secs: Option<f64>,
    pub cancel_grace_secs: Option<f64>,
    pub retry_max_attempts: Option<u32>,
    pub retry_initial_backoff_secs: Option<f64>,
    pub retry_max_backoff_secs: Option<f64>,
    pub shell: Option<String>,
    pub slurm_accounting: Option<bool>,
}

impl ManagerSection {
    pub fn apply(&self, config: &mut ManagerConfig) -> Result<(), ConfigError> {
        if let Some(max_running) = self.max_running {
            config.max_running = max_running;
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval = seconds("poll_interval_secs", secs)?;
        }
        if let Some(secs) = self.job_timeout_secs {
            config.job_timeout = Some(seconds("job_timeout_secs", secs)?);
        }
        if let Some(secs) = self.cancel_grace_secs {
            config.cancel_grace = seconds("cancel_grace_secs", secs)?;
        }
        if let Some(attempts) = self.retry_max_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(secs) = self.retry_initial_backoff_secs {
            config.retry.initial_backoff = seconds("retry_initial_backoff_secs", secs)?;
        }
        if let Some(secs) = self.retry_max_backoff_secs {
            config.retry.max_backoff = seconds("retry_max_backoff_secs", secs)?;
        }
        if let Some(shell) = &self.shell {
            config.shell = shell.clone();
        }
        if let Some(accounting) = self.slurm_accounting {
            config.slurm_accounting = accounting;
        }
        config.validate()
    }
}

/// A job's commands: a single string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    One(String),
    Many(Vec<String>),
}

impl CommandSpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(command) => vec![command],
            Self::Many(commands) => commands,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobEntry {
    pub mode: String,
    pub commands: CommandSpec,
    #[serde(default)]
    pub slurm: Option<SlurmConfig>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsFile {
    #[serde(default)]
    pub manager: ManagerSection,
    /// Resource request every batch/srun job starts from.
    #[serde(default)]
    pub slurm: Option<SlurmConfig>,
    pub jobs: Vec<JobEntry>,
}

impl JobsFile {
    /// Manager settings with this file's overrides applied.
    pub fn manager_config(&self, base: ManagerConfig) -> Result<ManagerConfig, ConfigError> {
        let mut config = base;
        self.manager.apply(&mut config)?;
        Ok(config)
    }

    /// The per-job configuration `add_job` expects, with the file-level Slurm
    /// defaults merged in. Batch and srun jobs without any request fall back
    /// to the manager's standard request later.
    pub fn job_config(&self, entry: &JobEntry) -> JobConfig {
        let slurm = match (&self.slurm, &entry.slurm) {
            (Some(base), Some(over)) => Some(base.merge(over)),
            (base, over) => over.clone().or_else(|| base.clone()),
        };
        JobConfig {
            slurm,
            working_dir: entry.working_dir.clone(),
            launcher: match JobMode::parse(&entry.mode) {
                Ok((_, Some(launcher))) => launcher,
                _ => Launcher::Shell,
            },
        }
    }
}

/// Locate the jobs file: an explicit path, then `JOB_ORCHESTRATOR_JOBS`,
/// then `./jobs.json`.
pub fn resolve_jobs_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }

    if let Ok(p) = env::var("JOB_ORCHESTRATOR_JOBS") {
        return Ok(PathBuf::from(p));
    }

    let candidate = PathBuf::from("jobs.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find jobs.json (pass --jobs, set JOB_ORCHESTRATOR_JOBS or create ./jobs.json)"
    ))
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_slurm(cfg: &mut SlurmConfig) {
    let fields = [
        &mut cfg.job_name,
        &mut cfg.output,
        &mut cfg.error,
        &mut cfg.mem,
        &mut cfg.time,
        &mut cfg.partition,
        &mut cfg.gres,
        &mut cfg.export,
        &mut cfg.exclude,
        &mut cfg.nodelist,
    ];
    for value in fields.into_iter().flatten() {
        *value = expand_env_vars(value);
    }
    for value in cfg.extra.values_mut() {
        if let serde_json::Value::String(s) = value {
            *s = expand_env_vars(s);
        }
    }
}

fn expand_entry(entry: JobEntry) -> JobEntry {
    let mut entry = entry;

    entry.commands = match entry.commands {
        CommandSpec::One(c) => CommandSpec::One(expand_env_vars(&c)),
        CommandSpec::Many(cs) => {
            CommandSpec::Many(cs.into_iter().map(|c| expand_env_vars(&c)).collect())
        }
    };
    if let Some(dir) = entry.working_dir.as_mut() {
        *dir = PathBuf::from(expand_env_vars(&dir.to_string_lossy()));
    }
    if let Some(slurm) = entry.slurm.as_mut() {
        expand_slurm(slurm);
    }

    entry
}

/// Parse a jobs file, expanding `${VAR}` references from the environment.
pub fn parse_jobs_file(raw: &str) -> anyhow::Result<JobsFile> {
    let mut file: JobsFile = serde_json::from_str(raw)?;
    file.jobs = file.jobs.into_iter().map(expand_entry).collect();
    if let Some(slurm) = file.slurm.as_mut() {
        expand_slurm(slurm);
    }
    Ok(file)
}

pub fn load_jobs_file(path: &Path) -> anyhow::Result<JobsFile> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    parse_jobs_file(&raw)
}
