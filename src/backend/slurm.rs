//! Slurm resource requests and the command-line batch backend.
//!
//! `SlurmConfig` renders a resource request into either an `srun` prefix or
//! an sbatch script. `SlurmCli` drives `sbatch`, `squeue`, `sacct` and
//! `scancel` through `tokio::process`.

use super::{BatchScheduler, RemoteState};
use crate::error::{CancelError, LaunchError, PollError};
use crate::types::ExternalJobId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Slurm resource request.
///
/// Field names follow sbatch's long options with underscores, e.g.
/// `cpus_per_task` renders as `--cpus-per-task`. Anything without a field goes
/// into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    pub job_name: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub nodes: Option<u32>,
    pub ntasks_per_node: Option<u32>,
    pub cpus_per_task: Option<u32>,
    pub mem: Option<String>,
    pub time: Option<String>,
    pub partition: Option<String>,
    pub gres: Option<String>,
    pub export: Option<String>,
    pub exclude: Option<String>,
    pub nodelist: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SlurmConfig {
    /// Request used when a job is submitted without one: a single task with
    /// one CPU and 16g of memory for up to a day.
    pub fn standard() -> Self {
        Self {
            job_name: Some("default".to_string()),
            nodes: Some(1),
            ntasks_per_node: Some(1),
            cpus_per_task: Some(1),
            mem: Some("16g".to_string()),
            time: Some("1-00:00:00".to_string()),
            ..Default::default()
        }
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    /// Set an option that has no dedicated field.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Layer `overrides` on top of `self`; options set in `overrides` win.
    pub fn merge(&self, overrides: &SlurmConfig) -> SlurmConfig {
        fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }

        let mut extra = self.extra.clone();
        extra.extend(overrides.extra.clone());

        SlurmConfig {
            job_name: pick(&self.job_name, &overrides.job_name),
            output: pick(&self.output, &overrides.output),
            error: pick(&self.error, &overrides.error),
            nodes: pick(&self.nodes, &overrides.nodes),
            ntasks_per_node: pick(&self.ntasks_per_node, &overrides.ntasks_per_node),
            cpus_per_task: pick(&self.cpus_per_task, &overrides.cpus_per_task),
            mem: pick(&self.mem, &overrides.mem),
            time: pick(&self.time, &overrides.time),
            partition: pick(&self.partition, &overrides.partition),
            gres: pick(&self.gres, &overrides.gres),
            export: pick(&self.export, &overrides.export),
            exclude: pick(&self.exclude, &overrides.exclude),
            nodelist: pick(&self.nodelist, &overrides.nodelist),
            extra,
        }
    }

    /// Load a resource request from a JSON file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Options as `(long-option, value)` pairs in rendering order.
    pub fn options(&self) -> Vec<(String, String)> {
        let mut options = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                options.push((format_key(key), value));
            }
        };

        push("job_name", self.job_name.clone());
        push("output", self.output.clone());
        push("error", self.error.clone());
        push("nodes", self.nodes.map(|v| v.to_string()));
        push("ntasks_per_node", self.ntasks_per_node.map(|v| v.to_string()));
        push("cpus_per_task", self.cpus_per_task.map(|v| v.to_string()));
        push("mem", self.mem.clone());
        push("time", self.time.clone());
        push("partition", self.partition.clone());
        push("gres", self.gres.clone());
        push("export", self.export.clone());
        push("exclude", self.exclude.clone());
        push("nodelist", self.nodelist.clone());

        for (key, value) in &self.extra {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            push(key, Some(rendered));
        }

        options
    }

    /// Reject requests that would produce a broken command line or script.
    pub fn validate(&self) -> Result<(), LaunchError> {
        for (key, value) in self.options() {
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(LaunchError::InvalidConfig(format!(
                    "invalid option name `{key}`"
                )));
            }
            if value.is_empty() || value.contains(['\n', '\r']) {
                return Err(LaunchError::InvalidConfig(format!(
                    "invalid value for --{key}: {value:?}"
                )));
            }
        }
        Ok(())
    }

    /// `srun` command line running `commands` in one shell on the allocation.
    pub fn srun_command(&self, commands: &[String]) -> String {
        let mut cmd = String::from("srun");
        for (key, value) in self.options() {
            cmd.push_str(&format!(" --{}={}", key, shell_quote(&value)));
        }
        cmd.push_str(&format!(" bash -c {}", shell_quote(&commands.join("; "))));
        cmd
    }

    /// sbatch script running `commands` in order.
    pub fn batch_script(&self, commands: &[String]) -> String {
        let mut script = String::from("#!/bin/bash");
        for (key, value) in self.options() {
            script.push_str(&format!("\n#SBATCH --{key}={value}"));
        }
        script.push_str("\n\n");
        script.push_str(&commands.join("\n"));
        script.push('\n');
        script
    }
}

/// `cpus_per_task` -> `cpus-per-task`
fn format_key(key: &str) -> String {
    key.trim().replace('_', "-")
}

/// Quote a string for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Extract the job id from sbatch output.
///
/// Handles both `--parsable` output (`6449881` or `6449881;cluster`) and the
/// human form (`Submitted batch job 6449881`).
pub fn parse_submission_output(stdout: &str) -> Option<ExternalJobId> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;

    if let Some(rest) = line.strip_prefix("Submitted batch job") {
        let id = rest.split_whitespace().next()?;
        return id
            .chars()
            .all(|c| c.is_ascii_digit())
            .then(|| ExternalJobId::new(id));
    }

    let id = line.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_'))
        .then(|| ExternalJobId::new(id))
}

/// Map a Slurm job state name onto the scheduler-neutral vocabulary.
pub fn map_slurm_state(raw: &str) -> RemoteState {
    // sacct prints e.g. "CANCELLED by 1000" or "RUNNING+"
    let state = raw
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('+')
        .to_ascii_uppercase();

    match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
        | "RESV_DEL_HOLD" | "SUSPENDED" | "STOPPED" | "RESIZING" => RemoteState::Queued,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => RemoteState::Running,
        "COMPLETED" => RemoteState::CompletedSuccess,
        "" => RemoteState::Unknown,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" | "REVOKED" | "SPECIAL_EXIT" => {
            RemoteState::CompletedFailure(state)
        }
        _ => RemoteState::Unknown,
    }
}

/// Batch backend driving the Slurm command-line tools.
#[derive(Debug, Clone)]
pub struct SlurmCli {
    sbatch: String,
    squeue: String,
    sacct: String,
    scancel: String,
    accounting: bool,
}

impl Default for SlurmCli {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
            accounting: true,
        }
    }
}

impl SlurmCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `sacct` is available to report how finished jobs ended.
    ///
    /// Without accounting a job that left the queue is assumed to have
    /// completed successfully.
    pub fn with_accounting(mut self, accounting: bool) -> Self {
        self.accounting = accounting;
        self
    }

    /// Point the backend at differently named or located tools.
    pub fn with_tools(
        mut self,
        sbatch: impl Into<String>,
        squeue: impl Into<String>,
        sacct: impl Into<String>,
        scancel: impl Into<String>,
    ) -> Self {
        self.sbatch = sbatch.into();
        self.squeue = squeue.into();
        self.sacct = sacct.into();
        self.scancel = scancel.into();
        self
    }

    async fn run_tool(program: &str, args: &[&str]) -> std::io::Result<Output> {
        debug!("Running {} {}", program, args.join(" "));
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
    }

    async fn accounting_state(&self, id: &ExternalJobId) -> Result<RemoteState, PollError> {
        let output = Self::run_tool(
            &self.sacct,
            &["-n", "-X", "-P", "-j", id.as_str(), "-o", "State"],
        )
        .await
        .map_err(|e| PollError::Query(format!("{}: {}", self.sacct, e)))?;

        if !output.status.success() {
            return Err(PollError::Query(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(map_slurm_state)
            .unwrap_or(RemoteState::Unknown))
    }
}

#[async_trait]
impl BatchScheduler for SlurmCli {
    async fn submit(
        &self,
        commands: &[String],
        config: &SlurmConfig,
    ) -> Result<ExternalJobId, LaunchError> {
        config.validate()?;
        let script = config.batch_script(commands);

        let spawn_error = |e: std::io::Error| LaunchError::Spawn {
            command: self.sbatch.clone(),
            message: e.to_string(),
        };

        let mut child = Command::new(&self.sbatch)
            .arg("--parsable")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LaunchError::Rejected(stderr.trim().to_string()));
        }

        let id = parse_submission_output(&stdout)
            .ok_or_else(|| LaunchError::UnparsableResponse(stdout.trim().to_string()))?;
        info!("sbatch accepted job {}", id);
        Ok(id)
    }

    async fn query(&self, id: &ExternalJobId) -> Result<RemoteState, PollError> {
        let output = Self::run_tool(&self.squeue, &["-h", "-j", id.as_str(), "-o", "%T"])
            .await
            .map_err(|e| PollError::Query(format!("{}: {}", self.squeue, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            if let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Ok(map_slurm_state(line));
            }
        } else if !stderr.contains("Invalid job id") {
            return Err(PollError::Query(stderr.trim().to_string()));
        }

        // No longer in the queue
        if self.accounting {
            self.accounting_state(id).await
        } else {
            Ok(RemoteState::CompletedSuccess)
        }
    }

    async fn cancel(&self, id: &ExternalJobId) -> Result<(), CancelError> {
        let output = Self::run_tool(&self.scancel, &[id.as_str()])
            .await
            .map_err(|e| CancelError::new(id.as_str(), e.to_string()))?;
        if !output.status.success() {
            return Err(CancelError::new(
                id.as_str(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "slurm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_use_kebab_case_keys() {
        let cfg = SlurmConfig {
            ntasks_per_node: Some(1),
            cpus_per_task: Some(4),
            ..Default::default()
        };
        assert_eq!(
            cfg.options(),
            vec![
                ("ntasks-per-node".to_string(), "1".to_string()),
                ("cpus-per-task".to_string(), "4".to_string()),
            ]
        );
    }

    #[test]
    fn test_srun_command() {
        let cfg = SlurmConfig {
            ntasks_per_node: Some(1),
            cpus_per_task: Some(4),
            ..Default::default()
        };
        let cmd = cfg.srun_command(&["echo hello".to_string(), "sleep 5".to_string()]);
        assert_eq!(
            cmd,
            "srun --ntasks-per-node=1 --cpus-per-task=4 bash -c 'echo hello; sleep 5'"
        );
    }

    #[test]
    fn test_batch_script() {
        let cfg = SlurmConfig::default()
            .with_job_name("train")
            .with_option("account", "lab");
        let script = cfg.batch_script(&["echo hello".to_string(), "sleep 5".to_string()]);
        assert_eq!(
            script,
            "#!/bin/bash\n#SBATCH --job-name=train\n#SBATCH --account=lab\n\necho hello\nsleep 5\n"
        );
    }

    #[test]
    fn test_standard_request() {
        let options = SlurmConfig::standard().options();
        assert!(options.contains(&("job-name".to_string(), "default".to_string())));
        assert!(options.contains(&("mem".to_string(), "16g".to_string())));
        assert!(options.contains(&("time".to_string(), "1-00:00:00".to_string())));
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let base = SlurmConfig::standard().with_option("account", "lab");
        let over = SlurmConfig {
            mem: Some("64g".to_string()),
            ..SlurmConfig::default().with_job_name("eval")
        };
        let merged = base.merge(&over);
        assert_eq!(merged.job_name.as_deref(), Some("eval"));
        assert_eq!(merged.mem.as_deref(), Some("64g"));
        assert_eq!(merged.nodes, Some(1));
        assert_eq!(merged.extra.get("account"), Some(&serde_json::json!("lab")));
    }

    #[test]
    fn test_deserialize_with_extra_options() {
        let cfg: SlurmConfig = serde_json::from_str(
            r#"{"job_name": "gpu", "gres": "gpu:1", "mail_type": "END", "array": 4}"#,
        )
        .unwrap();
        assert_eq!(cfg.job_name.as_deref(), Some("gpu"));
        assert_eq!(cfg.nodes, None);
        let options = cfg.options();
        assert!(options.contains(&("mail-type".to_string(), "END".to_string())));
        assert!(options.contains(&("array".to_string(), "4".to_string())));
    }

    #[test]
    fn test_validate_rejects_newlines() {
        let cfg = SlurmConfig::default().with_job_name("a\n#SBATCH --nodes=100");
        assert!(matches!(cfg.validate(), Err(LaunchError::InvalidConfig(_))));
        assert!(SlurmConfig::standard().validate().is_ok());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("16g"), "16g");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_parse_submission_output() {
        assert_eq!(
            parse_submission_output("Submitted batch job 6449881\n"),
            Some(ExternalJobId::new("6449881"))
        );
        assert_eq!(
            parse_submission_output("6449881;cluster\n"),
            Some(ExternalJobId::new("6449881"))
        );
        assert_eq!(parse_submission_output("\n"), None);
        assert_eq!(parse_submission_output("sbatch: error: oops"), None);
    }

    #[test]
    fn test_map_slurm_state() {
        assert_eq!(map_slurm_state("PENDING"), RemoteState::Queued);
        assert_eq!(map_slurm_state("RUNNING"), RemoteState::Running);
        assert_eq!(map_slurm_state("COMPLETED"), RemoteState::CompletedSuccess);
        assert_eq!(
            map_slurm_state("CANCELLED by 1000"),
            RemoteState::CompletedFailure("CANCELLED".to_string())
        );
        assert_eq!(
            map_slurm_state("out_of_memory"),
            RemoteState::CompletedFailure("OUT_OF_MEMORY".to_string())
        );
        assert_eq!(map_slurm_state(""), RemoteState::Unknown);
    }

    #[tokio::test]
    async fn test_missing_sbatch_is_a_launch_error() {
        let cli = SlurmCli::new().with_tools(
            "/nonexistent/sbatch",
            "/nonexistent/squeue",
            "/nonexistent/sacct",
            "/nonexistent/scancel",
        );
        let err = cli
            .submit(&["true".to_string()], &SlurmConfig::standard())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));

        let err = cli.query(&ExternalJobId::new("1")).await.unwrap_err();
        assert!(matches!(err, PollError::Query(_)));
    }
}
