// Local process spawning through tokio

use super::{ProcessExit, ProcessHandle, ProcessSpawner};
use crate::error::LaunchError;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tracing::debug;

/// Lines of stderr kept per process.
const STDERR_TAIL_LINES: usize = 20;

/// How long an exited process may keep its stderr open before the exit is
/// reported anyway (a background child can hold the pipe indefinitely).
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Spawns each command as `<shell> -c <command>`.
///
/// Stdout is inherited; stderr is piped and its last lines are kept for the
/// job's outcome.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    shell: String,
}

impl ShellSpawner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl Default for ShellSpawner {
    fn default() -> Self {
        Self::new("bash")
    }
}

impl ProcessSpawner for ShellSpawner {
    fn spawn(
        &self,
        command: &str,
        working_dir: Option<&Path>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            command: command.to_string(),
            message: e.to_string(),
        })?;
        debug!("Spawned `{}` as pid {:?}", command, child.id());

        let stderr = Arc::new(Mutex::new(StderrTail::default()));
        match child.stderr.take() {
            Some(pipe) => {
                tokio::spawn(collect_stderr(pipe, stderr.clone()));
            }
            None => lock(&stderr).closed = true,
        }

        Ok(Box::new(ChildHandle {
            child,
            stderr,
            exited: None,
        }))
    }
}

#[derive(Default)]
struct StderrTail {
    lines: VecDeque<String>,
    closed: bool,
}

fn lock(tail: &Mutex<StderrTail>) -> std::sync::MutexGuard<'_, StderrTail> {
    tail.lock().unwrap_or_else(|e| e.into_inner())
}

async fn collect_stderr(pipe: ChildStderr, tail: Arc<Mutex<StderrTail>>) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut tail = lock(&tail);
        if tail.lines.len() == STDERR_TAIL_LINES {
            tail.lines.pop_front();
        }
        tail.lines.push_back(line);
    }
    lock(&tail).closed = true;
}

struct ChildHandle {
    child: Child,
    stderr: Arc<Mutex<StderrTail>>,
    /// Exit seen while stderr was still being drained.
    exited: Option<(ProcessExit, Instant)>,
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ProcessExit>> {
        let (exit, at) = match self.exited {
            Some(seen) => seen,
            None => match self.child.try_wait()? {
                Some(status) => {
                    let seen = (ProcessExit { code: status.code() }, Instant::now());
                    self.exited = Some(seen);
                    seen
                }
                None => return Ok(None),
            },
        };

        // Hold the exit back until the last stderr lines are in.
        if lock(&self.stderr).closed || at.elapsed() >= STDERR_DRAIN_GRACE {
            Ok(Some(exit))
        } else {
            Ok(None)
        }
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        if self.exited.is_some() {
            return Ok(());
        }
        self.child.start_kill()
    }

    fn stderr_tail(&self) -> Option<String> {
        let tail = lock(&self.stderr);
        if tail.lines.is_empty() {
            return None;
        }
        Some(Vec::from(tail.lines.clone()).join("\n"))
    }
}
