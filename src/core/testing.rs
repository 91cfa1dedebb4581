//! Scripted backends for exercising executors and the manager without a
//! cluster or real processes.
//!
//! `FakeSpawner` interprets the command string as a script:
//! - `ok:N` exits 0 after answering "still running" N times
//! - `fail:N` exits 1 after answering "still running" N times, leaving
//!   `<command>: failed` as its stderr
//! - `hang` runs until killed
//! - `stubborn` ignores kill requests
//! - `unspawnable` fails to spawn
//! - anything else exits 0 on the first check

#![cfg(test)]

use crate::backend::{BatchScheduler, ProcessExit, ProcessHandle, ProcessSpawner, RemoteState, SlurmConfig};
use crate::error::{CancelError, LaunchError, PollError};
use crate::types::ExternalJobId;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnEvent {
    Spawned(String),
    Exited(String),
}

#[derive(Default)]
struct SpawnerState {
    launched: Vec<String>,
    events: Vec<SpawnEvent>,
    live: usize,
    max_live: usize,
    wait_calls: usize,
}

#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<SpawnerState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<String> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn events(&self) -> Vec<SpawnEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Highest number of processes alive at the same time.
    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn wait_calls(&self) -> usize {
        self.state.lock().unwrap().wait_calls
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(
        &self,
        command: &str,
        _working_dir: Option<&Path>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        if command == "unspawnable" {
            return Err(LaunchError::Spawn {
                command: command.to_string(),
                message: "No such file or directory".to_string(),
            });
        }

        let (kind, polls) = command.split_once(':').unwrap_or((command, "0"));
        let polls = polls.parse().unwrap_or(0);
        let behavior = match kind {
            "ok" => Behavior::Exit { polls, code: 0 },
            "fail" => Behavior::Exit { polls, code: 1 },
            "hang" => Behavior::Hang,
            "stubborn" => Behavior::Stubborn,
            _ => Behavior::Exit { polls: 0, code: 0 },
        };

        let mut state = self.state.lock().unwrap();
        state.launched.push(command.to_string());
        state.events.push(SpawnEvent::Spawned(command.to_string()));
        state.live += 1;
        state.max_live = state.max_live.max(state.live);

        Ok(Box::new(FakeHandle {
            command: command.to_string(),
            behavior,
            killed: false,
            exit: None,
            state: self.state.clone(),
        }))
    }
}

enum Behavior {
    Exit { polls: u32, code: i32 },
    Hang,
    Stubborn,
}

struct FakeHandle {
    command: String,
    behavior: Behavior,
    killed: bool,
    exit: Option<ProcessExit>,
    state: Arc<Mutex<SpawnerState>>,
}

impl FakeHandle {
    fn exit_with(&mut self, code: Option<i32>) -> ProcessExit {
        let exit = ProcessExit { code };
        self.exit = Some(exit);
        let mut state = self.state.lock().unwrap();
        state.live -= 1;
        state.events.push(SpawnEvent::Exited(self.command.clone()));
        exit
    }
}

impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ProcessExit>> {
        self.state.lock().unwrap().wait_calls += 1;
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }

        if self.killed && !matches!(self.behavior, Behavior::Stubborn) {
            return Ok(Some(self.exit_with(None)));
        }

        let code = match &mut self.behavior {
            Behavior::Stubborn | Behavior::Hang => return Ok(None),
            Behavior::Exit { polls, .. } if *polls > 0 => {
                *polls -= 1;
                return Ok(None);
            }
            Behavior::Exit { code, .. } => *code,
        };
        Ok(Some(self.exit_with(Some(code))))
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.killed = true;
        Ok(())
    }

    fn stderr_tail(&self) -> Option<String> {
        match self.exit {
            Some(ProcessExit { code: Some(code) }) if code != 0 => {
                Some(format!("{}: failed", self.command))
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    next_id: u64,
    submissions: Vec<(Vec<String>, SlurmConfig)>,
    scripts: HashMap<String, VecDeque<Result<RemoteState, PollError>>>,
    cancelled: Vec<String>,
    reject: Option<String>,
}

/// Hands out ids `100`, `101`, ... and answers queries from per-id scripts.
///
/// Once a script is down to its last answer, that answer repeats. Ids without
/// a script report success.
#[derive(Clone, Default)]
pub struct FakeScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, id: &str, answers: Vec<Result<RemoteState, PollError>>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(id.to_string(), answers.into());
    }

    /// Make every submission fail with the given diagnostic.
    pub fn reject_with(&self, diagnostic: &str) {
        self.state.lock().unwrap().reject = Some(diagnostic.to_string());
    }

    pub fn submissions(&self) -> Vec<(Vec<String>, SlurmConfig)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl BatchScheduler for FakeScheduler {
    async fn submit(
        &self,
        commands: &[String],
        config: &SlurmConfig,
    ) -> Result<ExternalJobId, LaunchError> {
        let mut state = self.state.lock().unwrap();
        if let Some(diagnostic) = &state.reject {
            return Err(LaunchError::Rejected(diagnostic.clone()));
        }
        state.submissions.push((commands.to_vec(), config.clone()));
        let id = 100 + state.next_id;
        state.next_id += 1;
        Ok(ExternalJobId::new(id.to_string()))
    }

    async fn query(&self, id: &ExternalJobId) -> Result<RemoteState, PollError> {
        let mut state = self.state.lock().unwrap();
        let cancelled = state.cancelled.iter().any(|c| c == id.as_str());
        match state.scripts.get_mut(id.as_str()) {
            _ if cancelled => Ok(RemoteState::CompletedFailure("CANCELLED".to_string())),
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(Ok(RemoteState::Unknown)),
            Some(script) => script.front().cloned().unwrap_or(Ok(RemoteState::Unknown)),
            None => Ok(RemoteState::CompletedSuccess),
        }
    }

    async fn cancel(&self, id: &ExternalJobId) -> Result<(), CancelError> {
        self.state.lock().unwrap().cancelled.push(id.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}
