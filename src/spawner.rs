//! Worker process spawning.
//!
//! The execute heartbeat never runs task work in-process: it hands each row to
//! an external worker and moves on. The command-line contract is fixed so any
//! application can act as the worker: the configured executable, the entry
//! point argument, the worker subcommand token, then the task's coordinates.

use crate::config::Config;
use crate::task::Task;
use eyre::{Context, Result};
use std::process::{Command, Stdio};

/// Subcommand token identifying a worker invocation.
pub const SPAWN_SUBCOMMAND: &str = "task-execute";

/// A fully-resolved worker command line. Arguments are passed as an argv, not
/// through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SpawnCommand {
    /// Build the worker invocation for one RUNNING task.
    pub fn for_task(config: &Config, task: &Task) -> Self {
        let mut args = Vec::new();
        if !config.entry_point.is_empty() {
            args.push(config.entry_point.clone());
        }
        args.push(SPAWN_SUBCOMMAND.to_string());
        args.push(format!("--id={}", task.id.unwrap_or_default()));
        args.push(format!("--class={}", task.class));
        args.push(format!("--range={}", task.range));
        args.push(format!("--timeout={}", task.timeout));
        args.push(format!("--cooldown={}", task.cooldown));
        SpawnCommand {
            program: config.executable.clone(),
            args,
        }
    }
}

/// Launches worker processes. The production implementation detaches; tests
/// substitute their own recorder.
pub trait Spawner {
    fn spawn(&self, command: &SpawnCommand) -> Result<()>;
}

/// Spawns the worker as a detached OS process. Stdout is discarded per the
/// worker contract; stderr stays attached for operator logs. The child is
/// never waited on, the store is how it reports back.
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, command: &SpawnCommand) -> Result<()> {
        Command::new(&command.program)
            .args(&command.args)
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn worker: {}", command.program))?;
        Ok(())
    }
}
