//! Execute heartbeat: hands NEW rows to worker processes.
//!
//! Each tick computes the open slot budget, lets the configured priority
//! strategy pick which NEW rows get them, flips those rows to RUNNING in one
//! transaction, and spawns a detached worker per row. Strategy failures fall
//! back to oldest-first for the tick; spawn failures cost the row an error try
//! instead of failing the tick.

use crate::config::Config;
use crate::coordination::{self, Coordinator};
use crate::heartbeat::{HeartbeatConfig, run_heartbeat};
use crate::priority::{ClassBacklog, PriorityStrategyKind, divide_slots};
use crate::spawner::{SpawnCommand, Spawner};
use crate::store::repository;
use crate::task::change::StateChange;
use crate::task::{Task, now_ts};
use eyre::Result;
use log::{error, warn};

pub struct ExecuteLoop<'a, S: Spawner> {
    coordinator: &'a mut Coordinator,
    spawner: &'a S,
    config: Config,
    heartbeat: HeartbeatConfig,
}

impl<'a, S: Spawner> ExecuteLoop<'a, S> {
    pub fn new(coordinator: &'a mut Coordinator, spawner: &'a S, config: &Config) -> Self {
        ExecuteLoop {
            coordinator,
            spawner,
            config: config.clone(),
            heartbeat: HeartbeatConfig::from_config(config),
        }
    }

    pub fn run(&mut self) -> bool {
        let heartbeat = self.heartbeat.clone();
        run_heartbeat("execute", &heartbeat, || self.tick())
    }

    pub fn tick(&mut self) -> Result<()> {
        let now = now_ts();
        let available = self.coordinator.available_slots(now)?;
        if available == 0 {
            return Ok(());
        }

        let started = self.start_next_tasks(available, now)?;
        ensure_within_slots(started.len() as u64, self.coordinator.max_execution_slots())?;

        for mut task in started {
            let command = SpawnCommand::for_task(&self.config, &task);
            if let Err(e) = self.spawner.spawn(&command) {
                warn!("spawn failed for task {:?} ({}): {e:#}", task.id, task.class);
                if let Err(e) = self.coordinator.save_and_increase_error_tries(&mut task, now_ts())
                {
                    error!("failed to record spawn failure for task {:?}: {e}", task.id);
                }
            }
        }
        Ok(())
    }

    /// Lock and transition the selected rows with the configured strategy,
    /// falling back to oldest-first when the strategy fails for this tick.
    fn start_next_tasks(&mut self, available: u64, now: i64) -> Result<Vec<Task>> {
        match self.lock_with_strategy(self.config.priority_strategy, available, now) {
            Ok(tasks) => Ok(tasks),
            Err(e) => {
                error!(
                    "priority strategy {} failed, falling back to {}: {e:#}",
                    self.config.priority_strategy.as_str(),
                    PriorityStrategyKind::SortByDateCreated.as_str()
                );
                self.lock_with_strategy(PriorityStrategyKind::SortByDateCreated, available, now)
            }
        }
    }

    fn lock_with_strategy(
        &mut self,
        strategy: PriorityStrategyKind,
        available: u64,
        now: i64,
    ) -> Result<Vec<Task>> {
        let tx = self.coordinator.store_mut().transaction()?;
        let locked = match strategy {
            PriorityStrategyKind::SortByDateCreated => repository::lock_next_new(&tx, available)?,
            PriorityStrategyKind::DivideTotalValueEqually => {
                if (self.config.tasks.len() as u64) > self.config.max_execution_slots {
                    eyre::bail!(
                        "{} configured task classes but only {} execution slots",
                        self.config.tasks.len(),
                        self.config.max_execution_slots
                    );
                }
                let classes = self.config.task_classes();
                let counts = repository::count_new_by_class(&tx, &classes)?;
                let entries: Vec<ClassBacklog> = self
                    .config
                    .tasks
                    .iter()
                    .map(|t| ClassBacklog {
                        class: t.class.clone(),
                        priority: t.priority,
                        db_count: counts
                            .iter()
                            .find(|(class, _)| class == &t.class)
                            .map(|(_, count)| *count)
                            .unwrap_or(0),
                    })
                    .collect();
                match divide_slots(available, &entries)? {
                    None => Vec::new(),
                    Some(allocations) => repository::fetch_new_by_allocation(&tx, &allocations)?,
                }
            }
        };

        let started =
            coordination::save_state_change_multiple(&tx, &locked, StateChange::NewToRunning, now);
        tx.commit()?;
        Ok(started)
    }
}

/// An allocation larger than the configured maximum indicates a strategy bug;
/// fail the tick instead of overcommitting workers.
fn ensure_within_slots(started: u64, max_execution_slots: u64) -> Result<()> {
    if started > max_execution_slots {
        eyre::bail!(
            "allocation bug: {started} tasks started but max-execution-slots is {max_execution_slots}"
        );
    }
    Ok(())
}
