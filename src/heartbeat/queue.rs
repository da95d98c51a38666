//! Queue heartbeat: turns the queuer's pending main processes into NEW rows.
//!
//! Once per invocation it reconciles the dependency table; each tick it asks
//! the queuer for main processes, expands their task handles through the range
//! strategies, and upserts the resulting rows in one transaction per process.
//! A non-dependent RUNNING collision rolls the whole process batch back; a
//! dependent one just drops that row from the batch.

use crate::config::Config;
use crate::coordination::{self, Coordinator};
use crate::error::RejectReason;
use crate::heartbeat::{HeartbeatConfig, run_heartbeat};
use crate::queuer::{MainProcess, Queuer};
use crate::store::repository;
use crate::task::change::StateChange;
use crate::task::{Task, TaskDependency, TaskState, now_ts};
use eyre::Result;
use log::{debug, error, info};

pub struct QueueLoop<'a, Q: Queuer> {
    coordinator: &'a mut Coordinator,
    queuer: &'a mut Q,
    heartbeat: HeartbeatConfig,
    dependencies: Vec<TaskDependency>,
}

impl<'a, Q: Queuer> QueueLoop<'a, Q> {
    pub fn new(coordinator: &'a mut Coordinator, queuer: &'a mut Q, config: &Config) -> Self {
        QueueLoop {
            coordinator,
            queuer,
            heartbeat: HeartbeatConfig::from_config(config),
            dependencies: config.dependencies(),
        }
    }

    /// Run one heartbeat invocation. Returns false when dependency
    /// reconciliation or any tick failed.
    pub fn run(&mut self) -> bool {
        if let Err(e) = self.coordinator.update_dependencies(&self.dependencies) {
            error!("failed to reconcile task dependencies: {e}");
            return false;
        }
        let heartbeat = self.heartbeat.clone();
        run_heartbeat("queue", &heartbeat, || self.tick())
    }

    pub fn tick(&mut self) -> Result<()> {
        let processes = self.queuer.next_main_processes()?;
        for process in processes {
            self.queue_main_process(process.as_ref());
        }
        Ok(())
    }

    /// Queue one main process, reporting the outcome through the queuer
    /// callbacks. A failure here stays inside this process; other processes in
    /// the same tick are unaffected.
    fn queue_main_process(&mut self, process: &dyn MainProcess) {
        if !self.queuer.queueing_start(process) {
            debug!("main process {} declined queueing", process.name());
            return;
        }
        match self.build_and_save(process) {
            Ok(()) => self.queuer.queueing_stop(process),
            Err(e) => self.queuer.queueing_failed(process, &e),
        }
    }

    fn build_and_save(&mut self, process: &dyn MainProcess) -> Result<()> {
        let mut batch = Vec::new();
        for handle in process.tasks()? {
            batch.extend(handle.queue()?);
        }
        self.save_batch(batch)
    }

    /// Upsert a batch of candidate rows atomically. Rows are walked in the
    /// fixed locking order; an existing row is resolved through the
    /// (derived-state -> NEW) transition policy before taking the candidate's
    /// free fields.
    fn save_batch(&mut self, mut batch: Vec<Task>) -> Result<()> {
        let now = now_ts();
        coordination::sort_for_locking(&mut batch);

        let tx = self.coordinator.store_mut().transaction()?;
        let mut to_save = Vec::new();
        for task in batch {
            let existing = match repository::find_unique(&tx, &task)? {
                None => {
                    to_save.push(task);
                    continue;
                }
                Some(existing) => existing,
            };

            let from = existing.derived_state(now)?;
            let Some(change) = StateChange::for_transition(from, TaskState::New) else {
                error!(
                    "no requeue transition from {} for task {:?}",
                    from, existing.id
                );
                continue;
            };
            match coordination::validate_and_change(&tx, Some(existing), &task, change, now) {
                Ok(mut updated) => {
                    updated.copy_free_fields_from(&task);
                    to_save.push(updated);
                }
                // A foreign execute heartbeat owns the row; retry the whole
                // batch next tick, with nothing half-written.
                Err(reason @ RejectReason::AlreadyPickedUp) => {
                    return Err(eyre::Report::new(reason));
                }
                Err(reason) if reason.is_expected_race() => {
                    info!(
                        "dropping task {} {} from batch: {}",
                        task.class, task.range, reason
                    );
                }
                Err(reason) => {
                    error!(
                        "queueing rejected task {} {}: {}",
                        task.class, task.range, reason
                    );
                }
            }
        }

        for mut task in to_save {
            repository::save(&tx, &mut task)?;
        }
        tx.commit()?;
        Ok(())
    }
}
