//! Worker-side task execution.
//!
//! The spawned worker process lands here: look up the row it was handed,
//! verify it is still live-RUNNING, run the task handle, and report the
//! terminal state through the same save/lock protocol the heartbeats use.
//! Whether a completed attempt becomes COMPLETED or NOT_COMPLETED depends on
//! the task's dependees at reporting time.

use crate::coordination::Coordinator;
use crate::queuer::TaskHandle;
use crate::store::repository;
use crate::task::change::StateChange;
use crate::task::{TaskState, now_ts};
use eyre::Result;
use log::{error, warn};

/// Run one task to its terminal state. Returns true when the row ended
/// COMPLETED.
pub fn execute_task(coordinator: &mut Coordinator, handle: &dyn TaskHandle, id: i64) -> Result<bool> {
    let now = now_ts();
    let task = repository::find_by_id(coordinator.store().conn(), id)?
        .ok_or_else(|| eyre::eyre!("task {id} not found"))?;
    if task.class != handle.class() {
        eyre::bail!(
            "task {id} is class {}, worker was spawned for {}",
            task.class,
            handle.class()
        );
    }
    match task.derived_state(now)? {
        TaskState::Running => {}
        other => eyre::bail!("task {id} is {other}, expected running"),
    }

    match handle.execute() {
        Ok(true) => {
            let target = coordinator.state_after_execution(&task)?;
            let change = StateChange::for_transition(TaskState::Running, target)
                .ok_or_else(|| eyre::eyre!("no terminal transition to {target}"))?;
            let updated = coordinator.save_state_change(&task, change, now_ts())?;
            Ok(updated.state == TaskState::Completed)
        }
        Ok(false) => {
            coordinator.save_state_change(&task, StateChange::RunningToNotCompleted, now_ts())?;
            Ok(false)
        }
        Err(e) => {
            warn!("task {id} ({}) execution failed: {e:#}", task.class);
            match coordinator.save_state_change(&task, StateChange::RunningToError, now_ts()) {
                Ok(mut errored) => {
                    coordinator.save_and_increase_error_tries(&mut errored, now_ts())?;
                }
                Err(reason) => {
                    error!("failed to record error state for task {id}: {reason}");
                }
            }
            Ok(false)
        }
    }
}
