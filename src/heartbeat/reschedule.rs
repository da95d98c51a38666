//! Reschedule heartbeat: recycles DEAD and NOT_COMPLETED rows back to NEW.
//!
//! Each tick scans unlocked for candidates, re-verifies the stricter
//! after-cooldown predicate in-process, and reschedules each row through the
//! transactional single-row save. A row that refuses its reschedule gets an
//! error try instead; nothing a single row does aborts the scan.

use crate::config::Config;
use crate::coordination::Coordinator;
use crate::heartbeat::{HeartbeatConfig, run_heartbeat};
use crate::store::repository;
use crate::task::change::StateChange;
use crate::task::{Task, TaskState, now_ts};
use eyre::Result;
use log::{error, info, warn};

pub struct RescheduleLoop<'a> {
    coordinator: &'a mut Coordinator,
    heartbeat: HeartbeatConfig,
}

impl<'a> RescheduleLoop<'a> {
    pub fn new(coordinator: &'a mut Coordinator, config: &Config) -> Self {
        RescheduleLoop {
            coordinator,
            heartbeat: HeartbeatConfig::from_config(config),
        }
    }

    pub fn run(&mut self) -> bool {
        let heartbeat = self.heartbeat.clone();
        run_heartbeat("reschedule", &heartbeat, || self.tick())
    }

    pub fn tick(&mut self) -> Result<()> {
        let now = now_ts();
        let candidates =
            repository::find_dead_or_not_completed(self.coordinator.store().conn(), now, None)?;
        for task in candidates {
            // Re-verify with a fresh clock; the scan ran earlier and only
            // approximates the cooldown.
            let now = now_ts();
            if !task.is_dead_after_reschedule_cooldown(now)
                && !task.is_not_completed_after_reschedule_cooldown(now)
            {
                continue;
            }
            self.reschedule(task, now);
        }
        Ok(())
    }

    fn reschedule(&mut self, mut task: Task, now: i64) {
        let from = match task.derived_state(now) {
            Ok(state) => state,
            Err(e) => {
                error!("cannot derive state for task {:?}: {e}", task.id);
                return;
            }
        };
        let Some(change) = StateChange::for_transition(from, TaskState::New) else {
            error!("no reschedule transition from {} for task {:?}", from, task.id);
            return;
        };
        match self.coordinator.save_state_change(&task, change, now) {
            Ok(updated) => {
                info!(
                    "rescheduled task {:?} ({}) via {}",
                    updated.id,
                    updated.class,
                    change.name()
                );
            }
            Err(reason) => {
                warn!("failed to reschedule task {:?}: {}", task.id, reason);
                if let Err(e) = self.coordinator.save_and_increase_error_tries(&mut task, now) {
                    error!("failed to record reschedule failure for task {:?}: {e}", task.id);
                }
            }
        }
    }
}
