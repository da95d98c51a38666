//! Transition policy layer.
//!
//! Each legal (and a few illegal-but-handled) state-pair maps to a `StateChange`
//! variant carrying the policy for that pair: whether free-field drift is
//! tolerated, whether a no-op outcome is acceptable, and how to mutate the row.
//! The coordination layer always runs all three checks before persisting.

use crate::error::RejectReason;
use crate::task::{Task, TaskState};

/// Policy for one (from, to) state pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    NewToRunning,
    RunningToCompleted,
    RunningToNotCompleted,
    RunningToError,
    ErrorToNew,
    DeadToNew,
    CompletedToNew,
    NotCompletedToNew,
    NewToNew,
    /// Queue heartbeat observed a RUNNING row where it wanted to requeue. Not a
    /// real transition; resolved by `apply` into either the already-picked-up
    /// sentinel or a silent skip, depending on whether the class has dependents.
    RunningToNew,
}

impl StateChange {
    /// Map a derived source state and a target state to a policy, or None when
    /// the pair is not handled at all.
    pub fn for_transition(from: TaskState, to: TaskState) -> Option<StateChange> {
        match (from, to) {
            (TaskState::New, TaskState::Running) => Some(StateChange::NewToRunning),
            (TaskState::Running, TaskState::Completed) => Some(StateChange::RunningToCompleted),
            (TaskState::Running, TaskState::NotCompleted) => {
                Some(StateChange::RunningToNotCompleted)
            }
            (TaskState::Running, TaskState::Error) => Some(StateChange::RunningToError),
            (TaskState::Error, TaskState::New) => Some(StateChange::ErrorToNew),
            (TaskState::Dead, TaskState::New) => Some(StateChange::DeadToNew),
            (TaskState::Completed, TaskState::New) => Some(StateChange::CompletedToNew),
            (TaskState::NotCompleted, TaskState::New) => Some(StateChange::NotCompletedToNew),
            (TaskState::New, TaskState::New) => Some(StateChange::NewToNew),
            (TaskState::Running, TaskState::New) => Some(StateChange::RunningToNew),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StateChange::NewToRunning => "new->running",
            StateChange::RunningToCompleted => "running->completed",
            StateChange::RunningToNotCompleted => "running->not_completed",
            StateChange::RunningToError => "running->error",
            StateChange::ErrorToNew => "error->new",
            StateChange::DeadToNew => "dead->new",
            StateChange::CompletedToNew => "completed->new",
            StateChange::NotCompletedToNew => "not_completed->new",
            StateChange::NewToNew => "new->new",
            StateChange::RunningToNew => "running->new",
        }
    }

    /// Whether the save may proceed when the persisted row's free fields drifted
    /// from the caller's copy. Rescheduling transitions tolerate drift;
    /// NEW->RUNNING and worker-reported terminal outcomes require a pristine row.
    pub fn dirty_should_continue(&self, is_dirty: bool) -> bool {
        match self {
            StateChange::NewToRunning
            | StateChange::RunningToCompleted
            | StateChange::RunningToNotCompleted
            | StateChange::RunningToError => !is_dirty,
            StateChange::ErrorToNew
            | StateChange::DeadToNew
            | StateChange::CompletedToNew
            | StateChange::NotCompletedToNew
            | StateChange::NewToNew
            | StateChange::RunningToNew => true,
        }
    }

    /// Whether the save may proceed given whether `apply` actually changed the
    /// row. No transition accepts a no-op.
    pub fn state_not_changed_should_continue(&self, changed: bool) -> bool {
        match self {
            StateChange::RunningToNew => false,
            _ => changed,
        }
    }

    /// Run the transition against the row.
    ///
    /// Returns Ok(true) on success, Ok(false) when the row's live state no
    /// longer matches the precondition (a routine race, resolved by the no-op
    /// policy check). `RunningToNew` never mutates: without a dependency it
    /// raises the already-picked-up sentinel, with one it is a silent skip.
    pub fn apply(
        &self,
        task: &mut Task,
        now: i64,
        has_dependency: bool,
    ) -> Result<bool, RejectReason> {
        let result = match self {
            StateChange::NewToRunning => task.state_new_to_running(now),
            StateChange::RunningToCompleted => task.state_running_to_completed(now),
            StateChange::RunningToNotCompleted => task.state_running_to_not_completed(now),
            StateChange::RunningToError => task.state_running_to_error(now),
            StateChange::ErrorToNew => task.state_error_to_new(now),
            StateChange::DeadToNew => task.state_dead_to_new(now),
            StateChange::CompletedToNew => task.state_completed_to_new(now),
            StateChange::NotCompletedToNew => task.state_not_completed_to_new(now),
            StateChange::NewToNew => task.state_new_to_new(now),
            StateChange::RunningToNew => {
                return if has_dependency {
                    Ok(false)
                } else {
                    Err(RejectReason::AlreadyPickedUp)
                };
            }
        };
        Ok(result.is_ok())
    }
}
