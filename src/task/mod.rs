//! Task entity and its finite-state machine.
//!
//! A task row moves through NEW -> RUNNING -> {COMPLETED, NOT_COMPLETED, ERROR}
//! and back to NEW when rescheduled. DEAD is virtual: it is never written to
//! storage, only derived at read time from `date_start`, the task's time budget
//! and a fixed grace constant. Every transition method re-derives the live state
//! fresh before mutating, so stale callers fail loudly instead of corrupting rows.

pub mod change;

use crate::error::StateError;
use chrono::Utc;
use std::fmt;

/// Seconds past `date_start + timeout + cooldown` before a RUNNING row without
/// a `date_end` is classified DEAD.
pub const DEAD_GRACE_SECS: i64 = 2;

/// Extra seconds the reschedule heartbeat waits on top of the DEAD/NOT_COMPLETED
/// classification, so independently-ticking heartbeats do not race on a row
/// right at the boundary.
pub const RESCHEDULE_COOLDOWN_SECS: i64 = 2;

/// Current wall-clock time as unix seconds. All state derivation takes `now`
/// as a parameter; this is the single place production code obtains it.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Task lifecycle states. `Dead` is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    New,
    Running,
    Error,
    Completed,
    NotCompleted,
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Running => "running",
            TaskState::Error => "error",
            TaskState::Completed => "completed",
            TaskState::NotCompleted => "not_completed",
            TaskState::Dead => "dead",
        }
    }

    /// Parse a stored state string. `dead` is rejected because it must never
    /// appear in storage.
    pub fn from_stored(s: &str) -> Option<TaskState> {
        match s {
            "new" => Some(TaskState::New),
            "running" => Some(TaskState::Running),
            "error" => Some(TaskState::Error),
            "completed" => Some(TaskState::Completed),
            "not_completed" => Some(TaskState::NotCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task instance: a class (which implementation runs), a subject
/// (`entity_uid`, e.g. "table.column") and a partition token (`range`).
/// (class, entity_uid, range) is the unique identity of a row.
///
/// Timestamps are unix seconds; `date_start`/`date_end` are null until the
/// corresponding transition sets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: Option<i64>,
    pub class: String,
    pub entity_uid: Option<String>,
    pub timeout: i64,
    pub cooldown: i64,
    pub range: String,
    pub date_start: Option<i64>,
    pub date_end: Option<i64>,
    pub state: TaskState,
    pub error_tries: u32,
    pub date_created: i64,
}

impl Task {
    /// A fresh NEW row, as the queue heartbeat builds them.
    pub fn new_queued(
        class: impl Into<String>,
        entity_uid: Option<String>,
        range: impl Into<String>,
        timeout: i64,
        cooldown: i64,
        now: i64,
    ) -> Self {
        Task {
            id: None,
            class: class.into(),
            entity_uid,
            range: range.into(),
            timeout,
            cooldown,
            date_start: None,
            date_end: None,
            state: TaskState::New,
            error_tries: 0,
            date_created: now,
        }
    }

    /// Wall-clock budget after which a RUNNING row is considered overdue.
    fn dead_after(&self) -> i64 {
        self.timeout + self.cooldown + DEAD_GRACE_SECS
    }

    /// Derive the live state at `now`. A stored RUNNING row is split into
    /// RUNNING (live) and DEAD depending on whether its window has elapsed.
    pub fn derived_state(&self, now: i64) -> Result<TaskState, StateError> {
        match self.state {
            TaskState::New => Ok(TaskState::New),
            TaskState::Error => Ok(TaskState::Error),
            TaskState::Completed => Ok(TaskState::Completed),
            TaskState::NotCompleted => Ok(TaskState::NotCompleted),
            TaskState::Dead => Err(StateError::Indeterminate),
            TaskState::Running => {
                let date_start = self.date_start.ok_or(StateError::Indeterminate)?;
                if self.date_end.is_some() {
                    return Err(StateError::Indeterminate);
                }
                if now < date_start + self.dead_after() {
                    Ok(TaskState::Running)
                } else {
                    Ok(TaskState::Dead)
                }
            }
        }
    }

    pub fn is_dead(&self, now: i64) -> bool {
        self.derived_state(now) == Ok(TaskState::Dead)
    }

    /// DEAD plus the extra reschedule cooldown has elapsed.
    pub fn is_dead_after_reschedule_cooldown(&self, now: i64) -> bool {
        match (self.state, self.date_start, self.date_end) {
            (TaskState::Running, Some(date_start), None) => {
                now >= date_start + self.dead_after() + RESCHEDULE_COOLDOWN_SECS
            }
            _ => false,
        }
    }

    /// NOT_COMPLETED and the reschedule cooldown past `date_end` has elapsed.
    pub fn is_not_completed_after_reschedule_cooldown(&self, now: i64) -> bool {
        if self.state != TaskState::NotCompleted {
            return false;
        }
        match self.date_end {
            Some(date_end) => now >= date_end + RESCHEDULE_COOLDOWN_SECS,
            None => true,
        }
    }

    /// Compare the "free fields" against another row with the same identity.
    /// State and date_created are deliberately excluded: two duplicate rows
    /// drift on these without being considered dirty.
    pub fn is_dirty(&self, other: &Task) -> bool {
        self.timeout != other.timeout
            || self.cooldown != other.cooldown
            || self.date_start != other.date_start
            || self.date_end != other.date_end
            || self.error_tries != other.error_tries
    }

    /// Take the free fields (plus date_created) from a freshly-built duplicate,
    /// keeping this row's identity and state.
    pub fn copy_free_fields_from(&mut self, other: &Task) {
        self.timeout = other.timeout;
        self.cooldown = other.cooldown;
        self.date_start = other.date_start;
        self.date_end = other.date_end;
        self.error_tries = other.error_tries;
        self.date_created = other.date_created;
    }

    pub fn increase_error_tries(&mut self) {
        self.error_tries += 1;
    }

    /// Terminal escape hatch for rows that keep failing: forces ERROR without
    /// the usual precondition check.
    pub fn force_state_error(&mut self, now: i64) {
        if self.date_end.is_none() {
            self.date_end = Some(now);
        }
        self.state = TaskState::Error;
    }

    fn expect_state(&self, expected: TaskState, now: i64) -> Result<(), StateError> {
        let actual = self.derived_state(now)?;
        if actual != expected {
            return Err(StateError::WrongState { expected, actual });
        }
        Ok(())
    }

    pub fn state_new_to_running(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::New, now)?;
        self.date_start = Some(now);
        self.state = TaskState::Running;
        Ok(())
    }

    pub fn state_running_to_completed(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::Running, now)?;
        self.date_end = Some(now);
        self.state = TaskState::Completed;
        Ok(())
    }

    pub fn state_running_to_not_completed(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::Running, now)?;
        self.date_end = Some(now);
        self.state = TaskState::NotCompleted;
        Ok(())
    }

    pub fn state_running_to_error(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::Running, now)?;
        self.date_end = Some(now);
        self.state = TaskState::Error;
        Ok(())
    }

    pub fn state_error_to_new(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::Error, now)?;
        self.reset_to_new(now);
        self.error_tries = 0;
        Ok(())
    }

    pub fn state_dead_to_new(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::Dead, now)?;
        // error_tries deliberately kept: a repeatedly-dying task must still
        // count toward the max-error-tries escape hatch.
        self.reset_to_new(now);
        Ok(())
    }

    pub fn state_completed_to_new(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::Completed, now)?;
        self.reset_to_new(now);
        self.error_tries = 0;
        Ok(())
    }

    pub fn state_not_completed_to_new(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::NotCompleted, now)?;
        self.reset_to_new(now);
        Ok(())
    }

    /// Idempotent requeue of an already-NEW row; only refreshes date_created.
    pub fn state_new_to_new(&mut self, now: i64) -> Result<(), StateError> {
        self.expect_state(TaskState::New, now)?;
        self.date_created = now;
        Ok(())
    }

    fn reset_to_new(&mut self, now: i64) {
        self.date_start = None;
        self.date_end = None;
        self.state = TaskState::New;
        self.date_created = now;
    }
}

/// Declares that task class `class` must wait for `depend_on` to finish.
/// The (class, depend_on) pair is the row's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDependency {
    pub id: Option<i64>,
    pub class: String,
    pub depend_on: String,
}

impl TaskDependency {
    pub fn new(class: impl Into<String>, depend_on: impl Into<String>) -> Self {
        TaskDependency {
            id: None,
            class: class.into(),
            depend_on: depend_on.into(),
        }
    }

    pub fn unique_pair(&self) -> (&str, &str) {
        (&self.class, &self.depend_on)
    }
}
