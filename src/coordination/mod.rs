//! Transactional save-with-state-change orchestration.
//!
//! Every state mutation in the system funnels through this module: lock the
//! persisted row inside an IMMEDIATE transaction, re-derive its live state, run
//! the transition policy, and only then persist. Races between the heartbeat
//! processes surface here as `RejectReason`s instead of corrupting rows.

use crate::config::Config;
use crate::error::{RejectReason, Result};
use crate::store::{TaskStore, repository};
use crate::task::change::StateChange;
use crate::task::{Task, TaskDependency, TaskState};
use log::{debug, error, info, warn};
use rusqlite::Connection;

/// Wraps the store with the slot budget and error-tries bookkeeping shared by
/// the three heartbeats and the worker entry point.
pub struct Coordinator {
    store: TaskStore,
    max_execution_slots: u64,
    max_error_tries: u32,
}

impl Coordinator {
    pub fn new(store: TaskStore, config: &Config) -> Self {
        Coordinator {
            store,
            max_execution_slots: config.max_execution_slots,
            max_error_tries: config.max_error_tries,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TaskStore {
        &mut self.store
    }

    pub fn max_execution_slots(&self) -> u64 {
        self.max_execution_slots
    }

    /// Execution slots still open at `now`: the configured maximum minus rows
    /// currently live-RUNNING, floored at zero.
    pub fn available_slots(&self, now: i64) -> Result<u64> {
        let running = repository::count_running(self.store.conn(), now)?;
        Ok(self.max_execution_slots.saturating_sub(running))
    }

    /// Apply one state change to the persisted row matching `task`'s unique
    /// key, atomically. On any rejection the transaction rolls back and the
    /// reason is returned; the already-picked-up sentinel passes through so
    /// callers can distinguish it from true failure.
    pub fn save_state_change(
        &mut self,
        task: &Task,
        change: StateChange,
        now: i64,
    ) -> std::result::Result<Task, RejectReason> {
        let tx = self.store.transaction().map_err(fatal)?;
        let existing = repository::find_unique(&tx, task).map_err(fatal)?;
        let mut updated = match validate_and_change(&tx, existing, task, change, now) {
            Ok(updated) => updated,
            Err(reason) => {
                match &reason {
                    RejectReason::AlreadyPickedUp => {
                        debug!("task {:?} already picked up during {}", task.id, change.name())
                    }
                    reason if reason.is_expected_race() => {
                        info!("task {:?} skipped during {}: {}", task.id, change.name(), reason)
                    }
                    reason => {
                        warn!("task {:?} rejected during {}: {}", task.id, change.name(), reason)
                    }
                }
                return Err(reason);
            }
        };
        repository::save(&tx, &mut updated).map_err(fatal)?;
        tx.commit().map_err(fatal)?;
        Ok(updated)
    }

    /// Increment the row's error tries and persist; once the configured
    /// maximum is reached the state is forced to ERROR, bypassing the normal
    /// transition check. Runs on the caller's connection without its own
    /// transaction.
    pub fn save_and_increase_error_tries(&mut self, task: &mut Task, now: i64) -> Result<()> {
        task.increase_error_tries();
        if task.error_tries >= self.max_error_tries {
            error!(
                "task {:?} ({}) reached {} error tries, forcing error state",
                task.id, task.class, task.error_tries
            );
            task.force_state_error(now);
        }
        repository::save(self.store.conn(), task)?;
        Ok(())
    }

    /// Reconcile the persisted dependency table against the configured set:
    /// insert pairs that are new, delete pairs no longer configured, leave
    /// matches untouched.
    pub fn update_dependencies(&mut self, configured: &[TaskDependency]) -> Result<()> {
        let mut wanted: Vec<&TaskDependency> = Vec::new();
        for dependency in configured {
            if !wanted.iter().any(|w| w.unique_pair() == dependency.unique_pair()) {
                wanted.push(dependency);
            }
        }

        let tx = self.store.transaction()?;
        let existing = repository::list_dependencies(&tx)?;
        for current in &existing {
            if !wanted.iter().any(|w| w.unique_pair() == current.unique_pair()) {
                if let Some(id) = current.id {
                    repository::delete_dependency(&tx, id)?;
                }
            }
        }
        for dependency in &wanted {
            if !existing.iter().any(|e| e.unique_pair() == dependency.unique_pair()) {
                repository::insert_dependency(&tx, dependency)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The terminal state a finished worker should report: NOT_COMPLETED when
    /// any dependee is unfinished or completed inside this task's run window,
    /// COMPLETED otherwise.
    pub fn state_after_execution(&self, task: &Task) -> Result<TaskState> {
        if repository::has_unfinished_or_overlapping_dependee(self.store.conn(), task)? {
            Ok(TaskState::NotCompleted)
        } else {
            Ok(TaskState::Completed)
        }
    }
}

/// The fixed lock-acquisition order for batch saves. Every concurrent batch
/// saver sorting the same way cannot deadlock on row order.
pub fn sort_for_locking(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        (&a.class, &a.entity_uid, &a.range).cmp(&(&b.class, &b.entity_uid, &b.range))
    });
}

/// The per-row policy protocol: require the row to exist, gate on dirtiness,
/// apply the transition against the freshly re-derived state, gate on no-op.
/// Returns the mutated row ready to persist.
pub fn validate_and_change(
    conn: &Connection,
    existing: Option<Task>,
    incoming: &Task,
    change: StateChange,
    now: i64,
) -> std::result::Result<Task, RejectReason> {
    let mut existing = existing.ok_or(RejectReason::Missing)?;

    let is_dirty = existing.is_dirty(incoming);
    if !change.dirty_should_continue(is_dirty) {
        return Err(RejectReason::DirtyNotAllowed);
    }

    // Only the running->new resolution needs to know about dependents.
    let has_dependency = if change == StateChange::RunningToNew {
        repository::has_dependency(conn, &existing.class).map_err(fatal)?
    } else {
        false
    };

    let changed = change.apply(&mut existing, now, has_dependency)?;
    if !change.state_not_changed_should_continue(changed) {
        return Err(RejectReason::StateNotChanged);
    }
    Ok(existing)
}

/// Batch variant of the save protocol, run on the caller's transaction. Rows
/// are processed in the fixed locking order; a rejection on one row skips that
/// row and never aborts its siblings. Returns the rows actually transitioned.
pub fn save_state_change_multiple(
    conn: &Connection,
    tasks: &[Task],
    change: StateChange,
    now: i64,
) -> Vec<Task> {
    let mut sorted: Vec<Task> = tasks.to_vec();
    sort_for_locking(&mut sorted);

    let mut saved = Vec::with_capacity(sorted.len());
    for task in &sorted {
        let existing = match task.id {
            Some(id) => match repository::find_by_id(conn, id) {
                Ok(existing) => existing,
                Err(e) => {
                    error!("failed to fetch task {id} during {}: {e}", change.name());
                    continue;
                }
            },
            None => None,
        };
        match validate_and_change(conn, existing, task, change, now) {
            Ok(mut updated) => match repository::save(conn, &mut updated) {
                Ok(()) => saved.push(updated),
                Err(e) => error!("failed to save task {:?} during {}: {e}", task.id, change.name()),
            },
            Err(reason) if reason.is_expected_race() => {
                info!("task {:?} skipped during {}: {}", task.id, change.name(), reason);
            }
            Err(reason) => {
                warn!("task {:?} rejected during {}: {}", task.id, change.name(), reason);
            }
        }
    }
    saved
}

fn fatal(e: rusqlite::Error) -> RejectReason {
    RejectReason::Fatal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskStore;

    fn coordinator() -> Coordinator {
        let store = TaskStore::open_in_memory().unwrap();
        let config = Config {
            max_execution_slots: 10,
            max_error_tries: 3,
            ..Config::default()
        };
        Coordinator::new(store, &config)
    }

    fn seeded(coordinator: &Coordinator, class: &str, range: &str) -> Task {
        let mut task = Task::new_queued(class, None, range, 60, 10, 1000);
        repository::save(coordinator.store().conn(), &mut task).unwrap();
        task
    }

    #[test]
    fn test_save_state_change_commits() {
        let mut coordinator = coordinator();
        let task = seeded(&coordinator, "Sync", "");

        let updated = coordinator
            .save_state_change(&task, StateChange::NewToRunning, 1005)
            .unwrap();
        assert_eq!(updated.state, TaskState::Running);

        let persisted = repository::find_by_id(coordinator.store().conn(), task.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(persisted.state, TaskState::Running);
        assert_eq!(persisted.date_start, Some(1005));
    }

    #[test]
    fn test_save_state_change_missing_row() {
        let mut coordinator = coordinator();
        let task = Task::new_queued("Ghost", None, "", 60, 10, 1000);
        let err = coordinator
            .save_state_change(&task, StateChange::NewToRunning, 1005)
            .unwrap_err();
        assert_eq!(err, RejectReason::Missing);
    }

    #[test]
    fn test_dirty_row_rejected_and_rolled_back() {
        let mut coordinator = coordinator();
        let task = seeded(&coordinator, "Sync", "");

        let mut drifted = task.clone();
        drifted.timeout = 90;
        let err = coordinator
            .save_state_change(&drifted, StateChange::NewToRunning, 1005)
            .unwrap_err();
        assert_eq!(err, RejectReason::DirtyNotAllowed);

        let persisted = repository::find_by_id(coordinator.store().conn(), task.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(persisted.state, TaskState::New);
    }

    #[test]
    fn test_stale_transition_is_state_not_changed() {
        let mut coordinator = coordinator();
        let task = seeded(&coordinator, "Sync", "");
        coordinator
            .save_state_change(&task, StateChange::NewToRunning, 1005)
            .unwrap();

        // A second queuer still holding the NEW copy loses the race.
        let running = repository::find_by_id(coordinator.store().conn(), task.id.unwrap())
            .unwrap()
            .unwrap();
        let err = coordinator
            .save_state_change(&running, StateChange::NewToRunning, 1010)
            .unwrap_err();
        assert_eq!(err, RejectReason::StateNotChanged);
    }

    #[test]
    fn test_running_to_new_sentinel_without_dependency() {
        let mut coordinator = coordinator();
        let task = seeded(&coordinator, "Sync", "");
        let running = coordinator
            .save_state_change(&task, StateChange::NewToRunning, 1005)
            .unwrap();

        let err = coordinator
            .save_state_change(&running, StateChange::RunningToNew, 1010)
            .unwrap_err();
        assert_eq!(err, RejectReason::AlreadyPickedUp);
    }

    #[test]
    fn test_running_to_new_with_dependency_is_skip() {
        let mut coordinator = coordinator();
        repository::insert_dependency(
            coordinator.store().conn(),
            &TaskDependency::new("Report", "Sync"),
        )
        .unwrap();
        let task = seeded(&coordinator, "Report", "");
        let running = coordinator
            .save_state_change(&task, StateChange::NewToRunning, 1005)
            .unwrap();

        let err = coordinator
            .save_state_change(&running, StateChange::RunningToNew, 1010)
            .unwrap_err();
        assert_eq!(err, RejectReason::StateNotChanged);
        assert!(err.is_expected_race());
    }

    #[test]
    fn test_save_multiple_skips_collided_rows() {
        let mut coordinator = coordinator();
        let a = seeded(&coordinator, "Sync", "a");
        let b = seeded(&coordinator, "Sync", "b");

        // b got picked up by another execute heartbeat in the meantime.
        coordinator
            .save_state_change(&b, StateChange::NewToRunning, 1004)
            .unwrap();

        let started = {
            let tx = coordinator.store_mut().transaction().unwrap();
            let started =
                save_state_change_multiple(&tx, &[a.clone(), b.clone()], StateChange::NewToRunning, 1005);
            tx.commit().unwrap();
            started
        };
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, a.id);
    }

    #[test]
    fn test_sort_for_locking_order() {
        let mut tasks = vec![
            Task::new_queued("B", None, "", 60, 10, 1000),
            Task::new_queued("A", Some("t.c".to_string()), "z", 60, 10, 1000),
            Task::new_queued("A", Some("t.c".to_string()), "a", 60, 10, 1000),
            Task::new_queued("A", None, "", 60, 10, 1000),
        ];
        sort_for_locking(&mut tasks);
        let keys: Vec<_> = tasks
            .iter()
            .map(|t| (t.class.clone(), t.entity_uid.clone(), t.range.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("A".to_string(), None, "".to_string()),
                ("A".to_string(), Some("t.c".to_string()), "a".to_string()),
                ("A".to_string(), Some("t.c".to_string()), "z".to_string()),
                ("B".to_string(), None, "".to_string()),
            ]
        );
    }

    #[test]
    fn test_error_tries_escalate_to_error_state() {
        let mut coordinator = coordinator();
        let mut task = seeded(&coordinator, "Sync", "");

        coordinator.save_and_increase_error_tries(&mut task, 2000).unwrap();
        coordinator.save_and_increase_error_tries(&mut task, 2001).unwrap();
        assert_eq!(task.error_tries, 2);
        assert_eq!(task.state, TaskState::New);

        coordinator.save_and_increase_error_tries(&mut task, 2002).unwrap();
        assert_eq!(task.error_tries, 3);
        assert_eq!(task.state, TaskState::Error);

        let persisted = repository::find_by_id(coordinator.store().conn(), task.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(persisted.state, TaskState::Error);
        assert_eq!(persisted.error_tries, 3);
    }

    #[test]
    fn test_update_dependencies_diffs_by_pair() {
        let mut coordinator = coordinator();
        repository::insert_dependency(
            coordinator.store().conn(),
            &TaskDependency::new("Report", "Sync"),
        )
        .unwrap();
        repository::insert_dependency(
            coordinator.store().conn(),
            &TaskDependency::new("Report", "Obsolete"),
        )
        .unwrap();

        let configured = vec![
            TaskDependency::new("Report", "Sync"),
            TaskDependency::new("Export", "Report"),
            // Duplicate pairs in the configuration collapse to one row.
            TaskDependency::new("Export", "Report"),
        ];
        coordinator.update_dependencies(&configured).unwrap();

        let mut pairs: Vec<_> = repository::list_dependencies(coordinator.store().conn())
            .unwrap()
            .into_iter()
            .map(|d| (d.class, d.depend_on))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("Export".to_string(), "Report".to_string()),
                ("Report".to_string(), "Sync".to_string()),
            ]
        );
    }

    #[test]
    fn test_state_after_execution_depends_on_dependees() {
        let mut coordinator = coordinator();
        repository::insert_dependency(
            coordinator.store().conn(),
            &TaskDependency::new("Report", "Sync"),
        )
        .unwrap();

        let report = seeded(&coordinator, "Report", "");
        let report = coordinator
            .save_state_change(&report, StateChange::NewToRunning, 1005)
            .unwrap();

        // No dependee rows exist yet: completed.
        assert_eq!(
            coordinator.state_after_execution(&report).unwrap(),
            TaskState::Completed
        );

        // An unfinished dependee forces not-completed.
        seeded(&coordinator, "Sync", "");
        assert_eq!(
            coordinator.state_after_execution(&report).unwrap(),
            TaskState::NotCompleted
        );
    }

    #[test]
    fn test_available_slots_floors_at_zero() {
        let store = TaskStore::open_in_memory().unwrap();
        let config = Config {
            max_execution_slots: 1,
            max_error_tries: 3,
            ..Config::default()
        };
        let mut coordinator = Coordinator::new(store, &config);

        let a = seeded(&coordinator, "Sync", "a");
        let b = seeded(&coordinator, "Sync", "b");
        coordinator.save_state_change(&a, StateChange::NewToRunning, 1000).unwrap();
        assert_eq!(coordinator.available_slots(1001).unwrap(), 0);

        // Force a second running row past the budget.
        let mut b = repository::find_by_id(coordinator.store().conn(), b.id.unwrap())
            .unwrap()
            .unwrap();
        b.state_new_to_running(1000).unwrap();
        repository::save(coordinator.store().conn(), &mut b).unwrap();
        assert_eq!(coordinator.available_slots(1001).unwrap(), 0);
    }
}
