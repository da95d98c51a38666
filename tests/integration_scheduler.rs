//! Full scheduling cycle integration tests
//!
//! Drives the queue, execute and reschedule heartbeats against a real on-disk
//! database, with the worker step simulated in-process instead of spawned.

use prism::config::{Config, MainProcessConfig, MainProcessTask, TaskClassConfig};
use prism::coordination::Coordinator;
use prism::executor;
use prism::heartbeat::{ExecuteLoop, QueueLoop, RescheduleLoop};
use prism::queuer::{ConfigQueuer, TaskHandle};
use prism::spawner::{SpawnCommand, Spawner};
use prism::store::{TaskStore, repository};
use prism::task::{Task, TaskState, now_ts};
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

/// Records every worker command instead of launching it.
#[derive(Default)]
struct RecordingSpawner {
    commands: Mutex<Vec<SpawnCommand>>,
}

impl RecordingSpawner {
    fn spawned_ids(&self) -> Vec<i64> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|command| {
                command
                    .args
                    .iter()
                    .find_map(|arg| arg.strip_prefix("--id="))
                    .unwrap()
                    .parse()
                    .unwrap()
            })
            .collect()
    }
}

impl Spawner for RecordingSpawner {
    fn spawn(&self, command: &SpawnCommand) -> eyre::Result<()> {
        self.commands.lock().unwrap().push(command.clone());
        Ok(())
    }
}

/// Always-succeeding worker handle for a class.
struct DoneHandle {
    class: String,
}

impl TaskHandle for DoneHandle {
    fn class(&self) -> &str {
        &self.class
    }

    fn queue(&self) -> eyre::Result<Vec<Task>> {
        Ok(Vec::new())
    }

    fn execute(&self) -> eyre::Result<bool> {
        Ok(true)
    }
}

fn scan_config(database: PathBuf) -> Config {
    Config {
        database,
        executable: "prism".to_string(),
        max_execution_slots: 10,
        main_processes: vec![MainProcessConfig {
            name: "nightly".to_string(),
            tasks: vec![MainProcessTask {
                class: "Scan".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }],
        tasks: vec![TaskClassConfig {
            class: "Scan".to_string(),
            timeout: 600,
            cooldown: 60,
            resources: 3,
            entity_uid: Some("users.id".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn queue_once(coordinator: &mut Coordinator, config: &Config) {
    coordinator.update_dependencies(&config.dependencies()).unwrap();
    let mut queuer = ConfigQueuer::new(config.clone());
    let mut heartbeat = QueueLoop::new(coordinator, &mut queuer, config);
    heartbeat.tick().unwrap();
}

fn tasks_in_state(coordinator: &Coordinator, state: TaskState) -> Vec<Task> {
    let mut stmt = coordinator
        .store()
        .conn()
        .prepare("SELECT id FROM tasks WHERE state = ?1 ORDER BY id")
        .unwrap();
    let ids: Vec<i64> = stmt
        .query_map([state.as_str()], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    ids.into_iter()
        .map(|id| {
            repository::find_by_id(coordinator.store().conn(), id)
                .unwrap()
                .unwrap()
        })
        .collect()
}

/// Queue heartbeat expands a hash-ranged class into one row per range.
#[test]
fn test_queue_creates_one_row_per_range() {
    let temp_dir = TempDir::new().unwrap();
    let config = scan_config(temp_dir.path().join("prism.db"));
    let mut coordinator = Coordinator::new(TaskStore::open(&config.database).unwrap(), &config);

    queue_once(&mut coordinator, &config);

    let rows = tasks_in_state(&coordinator, TaskState::New);
    let ranges: Vec<&str> = rows.iter().map(|t| t.range.as_str()).collect();
    assert_eq!(ranges, vec!["012345", "6789a", "bcdef"]);
    assert!(rows.iter().all(|t| t.entity_uid.as_deref() == Some("users.id")));
}

/// Queueing again merges into the existing rows instead of duplicating them.
#[test]
fn test_requeue_merges_updated_settings() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = scan_config(temp_dir.path().join("prism.db"));
    let mut coordinator = Coordinator::new(TaskStore::open(&config.database).unwrap(), &config);

    queue_once(&mut coordinator, &config);
    config.tasks[0].timeout = 900;
    queue_once(&mut coordinator, &config);

    let rows = tasks_in_state(&coordinator, TaskState::New);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|t| t.timeout == 900));
}

/// Execute heartbeat moves NEW rows to RUNNING and spawns one worker each,
/// and the simulated workers drive them to COMPLETED.
#[test]
fn test_queue_execute_complete_cycle() {
    let temp_dir = TempDir::new().unwrap();
    let config = scan_config(temp_dir.path().join("prism.db"));
    let mut coordinator = Coordinator::new(TaskStore::open(&config.database).unwrap(), &config);

    queue_once(&mut coordinator, &config);

    let spawner = RecordingSpawner::default();
    ExecuteLoop::new(&mut coordinator, &spawner, &config).tick().unwrap();

    let ids = spawner.spawned_ids();
    assert_eq!(ids.len(), 3);
    assert_eq!(tasks_in_state(&coordinator, TaskState::Running).len(), 3);

    let handle = DoneHandle {
        class: "Scan".to_string(),
    };
    for id in ids {
        assert!(executor::execute_task(&mut coordinator, &handle, id).unwrap());
    }

    assert_eq!(tasks_in_state(&coordinator, TaskState::Completed).len(), 3);
    assert!(tasks_in_state(&coordinator, TaskState::Running).is_empty());
}

/// The slot budget caps how many rows one execute tick starts.
#[test]
fn test_execute_respects_slot_budget() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = scan_config(temp_dir.path().join("prism.db"));
    config.max_execution_slots = 2;
    let mut coordinator = Coordinator::new(TaskStore::open(&config.database).unwrap(), &config);

    queue_once(&mut coordinator, &config);

    let spawner = RecordingSpawner::default();
    ExecuteLoop::new(&mut coordinator, &spawner, &config).tick().unwrap();

    assert_eq!(spawner.spawned_ids().len(), 2);
    assert_eq!(tasks_in_state(&coordinator, TaskState::Running).len(), 2);
    assert_eq!(tasks_in_state(&coordinator, TaskState::New).len(), 1);

    // Second tick with both slots occupied starts nothing new.
    ExecuteLoop::new(&mut coordinator, &spawner, &config).tick().unwrap();
    assert_eq!(spawner.spawned_ids().len(), 2);
}

/// A class waiting on an unfinished dependee lands NOT_COMPLETED, and the
/// reschedule heartbeat recycles it once the cooldown has passed.
#[test]
fn test_dependency_defers_completion_until_rescheduled() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = scan_config(temp_dir.path().join("prism.db"));
    config.main_processes[0].tasks.push(MainProcessTask {
        class: "Report".to_string(),
        depend_on: Some("Scan".to_string()),
    });
    config.tasks.push(TaskClassConfig {
        class: "Report".to_string(),
        timeout: 600,
        cooldown: 60,
        ..Default::default()
    });
    let mut coordinator = Coordinator::new(TaskStore::open(&config.database).unwrap(), &config);

    queue_once(&mut coordinator, &config);

    let spawner = RecordingSpawner::default();
    ExecuteLoop::new(&mut coordinator, &spawner, &config).tick().unwrap();

    // Finish the Report worker first, while all Scan rows are still running.
    let report_id = tasks_in_state(&coordinator, TaskState::Running)
        .into_iter()
        .find(|t| t.class == "Report")
        .unwrap()
        .id
        .unwrap();
    let report_handle = DoneHandle {
        class: "Report".to_string(),
    };
    assert!(!executor::execute_task(&mut coordinator, &report_handle, report_id).unwrap());
    assert_eq!(tasks_in_state(&coordinator, TaskState::NotCompleted).len(), 1);

    // Reschedule leaves it alone while the cooldown is still running, then
    // recycles it once date_end is old enough.
    RescheduleLoop::new(&mut coordinator, &config).tick().unwrap();
    assert_eq!(tasks_in_state(&coordinator, TaskState::NotCompleted).len(), 1);

    let mut report = repository::find_by_id(coordinator.store().conn(), report_id)
        .unwrap()
        .unwrap();
    report.date_end = Some(now_ts() - 30);
    repository::update(coordinator.store().conn(), &report).unwrap();

    RescheduleLoop::new(&mut coordinator, &config).tick().unwrap();
    let recycled = repository::find_by_id(coordinator.store().conn(), report_id)
        .unwrap()
        .unwrap();
    assert_eq!(recycled.state, TaskState::New);
    assert!(recycled.date_start.is_none());
    assert!(recycled.date_end.is_none());

    // Once every Scan row completes before the recycled Report restarts, the
    // Report can finish for real.
    let scan_handle = DoneHandle {
        class: "Scan".to_string(),
    };
    for task in tasks_in_state(&coordinator, TaskState::Running) {
        assert!(executor::execute_task(&mut coordinator, &scan_handle, task.id.unwrap()).unwrap());
    }
    for mut task in tasks_in_state(&coordinator, TaskState::Completed) {
        task.date_end = Some(now_ts() - 30);
        repository::update(coordinator.store().conn(), &task).unwrap();
    }

    ExecuteLoop::new(&mut coordinator, &spawner, &config).tick().unwrap();
    assert!(executor::execute_task(&mut coordinator, &report_handle, report_id).unwrap());
}
