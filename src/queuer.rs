//! The queueing seam: where task rows come from.
//!
//! The queue heartbeat does not know what work exists; it asks a `Queuer` for
//! the next batch of logical main processes, expands each into concrete task
//! rows, and reports the outcome back through the start/stop/failed callbacks.
//! `ConfigQueuer` is the built-in implementation that reads the declared main
//! processes straight from configuration; applications with their own notion
//! of pending work implement the traits instead.

use crate::config::{Config, MainProcessConfig, TaskClassConfig};
use crate::task::{Task, now_ts};
use eyre::Result;
use log::{info, warn};
use std::collections::HashSet;

/// Default subject instance for unique-id ranged classes when the main process
/// does not name one.
const DEFAULT_SUBJECT_UID: &str = "1";

/// One task class inside a main process: produces the concrete rows to queue
/// and, on the worker side, performs the actual work.
pub trait TaskHandle {
    fn class(&self) -> &str;

    /// Expand into zero or more NEW rows, one per range token.
    fn queue(&self) -> Result<Vec<Task>>;

    /// Do the work for one row. Returns true when the attempt completed; the
    /// worker entry point turns this into the terminal state decision.
    fn execute(&self) -> Result<bool>;
}

/// A logical process: an ordered batch of task handles queued together.
pub trait MainProcess {
    fn name(&self) -> &str;
    fn tasks(&self) -> Result<Vec<Box<dyn TaskHandle>>>;
}

/// Supplies main processes to the queue heartbeat and observes the outcome of
/// each queueing attempt.
pub trait Queuer {
    fn next_main_processes(&mut self) -> Result<Vec<Box<dyn MainProcess>>>;

    /// False declines the process for this tick.
    fn queueing_start(&mut self, process: &dyn MainProcess) -> bool;

    fn queueing_stop(&mut self, process: &dyn MainProcess);

    fn queueing_failed(&mut self, process: &dyn MainProcess, error: &eyre::Report);
}

/// Queues the main processes declared in configuration. Each process is queued
/// once per heartbeat invocation; a failed process stays eligible so the next
/// tick retries it.
pub struct ConfigQueuer {
    config: Config,
    queued: HashSet<String>,
}

impl ConfigQueuer {
    pub fn new(config: Config) -> Self {
        ConfigQueuer {
            config,
            queued: HashSet::new(),
        }
    }
}

impl Queuer for ConfigQueuer {
    fn next_main_processes(&mut self) -> Result<Vec<Box<dyn MainProcess>>> {
        let mut processes: Vec<Box<dyn MainProcess>> = Vec::new();
        for process in self.config.enabled_main_processes() {
            if self.queued.contains(&process.name) {
                continue;
            }
            processes.push(Box::new(ConfigMainProcess::new(&self.config, process)?));
        }
        Ok(processes)
    }

    fn queueing_start(&mut self, process: &dyn MainProcess) -> bool {
        !self.queued.contains(process.name())
    }

    fn queueing_stop(&mut self, process: &dyn MainProcess) {
        info!("queued main process {}", process.name());
        self.queued.insert(process.name().to_string());
    }

    fn queueing_failed(&mut self, process: &dyn MainProcess, error: &eyre::Report) {
        warn!("queueing main process {} failed: {error:#}", process.name());
    }
}

struct ConfigMainProcess {
    name: String,
    handles: Vec<ConfigTaskHandle>,
}

impl ConfigMainProcess {
    fn new(config: &Config, process: &MainProcessConfig) -> Result<Self> {
        let uid = process
            .subject
            .clone()
            .unwrap_or_else(|| DEFAULT_SUBJECT_UID.to_string());
        let mut handles = Vec::with_capacity(process.tasks.len());
        for task in &process.tasks {
            let class_config = config.task_class(&task.class).ok_or_else(|| {
                eyre::eyre!(
                    "main process {} references unknown task class {}",
                    process.name,
                    task.class
                )
            })?;
            handles.push(ConfigTaskHandle {
                class_config: class_config.clone(),
                uid: uid.clone(),
            });
        }
        Ok(ConfigMainProcess {
            name: process.name.clone(),
            handles,
        })
    }
}

impl MainProcess for ConfigMainProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self) -> Result<Vec<Box<dyn TaskHandle>>> {
        Ok(self
            .handles
            .iter()
            .map(|h| Box::new(h.clone()) as Box<dyn TaskHandle>)
            .collect())
    }
}

/// Config-driven task handle: queueing is fully described by the class config,
/// execution is a no-op attempt (real work lives in the application embedding
/// the scheduler).
#[derive(Clone)]
pub struct ConfigTaskHandle {
    class_config: TaskClassConfig,
    uid: String,
}

impl ConfigTaskHandle {
    pub fn new(class_config: TaskClassConfig, uid: impl Into<String>) -> Self {
        ConfigTaskHandle {
            class_config,
            uid: uid.into(),
        }
    }
}

impl TaskHandle for ConfigTaskHandle {
    fn class(&self) -> &str {
        &self.class_config.class
    }

    fn queue(&self) -> Result<Vec<Task>> {
        let strategy = self.class_config.build_range_strategy(&self.uid);
        let ranges = strategy.calculate()?;
        let now = now_ts();
        Ok(ranges
            .into_iter()
            .map(|range| {
                Task::new_queued(
                    &self.class_config.class,
                    self.class_config.entity_uid.clone(),
                    range,
                    self.class_config.timeout,
                    self.class_config.cooldown,
                    now,
                )
            })
            .collect())
    }

    fn execute(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MainProcessTask;
    use crate::range::RangeStrategyKind;

    fn config() -> Config {
        Config {
            main_processes: vec![MainProcessConfig {
                name: "nightly".to_string(),
                tasks: vec![
                    MainProcessTask {
                        class: "Sync".to_string(),
                        depend_on: None,
                    },
                    MainProcessTask {
                        class: "Report".to_string(),
                        depend_on: Some("Sync".to_string()),
                    },
                ],
                ..Default::default()
            }],
            tasks: vec![
                TaskClassConfig {
                    class: "Sync".to_string(),
                    resources: 3,
                    entity_uid: Some("accounts.email".to_string()),
                    ..Default::default()
                },
                TaskClassConfig {
                    class: "Report".to_string(),
                    range_strategy: RangeStrategyKind::UniqueId,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_class_expands_one_row_per_shard() {
        let handle = ConfigTaskHandle::new(config().task_class("Sync").unwrap().clone(), "1");
        let tasks = handle.queue().unwrap();
        assert_eq!(tasks.len(), 3);
        let ranges: Vec<_> = tasks.iter().map(|t| t.range.as_str()).collect();
        assert_eq!(ranges, vec!["012345", "6789a", "bcdef"]);
        assert!(tasks.iter().all(|t| t.class == "Sync"));
        assert!(
            tasks
                .iter()
                .all(|t| t.entity_uid.as_deref() == Some("accounts.email"))
        );
    }

    #[test]
    fn test_unique_id_class_expands_single_row() {
        let handle = ConfigTaskHandle::new(config().task_class("Report").unwrap().clone(), "42");
        let tasks = handle.queue().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].range, "42");
    }

    #[test]
    fn test_config_queuer_offers_each_process_once() {
        let mut queuer = ConfigQueuer::new(config());
        let processes = queuer.next_main_processes().unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].name(), "nightly");
        assert!(queuer.queueing_start(processes[0].as_ref()));

        queuer.queueing_stop(processes[0].as_ref());
        assert!(queuer.next_main_processes().unwrap().is_empty());
        assert!(!queuer.queueing_start(processes[0].as_ref()));
    }

    #[test]
    fn test_failed_process_stays_eligible() {
        let mut queuer = ConfigQueuer::new(config());
        let processes = queuer.next_main_processes().unwrap();
        queuer.queueing_failed(processes[0].as_ref(), &eyre::eyre!("boom"));
        assert_eq!(queuer.next_main_processes().unwrap().len(), 1);
    }

    #[test]
    fn test_main_process_exposes_handles_in_order() {
        let mut queuer = ConfigQueuer::new(config());
        let processes = queuer.next_main_processes().unwrap();
        let handles = processes[0].tasks().unwrap();
        let classes: Vec<_> = handles.iter().map(|h| h.class().to_string()).collect();
        assert_eq!(classes, vec!["Sync", "Report"]);
    }
}
