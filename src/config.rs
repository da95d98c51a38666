//! Configuration: the scheduling budget, worker spawn settings, and the
//! declared main processes and task classes.
//!
//! Loaded from .prism.yml or ~/.config/prism/prism.yml; re-read by the queue
//! heartbeat every invocation so changes apply live.

use crate::priority::PriorityStrategyKind;
use crate::range::{MAX_HASH_RESOURCES, RangeStrategy, RangeStrategyKind};
use crate::task::TaskDependency;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path to the shared task database.
    pub database: PathBuf,

    /// Executable to spawn for each task worker.
    pub executable: String,

    /// First argument handed to the executable before the worker subcommand,
    /// typically the application entry point or a config flag.
    #[serde(rename = "entry-point")]
    pub entry_point: String,

    /// Maximum concurrently running task workers.
    #[serde(rename = "max-execution-slots")]
    pub max_execution_slots: u64,

    /// Seconds each heartbeat sleeps between ticks.
    #[serde(rename = "sleep-seconds")]
    pub sleep_seconds: u64,

    /// Seconds one heartbeat invocation keeps ticking before it exits and
    /// waits for the external scheduler to re-invoke it.
    #[serde(rename = "run-window-seconds")]
    pub run_window_seconds: u64,

    /// Error tries after which a task is forced into the error state.
    #[serde(rename = "max-error-tries")]
    pub max_error_tries: u32,

    /// Slot allocation strategy for the execute heartbeat.
    #[serde(rename = "priority-strategy")]
    pub priority_strategy: PriorityStrategyKind,

    /// Logical processes the queue heartbeat enqueues.
    #[serde(rename = "main-processes")]
    pub main_processes: Vec<MainProcessConfig>,

    /// Per-class task defaults.
    pub tasks: Vec<TaskClassConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("prism.db"),
            executable: String::new(),
            entry_point: String::new(),
            max_execution_slots: 10,
            sleep_seconds: 5,
            run_window_seconds: 55,
            max_error_tries: 5,
            priority_strategy: PriorityStrategyKind::default(),
            main_processes: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .prism.yml in current directory
    /// 3. ~/.config/prism/prism.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        let project_config = PathBuf::from(".prism.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from .prism.yml");
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load .prism.yml: {}", e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("prism").join("prism.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_execution_slots == 0 {
            eyre::bail!("max-execution-slots must be > 0");
        }
        if self.sleep_seconds == 0 {
            eyre::bail!("sleep-seconds must be > 0");
        }
        if self.run_window_seconds == 0 {
            eyre::bail!("run-window-seconds must be > 0");
        }
        if self.max_error_tries == 0 {
            eyre::bail!("max-error-tries must be > 0");
        }
        for process in &self.main_processes {
            if process.name.is_empty() {
                eyre::bail!("main process name must not be empty");
            }
            for task in &process.tasks {
                if self.task_class(&task.class).is_none() {
                    eyre::bail!(
                        "main process {} references unknown task class {}",
                        process.name,
                        task.class
                    );
                }
            }
        }
        for task in &self.tasks {
            if task.class.is_empty() {
                eyre::bail!("task class name must not be empty");
            }
            if task.resources < 1 || task.resources > MAX_HASH_RESOURCES {
                eyre::bail!(
                    "task class {} resources must be between 1 and {}",
                    task.class,
                    MAX_HASH_RESOURCES
                );
            }
            if task.priority <= 0 {
                eyre::bail!("task class {} priority must be > 0", task.class);
            }
        }
        Ok(())
    }

    pub fn task_class(&self, class: &str) -> Option<&TaskClassConfig> {
        self.tasks.iter().find(|t| t.class == class)
    }

    /// Main processes that are not disabled.
    pub fn enabled_main_processes(&self) -> impl Iterator<Item = &MainProcessConfig> {
        self.main_processes.iter().filter(|p| !p.disabled)
    }

    /// All configured task class names, for backlog accounting.
    pub fn task_classes(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.class.clone()).collect()
    }

    /// Dependency pairs declared by enabled main processes. Disabled processes
    /// contribute nothing: their tasks never queue, so a dependency on or from
    /// them would block dependers forever.
    pub fn dependencies(&self) -> Vec<TaskDependency> {
        self.enabled_main_processes()
            .flat_map(|process| process.tasks.iter())
            .filter_map(|task| {
                task.depend_on
                    .as_ref()
                    .map(|depend_on| TaskDependency::new(&task.class, depend_on))
            })
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_seconds)
    }

    pub fn run_window(&self) -> Duration {
        Duration::from_secs(self.run_window_seconds)
    }
}

/// One logical process: an ordered list of task classes queued together.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MainProcessConfig {
    pub name: String,

    /// Skip this process entirely.
    pub disabled: bool,

    /// Subject instance for unique-id ranged classes in this process.
    pub subject: Option<String>,

    pub tasks: Vec<MainProcessTask>,
}

/// A task class referenced by a main process, optionally waiting on another
/// class.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MainProcessTask {
    pub class: String,

    #[serde(rename = "depend-on")]
    pub depend_on: Option<String>,
}

/// Per-class task defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskClassConfig {
    pub class: String,

    /// Seconds a worker may run.
    pub timeout: i64,

    /// Grace seconds after timeout before the row counts as overdue.
    pub cooldown: i64,

    /// Parallel instances for the hash range strategy.
    pub resources: u32,

    /// Subject the class acts on, formatted as "table.column".
    #[serde(rename = "entity-uid")]
    pub entity_uid: Option<String>,

    #[serde(rename = "range-strategy")]
    pub range_strategy: RangeStrategyKind,

    /// Weight for the fair-share slot allocation.
    pub priority: i64,
}

impl Default for TaskClassConfig {
    fn default() -> Self {
        Self {
            class: String::new(),
            timeout: 60,
            cooldown: 10,
            resources: 1,
            entity_uid: None,
            range_strategy: RangeStrategyKind::default(),
            priority: 1,
        }
    }
}

impl TaskClassConfig {
    /// Resolve the configured strategy kind into a concrete range strategy.
    /// `uid` is the subject instance used by the unique-id kind.
    pub fn build_range_strategy(&self, uid: &str) -> RangeStrategy {
        match self.range_strategy {
            RangeStrategyKind::Hash => RangeStrategy::Hash {
                resources: self.resources,
            },
            RangeStrategyKind::UniqueId => RangeStrategy::UniqueId {
                uid: uid.to_string(),
            },
        }
    }
}
