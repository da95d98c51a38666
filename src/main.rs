use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use prism::config::Config;
use prism::coordination::Coordinator;
use prism::executor;
use prism::heartbeat::{ExecuteLoop, QueueLoop, RescheduleLoop};
use prism::queuer::{ConfigQueuer, ConfigTaskHandle};
use prism::spawner::ProcessSpawner;
use prism::store::TaskStore;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prism")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("prism.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn open_coordinator(config: &Config) -> Result<Coordinator> {
    let store = TaskStore::open(&config.database)?;
    Ok(Coordinator::new(store, config))
}

fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Init => handle_init(config),
        Commands::Queue => handle_queue(config),
        Commands::Execute => handle_execute(config),
        Commands::Reschedule => handle_reschedule(config),
        Commands::TaskExecute { id, class, .. } => handle_task_execute(*id, class, config),
    }
}

fn handle_init(config: &Config) -> Result<()> {
    TaskStore::open(&config.database)?;
    println!(
        "{} {}",
        "Initialized task database at".green(),
        config.database.display()
    );
    Ok(())
}

fn handle_queue(config: &Config) -> Result<()> {
    let mut coordinator = open_coordinator(config)?;
    let mut queuer = ConfigQueuer::new(config.clone());
    let mut heartbeat = QueueLoop::new(&mut coordinator, &mut queuer, config);
    if !heartbeat.run() {
        eyre::bail!("queue heartbeat exited with errors");
    }
    Ok(())
}

fn handle_execute(config: &Config) -> Result<()> {
    let mut coordinator = open_coordinator(config)?;
    let spawner = ProcessSpawner;
    let mut heartbeat = ExecuteLoop::new(&mut coordinator, &spawner, config);
    if !heartbeat.run() {
        eyre::bail!("execute heartbeat exited with errors");
    }
    Ok(())
}

fn handle_reschedule(config: &Config) -> Result<()> {
    let mut coordinator = open_coordinator(config)?;
    let mut heartbeat = RescheduleLoop::new(&mut coordinator, config);
    if !heartbeat.run() {
        eyre::bail!("reschedule heartbeat exited with errors");
    }
    Ok(())
}

fn handle_task_execute(id: i64, class: &str, config: &Config) -> Result<()> {
    let class_config = config
        .task_class(class)
        .ok_or_else(|| eyre::eyre!("unknown task class: {class}"))?
        .clone();
    let subject = subject_for_class(config, class);
    let handle = ConfigTaskHandle::new(class_config, subject);

    let mut coordinator = open_coordinator(config)?;
    let completed = executor::execute_task(&mut coordinator, &handle, id)?;
    info!("task {id} ({class}) finished, completed={completed}");
    Ok(())
}

/// Subject instance for a worker invocation: taken from the first enabled main
/// process that schedules this class.
fn subject_for_class(config: &Config, class: &str) -> String {
    config
        .enabled_main_processes()
        .find(|process| process.tasks.iter().any(|t| t.class == class))
        .and_then(|process| process.subject.clone())
        .unwrap_or_else(|| "1".to_string())
}

fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).context("Application failed")?;

    Ok(())
}
