//! Heartbeat loop driver shared by the queue, execute and reschedule processes.
//!
//! Each heartbeat invocation ticks for a bounded wall-clock window and then
//! exits; an external scheduler (cron, a systemd timer) re-invokes it. Any
//! error escaping a tick is logged and fails the whole invocation, leaving
//! recovery to the next one.

pub mod execute;
pub mod queue;
pub mod reschedule;

pub use execute::ExecuteLoop;
pub use queue::QueueLoop;
pub use reschedule::RescheduleLoop;

use crate::config::Config;
use eyre::Result;
use log::{error, info};
use std::thread;
use std::time::{Duration, Instant};

/// Tick cadence and run window for one heartbeat invocation.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub tick_interval: Duration,
    pub run_window: Duration,
}

impl HeartbeatConfig {
    pub fn from_config(config: &Config) -> Self {
        HeartbeatConfig {
            tick_interval: config.tick_interval(),
            run_window: config.run_window(),
        }
    }

    /// Ticks per invocation, rounded up so a partial final interval still runs.
    pub fn iterations(&self) -> u64 {
        let interval = self.tick_interval.as_secs_f64().max(f64::EPSILON);
        (self.run_window.as_secs_f64() / interval).ceil() as u64
    }
}

/// Drive `tick` until the run window closes. Returns false as soon as a tick
/// fails; true when the window completed cleanly.
pub fn run_heartbeat<F>(name: &str, config: &HeartbeatConfig, mut tick: F) -> bool
where
    F: FnMut() -> Result<()>,
{
    let started = Instant::now();
    let iterations = config.iterations();
    info!("{name} heartbeat started, {iterations} iterations");

    for _ in 0..iterations {
        if let Err(e) = tick() {
            error!("{name} heartbeat tick failed: {e:#}");
            return false;
        }
        thread::sleep(config.tick_interval);
        if started.elapsed() >= config.run_window {
            break;
        }
    }

    info!("{name} heartbeat finished");
    true
}
