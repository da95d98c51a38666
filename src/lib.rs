//! Prism - a database-coordinated task scheduler
//!
//! Prism coordinates many short-lived heartbeat processes through a shared
//! SQLite database: queue creates task rows, execute hands slots to worker
//! processes, and reschedule recycles dead or unfinished work.

pub mod config;
pub mod coordination;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod priority;
pub mod queuer;
pub mod range;
pub mod spawner;
pub mod store;
pub mod task;

pub use error::{PrismError, Result};
