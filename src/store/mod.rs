//! SQLite-backed task store.
//!
//! The store is the only shared mutable resource between the heartbeat
//! processes and the spawned workers; all coordination happens through its
//! transactions. Writers take an IMMEDIATE transaction so the write lock is
//! acquired up front, which gives the at-most-one-writer guarantee the
//! save/lock protocol relies on. WAL mode keeps readers from blocking behind
//! writers, and a busy timeout absorbs short lock contention between the
//! independently-ticking processes.

pub mod repository;

use eyre::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// How long a connection waits on a contended write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the SQLite connection for one heartbeat or worker process.
pub struct TaskStore {
    db: Connection,
}

impl TaskStore {
    /// Open or create the task database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let db = Connection::open(db_path)
            .with_context(|| format!("Failed to open task database: {}", db_path.display()))?;
        Self::configure(&db)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::configure(&db)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    fn configure(db: &Connection) -> Result<()> {
        db.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        db.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        Ok(())
    }

    /// Initialize the schema.
    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                class TEXT NOT NULL,
                entity_uid TEXT,
                timeout INTEGER NOT NULL,
                cooldown INTEGER NOT NULL,
                "range" TEXT NOT NULL DEFAULT '',
                date_start INTEGER,
                date_end INTEGER,
                state TEXT NOT NULL,
                error_tries INTEGER NOT NULL DEFAULT 0,
                date_created INTEGER NOT NULL,
                UNIQUE (class, entity_uid, "range")
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            CREATE INDEX IF NOT EXISTS idx_tasks_class_state ON tasks(class, state);
            CREATE INDEX IF NOT EXISTS idx_tasks_date_created ON tasks(date_created);

            CREATE TABLE IF NOT EXISTS task_dependencies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                class TEXT NOT NULL,
                depend_on TEXT NOT NULL,
                UNIQUE (class, depend_on)
            );
            "#,
        )
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.db
    }

    /// Begin a write transaction, taking the write lock immediately.
    pub fn transaction(&mut self) -> rusqlite::Result<Transaction<'_>> {
        self.db
            .transaction_with_behavior(TransactionBehavior::Immediate)
    }
}
