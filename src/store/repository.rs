//! Storage-facing task queries.
//!
//! Free functions over `&rusqlite::Connection` so they compose under a
//! caller-owned transaction; the write lock of that transaction is what gives
//! the lock-then-verify queries their meaning. No function reads the wall
//! clock: every time-windowed predicate takes `now` as a parameter.

use crate::error::{PrismError, Result};
use crate::priority::Allocation;
use crate::task::{DEAD_GRACE_SECS, Task, TaskDependency, TaskState};
use rusqlite::{Connection, Row, named_params, params, params_from_iter};
use sha2::{Digest, Sha256};

const TASK_COLUMNS: &str =
    "id, class, entity_uid, timeout, cooldown, \"range\", date_start, date_end, state, error_tries, date_created";

/// A stored-RUNNING row whose window has not elapsed. Rows past the window are
/// DEAD, which the slot accounting must not count.
fn running_live_clause() -> String {
    format!(
        "(state = 'running' AND date_end IS NULL \
         AND :now < date_start + timeout + cooldown + {DEAD_GRACE_SECS})"
    )
}

fn dead_clause() -> String {
    format!(
        "(state = 'running' AND date_end IS NULL \
         AND :now >= date_start + timeout + cooldown + {DEAD_GRACE_SECS})"
    )
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let state: String = row.get(8)?;
    let state = TaskState::from_stored(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown task state: {state}").into(),
        )
    })?;
    Ok(Task {
        id: Some(row.get(0)?),
        class: row.get(1)?,
        entity_uid: row.get(2)?,
        timeout: row.get(3)?,
        cooldown: row.get(4)?,
        range: row.get(5)?,
        date_start: row.get(6)?,
        date_end: row.get(7)?,
        state,
        error_tries: row.get(9)?,
        date_created: row.get(10)?,
    })
}

pub fn insert(conn: &Connection, task: &Task) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO tasks (class, entity_uid, timeout, cooldown, \"range\", \
         date_start, date_end, state, error_tries, date_created) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            task.class,
            task.entity_uid,
            task.timeout,
            task.cooldown,
            task.range,
            task.date_start,
            task.date_end,
            task.state.as_str(),
            task.error_tries,
            task.date_created,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
    let id = task.id.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    conn.execute(
        "UPDATE tasks SET class = ?1, entity_uid = ?2, timeout = ?3, cooldown = ?4, \
         \"range\" = ?5, date_start = ?6, date_end = ?7, state = ?8, error_tries = ?9, \
         date_created = ?10 WHERE id = ?11",
        params![
            task.class,
            task.entity_uid,
            task.timeout,
            task.cooldown,
            task.range,
            task.date_start,
            task.date_end,
            task.state.as_str(),
            task.error_tries,
            task.date_created,
            id,
        ],
    )?;
    Ok(())
}

/// Insert or update depending on whether the task already has an id; a fresh
/// insert writes the assigned id back into the task.
pub fn save(conn: &Connection, task: &mut Task) -> rusqlite::Result<()> {
    match task.id {
        Some(_) => update(conn, task),
        None => {
            let id = insert(conn, task)?;
            task.id = Some(id);
            Ok(())
        }
    }
}

pub fn find_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
    let mut rows = stmt.query_map([id], task_from_row)?;
    rows.next().transpose()
}

/// Look up the row sharing this task's unique identity (class, entity_uid,
/// range). A NULL entity_uid must match via IS NULL, not equality.
pub fn find_unique(conn: &Connection, task: &Task) -> rusqlite::Result<Option<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE class = :class \
         AND (entity_uid = :entity_uid OR (entity_uid IS NULL AND :entity_uid IS NULL)) \
         AND \"range\" = :range"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(
        named_params! {
            ":class": task.class,
            ":entity_uid": task.entity_uid,
            ":range": task.range,
        },
        task_from_row,
    )?;
    rows.next().transpose()
}

/// Count of rows currently live-RUNNING, for slot accounting.
pub fn count_running(conn: &Connection, now: i64) -> rusqlite::Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM tasks WHERE {}", running_live_clause());
    let count: i64 = conn.query_row(&sql, named_params! { ":now": now }, |row| row.get(0))?;
    Ok(count as u64)
}

/// Count of NEW rows per class, restricted to the given class set. Classes
/// without NEW rows are absent from the result.
pub fn count_new_by_class(
    conn: &Connection,
    classes: &[String],
) -> rusqlite::Result<Vec<(String, u64)>> {
    if classes.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; classes.len()].join(", ");
    let sql = format!(
        "SELECT class, COUNT(*) FROM tasks WHERE state = 'new' AND class IN ({placeholders}) \
         GROUP BY class"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(classes), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    rows.collect()
}

/// The oldest NEW rows up to `limit`, across all classes.
pub fn lock_next_new(conn: &Connection, limit: u64) -> rusqlite::Result<Vec<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE state = 'new' \
         ORDER BY date_created ASC, id ASC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit as i64], task_from_row)?;
    rows.collect()
}

/// NEW rows matching a per-class slot allocation: for each class the oldest
/// rows up to its granted count, then a re-verification that every selected id
/// is still NEW. Under the caller's write transaction the re-check guards
/// against a racing writer between the backlog count and this fetch.
pub fn fetch_new_by_allocation(
    conn: &Connection,
    allocations: &[Allocation],
) -> rusqlite::Result<Vec<Task>> {
    let mut ids: Vec<i64> = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id FROM tasks WHERE state = 'new' AND class = ?1 \
             ORDER BY date_created ASC, id ASC LIMIT ?2",
        )?;
        for allocation in allocations {
            let rows = stmt.query_map(
                params![allocation.class, allocation.granted as i64],
                |row| row.get::<_, i64>(0),
            )?;
            for id in rows {
                ids.push(id?);
            }
        }
    }
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE state = 'new' AND id IN ({placeholders}) \
         ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(ids), task_from_row)?;
    rows.collect()
}

/// Unlocked scan for rows currently DEAD or NOT_COMPLETED, oldest first.
pub fn find_dead_or_not_completed(
    conn: &Connection,
    now: i64,
    limit: Option<u64>,
) -> rusqlite::Result<Vec<Task>> {
    let limit_clause = match limit {
        Some(limit) => format!(" LIMIT {limit}"),
        None => String::new(),
    };
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE ({} OR state = 'not_completed') \
         ORDER BY date_created ASC, id ASC{limit_clause}",
        dead_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(named_params! { ":now": now }, task_from_row)?;
    rows.collect()
}

/// Whether any row this task depends on is unfinished, or finished but with a
/// completion that overlapped this task's run window. A dependee counts as
/// unfinished when NEW, NOT_COMPLETED, or stored RUNNING (live or dead); a
/// COMPLETED dependee counts when its date_end is at or past this task's
/// date_start, which must force this task to NOT_COMPLETED.
pub fn has_unfinished_or_overlapping_dependee(
    conn: &Connection,
    task: &Task,
) -> rusqlite::Result<bool> {
    // Without a start there is no run window; the overlap arm can never match.
    let date_start = task.date_start.unwrap_or(i64::MAX);
    let exists: i64 = conn.query_row(
        "SELECT EXISTS ( \
           SELECT 1 FROM tasks \
           WHERE class IN (SELECT depend_on FROM task_dependencies WHERE class = :class) \
           AND ( \
             state = 'new' \
             OR state = 'not_completed' \
             OR (state = 'running' AND date_end IS NULL) \
             OR (state = 'completed' AND date_end >= :date_start) \
           ) \
         )",
        named_params! { ":class": task.class, ":date_start": date_start },
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Whether this class waits on any other class.
pub fn has_dependency(conn: &Connection, class: &str) -> rusqlite::Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM task_dependencies WHERE class = ?1)",
        [class],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

pub fn list_dependencies(conn: &Connection) -> rusqlite::Result<Vec<TaskDependency>> {
    let mut stmt =
        conn.prepare("SELECT id, class, depend_on FROM task_dependencies ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok(TaskDependency {
            id: Some(row.get(0)?),
            class: row.get(1)?,
            depend_on: row.get(2)?,
        })
    })?;
    rows.collect()
}

pub fn insert_dependency(conn: &Connection, dependency: &TaskDependency) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO task_dependencies (class, depend_on) VALUES (?1, ?2)",
        params![dependency.class, dependency.depend_on],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn delete_dependency(conn: &Connection, id: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM task_dependencies WHERE id = ?1", [id])
}

/// Discover the concrete subject keys a hash-sharded task instance acts on:
/// rows of the subject table whose key column's SHA-256 digest starts with a
/// hex digit inside the instance's range token.
///
/// `entity_uid` names the subject as "table.column"; both identifiers are
/// validated before being spliced into SQL.
pub fn subject_keys_by_range(
    conn: &Connection,
    entity_uid: &str,
    range: &str,
) -> Result<Vec<String>> {
    let (table, column) = entity_uid.split_once('.').ok_or_else(|| {
        PrismError::Validation(format!(
            "entity_uid must be formatted as table.column, got {entity_uid}"
        ))
    })?;
    for identifier in [table, column] {
        if identifier.is_empty()
            || !identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(PrismError::Validation(format!(
                "invalid identifier in entity_uid: {identifier}"
            )));
        }
    }

    let sql = format!("SELECT CAST({column} AS TEXT) FROM {table}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut keys = Vec::new();
    for key in rows {
        let key = key?;
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let first = digest.chars().next().unwrap_or('0');
        if range.contains(first) {
            keys.push(key);
        }
    }
    Ok(keys)
}
