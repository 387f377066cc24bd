#![forbid(unsafe_code)]

mod cache;
mod connectors;
mod error;
mod history;
mod maintenance;
mod nodes;
mod projects;
mod query;
mod requests;
mod schema;
mod skeletons;
mod spatial_update;
mod summary;
mod support;

pub use error::StoreError;
pub use requests::*;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DB_FILE: &str = "neurite.db";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        schema::preflight_gate(&conn)?;
        schema::install_schema(&conn)?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Transaction for a mutation. IMMEDIATE takes the writer lock up front,
    /// which is SQLite's equivalent of locking the implicated rows for the
    /// duration of the transaction.
    pub(in crate::store) fn mutation_tx(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Verifies meta flags and counters, repairing what it safely can. Never
    /// a hard failure: the store can still serve reads with warnings pending.
    pub fn startup_check(&mut self) -> Result<StartupReport, StoreError> {
        let mut report = StartupReport::default();
        let tx = self.mutation_tx()?;

        for table in schema::expected_tables() {
            let present: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |row| row.get(0),
                )
                .optional()?;
            if present.is_none() {
                report
                    .warnings
                    .push(format!("table '{table}' is missing; run migrations"));
            }
        }

        let history: Option<String> = tx
            .query_row(
                "SELECT value FROM meta WHERE key='history_tracking'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match history.as_deref() {
            Some("on") | Some("off") => {}
            Some(other) => {
                tx.execute(
                    "UPDATE meta SET value='off' WHERE key='history_tracking'",
                    [],
                )?;
                report.repairs.push(format!(
                    "history_tracking flag was '{other}'; reset to 'off'"
                ));
            }
            None => {
                tx.execute(
                    "INSERT INTO meta(key, value) VALUES ('history_tracking', 'off')",
                    [],
                )?;
                report
                    .repairs
                    .push("history_tracking flag was missing; seeded 'off'".to_string());
            }
        }

        for name in ["skeleton", "txid"] {
            let present: Option<i64> = tx
                .query_row(
                    "SELECT value FROM counters WHERE name=?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            if present.is_none() {
                tx.execute(
                    "INSERT INTO counters(name, value) VALUES (?1, 0)",
                    params![name],
                )?;
                report
                    .repairs
                    .push(format!("counter '{name}' was missing; seeded 0"));
            }
        }

        // A skeleton counter behind the live data would hand out ids already
        // in use.
        let max_skeleton: Option<i64> = tx
            .query_row("SELECT MAX(skeleton_id) FROM treenodes", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        if let Some(max_skeleton) = max_skeleton {
            let counter: i64 = tx.query_row(
                "SELECT value FROM counters WHERE name='skeleton'",
                [],
                |row| row.get(0),
            )?;
            if counter < max_skeleton {
                tx.execute(
                    "UPDATE counters SET value=?1 WHERE name='skeleton'",
                    params![max_skeleton],
                )?;
                report.repairs.push(format!(
                    "skeleton counter {counter} was behind live maximum {max_skeleton}; advanced"
                ));
            }
        }

        tx.commit()?;
        Ok(report)
    }
}

pub(in crate::store) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}

/// Strictly monotonic per-row edition stamp; equality against a client stamp
/// stays a sound staleness test even for edits within one millisecond.
pub(in crate::store) fn bumped_edition(previous: i64, now: i64) -> i64 {
    now.max(previous + 1)
}

pub(in crate::store) fn next_counter_tx(
    conn: &Connection,
    name: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        "UPDATE counters SET value = value + 1 WHERE name=?1",
        params![name],
    )?;
    let value: Option<i64> = conn
        .query_row(
            "SELECT value FROM counters WHERE name=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(value) => Ok(value),
        None => {
            conn.execute(
                "INSERT INTO counters(name, value) VALUES (?1, 1)",
                params![name],
            )?;
            Ok(1)
        }
    }
}

pub(in crate::store) fn finite_point(
    p: nr_core::geom::Point3,
) -> Result<nr_core::geom::Point3, StoreError> {
    if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
        return Err(StoreError::InvalidInput("coordinates must be finite"));
    }
    Ok(p)
}

pub(in crate::store) fn validate_radius(radius: f64) -> Result<f64, StoreError> {
    if radius == nr_core::model::UNSET_RADIUS {
        return Ok(radius);
    }
    if !radius.is_finite() || radius < 0.0 {
        return Err(StoreError::InvalidInput(
            "radius must be non-negative or the unset sentinel",
        ));
    }
    Ok(radius)
}

pub(in crate::store) fn validate_project_user(
    project_id: i64,
    user_id: i64,
) -> Result<(), StoreError> {
    nr_core::ids::ProjectId::try_new(project_id)
        .map_err(|err| StoreError::InvalidInput(err.message()))?;
    nr_core::ids::UserId::try_new(user_id)
        .map_err(|err| StoreError::InvalidInput(err.message()))?;
    Ok(())
}

pub(in crate::store) fn validate_confidence(confidence: i64) -> Result<i64, StoreError> {
    nr_core::model::Confidence::try_new(confidence)
        .map_err(|err| StoreError::InvalidInput(err.message()))?;
    Ok(confidence)
}
