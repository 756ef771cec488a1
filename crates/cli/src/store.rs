// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relational trajectory store over a single SQLite file.
//!
//! Seven tables: runs, signal/spec catalogues, signal/spec samples, action
//! events and monitor errors. Foreign keys are enforced (`PRAGMA
//! foreign_keys = ON`) and samples carry a composite `(id, run_id)` key to
//! their catalogue row so a sample can never cite a catalogue entry from a
//! different run. Rows are append-only; nothing here ever deletes.
//!
//! JSON columns hold ASCII-safe JSON text; callers re-parse when they want
//! structure.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{BridgeError, Result};

pub struct TrajectoryStore {
    path: PathBuf,
    conn: Connection,
}

/// One action event row, as listed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionEventRow {
    pub id: i64,
    pub run_id: i64,
    pub dt_s: f64,
    pub action_kind: String,
    pub detected_at_utc: String,
    pub spec_label: String,
    pub signal_window_start_dt_s: f64,
    pub signal_window_end_dt_s: f64,
    pub delta_value: Option<f64>,
    pub old_value_json: Option<String>,
    pub new_value_json: Option<String>,
}

/// One signal sample row joined to its catalogue label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSampleRow {
    pub id: i64,
    pub run_id: i64,
    pub signal_id: i64,
    pub signal_label: String,
    pub dt_s: f64,
    pub values_json: String,
}

impl TrajectoryStore {
    /// Open (creating parent directories and the file as needed).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::store(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(&path)
            .map_err(|e| BridgeError::store(format!("cannot open {}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA foreign_keys = ON").map_err(store_err)?;
        Ok(Self { path, conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON").map_err(store_err)?;
        Ok(Self { path: PathBuf::from(":memory:"), conn })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create all tables. Idempotent; re-running on an up-to-date database
    /// is a no-op. The one schema alteration ever shipped, the
    /// `action_events.delta_value` column, is detected and applied here.
    pub fn initialize_schema(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_name TEXT NOT NULL UNIQUE,
                    started_at_utc TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS signal_catalog (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    signal_label TEXT NOT NULL,
                    unit TEXT,
                    metadata_json TEXT,
                    FOREIGN KEY(run_id) REFERENCES runs(id),
                    UNIQUE(id, run_id)
                );
                CREATE TABLE IF NOT EXISTS spec_catalog (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    spec_label TEXT NOT NULL,
                    unit TEXT,
                    metadata_json TEXT,
                    FOREIGN KEY(run_id) REFERENCES runs(id),
                    UNIQUE(id, run_id)
                );
                CREATE TABLE IF NOT EXISTS signal_samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    signal_id INTEGER NOT NULL,
                    dt_s REAL NOT NULL CHECK (dt_s >= 0.0),
                    values_json TEXT NOT NULL,
                    FOREIGN KEY(run_id) REFERENCES runs(id),
                    FOREIGN KEY(signal_id, run_id) REFERENCES signal_catalog(id, run_id)
                );
                CREATE TABLE IF NOT EXISTS spec_samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    spec_id INTEGER NOT NULL,
                    dt_s REAL NOT NULL CHECK (dt_s >= 0.0),
                    vals_json TEXT NOT NULL,
                    FOREIGN KEY(run_id) REFERENCES runs(id),
                    FOREIGN KEY(spec_id, run_id) REFERENCES spec_catalog(id, run_id)
                );
                CREATE TABLE IF NOT EXISTS action_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    dt_s REAL NOT NULL,
                    action_kind TEXT NOT NULL,
                    detected_at_utc TEXT NOT NULL,
                    spec_label TEXT NOT NULL,
                    signal_window_start_dt_s REAL NOT NULL,
                    signal_window_end_dt_s REAL NOT NULL,
                    delta_value REAL,
                    old_value_json TEXT,
                    new_value_json TEXT,
                    FOREIGN KEY(run_id) REFERENCES runs(id)
                );
                CREATE TABLE IF NOT EXISTS monitor_errors (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER,
                    dt_s REAL,
                    error_type TEXT NOT NULL,
                    message TEXT NOT NULL,
                    details_json TEXT,
                    FOREIGN KEY(run_id) REFERENCES runs(id)
                );
                ",
            )
            .map_err(store_err)?;

        // Databases written before delta_value shipped lack the column.
        let mut has_delta = false;
        {
            let mut stmt =
                self.conn.prepare("PRAGMA table_info(action_events)").map_err(store_err)?;
            let mut rows = stmt.query([]).map_err(store_err)?;
            while let Some(row) = rows.next().map_err(store_err)? {
                let name: String = row.get(1).map_err(store_err)?;
                if name == "delta_value" {
                    has_delta = true;
                }
            }
        }
        if !has_delta {
            self.conn
                .execute_batch("ALTER TABLE action_events ADD COLUMN delta_value REAL")
                .map_err(store_err)?;
        }
        Ok(())
    }

    /// Non-internal table names, for schema assertions.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(store_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(names)
    }

    /// Create a run row. A `run_name` collision is a hard error; the
    /// existing row is untouched.
    pub fn create_run(&mut self, run_name: &str, started_at_utc: &str) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row("SELECT id FROM runs WHERE run_name = ?1 LIMIT 1", [run_name], |row| {
                row.get(0)
            })
            .optional()
            .map_err(store_err)?;
        if existing.is_some() {
            return Err(BridgeError::store(format!(
                "run_name '{run_name}' already exists; run_name must be unique"
            )));
        }
        self.conn
            .execute(
                "INSERT INTO runs (run_name, started_at_utc) VALUES (?1, ?2)",
                params![run_name, started_at_utc],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    BridgeError::store(format!(
                        "run_name '{run_name}' already exists; run_name must be unique"
                    ))
                }
                other => store_err(other),
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_signal_catalog(
        &mut self,
        run_id: i64,
        signal_label: &str,
        unit: Option<&str>,
        metadata_json: Option<&serde_json::Value>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO signal_catalog (run_id, signal_label, unit, metadata_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, signal_label, unit, metadata_json.map(ascii_json)],
            )
            .map_err(store_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_spec_catalog(
        &mut self,
        run_id: i64,
        spec_label: &str,
        unit: Option<&str>,
        metadata_json: Option<&serde_json::Value>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO spec_catalog (run_id, spec_label, unit, metadata_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, spec_label, unit, metadata_json.map(ascii_json)],
            )
            .map_err(store_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_signal_sample(
        &mut self,
        run_id: i64,
        signal_id: i64,
        dt_s: f64,
        values_json: &serde_json::Value,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO signal_samples (run_id, signal_id, dt_s, values_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, signal_id, dt_s, ascii_json(values_json)],
            )
            .map_err(store_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_spec_sample(
        &mut self,
        run_id: i64,
        spec_id: i64,
        dt_s: f64,
        vals_json: &serde_json::Value,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO spec_samples (run_id, spec_id, dt_s, vals_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, spec_id, dt_s, ascii_json(vals_json)],
            )
            .map_err(store_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert one signal sample and one spec sample atomically: either
    /// both rows appear or neither does.
    pub fn insert_sample_pair(
        &mut self,
        run_id: i64,
        signal_id: i64,
        spec_id: i64,
        dt_s: f64,
        signal_values_json: &serde_json::Value,
        spec_vals_json: &serde_json::Value,
    ) -> Result<(i64, i64)> {
        let tx = self.conn.transaction().map_err(store_err)?;
        tx.execute(
            "INSERT INTO signal_samples (run_id, signal_id, dt_s, values_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, signal_id, dt_s, ascii_json(signal_values_json)],
        )
        .map_err(store_err)?;
        let signal_row_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO spec_samples (run_id, spec_id, dt_s, vals_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, spec_id, dt_s, ascii_json(spec_vals_json)],
        )
        .map_err(store_err)?;
        let spec_row_id = tx.last_insert_rowid();
        tx.commit().map_err(store_err)?;
        Ok((signal_row_id, spec_row_id))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_action_event(
        &mut self,
        run_id: i64,
        dt_s: f64,
        action_kind: &str,
        detected_at_utc: &str,
        spec_label: &str,
        signal_window_start_dt_s: f64,
        signal_window_end_dt_s: f64,
        delta_value: Option<f64>,
        old_value_json: Option<&serde_json::Value>,
        new_value_json: Option<&serde_json::Value>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO action_events (
                     run_id, dt_s, action_kind, detected_at_utc, spec_label,
                     signal_window_start_dt_s, signal_window_end_dt_s,
                     delta_value, old_value_json, new_value_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    dt_s,
                    action_kind,
                    detected_at_utc,
                    spec_label,
                    signal_window_start_dt_s,
                    signal_window_end_dt_s,
                    delta_value,
                    old_value_json.map(ascii_json),
                    new_value_json.map(ascii_json),
                ],
            )
            .map_err(store_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_monitor_error(
        &mut self,
        run_id: Option<i64>,
        dt_s: Option<f64>,
        error_type: &str,
        message: &str,
        details_json: Option<&serde_json::Value>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO monitor_errors (run_id, dt_s, error_type, message, details_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, dt_s, error_type, message, details_json.map(ascii_json)],
            )
            .map_err(store_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Action events ordered `(dt_s asc, id asc)`, optionally scoped to one
    /// run.
    pub fn list_action_events(&self, run_id: Option<i64>) -> Result<Vec<ActionEventRow>> {
        let (sql, scoped) = match run_id {
            Some(_) => (
                "SELECT id, run_id, dt_s, action_kind, detected_at_utc, spec_label,
                        signal_window_start_dt_s, signal_window_end_dt_s,
                        delta_value, old_value_json, new_value_json
                 FROM action_events WHERE run_id = ?1
                 ORDER BY dt_s ASC, id ASC",
                true,
            ),
            None => (
                "SELECT id, run_id, dt_s, action_kind, detected_at_utc, spec_label,
                        signal_window_start_dt_s, signal_window_end_dt_s,
                        delta_value, old_value_json, new_value_json
                 FROM action_events
                 ORDER BY run_id ASC, dt_s ASC, id ASC",
                false,
            ),
        };
        let mut stmt = self.conn.prepare(sql).map_err(store_err)?;
        let map = |row: &rusqlite::Row<'_>| action_event_from_row(row);
        let rows = if scoped {
            stmt.query_map([run_id], map).map_err(store_err)?.collect()
        } else {
            stmt.query_map([], map).map_err(store_err)?.collect()
        };
        let rows: std::result::Result<Vec<_>, _> = rows;
        rows.map_err(store_err)
    }

    /// The `idx`-th action event of a run in `(dt_s, id)` order.
    pub fn get_action_event_by_idx(
        &self,
        run_id: i64,
        action_idx: u64,
    ) -> Result<Option<ActionEventRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, dt_s, action_kind, detected_at_utc, spec_label,
                        signal_window_start_dt_s, signal_window_end_dt_s,
                        delta_value, old_value_json, new_value_json
                 FROM action_events WHERE run_id = ?1
                 ORDER BY dt_s ASC, id ASC
                 LIMIT 1 OFFSET ?2",
            )
            .map_err(store_err)?;
        stmt.query_row(params![run_id, action_idx as i64], |row| action_event_from_row(row))
            .optional()
            .map_err(store_err)
    }

    /// Signal samples of a run with `dt_min <= dt_s <= dt_max`, joined to
    /// their catalogue label, ordered `(dt_s asc, id asc)`.
    pub fn list_signal_samples_in_window(
        &self,
        run_id: i64,
        dt_min_s: f64,
        dt_max_s: f64,
    ) -> Result<Vec<SignalSampleRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT signal_samples.id, signal_samples.run_id, signal_samples.signal_id,
                        signal_catalog.signal_label, signal_samples.dt_s,
                        signal_samples.values_json
                 FROM signal_samples
                 INNER JOIN signal_catalog
                     ON signal_samples.signal_id = signal_catalog.id
                     AND signal_samples.run_id = signal_catalog.run_id
                 WHERE signal_samples.run_id = ?1
                     AND signal_samples.dt_s >= ?2
                     AND signal_samples.dt_s <= ?3
                 ORDER BY signal_samples.dt_s ASC, signal_samples.id ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![run_id, dt_min_s, dt_max_s], |row| {
                Ok(SignalSampleRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    signal_id: row.get(2)?,
                    signal_label: row.get(3)?,
                    dt_s: row.get(4)?,
                    values_json: row.get(5)?,
                })
            })
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    pub fn get_latest_run_id(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT id FROM runs ORDER BY id DESC LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(store_err)
    }

    /// Resolve a run name. The schema forbids duplicates, so finding more
    /// than one is defensive and errors.
    pub fn get_run_id_by_name(&self, run_name: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM runs WHERE run_name = ?1 ORDER BY id DESC LIMIT 2")
            .map_err(store_err)?;
        let ids = stmt
            .query_map([run_name], |row| row.get::<_, i64>(0))
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        match ids.len() {
            0 => Ok(None),
            1 => Ok(Some(ids[0])),
            _ => Err(BridgeError::store(format!(
                "multiple runs found for run_name '{run_name}'; run_name must be unique"
            ))),
        }
    }

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        // Table names cannot be bound; restrict to the known schema.
        if !self.table_names()?.iter().any(|t| t == table) {
            return Err(BridgeError::store(format!("unknown table '{table}'")));
        }
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(store_err)
    }
}

fn action_event_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ActionEventRow, rusqlite::Error> {
    Ok(ActionEventRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        dt_s: row.get(2)?,
        action_kind: row.get(3)?,
        detected_at_utc: row.get(4)?,
        spec_label: row.get(5)?,
        signal_window_start_dt_s: row.get(6)?,
        signal_window_end_dt_s: row.get(7)?,
        delta_value: row.get(8)?,
        old_value_json: row.get(9)?,
        new_value_json: row.get(10)?,
    })
}

fn store_err(err: rusqlite::Error) -> BridgeError {
    BridgeError::store(err.to_string())
}

/// Serialize to JSON text with every non-ASCII character escaped, so the
/// stored text survives encoding-naive consumers.
pub fn ascii_json(value: &serde_json::Value) -> String {
    let text = value.to_string();
    if text.is_ascii() {
        return text;
    }
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
