//! SQLite persistence for server records
//!
//! Records survive restarts, including the provisioner state needed to
//! reattach to a backend that kept running while the control plane was down.

use crate::record::{BackendRecord, ServerKey, ServerState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info, warn};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str = "owner, name, state, options, started_at, last_activity, route, target,
                              provisioner_state, last_error";

/// Durable store for [`BackendRecord`]s keyed by `(owner, name)`
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open record store")?;

        // WAL keeps readers from blocking the writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!(path = %path.display(), "Record store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory record store")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: servers table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: servers table");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                owner TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'stopped',
                options TEXT NOT NULL DEFAULT 'null',
                started_at TEXT,
                last_activity TEXT,
                route TEXT,
                target TEXT,
                provisioner_state TEXT NOT NULL DEFAULT 'null',
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (owner, name)
            );

            CREATE INDEX IF NOT EXISTS idx_servers_state ON servers(state);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Get a record by key
    pub fn get(&self, key: &ServerKey) -> Result<Option<BackendRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM servers WHERE owner = ?1 AND name = ?2", SELECT_COLUMNS);
        conn.query_row(&sql, params![key.owner, key.name], row_to_record)
            .optional()
            .with_context(|| format!("Failed to get server record {}", key))
    }

    /// Insert or replace a record
    pub fn upsert(&self, record: &BackendRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO servers (owner, name, state, options, started_at, last_activity, route, target,
                                  provisioner_state, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(owner, name) DO UPDATE SET
                state = excluded.state,
                options = excluded.options,
                started_at = excluded.started_at,
                last_activity = excluded.last_activity,
                route = excluded.route,
                target = excluded.target,
                provisioner_state = excluded.provisioner_state,
                last_error = excluded.last_error",
            params![
                record.key.owner,
                record.key.name,
                record.state.as_str(),
                record.options.to_string(),
                record.started_at.map(|t| t.to_rfc3339()),
                record.last_activity.map(|t| t.to_rfc3339()),
                record.route,
                record.target,
                record.provisioner_state.to_string(),
                record.last_error,
            ],
        )
        .with_context(|| format!("Failed to save server record {}", record.key))?;
        Ok(())
    }

    /// List all records, ordered by owner then name
    pub fn list(&self) -> Result<Vec<BackendRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM servers ORDER BY owner, name", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list server records")?;
        Ok(records)
    }

    /// Delete a record, returns whether it existed
    pub fn delete(&self, key: &ServerKey) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM servers WHERE owner = ?1 AND name = ?2",
                params![key.owner, key.name],
            )
            .with_context(|| format!("Failed to delete server record {}", key))?;
        Ok(rows > 0)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<BackendRecord> {
    let owner: String = row.get(0)?;
    let name: String = row.get(1)?;
    let state: String = row.get(2)?;
    let options: String = row.get(3)?;
    let provisioner_state: String = row.get(8)?;

    let key = ServerKey::new(owner, name);
    let state = state.parse().unwrap_or_else(|e: String| {
        warn!(server = %key, error = %e, "Unreadable server state, treating as stopped");
        ServerState::Stopped
    });

    Ok(BackendRecord {
        state,
        options: parse_json(&options),
        started_at: parse_time(row.get(4)?),
        last_activity: parse_time(row.get(5)?),
        route: row.get(6)?,
        target: row.get(7)?,
        provisioner_state: parse_json(&provisioner_state),
        last_error: row.get(9)?,
        key,
    })
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}
