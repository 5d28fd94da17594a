use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::StoreResult;

/// Connection manager for the engine database. All access goes through a
/// single connection behind a mutex; WAL mode keeps readers cheap.
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Store {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source_url TEXT NOT NULL,
                status TEXT NOT NULL,
                last_build_id TEXT,
                last_build_at TEXT,
                edge_url TEXT,
                edge_project TEXT,
                page_count INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                settings TEXT NOT NULL DEFAULT '{}',
                webhook_secret TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                scope TEXT NOT NULL,
                triggered_by TEXT NOT NULL,
                status TEXT NOT NULL,
                pages_total INTEGER NOT NULL DEFAULT 0,
                pages_processed INTEGER NOT NULL DEFAULT 0,
                original_size TEXT NOT NULL DEFAULT '{}',
                optimized_size TEXT NOT NULL DEFAULT '{}',
                iframe_facades_applied INTEGER NOT NULL DEFAULT 0,
                scripts_removed INTEGER NOT NULL DEFAULT 0,
                score_before REAL,
                score_after REAL,
                error_details TEXT,
                resolved_settings TEXT NOT NULL DEFAULT '{}',
                checkpoint_phase TEXT,
                log TEXT NOT NULL DEFAULT '[]',
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_builds_site ON builds(site_id, created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_runs (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                iteration INTEGER NOT NULL DEFAULT 0,
                max_iterations INTEGER NOT NULL DEFAULT 10,
                phase_timings TEXT NOT NULL DEFAULT '{}',
                last_error TEXT,
                checkpoint TEXT NOT NULL DEFAULT '{}',
                current_build_id TEXT,
                workdir TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_runs_site ON agent_runs(site_id, created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS asset_overrides (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                url_pattern TEXT NOT NULL,
                asset_class TEXT,
                settings TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE (site_id, url_pattern)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings_history (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                settings TEXT NOT NULL,
                actor TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS measurement_comparisons (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                build_id TEXT,
                strategy TEXT NOT NULL,
                original TEXT NOT NULL,
                optimized TEXT NOT NULL,
                improvements TEXT NOT NULL DEFAULT '{}',
                payload_savings_bytes INTEGER NOT NULL DEFAULT 0,
                measured_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pages (
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (site_id, path)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alert_rules (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                metric TEXT NOT NULL,
                comparator TEXT NOT NULL,
                threshold REAL NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alert_log (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                metric TEXT NOT NULL,
                observed REAL NOT NULL,
                threshold REAL NOT NULL,
                fired_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                site_id TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'ready',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                not_before TEXT NOT NULL,
                lease_expires_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(status, not_before, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS site_locks (
                site_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                lease_expires_at TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

pub(crate) fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(
    table: &'static str,
    column: &'static str,
    raw: &str,
) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| crate::error::StoreError::Corrupt {
            table,
            column,
            detail: err.to_string(),
        })
}

pub(crate) fn parse_opt_ts(
    table: &'static str,
    column: &'static str,
    raw: Option<String>,
) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|value| parse_ts(table, column, &value)).transpose()
}
