//! Shared SQLite connection and schema migration for the three persisted
//! tables named in the external interface contract: `model_health`,
//! `provider_budget`, `request_sessions`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// Thin wrapper around a single `rusqlite::Connection` guarded by a mutex.
/// One process owns one database file; stores in `health.rs`/`budget.rs`/
/// `session.rs` each hold an `Arc<Database>` and layer their own
/// `parking_lot` read caches in front of it.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "failed to create database parent directory: {}",
                        parent.display()
                    )
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database at: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// In-memory database, used by tests that don't need a file on disk.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS model_health (
                model_id TEXT PRIMARY KEY,
                cooldown_until INTEGER NOT NULL DEFAULT 0,
                degraded_until INTEGER NOT NULL DEFAULT 0,
                rate_limit_strikes INTEGER NOT NULL DEFAULT 0,
                last_rate_limit_at INTEGER NOT NULL DEFAULT 0,
                rolling_latency_ms REAL NOT NULL DEFAULT 0.0,
                rolling_success_rate REAL NOT NULL DEFAULT 1.0
            )",
            [],
        )
        .context("failed to create model_health table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS provider_budget (
                provider TEXT PRIMARY KEY,
                used_tokens INTEGER NOT NULL DEFAULT 0,
                soft_limit_tokens INTEGER,
                hard_limit_tokens INTEGER
            )",
            [],
        )
        .context("failed to create provider_budget table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS request_sessions (
                request_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                task_type TEXT,
                model_id TEXT,
                response_text TEXT,
                attempts_json TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )
        .context("failed to create request_sessions table")?;

        Ok(())
    }

    /// Lock the underlying connection. Panics if the mutex is poisoned — a
    /// prior panic while holding the connection means the process state is
    /// no longer trustworthy.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn default_db_path() -> String {
    "data/state.sqlite".to_string()
}
