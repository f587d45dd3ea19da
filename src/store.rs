// src/store.rs

use crate::config::Settings;
use crate::manager::CompletedJob;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_rusqlite::Connection;

const SETTINGS_KEY: &str = "settings";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// One row of the download history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedDownload {
    pub name: String,
    pub group_key: String,
    pub local_path: PathBuf,
    /// Seconds since the Unix epoch.
    pub finished_at: i64,
}

impl CompletedDownload {
    pub fn from_job(completed: &CompletedJob) -> Self {
        let finished_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Self {
            name: completed.job.name.clone(),
            group_key: completed.job.group_key.clone(),
            local_path: completed.local_file.clone(),
            finished_at,
        }
    }
}

/// Persists settings and the completed-downloads history in SQLite.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Opens (or creates) the database file and its tables.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS settings (
                        key     TEXT PRIMARY KEY,
                        value   TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS completed_downloads (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        name        TEXT NOT NULL,
                        group_key   TEXT NOT NULL,
                        local_path  TEXT NOT NULL,
                        finished_at INTEGER NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Returns the stored settings, or `None` on first run.
    pub async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        let raw: Option<String> = self
            .conn
            .call(|conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM settings WHERE key = ?1",
                        params![SETTINGS_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let json = serde_json::to_string(settings)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                    params![SETTINGS_KEY, json],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn record_completed(&self, download: &CompletedDownload) -> Result<(), StoreError> {
        let download = download.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO completed_downloads (name, group_key, local_path, finished_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        download.name,
                        download.group_key,
                        download.local_path.to_string_lossy().into_owned(),
                        download.finished_at
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// History, newest first.
    pub async fn completed_downloads(&self) -> Result<Vec<CompletedDownload>, StoreError> {
        let downloads = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, group_key, local_path, finished_at
                     FROM completed_downloads ORDER BY id DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let local_path: String = row.get(2)?;
                        Ok(CompletedDownload {
                            name: row.get(0)?,
                            group_key: row.get(1)?,
                            local_path: PathBuf::from(local_path),
                            finished_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        Ok(downloads)
    }

    /// Deletes the whole history, returning how many rows were removed.
    pub async fn clear_history(&self) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .call(|conn| {
                let removed = conn.execute("DELETE FROM completed_downloads", [])?;
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }
}
