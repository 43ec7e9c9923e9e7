//! SQLite-based build history

use crate::core::ExecutionStatus;
use crate::persistence::{BuildRecord, PersistenceBackend};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

const COLUMNS: &str =
    "id, build_name, vm_name, status, started_at, completed_at, artifact_dir, error";

/// SQLite build store
pub struct SqliteBuildStore {
    pool: SqlitePool,
}

impl SqliteBuildStore {
    /// Open (or create) the database at `db_path`
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // An in-memory database lives only as long as its connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let db_path = Self::default_path();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let db_path = db_path
            .to_str()
            .ok_or_else(|| anyhow!("Database path is not valid UTF-8: {}", db_path.display()))?;
        Self::new(db_path).await
    }

    /// `<local data dir>/ovfbuild/builds.db`
    pub fn default_path() -> PathBuf {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| Path::new(".").to_path_buf());
        data_dir.join("ovfbuild").join("builds.db")
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                build_name TEXT NOT NULL,
                vm_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                artifact_dir TEXT,
                error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_build_name ON builds(build_name);
            CREATE INDEX IF NOT EXISTS idx_started_at ON builds(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<BuildRecord> {
        let status: String = row.get("status");
        Ok(BuildRecord {
            build_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            build_name: row.get("build_name"),
            vm_name: row.get("vm_name"),
            status: ExecutionStatus::parse(&status)
                .ok_or_else(|| anyhow!("Unknown build status in history: {}", status))?,
            started_at: Self::from_naive(row.get("started_at")),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(Self::from_naive),
            artifact_dir: row.get::<Option<String>, _>("artifact_dir").map(PathBuf::from),
            error: row.get("error"),
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteBuildStore {
    async fn save_build(&self, record: &BuildRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO builds ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            COLUMNS
        ))
        .bind(record.build_id.to_string())
        .bind(&record.build_name)
        .bind(&record.vm_name)
        .bind(record.status.as_str())
        .bind(Self::to_naive(record.started_at))
        .bind(record.completed_at.map(Self::to_naive))
        .bind(
            record
                .artifact_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
        )
        .bind(&record.error)
        .execute(&self.pool)
        .await
        .context("Failed to save build")?;

        Ok(())
    }

    async fn load_build(&self, build_id: Uuid) -> Result<Option<BuildRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM builds WHERE id = ?1", COLUMNS))
            .bind(build_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load build")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_builds(&self, build_name: &str) -> Result<Vec<BuildRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM builds WHERE build_name = ?1 ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(build_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list builds")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_build_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT build_name FROM builds ORDER BY build_name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list build names")?;

        Ok(rows.iter().map(|row| row.get("build_name")).collect())
    }
}
