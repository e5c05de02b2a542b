use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::zone::FinishedSession;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A journal row as stored; timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SessionRow {
    pub id: i64,
    pub zone_id: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub cycles: i64,
    pub minutes: f64,
    pub pre_moisture: Option<f64>,
    pub final_moisture: Option<f64>,
    pub result: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/sprinklers/sprinklers.db"
    /// - "sqlite:sprinklers.db?mode=rwc"
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory sqlite db")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Watering sessions
    // ----------------------------

    pub async fn insert_session(&self, s: &FinishedSession) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO watering_sessions (
              zone_id, started_at, ended_at,
              cycles, minutes,
              pre_moisture, final_moisture,
              result
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&s.zone_id)
        .bind(s.started_at.unix_timestamp())
        .bind(s.ended_at.unix_timestamp())
        .bind(s.cycles as i64)
        .bind(s.minutes)
        .bind(s.pre_moisture)
        .bind(s.final_moisture)
        .bind(s.result.as_str())
        .execute(&self.pool)
        .await
        .context("insert_session failed")?
        .last_insert_rowid();
        Ok(id)
    }

    /// Newest first.
    pub async fn recent_sessions(&self, zone_id: &str, limit: i64) -> Result<Vec<SessionRow>> {
        sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, zone_id, started_at, ended_at,
                   cycles, minutes, pre_moisture, final_moisture, result
            FROM watering_sessions
            WHERE zone_id = ?
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(zone_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_sessions failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
