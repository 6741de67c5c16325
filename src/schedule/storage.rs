/// SQLite persistence for published schedules
///
/// Published schedules survive restarts here and are recovered into the cron
/// scheduler at startup.

use crate::schedule::types::ScheduleJob;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ScheduleStorage {
    pool: SqlitePool,
}

impl ScheduleStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file and ensure the schema
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Single-connection in-memory database, for tests and ephemeral runs
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Safe to call multiple times (uses IF NOT EXISTS)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                flow_version_id TEXT NOT NULL,
                project_id TEXT,
                tenant_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_schedules_active
            ON schedules(is_active)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a schedule definition
    pub async fn save_schedule(&self, job: &ScheduleJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, name, cron_expression, flow_version_id, project_id, tenant_id, is_active, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                cron_expression = excluded.cron_expression,
                flow_version_id = excluded.flow_version_id,
                project_id = excluded.project_id,
                tenant_id = excluded.tenant_id,
                is_active = excluded.is_active,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.cron_expression)
        .bind(&job.flow_version_id)
        .bind(&job.project_id)
        .bind(&job.tenant_id)
        .bind(job.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleJob>> {
        let row = sqlx::query(
            "SELECT id, name, cron_expression, flow_version_id, project_id, tenant_id, is_active FROM schedules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(job_from_row))
    }

    /// Active schedules, oldest first
    pub async fn list_active(&self) -> Result<Vec<ScheduleJob>> {
        let rows = sqlx::query(
            "SELECT id, name, cron_expression, flow_version_id, project_id, tenant_id, is_active FROM schedules WHERE is_active = 1 ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(job_from_row).collect())
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn job_from_row(row: &SqliteRow) -> ScheduleJob {
    ScheduleJob {
        id: row.get("id"),
        name: row.get("name"),
        cron_expression: row.get("cron_expression"),
        flow_version_id: row.get("flow_version_id"),
        project_id: row.get("project_id"),
        tenant_id: row.get("tenant_id"),
        is_active: row.get("is_active"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_list_active() {
        let storage = ScheduleStorage::in_memory().await.unwrap();

        let mut job = ScheduleJob::new("s1", "nightly", "0 3 * * *", "v1");
        storage.save_schedule(&job).await.unwrap();

        job.cron_expression = "0 4 * * *".into();
        storage.save_schedule(&job).await.unwrap();

        let mut paused = ScheduleJob::new("s2", "paused", "* * * * *", "v2");
        paused.is_active = false;
        storage.save_schedule(&paused).await.unwrap();

        let active = storage.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cron_expression, "0 4 * * *");

        assert!(storage.get_schedule("s2").await.unwrap().is_some());
        assert!(storage.delete_schedule("s1").await.unwrap());
        assert!(!storage.delete_schedule("s1").await.unwrap());
    }

    #[tokio::test]
    async fn file_database_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.db");

        {
            let storage = ScheduleStorage::connect(&path).await.unwrap();
            let mut job = ScheduleJob::new("s1", "hourly", "0 * * * *", "v1");
            job.tenant_id = Some("t1".into());
            storage.save_schedule(&job).await.unwrap();
        }

        let storage = ScheduleStorage::connect(&path).await.unwrap();
        let job = storage.get_schedule("s1").await.unwrap().unwrap();
        assert_eq!(job.tenant_id.as_deref(), Some("t1"));
        assert!(job.project_id.is_none());
    }
}
