//! PostgreSQL storage
//!
//! Tables are created by the embedded migrations in `migrations/`, applied
//! by [`connect`].

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketflow_core::WorkflowDefinition;
use marketflow_core::engine::{RunStatus, WorkflowRun};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use crate::error::Result;
use crate::storage::{RunStore, WorkflowStore};
use crate::tasks::{AsyncTaskRecord, TaskStatus, TaskStore};

/// Embedded schema migrations
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open a pool and bring the schema up to date
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database schema up to date");
    Ok(pool)
}

/// Documents are stored as JSON text; JSONB would reorder object keys
fn encode<T: Serialize>(document: &T) -> Result<String> {
    Ok(serde_json::to_string(document)?)
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

/// Task store backed by the `async_tasks` table
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Store using `pool`
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_task(row: &PgRow) -> Result<AsyncTaskRecord> {
    let status: String = row.try_get("status")?;
    let interval: i64 = row.try_get("check_interval_seconds")?;
    let result_data: Option<String> = row.try_get("result_data")?;
    Ok(AsyncTaskRecord {
        external_task_id: row.try_get("external_task_id")?,
        connector_id: row.try_get("connector_id")?,
        action_id: row.try_get("action_id")?,
        workflow_run_id: row.try_get("workflow_run_id")?,
        status: TaskStatus::parse(&status).ok_or_else(|| anyhow!("unknown task status '{status}'"))?,
        check_interval_seconds: u64::try_from(interval).unwrap_or_default(),
        next_check_at: row.try_get("next_check_at")?,
        result_data: result_data.as_deref().map(decode).transpose()?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, record: AsyncTaskRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO async_tasks (
                external_task_id, connector_id, action_id, workflow_run_id, status,
                check_interval_seconds, next_check_at, result_data, error_message,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.external_task_id)
        .bind(&record.connector_id)
        .bind(&record.action_id)
        .bind(&record.workflow_run_id)
        .bind(record.status.as_str())
        .bind(i64::try_from(record.check_interval_seconds).unwrap_or(i64::MAX))
        .bind(record.next_check_at)
        .bind(record.result_data.as_ref().map(encode).transpose()?)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert task {}", record.external_task_id))?;
        Ok(())
    }

    async fn get(&self, external_task_id: &str) -> Result<Option<AsyncTaskRecord>> {
        let row = sqlx::query(r#"SELECT * FROM async_tasks WHERE external_task_id = $1"#)
            .bind(external_task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn update(&self, record: &AsyncTaskRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE async_tasks
            SET status = $2, check_interval_seconds = $3, next_check_at = $4,
                result_data = $5, error_message = $6, updated_at = $7
            WHERE external_task_id = $1
            "#,
        )
        .bind(&record.external_task_id)
        .bind(record.status.as_str())
        .bind(i64::try_from(record.check_interval_seconds).unwrap_or(i64::MAX))
        .bind(record.next_check_at)
        .bind(record.result_data.as_ref().map(encode).transpose()?)
        .bind(&record.error_message)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("task '{}' not found", record.external_task_id));
        }
        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<AsyncTaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM async_tasks
            WHERE status = 'pending' AND next_check_at <= $1
            ORDER BY next_check_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM async_tasks
            WHERE status IN ('completed', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Workflow store backed by the `workflows` table
#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    /// Store using `pool`
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_workflow(row: &PgRow) -> Result<WorkflowDefinition> {
    let definition: String = row.try_get("definition")?;
    decode(&definition)
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn get(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query(r#"SELECT definition FROM workflows WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(r#"SELECT definition FROM workflows ORDER BY id"#)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn save(&self, definition: &WorkflowDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, definition, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET definition = EXCLUDED.definition, updated_at = NOW()
            "#,
        )
        .bind(&definition.id)
        .bind(encode(definition)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save workflow {}", definition.id))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(r#"DELETE FROM workflows WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Run store backed by the `workflow_runs` table
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Store using `pool`
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_run(row: &PgRow) -> Result<WorkflowRun> {
    let record: String = row.try_get("record")?;
    decode(&record)
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query(r#"SELECT record FROM workflow_runs WHERE run_id = $1"#)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, workflow_id, status, record, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id) DO UPDATE
            SET status = EXCLUDED.status, record = EXCLUDED.record, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.workflow_id)
        .bind(run.status.as_str())
        .bind(encode(run)?)
        .bind(run.started_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save run {}", run.run_id))?;
        Ok(())
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            r#"SELECT record FROM workflow_runs WHERE status = $1 ORDER BY started_at"#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }
}
