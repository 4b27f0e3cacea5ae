//! External task records and their storage

use std::collections::HashMap;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use marketflow_core::connectors::MAX_CHECK_INTERVAL_SECS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

/// Lifecycle of an external task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for the external API
    Pending,
    /// Settled with a result
    Completed,
    /// Settled with an error
    Failed,
}

impl TaskStatus {
    /// Lowercase name, as stored
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse a stored name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Whether the task has settled
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// One external task a suspended run waits on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncTaskRecord {
    /// Task id issued by the external API
    pub external_task_id: String,
    /// Connector that issued the task
    pub connector_id: String,
    /// Action that started it
    pub action_id: String,
    /// Run to resume once the task settles
    pub workflow_run_id: String,
    /// Current status
    pub status: TaskStatus,
    /// Seconds between readiness checks
    pub check_interval_seconds: u64,
    /// When the next check is due
    pub next_check_at: DateTime<Utc>,
    /// Payload of a completed task
    pub result_data: Option<Value>,
    /// Reason of a failed task
    pub error_message: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl AsyncTaskRecord {
    /// A pending record whose first check is due now.
    ///
    /// The interval is capped at [`MAX_CHECK_INTERVAL_SECS`].
    pub fn pending(
        external_task_id: impl Into<String>,
        connector_id: impl Into<String>,
        action_id: impl Into<String>,
        workflow_run_id: impl Into<String>,
        check_interval_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            external_task_id: external_task_id.into(),
            connector_id: connector_id.into(),
            action_id: action_id.into(),
            workflow_run_id: workflow_run_id.into(),
            status: TaskStatus::Pending,
            check_interval_seconds: check_interval_seconds.min(MAX_CHECK_INTERVAL_SECS),
            next_check_at: now,
            result_data: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Settle with a result
    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result_data = Some(result);
        self.updated_at = Utc::now();
    }

    /// Settle with an error
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Push the next check one interval out, always later than the last one
    pub fn reschedule(&mut self) {
        let now = Utc::now();
        let interval = self.check_interval_seconds.min(MAX_CHECK_INTERVAL_SECS);
        let next = TimeDelta::try_seconds(interval as i64)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let floor = self
            .next_check_at
            .checked_add_signed(TimeDelta::milliseconds(1))
            .unwrap_or(self.next_check_at);
        self.next_check_at = next.max(floor);
        self.updated_at = now;
    }
}

/// Storage for [`AsyncTaskRecord`]s keyed by `external_task_id`
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a new record; a duplicate id is an error
    async fn insert(&self, record: AsyncTaskRecord) -> Result<()>;

    /// Fetch a record
    async fn get(&self, external_task_id: &str) -> Result<Option<AsyncTaskRecord>>;

    /// Overwrite an existing record
    async fn update(&self, record: &AsyncTaskRecord) -> Result<()>;

    /// Pending records whose next check is at or before `now`
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<AsyncTaskRecord>>;

    /// Delete settled records last changed before `cutoff`; returns the count
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-process task store
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<String, AsyncTaskRecord>>,
}

impl InMemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: AsyncTaskRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.external_task_id) {
            bail!("task '{}' is already scheduled", record.external_task_id);
        }
        records.insert(record.external_task_id.clone(), record);
        Ok(())
    }

    async fn get(&self, external_task_id: &str) -> Result<Option<AsyncTaskRecord>> {
        Ok(self.records.read().await.get(external_task_id).cloned())
    }

    async fn update(&self, record: &AsyncTaskRecord) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.external_task_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => bail!("task '{}' not found", record.external_task_id),
        }
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<AsyncTaskRecord>> {
        let records = self.records.read().await;
        let mut due: Vec<AsyncTaskRecord> = records
            .values()
            .filter(|r| r.status == TaskStatus::Pending && r.next_check_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_check_at);
        Ok(due)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.updated_at < cutoff));
        Ok((before - records.len()) as u64)
    }
}
