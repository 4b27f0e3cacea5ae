//! Async task manager
//!
//! Polls external tasks until they settle. Each check asks the issuing
//! connector's `task_ready` action; a settled task is published as a
//! [`TaskEvent`] for the runner to resume the waiting run.
//!
//! ```text
//! schedule_task_check ──▶ TaskStore (pending)
//!          │
//!          ▼
//!   CheckScheduler ──(delay)──▶ due queue ──▶ run() ──▶ check_task_status
//!                                                        │
//!                        ┌── not ready: reschedule ◀─────┤
//!                        └── settled: TaskEvent ◀────────┘
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use marketflow_core::connectors::{Connector, ConnectorRegistry, TASK_READY_ACTION, TaskReadiness};
use marketflow_core::credentials::{CredentialProvider, StaticCredentials};
use marketflow_core::engine::TaskOutcome;
use marketflow_core::transforms::Params;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::tasks::{AsyncTaskRecord, TaskStatus, TaskStore};

/// A task settled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The connector reported the task ready
    Completed {
        /// Run waiting on the task
        workflow_run_id: String,
        /// External task id
        external_task_id: String,
        /// Result payload
        result: Value,
    },
    /// The task failed, or could not be checked
    Failed {
        /// Run waiting on the task
        workflow_run_id: String,
        /// External task id
        external_task_id: String,
        /// Failure reason
        message: String,
    },
}

impl TaskEvent {
    /// Run waiting on the task
    pub fn workflow_run_id(&self) -> &str {
        match self {
            TaskEvent::Completed {
                workflow_run_id, ..
            }
            | TaskEvent::Failed {
                workflow_run_id, ..
            } => workflow_run_id,
        }
    }

    /// External task id
    pub fn external_task_id(&self) -> &str {
        match self {
            TaskEvent::Completed {
                external_task_id, ..
            }
            | TaskEvent::Failed {
                external_task_id, ..
            } => external_task_id,
        }
    }

    /// What the waiting unit receives on resume
    pub fn into_outcome(self) -> TaskOutcome {
        match self {
            TaskEvent::Completed { result, .. } => TaskOutcome::Completed(result),
            TaskEvent::Failed { message, .. } => TaskOutcome::Failed(message),
        }
    }
}

/// Result of one [`AsyncTaskManager::check_task_status`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Unknown task, already settled, or another check is in flight
    Skipped,
    /// Not ready; the next check is scheduled
    Pending,
    /// Marked completed
    Completed,
    /// Marked failed
    Failed,
}

/// Arranges for a task id to be checked after a delay
pub trait CheckScheduler: Send + Sync {
    /// Queue a check of `external_task_id` once `delay` has passed
    fn schedule(&self, external_task_id: &str, delay: Duration);
}

/// Sleeps on a tokio timer, then pushes the id onto the due queue
#[derive(Debug, Clone)]
pub struct TimerScheduler {
    due: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl TimerScheduler {
    /// Create a scheduler and the due queue it feeds.
    ///
    /// Pending timers are dropped once `cancel` fires.
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (due, queue) = mpsc::unbounded_channel();
        (Self { due, cancel }, queue)
    }
}

impl CheckScheduler for TimerScheduler {
    fn schedule(&self, external_task_id: &str, delay: Duration) {
        let due = self.due.clone();
        let cancel = self.cancel.clone();
        let id = external_task_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if due.send(id).is_err() {
                        debug!("Due queue closed, dropping task check");
                    }
                }
            }
        });
    }
}

/// Removes the id from the in-flight set when dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        inserted.then(|| Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Tracks external tasks and resolves them
pub struct AsyncTaskManager {
    store: Arc<dyn TaskStore>,
    connectors: ConnectorRegistry,
    credentials: Arc<dyn CredentialProvider>,
    scheduler: Arc<dyn CheckScheduler>,
    events: mpsc::UnboundedSender<TaskEvent>,
    in_flight: Mutex<HashSet<String>>,
    connector_timeout: Duration,
}

impl AsyncTaskManager {
    /// Create a manager publishing settled tasks on `events`
    pub fn new(
        store: Arc<dyn TaskStore>,
        connectors: ConnectorRegistry,
        scheduler: Arc<dyn CheckScheduler>,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        Self {
            store,
            connectors,
            credentials: Arc::new(StaticCredentials::new()),
            scheduler,
            events,
            in_flight: Mutex::new(HashSet::new()),
            connector_timeout: Duration::from_secs(30),
        }
    }

    /// Use `credentials` for readiness checks
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Bound each readiness check; zero disables the bound
    pub fn with_connector_timeout(mut self, timeout: Duration) -> Self {
        self.connector_timeout = timeout;
        self
    }

    /// The task store
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Record a pending task and schedule its first check.
    ///
    /// `external_task_id` must be unique; scheduling it twice is an error.
    pub async fn schedule_task_check(
        &self,
        external_task_id: &str,
        connector_id: &str,
        action_id: &str,
        workflow_run_id: &str,
        check_interval_seconds: u64,
    ) -> Result<()> {
        let record = AsyncTaskRecord::pending(
            external_task_id,
            connector_id,
            action_id,
            workflow_run_id,
            check_interval_seconds,
        );
        let check_interval_seconds = record.check_interval_seconds;
        self.store
            .insert(record)
            .await
            .with_context(|| format!("Failed to schedule task {external_task_id}"))?;
        self.scheduler
            .schedule(external_task_id, Duration::from_secs(check_interval_seconds));

        info!(
            external_task_id,
            connector = connector_id,
            action = action_id,
            run_id = workflow_run_id,
            check_interval_seconds,
            "Scheduled async task check"
        );
        Ok(())
    }

    /// Check one task with its connector and settle or reschedule it.
    ///
    /// Only a `pending` record is checked, and only one check per id runs
    /// at a time; anything else is a no-op.
    pub async fn check_task_status(&self, external_task_id: &str) -> Result<CheckOutcome> {
        let Some(_guard) = InFlight::acquire(&self.in_flight, external_task_id) else {
            debug!(external_task_id, "Check already in flight");
            return Ok(CheckOutcome::Skipped);
        };

        let Some(mut record) = self.store.get(external_task_id).await? else {
            debug!(external_task_id, "Unknown task");
            return Ok(CheckOutcome::Skipped);
        };
        if record.status != TaskStatus::Pending {
            debug!(external_task_id, status = record.status.as_str(), "Task already settled");
            return Ok(CheckOutcome::Skipped);
        }

        let connector = match self.connectors.get(&record.connector_id) {
            Ok(connector) => connector,
            Err(e) => return self.settle_failed(record, e.to_string()).await,
        };

        match self.poll(connector.as_ref(), &record).await {
            Ok(TaskReadiness::Ready(result)) => {
                record.complete(result.clone());
                self.store.update(&record).await?;
                info!(
                    external_task_id,
                    run_id = %record.workflow_run_id,
                    "Async task completed"
                );
                self.publish(TaskEvent::Completed {
                    workflow_run_id: record.workflow_run_id,
                    external_task_id: record.external_task_id,
                    result,
                });
                Ok(CheckOutcome::Completed)
            }
            Ok(TaskReadiness::Pending) => {
                record.reschedule();
                self.store.update(&record).await?;
                self.scheduler.schedule(
                    external_task_id,
                    Duration::from_secs(record.check_interval_seconds),
                );
                debug!(
                    external_task_id,
                    next_check_at = %record.next_check_at,
                    "Async task not ready"
                );
                Ok(CheckOutcome::Pending)
            }
            Ok(TaskReadiness::Failed(message)) => self.settle_failed(record, message).await,
            Err(e) => self.settle_failed(record, format!("{e:#}")).await,
        }
    }

    async fn poll(&self, connector: &dyn Connector, record: &AsyncTaskRecord) -> Result<TaskReadiness> {
        let auth = self
            .credentials
            .get_credentials(&record.connector_id)
            .await?
            .unwrap_or_default();
        let mut params = Params::new();
        params.insert("id".to_string(), json!(record.external_task_id));

        let call = connector.execute_action(TASK_READY_ACTION, &params, &auth);
        let response = if self.connector_timeout.is_zero() {
            call.await?
        } else {
            tokio::time::timeout(self.connector_timeout, call)
                .await
                .map_err(|_| marketflow_core::Error::Timeout {
                    connector: record.connector_id.clone(),
                    action: TASK_READY_ACTION.to_string(),
                    seconds: self.connector_timeout.as_secs(),
                })??
        };
        Ok(TaskReadiness::from_response(&response))
    }

    async fn settle_failed(
        &self,
        mut record: AsyncTaskRecord,
        message: String,
    ) -> Result<CheckOutcome> {
        record.fail(message.clone());
        self.store.update(&record).await?;
        error!(
            external_task_id = %record.external_task_id,
            run_id = %record.workflow_run_id,
            connector = %record.connector_id,
            error = %message,
            "Async task failed"
        );
        self.publish(TaskEvent::Failed {
            workflow_run_id: record.workflow_run_id,
            external_task_id: record.external_task_id,
            message,
        });
        Ok(CheckOutcome::Failed)
    }

    fn publish(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            warn!("No listener for task events");
        }
    }

    /// Delete settled tasks older than `days_old` days
    pub async fn cleanup_old_tasks(&self, days_old: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_old));
        let deleted = self.store.delete_terminal_before(cutoff).await?;
        info!(deleted, days_old, "Cleaned up old async tasks");
        Ok(deleted)
    }

    /// Queue an immediate check for every pending task that is due
    pub async fn recover_due(&self) -> Result<usize> {
        let due = self.store.list_due(Utc::now()).await?;
        for record in &due {
            self.scheduler.schedule(&record.external_task_id, Duration::ZERO);
        }
        if !due.is_empty() {
            info!(count = due.len(), "Recovered due async tasks");
        }
        Ok(due.len())
    }

    /// Consume the due queue until `cancel` fires.
    ///
    /// Checks for different tasks run concurrently.
    pub async fn run(
        self: Arc<Self>,
        mut due: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        info!("Async task worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = due.recv() => {
                    let Some(external_task_id) = next else { break };
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.check_task_status(&external_task_id).await {
                            error!(external_task_id = %external_task_id, error = %e, "Task check failed");
                        }
                    });
                }
            }
        }
        info!("Async task worker stopped");
    }

    /// Run [`cleanup_old_tasks`](Self::cleanup_old_tasks) every `every` until `cancel` fires
    pub async fn run_cleanup(self: Arc<Self>, every: Duration, days_old: u32, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup_old_tasks(days_old).await {
                        error!(error = %e, "Async task cleanup failed");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for AsyncTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTaskManager")
            .field("connectors", &self.connectors)
            .field("connector_timeout", &self.connector_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::InMemoryTaskStore;
    use async_trait::async_trait;
    use marketflow_core::connectors::ActionSchema;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(String, Duration)>>,
    }

    impl RecordingScheduler {
        fn calls(&self) -> Vec<(String, Duration)> {
            self.scheduled.lock().unwrap().clone()
        }
    }

    impl CheckScheduler for RecordingScheduler {
        fn schedule(&self, external_task_id: &str, delay: Duration) {
            self.scheduled
                .lock()
                .unwrap()
                .push((external_task_id.to_string(), delay));
        }
    }

    /// Answers `task_ready` with scripted responses, the last one repeating
    struct ScriptedConnector {
        responses: Vec<Value>,
        calls: AtomicU32,
    }

    impl ScriptedConnector {
        fn new(responses: Vec<Value>) -> Self {
            Self {
                responses,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn id(&self) -> &str {
            "dataforseo"
        }

        fn actions(&self) -> BTreeMap<String, ActionSchema> {
            BTreeMap::new()
        }

        async fn execute_action(
            &self,
            action_id: &str,
            params: &Params,
            auth: &Params,
        ) -> marketflow_core::Result<Value> {
            assert_eq!(action_id, TASK_READY_ACTION);
            assert_eq!(params["id"], "t1");
            if auth.get("login").is_none() {
                return Err(marketflow_core::Error::connector("dataforseo", "auth missing"));
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.responses[n.min(self.responses.len() - 1)].clone())
        }
    }

    struct Harness {
        manager: AsyncTaskManager,
        scheduler: Arc<RecordingScheduler>,
        events: mpsc::UnboundedReceiver<TaskEvent>,
    }

    fn harness(responses: Vec<Value>) -> Harness {
        let scheduler = Arc::new(RecordingScheduler::default());
        let (tx, events) = mpsc::unbounded_channel();
        let registry = ConnectorRegistry::new().with(ScriptedConnector::new(responses));
        let mut auth = Params::new();
        auth.insert("login".to_string(), json!("me"));
        let manager = AsyncTaskManager::new(
            Arc::new(InMemoryTaskStore::new()),
            registry,
            scheduler.clone(),
            tx,
        )
        .with_credentials(Arc::new(StaticCredentials::new().with("dataforseo", auth)));
        Harness {
            manager,
            scheduler,
            events,
        }
    }

    #[tokio::test]
    async fn test_schedule_creates_pending_record() {
        let h = harness(vec![json!({"ready": false})]);
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await
            .unwrap();

        let record = h.manager.store().get("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.workflow_run_id, "42");
        assert_eq!(h.scheduler.calls(), vec![("t1".to_string(), Duration::from_secs(30))]);

        let duplicate = h
            .manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_async_lifecycle() {
        let mut h = harness(vec![
            json!({"ready": false}),
            json!({"status": "completed", "result": {"rank": 3}}),
        ]);
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await
            .unwrap();
        let before = h.manager.store().get("t1").await.unwrap().unwrap();

        let outcome = h.manager.check_task_status("t1").await.unwrap();
        assert_eq!(outcome, CheckOutcome::Pending);
        let after = h.manager.store().get("t1").await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert!(after.next_check_at > before.next_check_at);
        assert_eq!(h.scheduler.calls().len(), 2);
        assert!(h.events.try_recv().is_err());

        let outcome = h.manager.check_task_status("t1").await.unwrap();
        assert_eq!(outcome, CheckOutcome::Completed);
        let done = h.manager.store().get("t1").await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result_data, Some(json!({"rank": 3})));

        // Settled tasks are not checked again
        assert_eq!(h.manager.check_task_status("t1").await.unwrap(), CheckOutcome::Skipped);

        let event = h.events.try_recv().unwrap();
        assert_eq!(
            event,
            TaskEvent::Completed {
                workflow_run_id: "42".to_string(),
                external_task_id: "t1".to_string(),
                result: json!({"rank": 3}),
            }
        );
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_huge_interval_is_capped() {
        let h = harness(vec![json!({"ready": false})]);
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", u64::MAX)
            .await
            .unwrap();

        assert_eq!(h.manager.check_task_status("t1").await.unwrap(), CheckOutcome::Pending);
        let cap = Duration::from_secs(marketflow_core::connectors::MAX_CHECK_INTERVAL_SECS);
        assert!(h.scheduler.calls().iter().all(|(_, delay)| *delay == cap));
        let record = h.manager.store().get("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_reported_failure_is_terminal() {
        let mut h = harness(vec![json!({"status": "failed", "error": "quota exceeded"})]);
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await
            .unwrap();

        assert_eq!(h.manager.check_task_status("t1").await.unwrap(), CheckOutcome::Failed);
        let record = h.manager.store().get("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("quota exceeded"));

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.clone().into_outcome(), TaskOutcome::Failed("quota exceeded".to_string()));
        assert_eq!(event.workflow_run_id(), "42");
        assert_eq!(h.scheduler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_connector_error_fails_task() {
        let mut h = harness(vec![json!({"ready": true})]);
        h.manager = h.manager.with_credentials(Arc::new(StaticCredentials::new()));
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await
            .unwrap();

        assert_eq!(h.manager.check_task_status("t1").await.unwrap(), CheckOutcome::Failed);
        let record = h.manager.store().get("t1").await.unwrap().unwrap();
        assert!(record.error_message.unwrap().contains("auth missing"));
        assert!(matches!(h.events.try_recv().unwrap(), TaskEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn test_missing_connector_fails_task() {
        let mut h = harness(vec![]);
        h.manager
            .schedule_task_check("t1", "ahrefs", "backlinks", "7", 30)
            .await
            .unwrap();

        assert_eq!(h.manager.check_task_status("t1").await.unwrap(), CheckOutcome::Failed);
        match h.events.try_recv().unwrap() {
            TaskEvent::Failed { message, .. } => assert!(message.contains("ahrefs")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_flight_check_is_skipped() {
        let h = harness(vec![json!({"ready": true})]);
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await
            .unwrap();

        let guard = InFlight::acquire(&h.manager.in_flight, "t1").unwrap();
        assert!(InFlight::acquire(&h.manager.in_flight, "t1").is_none());
        assert_eq!(h.manager.check_task_status("t1").await.unwrap(), CheckOutcome::Skipped);
        drop(guard);
        assert_eq!(h.manager.check_task_status("t1").await.unwrap(), CheckOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unknown_task_is_skipped() {
        let h = harness(vec![]);
        assert_eq!(h.manager.check_task_status("nope").await.unwrap(), CheckOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_recover_due() {
        let h = harness(vec![]);
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await
            .unwrap();
        assert_eq!(h.manager.recover_due().await.unwrap(), 1);
        assert_eq!(h.scheduler.calls().last().unwrap(), &("t1".to_string(), Duration::ZERO));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent() {
        let mut h = harness(vec![json!({"ready": true})]);
        h.manager
            .schedule_task_check("t1", "dataforseo", "serp_analysis", "42", 30)
            .await
            .unwrap();
        h.manager.check_task_status("t1").await.unwrap();
        h.events.try_recv().unwrap();

        assert_eq!(h.manager.cleanup_old_tasks(7).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.manager.cleanup_old_tasks(0).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_scheduler_fires_after_delay() {
        let cancel = CancellationToken::new();
        let (scheduler, mut due) = TimerScheduler::new(cancel.clone());
        scheduler.schedule("t1", Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(due.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(due.recv().await.unwrap(), "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_scheduler_cancelled() {
        let cancel = CancellationToken::new();
        let (scheduler, mut due) = TimerScheduler::new(cancel.clone());
        scheduler.schedule("t1", Duration::from_secs(30));
        cancel.cancel();
        drop(scheduler);
        assert!(due.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_task_event_serialization() {
        let event = TaskEvent::Failed {
            workflow_run_id: "r".to_string(),
            external_task_id: "t".to_string(),
            message: "m".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "failed");
        assert_eq!(event.external_task_id(), "t");
    }
}
