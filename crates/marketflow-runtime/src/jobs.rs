//! Workflow jobs and their scheduling

use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Job to run a workflow once with an input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJob {
    /// Workflow identifier
    pub workflow_id: String,

    /// Run input
    pub input: Value,

    /// Job metadata
    pub metadata: JobMetadata,
}

/// Job metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobMetadata {
    /// Who submitted the job
    pub source: Option<String>,

    /// Caller-supplied key
    pub key: Option<String>,

    /// Submission time, unix seconds
    pub timestamp: Option<i64>,

    /// Retry count
    pub retry_count: u32,
}

impl WorkflowJob {
    /// Create a new workflow job
    pub fn new(workflow_id: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input,
            metadata: JobMetadata::default(),
        }
    }

    /// Set the job key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.metadata.key = Some(key.into());
        self
    }

    /// Set the submitter
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }
}

/// Sends jobs to the runner's job loop
#[derive(Debug, Clone)]
pub struct JobScheduler {
    sender: mpsc::UnboundedSender<WorkflowJob>,
    cancel: CancellationToken,
}

impl JobScheduler {
    /// Create a scheduler and the job queue it feeds.
    ///
    /// Delayed and recurring jobs stop once `cancel` fires.
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<WorkflowJob>) {
        let (sender, queue) = mpsc::unbounded_channel();
        (Self { sender, cancel }, queue)
    }

    /// Queue a job now
    pub fn submit(&self, mut job: WorkflowJob) -> Result<()> {
        job.metadata
            .timestamp
            .get_or_insert_with(|| chrono::Utc::now().timestamp());
        tracing::debug!(workflow_id = %job.workflow_id, "Submitting workflow job");
        self.sender
            .send(job)
            .map_err(|_| anyhow!("job queue is closed"))
    }

    /// Queue a job once `delay` has passed
    pub fn schedule_once(&self, job: WorkflowJob, delay: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scheduler.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = scheduler.submit(job) {
                        tracing::warn!(error = %e, "Dropped scheduled job");
                    }
                }
            }
        })
    }

    /// Queue a copy of the job every `interval`, first after one interval
    pub fn schedule_every(&self, job: WorkflowJob, interval: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut next = job.clone();
                        next.metadata.timestamp = None;
                        if let Err(e) = scheduler.submit(next) {
                            tracing::warn!(error = %e, "Stopping recurring job");
                            break;
                        }
                    }
                }
            }
        })
    }
}
