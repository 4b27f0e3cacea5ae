//! Workflow runner
//!
//! Loads workflows from a [`WorkflowStore`], runs them on the
//! [`FlowEngine`] and parks suspended runs in a [`RunStore`] until the
//! [`AsyncTaskManager`] reports their external task settled.

use std::sync::Arc;

use anyhow::{anyhow, bail};
use marketflow_core::engine::{FlowEngine, RunStatus, TaskOutcome, WorkflowRun};
use marketflow_core::WorkflowDefinition;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::jobs::WorkflowJob;
use crate::manager::{AsyncTaskManager, TaskEvent};
use crate::storage::{RunStore, WorkflowStore};

/// Runs workflows and resumes them after external tasks
pub struct Runner {
    engine: FlowEngine,
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    tasks: Arc<AsyncTaskManager>,
}

impl Runner {
    /// Create a runner
    pub fn new(
        engine: FlowEngine,
        workflows: Arc<dyn WorkflowStore>,
        runs: Arc<dyn RunStore>,
        tasks: Arc<AsyncTaskManager>,
    ) -> Self {
        Self {
            engine,
            workflows,
            runs,
            tasks,
        }
    }

    /// The flow engine
    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    /// The workflow store
    pub fn workflows(&self) -> &Arc<dyn WorkflowStore> {
        &self.workflows
    }

    /// The run store
    pub fn runs(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    /// The async task manager
    pub fn tasks(&self) -> &Arc<AsyncTaskManager> {
        &self.tasks
    }

    /// Load a stored workflow and run it
    pub async fn run_workflow(&self, workflow_id: &str, input: Value) -> Result<WorkflowRun> {
        let definition = self.load(workflow_id).await?;
        self.run_definition(&definition, input).await
    }

    /// Run a definition that need not be stored.
    ///
    /// A run that suspends can only be resumed when the definition is
    /// also in the workflow store.
    pub async fn run_definition(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<WorkflowRun> {
        let run = self.engine.execute_workflow(definition, input).await;
        self.park(run, false).await
    }

    /// Resume the run waiting on an external task.
    ///
    /// When the run can no longer be resumed (its workflow was removed or
    /// changed) it is stored as failed at the waiting unit.
    pub async fn continue_after_async_task(
        &self,
        workflow_run_id: &str,
        outcome: TaskOutcome,
    ) -> Result<WorkflowRun> {
        let run = self
            .runs
            .get(workflow_run_id)
            .await?
            .ok_or_else(|| anyhow!("run '{workflow_run_id}' not found"))?;
        if run.status != RunStatus::Suspended {
            bail!(
                "run '{workflow_run_id}' is {}, not suspended",
                run.status.as_str()
            );
        }

        let resumed = match self.workflows.get(&run.workflow_id).await? {
            Some(definition) => {
                info!(
                    run_id = workflow_run_id,
                    workflow_id = %definition.id,
                    "Task settled, continuing run"
                );
                self.engine
                    .resume(&definition, run.clone(), outcome)
                    .await
                    .map_err(anyhow::Error::from)
            }
            None => Err(anyhow!("workflow '{}' not found", run.workflow_id)),
        };

        match resumed {
            Ok(resumed) => self.park(resumed, true).await,
            Err(e) => {
                let step_id = run
                    .pending
                    .as_ref()
                    .map(|pending| pending.step_id.clone())
                    .unwrap_or_default();
                let mut failed = run;
                failed.fail(&step_id, format!("{e:#}"));
                self.runs.save(&failed).await?;
                Err(e.context(format!("Failed to resume run {workflow_run_id}")))
            }
        }
    }

    /// Resume runs as task events arrive, until `cancel` fires; each
    /// continuation runs on its own task
    pub async fn listen(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TaskEvent>,
        cancel: CancellationToken,
    ) {
        info!("Task event listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => {
                    let Some(event) = next else { break };
                    let runner = Arc::clone(&self);
                    tokio::spawn(async move {
                        let run_id = event.workflow_run_id().to_string();
                        if let Err(e) = runner.continue_after_async_task(&run_id, event.into_outcome()).await {
                            error!(run_id = %run_id, error = %format!("{e:#}"), "Failed to continue workflow run");
                        }
                    });
                }
            }
        }
        info!("Task event listener stopped");
    }

    /// Run each queued job until `cancel` fires; jobs run concurrently
    pub async fn process_jobs(
        self: Arc<Self>,
        mut jobs: mpsc::UnboundedReceiver<WorkflowJob>,
        cancel: CancellationToken,
    ) {
        info!("Job loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = jobs.recv() => {
                    let Some(job) = next else { break };
                    let runner = Arc::clone(&self);
                    tokio::spawn(async move {
                        match runner.run_workflow(&job.workflow_id, job.input).await {
                            Ok(run) => info!(
                                workflow_id = %job.workflow_id,
                                run_id = %run.run_id,
                                status = run.status.as_str(),
                                "Workflow job finished"
                            ),
                            Err(e) => error!(
                                workflow_id = %job.workflow_id,
                                error = %format!("{e:#}"),
                                "Workflow job failed"
                            ),
                        }
                    });
                }
            }
        }
        info!("Job loop stopped");
    }

    async fn load(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        self.workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| anyhow!("workflow '{workflow_id}' not found"))
    }

    /// Store a suspended run and schedule its task check; a resumed run is
    /// stored in whatever state it reached.
    async fn park(&self, run: WorkflowRun, resumed: bool) -> Result<WorkflowRun> {
        if run.status != RunStatus::Suspended {
            if resumed {
                self.runs.save(&run).await?;
            }
            return Ok(run);
        }

        let pending = run
            .pending
            .as_ref()
            .ok_or_else(|| anyhow!("suspended run '{}' has no pending task", run.run_id))?;
        self.runs.save(&run).await?;
        self.tasks
            .schedule_task_check(
                &pending.external_task_id,
                &pending.connector_id,
                &pending.action_id,
                &run.run_id,
                pending.check_interval_secs,
            )
            .await?;
        Ok(run)
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}
