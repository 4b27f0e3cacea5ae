//! Workflow execution
//!
//! [`FlowEngine`] runs one workflow at a time on a single logical thread of
//! control: units execute strictly one after another. Each unit's result is
//! recorded under its id in both `step_results` and the context that later
//! units substitute placeholders from.
//!
//! A unit that fails is handled by its `error_handling` policy:
//!
//! - `abort` stops the run; results so far are kept and `error` names the unit
//! - `continue` records `{"success": false, "error": ..}` and moves on
//! - `retry` re-executes up to `retry_attempts` more times, then aborts
//!
//! Configuration errors (unknown step type, transform or rule) always abort.
//!
//! When a connector answers with a pending marker the run is suspended and
//! returned with a cursor; [`FlowEngine::resume`] continues it once the
//! external task settles.

mod events;
mod executor;
mod graph;
mod run;
mod units;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connectors::{ConnectorRegistry, EchoConnector};
use crate::credentials::{CredentialProvider, StaticCredentials};
use crate::error::{Error, Result};
use crate::processor::DataProcessor;
use crate::workflow::{ErrorHandling, StepDefinition, WorkflowBody, WorkflowDefinition};

pub use events::{ChannelNotifier, ExecutionNotifier, NoopNotifier, RunEvent};
pub use executor::{Executor, LinearExecutor};
pub use graph::{GraphExecutor, GraphOrder};
pub use run::{PendingTask, RunFailure, RunStatus, WorkflowRun};

use units::UnitOutcome;

/// Engine settings, the `engine:` section of `marketflow.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Limit per connector call; 0 disables it
    #[serde(default = "default_connector_timeout")]
    pub connector_timeout_secs: u64,

    /// Extra attempts for `error_handling: retry`
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Pause between attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Node ordering for graph workflows
    #[serde(default)]
    pub graph_order: GraphOrder,

    /// Poll interval for pending tasks that do not name one. Filled from
    /// the `tasks:` section.
    #[serde(skip, default = "default_check_interval")]
    pub default_check_interval_secs: u64,
}

fn default_connector_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_check_interval() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connector_timeout_secs: default_connector_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
            graph_order: GraphOrder::default(),
            default_check_interval_secs: default_check_interval(),
        }
    }
}

/// How an external task ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task produced this result
    Completed(Value),
    /// The task failed with this message
    Failed(String),
}

/// Executes workflow definitions
#[derive(Clone)]
pub struct FlowEngine {
    connectors: ConnectorRegistry,
    processor: DataProcessor,
    credentials: Arc<dyn CredentialProvider>,
    notifier: Arc<dyn ExecutionNotifier>,
    config: EngineConfig,
}

impl Default for FlowEngine {
    /// Engine with only the local `echo` connector
    fn default() -> Self {
        Self::new(ConnectorRegistry::new().with(EchoConnector))
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("connectors", &self.connectors)
            .field("processor", &self.processor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FlowEngine {
    /// Engine over `connectors` with default settings and no credentials
    pub fn new(connectors: ConnectorRegistry) -> Self {
        Self {
            connectors,
            processor: DataProcessor::new(),
            credentials: Arc::new(StaticCredentials::new()),
            notifier: Arc::new(NoopNotifier),
            config: EngineConfig::default(),
        }
    }

    /// Use a custom data processor
    pub fn with_processor(mut self, processor: DataProcessor) -> Self {
        self.processor = processor;
        self
    }

    /// Use a credential provider
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Report events to `notifier`
    pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Apply engine settings
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The data processor
    pub fn processor(&self) -> &DataProcessor {
        &self.processor
    }

    /// The connector registry
    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Run `definition` from the start.
    ///
    /// The returned run is `completed`, `failed` (with `error` set and the
    /// results gathered so far) or `suspended` on an external task.
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> WorkflowRun {
        let mut run = WorkflowRun::start(&definition.id, definition.fingerprint(), input);
        tracing::info!(
            workflow_id = %definition.id,
            run_id = %run.run_id,
            graph = definition.is_graph(),
            "Starting workflow run"
        );
        self.notifier.notify(RunEvent::RunStarted {
            run_id: run.run_id.clone(),
            workflow_id: definition.id.clone(),
        });

        let executor = self.executor_for(definition);
        let plan = executor.plan(definition);
        self.drive(definition, executor.as_ref(), &plan, &mut run).await;
        run
    }

    /// Continue a suspended run once its external task settled.
    ///
    /// A completed task becomes the waiting unit's result. A failed task is
    /// handled by that unit's policy as an `AsyncTaskFailed` error, except
    /// that it is never retried.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        mut run: WorkflowRun,
        outcome: TaskOutcome,
    ) -> Result<WorkflowRun> {
        let invalid = |message: String| Error::InvalidWorkflow {
            workflow_id: definition.id.clone(),
            message,
        };
        if run.workflow_id != definition.id {
            return Err(invalid(format!(
                "run {} belongs to workflow '{}'",
                run.run_id, run.workflow_id
            )));
        }
        if run.fingerprint != definition.fingerprint() {
            return Err(invalid(format!(
                "definition changed while run {} was suspended",
                run.run_id
            )));
        }
        let pending = match (run.status, run.pending.take()) {
            (RunStatus::Suspended, Some(pending)) => pending,
            (status, _) => {
                return Err(invalid(format!(
                    "run {} is {}, not suspended",
                    run.run_id,
                    status.as_str()
                )));
            }
        };

        let executor = self.executor_for(definition);
        let plan = executor.plan(definition);
        let unit = plan
            .get(run.cursor)
            .and_then(|&i| definition.units().get(i))
            .filter(|unit| unit.id == pending.step_id)
            .ok_or_else(|| {
                invalid(format!(
                    "run {} cursor does not point at '{}'",
                    run.run_id, pending.step_id
                ))
            })?;

        tracing::info!(
            workflow_id = %definition.id,
            run_id = %run.run_id,
            step_id = %unit.id,
            external_task_id = %pending.external_task_id,
            "Resuming workflow run"
        );
        run.status = RunStatus::Running;
        self.notifier.notify(RunEvent::RunResumed {
            run_id: run.run_id.clone(),
            step_id: unit.id.clone(),
        });

        match outcome {
            TaskOutcome::Completed(result) => {
                self.settle(definition, executor.as_ref(), unit, result, &mut run);
            }
            TaskOutcome::Failed(message) => {
                let error = Error::AsyncTaskFailed {
                    task_id: pending.external_task_id.clone(),
                    message,
                };
                if unit.error_handling == ErrorHandling::Continue {
                    self.capture(unit, &error, &mut run);
                } else {
                    self.abort(unit, &error, &mut run);
                    return Ok(run);
                }
            }
        }
        run.cursor += 1;
        self.drive(definition, executor.as_ref(), &plan, &mut run).await;
        Ok(run)
    }

    fn executor_for(&self, definition: &WorkflowDefinition) -> Box<dyn Executor> {
        match definition.body {
            WorkflowBody::Steps(_) => Box::new(LinearExecutor),
            WorkflowBody::Graph { .. } => Box::new(GraphExecutor::new(self.config.graph_order)),
        }
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        executor: &dyn Executor,
        plan: &[usize],
        run: &mut WorkflowRun,
    ) {
        while let Some(unit) = plan
            .get(run.cursor)
            .and_then(|&i| definition.units().get(i))
        {
            tracing::debug!(run_id = %run.run_id, step_id = %unit.id, "Executing unit");
            self.notifier.notify(RunEvent::StepStarted {
                run_id: run.run_id.clone(),
                step_id: unit.id.clone(),
            });

            match self.execute_with_policy(unit, &run.context).await {
                Ok(UnitOutcome::Done(result)) => {
                    self.settle(definition, executor, unit, result, run);
                }
                Ok(UnitOutcome::Pending {
                    connector_id,
                    action_id,
                    marker,
                }) => {
                    tracing::info!(
                        run_id = %run.run_id,
                        step_id = %unit.id,
                        external_task_id = %marker.task_id,
                        "Workflow run suspended on external task"
                    );
                    self.notifier.notify(RunEvent::RunSuspended {
                        run_id: run.run_id.clone(),
                        step_id: unit.id.clone(),
                        external_task_id: marker.task_id.clone(),
                    });
                    run.suspend(PendingTask {
                        external_task_id: marker.task_id,
                        connector_id,
                        action_id,
                        step_id: unit.id.clone(),
                        check_interval_secs: marker
                            .check_interval_secs
                            .unwrap_or(self.config.default_check_interval_secs),
                    });
                    return;
                }
                Err(error) => {
                    if error.is_configuration_error()
                        || unit.error_handling != ErrorHandling::Continue
                    {
                        self.abort(unit, &error, run);
                        return;
                    }
                    self.capture(unit, &error, run);
                }
            }
            run.cursor += 1;
        }

        run.complete();
        tracing::info!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            steps = run.step_results.len(),
            "Workflow run completed"
        );
        self.notifier.notify(RunEvent::RunCompleted {
            run_id: run.run_id.clone(),
        });
    }

    /// Execute once, or several times for `retry` units
    async fn execute_with_policy(
        &self,
        unit: &StepDefinition,
        context: &Value,
    ) -> Result<UnitOutcome> {
        let attempts = match unit.error_handling {
            ErrorHandling::Retry => 1 + self.config.retry_attempts,
            _ => 1,
        };
        let mut attempt = 1;
        loop {
            match self.execute_unit(unit, context).await {
                Err(error) if attempt < attempts && !error.is_configuration_error() => {
                    tracing::warn!(
                        step_id = %unit.id,
                        attempt,
                        error = %error,
                        "Unit failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
                other => return other,
            }
        }
    }

    fn settle(
        &self,
        definition: &WorkflowDefinition,
        executor: &dyn Executor,
        unit: &StepDefinition,
        result: Value,
        run: &mut WorkflowRun,
    ) {
        self.notifier.notify(RunEvent::StepCompleted {
            run_id: run.run_id.clone(),
            step_id: unit.id.clone(),
            result: result.clone(),
        });
        run.record(&unit.id, result.clone());
        executor.propagate(definition, &unit.id, &result, run, &self.processor);
    }

    fn capture(&self, unit: &StepDefinition, error: &Error, run: &mut WorkflowRun) {
        let message = error.to_string();
        tracing::warn!(
            run_id = %run.run_id,
            step_id = %unit.id,
            error = %message,
            "Unit failed, continuing"
        );
        self.notifier.notify(RunEvent::StepFailed {
            run_id: run.run_id.clone(),
            step_id: unit.id.clone(),
            error: message.clone(),
        });
        run.record_captured_error(&unit.id, &message);
    }

    fn abort(&self, unit: &StepDefinition, error: &Error, run: &mut WorkflowRun) {
        let message = error.to_string();
        tracing::error!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            step_id = %unit.id,
            error = %message,
            "Workflow run aborted"
        );
        self.notifier.notify(RunEvent::RunFailed {
            run_id: run.run_id.clone(),
            step_id: unit.id.clone(),
            error: message.clone(),
        });
        run.fail(&unit.id, message);
    }
}
