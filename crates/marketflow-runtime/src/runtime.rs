//! Runtime wiring
//!
//! Builds storage, engine, task manager and runner from a project
//! [`Config`] and runs the background loops until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::join_all;
use marketflow_core::config::StorageMode;
use marketflow_core::credentials::CredentialProvider;
use marketflow_core::{Config, ConnectorRegistry, FlowEngine};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::jobs::{JobScheduler, WorkflowJob};
use crate::manager::{AsyncTaskManager, TaskEvent, TimerScheduler};
use crate::postgres::{self, PgRunStore, PgTaskStore, PgWorkflowStore};
use crate::runner::Runner;
use crate::storage::{DirWorkflowStore, InMemoryRunStore, RunStore, WorkflowStore};
use crate::tasks::{InMemoryTaskStore, TaskStore};

/// Receivers handed to the background loops on start
struct Queues {
    due: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    jobs: mpsc::UnboundedReceiver<WorkflowJob>,
}

/// Runtime hosting workflow runs for one project
pub struct Runtime {
    config: Config,
    runner: Arc<Runner>,
    manager: Arc<AsyncTaskManager>,
    jobs: JobScheduler,
    cancel: CancellationToken,
    queues: Option<Queues>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Create a runtime for `config` with the given connectors.
    ///
    /// In postgres mode this connects, migrates the schema and copies the
    /// project's workflow directory into the database.
    pub async fn new(config: Config, connectors: ConnectorRegistry) -> Result<Self> {
        let dir_store = DirWorkflowStore::new(config.workflows_dir());
        let (workflows, runs, tasks): (Arc<dyn WorkflowStore>, Arc<dyn RunStore>, Arc<dyn TaskStore>) =
            match config.project.storage.mode {
                StorageMode::Memory => (
                    Arc::new(dir_store),
                    Arc::new(InMemoryRunStore::new()),
                    Arc::new(InMemoryTaskStore::new()),
                ),
                StorageMode::Postgres => {
                    let url = config
                        .project
                        .storage
                        .postgres_url
                        .as_deref()
                        .ok_or_else(|| anyhow!("storage.postgres_url is not set"))?;
                    let pool = postgres::connect(url).await?;
                    let workflows = PgWorkflowStore::new(pool.clone());
                    let seeded = dir_store.list().await?;
                    for definition in &seeded {
                        workflows.save(definition).await?;
                    }
                    tracing::info!(count = seeded.len(), "Loaded workflows into database");
                    (
                        Arc::new(workflows),
                        Arc::new(PgRunStore::new(pool.clone())),
                        Arc::new(PgTaskStore::new(pool)),
                    )
                }
            };

        let engine_config = config.engine_config();
        let credentials: Arc<dyn CredentialProvider> = Arc::new(config.credential_provider());
        let engine = FlowEngine::new(connectors.clone())
            .with_credentials(credentials.clone())
            .with_config(engine_config.clone());

        let cancel = CancellationToken::new();
        let (scheduler, due) = TimerScheduler::new(cancel.clone());
        let (events_tx, events) = mpsc::unbounded_channel();
        let manager = Arc::new(
            AsyncTaskManager::new(tasks, connectors, Arc::new(scheduler), events_tx)
                .with_credentials(credentials)
                .with_connector_timeout(Duration::from_secs(engine_config.connector_timeout_secs)),
        );
        let runner = Arc::new(Runner::new(engine, workflows, runs, manager.clone()));
        let (jobs, job_queue) = JobScheduler::new(cancel.clone());

        Ok(Self {
            config,
            runner,
            manager,
            jobs,
            cancel,
            queues: Some(Queues {
                due,
                events,
                jobs: job_queue,
            }),
            workers: Vec::new(),
        })
    }

    /// Start the background loops and recover due tasks
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(project = %self.config.project.name, "Starting Marketflow runtime");
        let Queues { due, events, jobs } = self
            .queues
            .take()
            .ok_or_else(|| anyhow!("runtime already started"))?;

        let tasks = &self.config.project.tasks;
        self.workers.push(tokio::spawn(
            self.manager.clone().run(due, self.cancel.clone()),
        ));
        self.workers.push(tokio::spawn(self.manager.clone().run_cleanup(
            Duration::from_secs(tasks.cleanup_interval_secs),
            tasks.cleanup_days,
            self.cancel.clone(),
        )));
        self.workers.push(tokio::spawn(
            self.runner.clone().listen(events, self.cancel.clone()),
        ));
        self.workers.push(tokio::spawn(
            self.runner.clone().process_jobs(jobs, self.cancel.clone()),
        ));

        self.manager.recover_due().await?;
        tracing::info!("Runtime started successfully");
        Ok(())
    }

    /// Stop the background loops and wait for them to finish
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!("Shutting down Marketflow runtime");
        self.cancel.cancel();
        for joined in join_all(self.workers.drain(..)).await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Runtime worker ended abnormally");
            }
        }
        tracing::info!("Runtime shutdown complete");
        Ok(())
    }

    /// The workflow runner
    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    /// The async task manager
    pub fn manager(&self) -> &Arc<AsyncTaskManager> {
        &self.manager
    }

    /// Submits workflow jobs
    pub fn jobs(&self) -> &JobScheduler {
        &self.jobs
    }

    /// Fires when the runtime shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The project configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
