//! Workflow and run storage

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use marketflow_core::WorkflowDefinition;
use marketflow_core::config::load_workflow_dir;
use marketflow_core::engine::{RunStatus, WorkflowRun};
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::error::Result;

/// Workflow definitions keyed by id
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Fetch one definition
    async fn get(&self, id: &str) -> Result<Option<WorkflowDefinition>>;

    /// All definitions, ordered by id
    async fn list(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Create or replace a definition
    async fn save(&self, definition: &WorkflowDefinition) -> Result<()>;

    /// Remove a definition; false when it did not exist
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Runs that are, or were, waiting on an external task
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetch a run
    async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Create or replace a run
    async fn save(&self, run: &WorkflowRun) -> Result<()>;

    /// Runs in the given status
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<WorkflowRun>>;
}

/// In-process workflow store
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<BTreeMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `workflows`
    pub fn with_workflows(workflows: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let map = workflows.into_iter().map(|w| (w.id.clone(), w)).collect();
        Self {
            workflows: RwLock::new(map),
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn get(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self.workflows.read().await.values().cloned().collect())
    }

    async fn save(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.workflows
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.workflows.write().await.remove(id).is_some())
    }
}

/// Workflows kept as `*.json` files in a directory.
///
/// Files may have any name; new definitions are written to `<id>.json`.
#[derive(Debug, Clone)]
pub struct DirWorkflowStore {
    dir: PathBuf,
}

impl DirWorkflowStore {
    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the definitions
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &str) -> Result<Option<PathBuf>> {
        for entry in WalkDir::new(&self.dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let definition = WorkflowDefinition::from_file(path)
                .with_context(|| format!("Failed to read workflow {}", path.display()))?;
            if definition.id == id {
                return Ok(Some(path.to_path_buf()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl WorkflowStore for DirWorkflowStore {
    async fn get(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.list().await?.into_iter().find(|w| w.id == id))
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut workflows = load_workflow_dir(&self.dir)?;
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn save(&self, definition: &WorkflowDefinition) -> Result<()> {
        let path = match self.path_of(&definition.id)? {
            Some(path) => path,
            None => self.dir.join(format!("{}.json", definition.id)),
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(definition)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        match self.path_of(id)? {
            Some(path) => {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// In-process run store
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<BTreeMap<String, WorkflowRun>>,
}

impl InMemoryRunStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        self.runs
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<WorkflowRun>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<WorkflowRun> =
            runs.values().filter(|r| r.status == status).cloned().collect();
        matching.sort_by_key(|r| r.started_at);
        Ok(matching)
    }
}
