//! Project configuration
//!
//! A project is a directory holding `marketflow.yaml` and a directory of
//! workflow definitions (`workflows/*.json` by default).
//!
//! ```yaml
//! name: seo-automation
//! engine:
//!   connector_timeout_secs: 30
//!   graph_order: post_order
//! tasks:
//!   check_interval_secs: 30
//!   cleanup_days: 7
//! storage:
//!   mode: postgres
//!   postgres_url: postgres://localhost/marketflow
//! credentials:
//!   dataforseo: { login: me, password: secret }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::credentials::{ChainedCredentials, EnvCredentials, StaticCredentials};
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::transforms::Params;
use crate::workflow::WorkflowDefinition;

/// File name looked up when [`Config::load`] is given a directory
pub const CONFIG_FILE: &str = "marketflow.yaml";

/// Root project configuration from `marketflow.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name
    pub name: String,

    /// Project version
    #[serde(default = "default_version")]
    pub version: String,

    /// Flow engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Async task polling and cleanup
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Where workflows, runs and tasks are kept
    #[serde(default)]
    pub storage: StorageConfig,

    /// Connector credentials for local development
    #[serde(default)]
    pub credentials: HashMap<String, Params>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Async task settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Default seconds between readiness checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Age in days after which settled tasks are deleted
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u32,

    /// Seconds between cleanup sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            cleanup_days: default_cleanup_days(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_check_interval() -> u64 {
    30
}

fn default_cleanup_days() -> u32 {
    7
}

fn default_cleanup_interval() -> u64 {
    86_400
}

/// Storage backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// In-process maps, workflows read from `workflows_dir`
    #[default]
    Memory,
    /// PostgreSQL via `postgres_url`
    Postgres,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend
    #[serde(default)]
    pub mode: StorageMode,

    /// Workflow directory, relative to the project
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,

    /// PostgreSQL connection URL
    #[serde(default)]
    pub postgres_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            workflows_dir: default_workflows_dir(),
            postgres_url: None,
        }
    }
}

fn default_workflows_dir() -> String {
    "workflows".to_string()
}

/// Main configuration container
#[derive(Debug, Clone)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Base path of the project
    pub base_path: PathBuf,
}

impl Config {
    /// Load configuration from a project directory or a `marketflow.yaml`
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let config = Config::load("./my-project")?;
    /// println!("Project: {}", config.project.name);
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let (config_path, base_path) = if path.is_dir() {
            (path.join(CONFIG_FILE), path.to_path_buf())
        } else {
            (
                path.to_path_buf(),
                path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            )
        };

        if !config_path.exists() {
            return Err(Error::ConfigNotFound {
                path: config_path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(&config_path)?;
        let project: ProjectConfig = serde_yaml::from_str(&contents)?;
        let config = Self { project, base_path };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.project.name.trim().is_empty() {
            return Err(Error::ConfigInvalid {
                message: "project name must not be empty".to_string(),
            });
        }
        if self.project.storage.mode == StorageMode::Postgres
            && self.project.storage.postgres_url.is_none()
        {
            return Err(Error::ConfigInvalid {
                message: "storage.mode is postgres but storage.postgres_url is not set"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Engine settings with the task poll interval folded in
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_check_interval_secs: self.project.tasks.check_interval_secs,
            ..self.project.engine.clone()
        }
    }

    /// Absolute path of the workflow directory
    pub fn workflows_dir(&self) -> PathBuf {
        self.base_path.join(&self.project.storage.workflows_dir)
    }

    /// Load every `*.json` under the workflow directory, sorted by path
    pub fn load_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        load_workflow_dir(self.workflows_dir())
    }

    /// Environment credentials first, then the ones in the project file
    pub fn credential_provider(&self) -> ChainedCredentials {
        ChainedCredentials::new()
            .then(EnvCredentials)
            .then(StaticCredentials::from(self.project.credentials.clone()))
    }
}

/// Load every `*.json` under `dir` (recursively), sorted by path.
///
/// A missing directory holds no workflows.
pub fn load_workflow_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<WorkflowDefinition>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            WorkflowDefinition::from_file(path).map_err(|e| Error::InvalidWorkflow {
                workflow_id: path.display().to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GraphOrder;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let config: ProjectConfig = serde_yaml::from_str("name: test-project\n").unwrap();
        assert_eq!(config.name, "test-project");
        assert_eq!(config.version, "0.1.0");
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.tasks.cleanup_days, 7);
        assert_eq!(config.storage.mode, StorageMode::Memory);
        assert_eq!(config.storage.workflows_dir, "workflows");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
name: seo
version: "1.0.0"
engine:
  connector_timeout_secs: 10
  retry_attempts: 1
  retry_delay_ms: 5
  graph_order: topological
tasks:
  check_interval_secs: 60
  cleanup_days: 3
storage:
  mode: postgres
  postgres_url: postgres://localhost/marketflow
credentials:
  dataforseo:
    login: me
    password: secret
"#;
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.connector_timeout_secs, 10);
        assert_eq!(config.engine.graph_order, GraphOrder::Topological);
        assert_eq!(config.tasks.check_interval_secs, 60);
        assert_eq!(config.tasks.cleanup_interval_secs, 86_400);
        assert_eq!(config.storage.mode, StorageMode::Postgres);
        assert_eq!(config.credentials["dataforseo"]["login"], "me");
    }

    #[test]
    fn test_load_missing_config() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[test]
    fn test_postgres_mode_needs_url() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "name: p\nstorage:\n  mode: postgres\n",
        )
        .unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_load_workflows_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("workflows/nested")).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "name: test\n").unwrap();
        std::fs::write(
            dir.path().join("workflows/b.json"),
            r#"{"id": "b", "steps": []}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("workflows/nested/a.json"),
            r#"{"id": "nested", "steps": []}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("workflows/notes.txt"), "ignored").unwrap();

        let config = Config::load(dir.path()).unwrap();
        let ids: Vec<String> = config
            .load_workflows()
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["b", "nested"]);
    }

    #[test]
    fn test_bad_workflow_names_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("workflows")).unwrap();
        std::fs::write(dir.path().join("workflows/broken.json"), "{").unwrap();
        let err = load_workflow_dir(dir.path().join("workflows")).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[tokio::test]
    async fn test_credentials_from_project_file() {
        use crate::credentials::CredentialProvider;

        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "name: p\ncredentials:\n  local_test_conn:\n    api_key: k\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        let auth = config
            .credential_provider()
            .get_credentials("local_test_conn")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(auth["api_key"], "k");
    }
}
