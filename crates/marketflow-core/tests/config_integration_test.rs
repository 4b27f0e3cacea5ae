//! Integration tests for project loading
//!
//! Tests use temporary directories with real file fixtures to verify:
//! - Project config and workflow directory loading
//! - Engine settings and credentials flowing from the project file
//! - Static workflow validation across a project

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use marketflow_core::config::CONFIG_FILE;
use marketflow_core::connectors::{ActionSchema, Connector, ConnectorRegistry, EchoConnector};
use marketflow_core::engine::{GraphOrder, RunStatus};
use marketflow_core::transforms::Params;
use marketflow_core::{Config, DataProcessor, Error, FlowEngine, Result};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Helper to create a temporary project directory with standard structure.
fn setup_project(config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("workflows")).unwrap();
    std::fs::write(dir.path().join(CONFIG_FILE), config).unwrap();
    dir
}

fn write_workflow(dir: &TempDir, file: &str, workflow: Value) {
    std::fs::write(
        dir.path().join("workflows").join(file),
        serde_json::to_string_pretty(&workflow).unwrap(),
    )
    .unwrap();
}

/// Answers with the auth it was given
struct AuthEcho;

#[async_trait]
impl Connector for AuthEcho {
    fn id(&self) -> &str {
        "search_console"
    }

    fn actions(&self) -> BTreeMap<String, ActionSchema> {
        BTreeMap::from([("whoami".to_string(), ActionSchema::new("Return the auth"))])
    }

    async fn execute_action(&self, _action: &str, _params: &Params, auth: &Params) -> Result<Value> {
        Ok(Value::Object(auth.clone()))
    }
}

#[tokio::test]
async fn test_graph_project_end_to_end() {
    let dir = setup_project(
        r#"
name: seo-graph
engine:
  graph_order: topological
credentials:
  search_console:
    site: example.com
"#,
    );
    write_workflow(
        &dir,
        "graph.json",
        json!({
            "id": "graph",
            "name": "Keyword graph",
            "nodes": [
                {"id": "fetch", "connector_id": "echo", "action_id": "echo",
                 "params": {"keyword": "{{keyword}}"}},
                {"id": "account", "connector_id": "search_console", "action_id": "whoami"},
                {"id": "shape", "type": "mapper", "input_data": "shape_input",
                 "field_mapping": [{"source": "term", "target": "kw"}]}
            ],
            "connections": [
                {"source": "fetch", "target": "shape",
                 "mapping": [{"source": "keyword", "target": "term"}]}
            ]
        }),
    );

    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.engine_config().graph_order, GraphOrder::Topological);

    let workflows = config.load_workflows().unwrap();
    assert_eq!(workflows.len(), 1);
    let graph = &workflows[0];
    assert!(graph.is_graph());
    graph.ensure_valid(&DataProcessor::new()).unwrap();

    let engine = FlowEngine::new(ConnectorRegistry::new().with(EchoConnector).with(AuthEcho))
        .with_config(config.engine_config())
        .with_credentials(Arc::new(config.credential_provider()));
    let run = engine.execute_workflow(graph, json!({"keyword": "rust"})).await;

    assert_eq!(run.status, RunStatus::Completed);
    let order: Vec<&str> = run.step_results.keys().map(String::as_str).collect();
    assert_eq!(order, vec!["fetch", "account", "shape"]);
    assert_eq!(run.step_results["account"], json!({"site": "example.com"}));
    assert_eq!(run.step_results["shape"], json!({"result": {"kw": "rust"}}));
}

#[test]
fn test_project_validation_problems() {
    let dir = setup_project("name: broken\n");
    write_workflow(
        &dir,
        "broken.json",
        json!({
            "id": "broken",
            "name": "Broken",
            "nodes": [
                {"id": "a", "type": "action"},
                {"id": "a", "type": "validator",
                 "validation_rules": {"email": [{"rule": "looks_nice"}]}},
                {"id": "b", "type": "transformer",
                 "transformations": [{"field": "x", "function": "shout"}]}
            ],
            "connections": [{"source": "a", "target": "ghost"}]
        }),
    );

    let config = Config::load(dir.path()).unwrap();
    let workflow = &config.load_workflows().unwrap()[0];
    let problems = workflow.validate(&DataProcessor::new());

    assert!(problems.iter().any(|p| p.contains("duplicate unit id 'a'")));
    assert!(problems.iter().any(|p| p.contains("connector_id")));
    assert!(problems.iter().any(|p| p.contains("looks_nice")));
    assert!(problems.iter().any(|p| p.contains("shout")));
    assert!(problems.iter().any(|p| p.contains("ghost")));

    let err = workflow.ensure_valid(&DataProcessor::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidWorkflow { ref workflow_id, .. } if workflow_id == "broken"));
}

#[test]
fn test_invalid_yaml_is_a_parse_error() {
    let dir = setup_project("name: [unterminated\n");
    let err = Config::load(dir.path()).unwrap_err();
    assert!(matches!(err, Error::ConfigParse(_)));
}

#[test]
fn test_config_file_path_sets_base() {
    let dir = setup_project("name: by-file\nstorage:\n  workflows_dir: flows\n");
    let config = Config::load(dir.path().join(CONFIG_FILE)).unwrap();
    assert_eq!(config.base_path, dir.path());
    assert_eq!(config.workflows_dir(), dir.path().join("flows"));
    assert!(config.load_workflows().unwrap().is_empty());
}
