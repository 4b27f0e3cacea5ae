//! Integration tests for the flow engine
//!
//! Covers:
//! - Linear and graph workflows parsed from the JSON wire format
//! - Error policies (abort, continue, retry) and configuration errors
//! - Connector timeouts and credentials
//! - Suspension on a pending marker and resumption

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use marketflow_core::connectors::{ActionSchema, Connector, ConnectorRegistry, EchoConnector};
use marketflow_core::credentials::StaticCredentials;
use marketflow_core::engine::{
    ChannelNotifier, EngineConfig, GraphOrder, RunEvent, RunStatus, TaskOutcome,
};
use marketflow_core::transforms::Params;
use marketflow_core::{Error, FlowEngine, Result, WorkflowDefinition};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Fails until it has been called `succeed_on` times
struct FlakyConnector {
    calls: AtomicU32,
    succeed_on: u32,
}

#[async_trait]
impl Connector for FlakyConnector {
    fn id(&self) -> &str {
        "flaky"
    }

    fn actions(&self) -> BTreeMap<String, ActionSchema> {
        BTreeMap::from([("call".to_string(), ActionSchema::new("flaky call"))])
    }

    async fn execute_action(&self, _action: &str, _params: &Params, _auth: &Params) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            Err(Error::connector("flaky", format!("attempt {} failed", call)))
        } else {
            Ok(json!({"attempts": call}))
        }
    }
}

/// Never answers in time
struct SlowConnector;

#[async_trait]
impl Connector for SlowConnector {
    fn id(&self) -> &str {
        "slow"
    }

    fn actions(&self) -> BTreeMap<String, ActionSchema> {
        BTreeMap::new()
    }

    async fn execute_action(&self, _action: &str, _params: &Params, _auth: &Params) -> Result<Value> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

/// Returns the auth map it was given
struct WhoAmIConnector;

#[async_trait]
impl Connector for WhoAmIConnector {
    fn id(&self) -> &str {
        "whoami"
    }

    fn actions(&self) -> BTreeMap<String, ActionSchema> {
        BTreeMap::new()
    }

    async fn execute_action(&self, _action: &str, _params: &Params, auth: &Params) -> Result<Value> {
        Ok(Value::Object(auth.clone()))
    }
}

fn workflow(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_delay_ms: 1,
        ..EngineConfig::default()
    }
}

// =============================================================================
// Linear workflows
// =============================================================================

#[tokio::test]
async fn test_linear_pipeline_end_to_end() {
    let def = workflow(json!({
        "id": "profile",
        "name": "Profile cleanup",
        "steps": [
            {"id": "fetch", "type": "connector", "connector_id": "echo", "action_id": "echo",
             "params": {"user": {"profile": {"name": "{{name}}", "email": "{{email}}"}}}},
            {"id": "map", "type": "mapper", "input_data": "fetch",
             "field_mapping": [
                {"source": "user.profile.name", "target": "full_name"},
                {"source": "user.profile.email", "target": "email"}
             ]},
            {"id": "clean", "type": "transformer", "input_data": "{{ map.result }}",
             "transformations": [
                {"field": "full_name", "function": "uppercase"},
                {"field": "email", "function": "lowercase"}
             ]},
            {"id": "check", "type": "validator", "input_data": "clean.result",
             "validation_rules": {
                "full_name": [{"rule": "required"}],
                "email": [{"rule": "email"}]
             }},
            {"id": "greet", "type": "transformer", "template": "Hello {{clean.result.full_name}}"}
        ]
    }));

    let run = FlowEngine::default()
        .execute_workflow(&def, json!({"name": "john", "email": "JOHN@EX.COM"}))
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.success);
    assert_eq!(
        run.step_results["clean"]["result"],
        json!({"full_name": "JOHN", "email": "john@ex.com"})
    );
    assert_eq!(run.step_results["check"], json!({"valid": true, "errors": []}));
    assert_eq!(run.step_results["greet"]["result"], "Hello JOHN");
    assert_eq!(run.context["name"], "john");
}

#[tokio::test]
async fn test_validator_abort_keeps_partial_results() {
    let def = workflow(json!({
        "id": "w",
        "steps": [
            {"id": "fetch", "connector_id": "echo", "action_id": "echo", "params": {"full_name": "JOHN"}},
            {"id": "check", "type": "validator", "input_data": "fetch",
             "validation_rules": {"email": [{"rule": "email"}]}},
            {"id": "never", "connector_id": "echo", "action_id": "echo"}
        ]
    }));

    let run = FlowEngine::default().execute_workflow(&def, json!({})).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(!run.success);
    let keys: Vec<&String> = run.step_results.keys().collect();
    assert_eq!(keys, vec!["fetch"]);
    let error = run.error.unwrap();
    assert_eq!(error.step_id, "check");
    assert!(error.message.contains("Field \"email\""));
}

#[tokio::test]
async fn test_continue_policy_captures_error() {
    let def = workflow(json!({
        "id": "w",
        "steps": [
            {"id": "boom", "connector_id": "echo", "action_id": "fail",
             "params": {"message": "rate limited"}, "error_handling": "continue"},
            {"id": "after", "connector_id": "echo", "action_id": "echo", "params": {"ok": true}}
        ]
    }));

    let run = FlowEngine::default().execute_workflow(&def, json!({})).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results["boom"]["success"], false);
    assert_eq!(
        run.step_results["boom"]["error"],
        "connector 'echo' error: rate limited"
    );
    assert_eq!(run.step_results["after"], json!({"ok": true}));
}

#[tokio::test]
async fn test_continue_policy_captures_transform_error() {
    let def = workflow(json!({
        "id": "w",
        "steps": [
            {"id": "decode", "type": "transformer", "error_handling": "continue",
             "transformations": [{"field": "payload", "function": "json_decode"}]},
            {"id": "after", "type": "transformer", "template": "still {{keyword}}"}
        ]
    }));

    let run = FlowEngine::default()
        .execute_workflow(&def, json!({"keyword": "rust", "payload": "{not json"}))
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results["decode"]["success"], false);
    let error = run.step_results["decode"]["error"].as_str().unwrap();
    assert!(error.starts_with("transform error in 'json_decode'"));
    assert_eq!(run.step_results["after"]["result"], "still rust");
}

#[tokio::test]
async fn test_configuration_error_aborts_despite_continue() {
    let def = workflow(json!({
        "id": "w",
        "steps": [
            {"id": "t", "type": "transformer", "error_handling": "continue",
             "transformations": [{"field": "a", "function": "shout"}]},
            {"id": "after", "connector_id": "echo", "action_id": "echo"}
        ]
    }));

    let run = FlowEngine::default()
        .execute_workflow(&def, json!({"a": "x"}))
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().message.contains("unknown transform function: shout"));
    assert!(run.step_results.is_empty());
}

#[tokio::test]
async fn test_unknown_connector_aborts() {
    let def = workflow(json!({
        "id": "w",
        "steps": [{"id": "gpt", "connector_id": "openai", "action_id": "complete"}]
    }));
    let run = FlowEngine::default().execute_workflow(&def, json!({})).await;
    assert_eq!(run.error.unwrap().message, "connector not found: openai");
}

#[tokio::test]
async fn test_decision_does_not_branch() {
    let def = workflow(json!({
        "id": "w",
        "steps": [
            {"id": "gate", "type": "decision", "condition": "{{score}} > 50",
             "true_path": "publish", "false_path": "rewrite"},
            {"id": "rewrite", "connector_id": "echo", "action_id": "echo"},
            {"id": "publish", "connector_id": "echo", "action_id": "echo"}
        ]
    }));

    let run = FlowEngine::default()
        .execute_workflow(&def, json!({"score": 20}))
        .await;

    assert_eq!(
        run.step_results["gate"],
        json!({"condition": "20 > 50", "result": false, "next_step": "rewrite"})
    );
    // both branches still run
    assert_eq!(run.step_results.len(), 3);
}

// =============================================================================
// Retry, timeout, credentials
// =============================================================================

#[tokio::test]
async fn test_retry_until_success() {
    let registry = ConnectorRegistry::new().with(FlakyConnector {
        calls: AtomicU32::new(0),
        succeed_on: 3,
    });
    let engine = FlowEngine::new(registry).with_config(fast_config());
    let def = workflow(json!({
        "id": "w",
        "steps": [{"id": "call", "connector_id": "flaky", "action_id": "call", "error_handling": "retry"}]
    }));

    let run = engine.execute_workflow(&def, json!({})).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results["call"], json!({"attempts": 3}));
}

#[tokio::test]
async fn test_retry_exhausted_aborts() {
    let registry = ConnectorRegistry::new().with(FlakyConnector {
        calls: AtomicU32::new(0),
        succeed_on: 100,
    });
    let engine = FlowEngine::new(registry).with_config(EngineConfig {
        retry_attempts: 2,
        ..fast_config()
    });
    let def = workflow(json!({
        "id": "w",
        "steps": [{"id": "call", "connector_id": "flaky", "action_id": "call", "error_handling": "retry"}]
    }));

    let run = engine.execute_workflow(&def, json!({})).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().message.contains("attempt 3 failed"));
}

#[tokio::test(start_paused = true)]
async fn test_connector_timeout() {
    let engine = FlowEngine::new(ConnectorRegistry::new().with(SlowConnector)).with_config(
        EngineConfig {
            connector_timeout_secs: 2,
            ..EngineConfig::default()
        },
    );
    let def = workflow(json!({
        "id": "w",
        "steps": [{"id": "wait", "connector_id": "slow", "action_id": "anything"}]
    }));

    let run = engine.execute_workflow(&def, json!({})).await;

    assert_eq!(
        run.error.unwrap().message,
        "connector 'slow' action 'anything' timed out after 2s"
    );
}

#[tokio::test]
async fn test_credentials_reach_connector() {
    let auth = json!({"api_key": "sk-test"}).as_object().cloned().unwrap();
    let engine = FlowEngine::new(ConnectorRegistry::new().with(WhoAmIConnector))
        .with_credentials(Arc::new(StaticCredentials::new().with("whoami", auth)));
    let def = workflow(json!({
        "id": "w",
        "steps": [{"id": "me", "connector_id": "whoami", "action_id": "me"}]
    }));

    let run = engine.execute_workflow(&def, json!({})).await;
    assert_eq!(run.step_results["me"], json!({"api_key": "sk-test"}));
}

// =============================================================================
// Graph workflows
// =============================================================================

fn seo_graph() -> WorkflowDefinition {
    workflow(json!({
        "id": "seo",
        "nodes": [
            {"id": "serp", "connector_id": "echo", "action_id": "echo",
             "parameters": {"keyword": "{{keyword}}", "items": [{"url": "a.com"}, {"url": "b.com"}]}},
            {"id": "summary", "connector_id": "echo", "action_id": "echo",
             "parameters": {"top": "{{summary_input.top}}"}},
            {"id": "audit", "connector_id": "echo", "action_id": "echo"}
        ],
        "connections": [
            {"source_node_id": "serp", "target_node_id": "summary",
             "mapping": [{"source": "items.0.url", "target": "top"}]},
            {"source_node_id": "serp", "target_node_id": "audit"}
        ]
    }))
}

#[tokio::test]
async fn test_graph_default_order_is_post_order() {
    let run = FlowEngine::default()
        .execute_workflow(&seo_graph(), json!({"keyword": "rust"}))
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let keys: Vec<&str> = run.step_results.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["summary", "audit", "serp"]);
    // summary ran before serp, so its input was not there yet
    assert_eq!(run.step_results["summary"]["top"], "{{summary_input.top}}");
    assert_eq!(run.context["summary_input"], json!({"top": "a.com"}));
    assert_eq!(run.context["audit_input"]["keyword"], "rust");
}

#[tokio::test]
async fn test_graph_topological_order_feeds_downstream() {
    let engine = FlowEngine::default().with_config(EngineConfig {
        graph_order: GraphOrder::Topological,
        ..EngineConfig::default()
    });

    let run = engine
        .execute_workflow(&seo_graph(), json!({"keyword": "rust"}))
        .await;

    let keys: Vec<&str> = run.step_results.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["serp", "summary", "audit"]);
    assert_eq!(run.step_results["summary"]["top"], "a.com");

    // A result is recorded before it is mapped downstream
    let context: Vec<&str> = run.context.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(
        context,
        vec!["keyword", "serp", "summary_input", "audit_input", "summary", "audit"]
    );
}

#[tokio::test]
async fn test_graph_continue_policy_skips_propagation() {
    let engine = FlowEngine::default().with_config(EngineConfig {
        graph_order: GraphOrder::Topological,
        ..EngineConfig::default()
    });
    let def = workflow(json!({
        "id": "seo",
        "nodes": [
            {"id": "serp", "connector_id": "echo", "action_id": "fail",
             "parameters": {"message": "quota exceeded"}, "error_handling": "continue"},
            {"id": "summary", "connector_id": "echo", "action_id": "echo",
             "parameters": {"top": "{{summary_input.top}}"}}
        ],
        "connections": [
            {"source": "serp", "target": "summary",
             "mapping": [{"source": "items.0.url", "target": "top"}]}
        ]
    }));

    let run = engine.execute_workflow(&def, json!({"keyword": "rust"})).await;

    assert_eq!(run.status, RunStatus::Completed);
    let keys: Vec<&str> = run.step_results.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["serp", "summary"]);
    assert_eq!(run.step_results["serp"]["success"], false);
    assert!(
        run.step_results["serp"]["error"]
            .as_str()
            .unwrap()
            .contains("quota exceeded")
    );
    assert!(run.context.get("serp").is_none());
    assert!(run.context.get("summary_input").is_none());
    assert_eq!(run.step_results["summary"]["top"], "{{summary_input.top}}");
}

#[tokio::test]
async fn test_graph_order_is_deterministic() {
    let engine = FlowEngine::default();
    let def = seo_graph();
    let first = engine.execute_workflow(&def, json!({"keyword": "x"})).await;
    for _ in 0..5 {
        let again = engine.execute_workflow(&def, json!({"keyword": "x"})).await;
        assert_eq!(
            again.step_results.keys().collect::<Vec<_>>(),
            first.step_results.keys().collect::<Vec<_>>()
        );
        assert_eq!(again.step_results, first.step_results);
    }
}

// =============================================================================
// Suspension and resumption
// =============================================================================

fn deferred_workflow() -> WorkflowDefinition {
    workflow(json!({
        "id": "deferred",
        "steps": [
            {"id": "start", "connector_id": "echo", "action_id": "echo", "params": {"k": "{{keyword}}"}},
            {"id": "serp", "connector_id": "echo", "action_id": "defer",
             "params": {"task_id": "task-{{keyword}}", "check_interval": 5}},
            {"id": "report", "type": "transformer", "template": "found {{serp.count}} for {{start.k}}"}
        ]
    }))
}

#[tokio::test]
async fn test_pending_marker_suspends_run() {
    let run = FlowEngine::default()
        .execute_workflow(&deferred_workflow(), json!({"keyword": "rust"}))
        .await;

    assert_eq!(run.status, RunStatus::Suspended);
    assert!(!run.success);
    assert_eq!(run.cursor, 1);
    let pending = run.pending.as_ref().unwrap();
    assert_eq!(pending.external_task_id, "task-rust");
    assert_eq!(pending.connector_id, "echo");
    assert_eq!(pending.action_id, "defer");
    assert_eq!(pending.step_id, "serp");
    assert_eq!(pending.check_interval_secs, 5);
    assert_eq!(run.step_results.len(), 1);
}

#[tokio::test]
async fn test_resume_after_completion() {
    let engine = FlowEngine::default();
    let def = deferred_workflow();
    let suspended = engine.execute_workflow(&def, json!({"keyword": "rust"})).await;

    let run = engine
        .resume(&def, suspended, TaskOutcome::Completed(json!({"count": 12})))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.pending.is_none());
    assert_eq!(run.step_results["serp"], json!({"count": 12}));
    assert_eq!(run.step_results["report"]["result"], "found 12 for rust");
}

#[tokio::test]
async fn test_resume_after_failure_aborts() {
    let engine = FlowEngine::default();
    let def = deferred_workflow();
    let suspended = engine.execute_workflow(&def, json!({"keyword": "rust"})).await;

    let run = engine
        .resume(&def, suspended, TaskOutcome::Failed("quota exceeded".to_string()))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.step_id, "serp");
    assert_eq!(error.message, "async task 'task-rust' failed: quota exceeded");
}

#[tokio::test]
async fn test_resume_rejects_changed_definition() {
    let engine = FlowEngine::default();
    let def = deferred_workflow();
    let suspended = engine.execute_workflow(&def, json!({"keyword": "rust"})).await;

    let mut changed = def.clone();
    changed.name = "edited".to_string();
    let err = engine
        .resume(&changed, suspended, TaskOutcome::Completed(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidWorkflow { .. }));
}

#[tokio::test]
async fn test_resume_rejects_finished_run() {
    let engine = FlowEngine::default();
    let def = workflow(json!({"id": "w", "steps": []}));
    let run = engine.execute_workflow(&def, json!({})).await;
    assert_eq!(run.status, RunStatus::Completed);

    let err = engine
        .resume(&def, run, TaskOutcome::Completed(json!({})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not suspended"));
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn test_events_are_emitted_in_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = FlowEngine::new(ConnectorRegistry::new().with(EchoConnector))
        .with_notifier(Arc::new(ChannelNotifier::new(tx)));
    let def = workflow(json!({
        "id": "w",
        "steps": [
            {"id": "a", "connector_id": "echo", "action_id": "echo"},
            {"id": "b", "connector_id": "echo", "action_id": "fail", "error_handling": "continue"}
        ]
    }));

    let run = engine.execute_workflow(&def, json!({})).await;
    drop(engine);

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        let value = serde_json::to_value(&event).unwrap();
        names.push(value["event"].as_str().unwrap().to_string());
        if let RunEvent::RunStarted { run_id, .. } = &event {
            assert_eq!(run_id, &run.run_id);
        }
    }
    assert_eq!(
        names,
        vec![
            "run_started",
            "step_started",
            "step_completed",
            "step_started",
            "step_failed",
            "run_completed"
        ]
    );
}
