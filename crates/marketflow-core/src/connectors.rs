//! Connector capability and registry
//!
//! A connector wraps one external API (OpenAI, DataForSEO, a social
//! platform). The engine only ever sees the uniform [`Connector`] interface;
//! connectors are looked up by id in a [`ConnectorRegistry`].
//!
//! Long-running actions answer with a pending marker instead of a result:
//!
//! ```json
//! { "pending": true, "task_id": "0923-1234", "check_interval": 60 }
//! ```
//!
//! The task is later polled through the connector's `task_ready` action,
//! whose response is read by [`TaskReadiness::from_response`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::processor::value::{display, scalar_text};
use crate::transforms::Params;

/// Action polled to ask whether an external task has finished
pub const TASK_READY_ACTION: &str = "task_ready";

/// Parameters an action accepts. Used by the builder, not by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSchema {
    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Parameters that must be present
    #[serde(default)]
    pub required: Vec<String>,

    /// Parameters that may be present
    #[serde(default)]
    pub optional: Vec<String>,
}

impl ActionSchema {
    /// Schema with a description only
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Add required parameters
    pub fn required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add optional parameters
    pub fn optional<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional.extend(names.into_iter().map(Into::into));
        self
    }

    /// Required parameters absent from `params`
    pub fn missing<'a>(&'a self, params: &Params) -> Vec<&'a str> {
        self.required
            .iter()
            .filter(|name| params.get(name.as_str()).is_none_or(Value::is_null))
            .map(String::as_str)
            .collect()
    }
}

/// Uniform interface over an external API integration
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registry key
    fn id(&self) -> &str;

    /// Actions this connector supports
    fn actions(&self) -> BTreeMap<String, ActionSchema>;

    /// Run one action. Any failure comes back as [`Error::Connector`] with a
    /// readable message.
    async fn execute_action(&self, action_id: &str, params: &Params, auth: &Params)
    -> Result<Value>;

    /// Whether the credentials look usable
    fn validate_auth(&self, _credentials: &Params) -> bool {
        true
    }
}

/// Connectors keyed by id
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connector, replacing any with the same id
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.id().to_string(), connector);
    }

    /// Builder form of [`ConnectorRegistry::register`]
    pub fn with(mut self, connector: impl Connector + 'static) -> Self {
        self.register(Arc::new(connector));
        self
    }

    /// Look up a connector
    pub fn get(&self, id: &str) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ConnectorNotFound {
                connector: id.to_string(),
            })
    }

    /// Whether a connector is registered
    pub fn contains(&self, id: &str) -> bool {
        self.connectors.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.ids())
            .finish()
    }
}

/// Upper bound on a connector-requested poll interval
pub const MAX_CHECK_INTERVAL_SECS: u64 = 86_400;

/// A pending marker found in an action result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMarker {
    /// External task id
    pub task_id: String,
    /// Requested poll interval, if the connector gave one
    pub check_interval_secs: Option<u64>,
}

impl PendingMarker {
    /// Read `{"pending": true, "task_id": ..}` from a result
    pub fn from_result(result: &Value) -> Option<Self> {
        let obj = result.as_object()?;
        if obj.get("pending").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        let task_id = obj.get("task_id").and_then(scalar_text)?;
        if task_id.is_empty() {
            return None;
        }
        Some(Self {
            task_id,
            check_interval_secs: obj
                .get("check_interval")
                .and_then(Value::as_u64)
                .map(|secs| secs.min(MAX_CHECK_INTERVAL_SECS)),
        })
    }
}

/// How a `task_ready` response is read
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReadiness {
    /// Finished; carries the result payload
    Ready(Value),
    /// Finished unsuccessfully
    Failed(String),
    /// Still running
    Pending,
}

impl TaskReadiness {
    /// Ready when `ready` is true or `status` is `completed`/`ready`; the
    /// payload is `result` when present, else the whole response. A
    /// `failed` status carries the response's `error` text.
    pub fn from_response(response: &Value) -> Self {
        let status = response.get("status").and_then(Value::as_str);
        let ready = response.get("ready").and_then(Value::as_bool) == Some(true)
            || matches!(status, Some("completed") | Some("ready"));
        if ready {
            let payload = response
                .get("result")
                .cloned()
                .unwrap_or_else(|| response.clone());
            return Self::Ready(payload);
        }
        if status == Some("failed") {
            let message = response
                .get("error")
                .map(display)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "task reported failure".to_string());
            return Self::Failed(message);
        }
        Self::Pending
    }
}

/// Local connector that needs no external service.
///
/// | action | behaviour |
/// |--------|-----------|
/// | `echo` | returns its parameters |
/// | `fail` | fails with `params.message` |
/// | `defer` | returns a pending marker for `params.task_id` |
/// | `task_ready` | reports the task ready with `{"id": ..}` as result |
#[derive(Debug, Clone, Default)]
pub struct EchoConnector;

#[async_trait]
impl Connector for EchoConnector {
    fn id(&self) -> &str {
        "echo"
    }

    fn actions(&self) -> BTreeMap<String, ActionSchema> {
        BTreeMap::from([
            ("echo".to_string(), ActionSchema::new("Return the parameters")),
            (
                "fail".to_string(),
                ActionSchema::new("Always fail").optional(["message"]),
            ),
            (
                "defer".to_string(),
                ActionSchema::new("Answer with a pending marker")
                    .required(["task_id"])
                    .optional(["check_interval"]),
            ),
            (
                TASK_READY_ACTION.to_string(),
                ActionSchema::new("Report a deferred task ready").required(["id"]),
            ),
        ])
    }

    async fn execute_action(
        &self,
        action_id: &str,
        params: &Params,
        _auth: &Params,
    ) -> Result<Value> {
        match action_id {
            "echo" => Ok(Value::Object(params.clone())),
            "fail" => Err(Error::connector(
                self.id(),
                params
                    .get("message")
                    .map(display)
                    .unwrap_or_else(|| "echo failure".to_string()),
            )),
            "defer" => {
                let task_id = params
                    .get("task_id")
                    .and_then(scalar_text)
                    .ok_or_else(|| Error::connector(self.id(), "defer needs a task_id"))?;
                let mut marker = json!({"pending": true, "task_id": task_id});
                if let Some(interval) = params.get("check_interval") {
                    marker["check_interval"] = interval.clone();
                }
                Ok(marker)
            }
            TASK_READY_ACTION => Ok(json!({
                "ready": true,
                "result": {"id": params.get("id").cloned().unwrap_or(Value::Null)}
            })),
            other => Err(Error::connector(
                self.id(),
                format!("unsupported action '{}'", other),
            )),
        }
    }
}
