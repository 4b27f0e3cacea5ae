//! Run records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a run stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Units are executing
    Running,
    /// Every unit ran
    Completed,
    /// A unit aborted the run
    Failed,
    /// Waiting on an external task
    Suspended,
}

impl RunStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
        }
    }

    /// Parse the wire name
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "suspended" => Self::Suspended,
            _ => return None,
        })
    }
}

/// The unit that aborted a run and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Step or node id
    pub step_id: String,
    /// Error text
    pub message: String,
}

/// External task a suspended run is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    /// Task id issued by the external API
    pub external_task_id: String,
    /// Connector that issued it
    pub connector_id: String,
    /// Action that started it
    pub action_id: String,
    /// Unit that is waiting
    pub step_id: String,
    /// Seconds between readiness checks
    pub check_interval_secs: u64,
}

/// State and results of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run id
    pub run_id: String,

    /// Workflow that was executed
    pub workflow_id: String,

    /// Fingerprint of the definition the run started with
    pub fingerprint: String,

    /// Current status
    pub status: RunStatus,

    /// True once the run completed
    pub success: bool,

    /// Result per unit id, in execution order
    pub step_results: Map<String, Value>,

    /// Input keys plus every unit result
    pub context: Value,

    /// Set when the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,

    /// Set while suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingTask>,

    /// Position in the execution plan of the next (or waiting) unit
    pub cursor: usize,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A fresh run in `running` state.
    ///
    /// Object input is merged into the top level of the context; any other
    /// non-null input is stored under `input`.
    pub fn start(workflow_id: impl Into<String>, fingerprint: impl Into<String>, input: Value) -> Self {
        let mut context = Map::new();
        match input {
            Value::Object(map) => context.extend(map),
            Value::Null => {}
            other => {
                context.insert("input".to_string(), other);
            }
        }
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            fingerprint: fingerprint.into(),
            status: RunStatus::Running,
            success: false,
            step_results: Map::new(),
            context: Value::Object(context),
            error: None,
            pending: None,
            cursor: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Store a unit result in both the results and the context
    pub fn record(&mut self, step_id: &str, result: Value) {
        self.context_insert(step_id.to_string(), result.clone());
        self.step_results.insert(step_id.to_string(), result);
    }

    /// Store a failure the unit's policy chose to carry on from
    pub fn record_captured_error(&mut self, step_id: &str, message: &str) {
        self.step_results.insert(
            step_id.to_string(),
            serde_json::json!({"success": false, "error": message}),
        );
    }

    /// Insert a top-level context key
    pub fn context_insert(&mut self, key: String, value: Value) {
        if !self.context.is_object() {
            self.context = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.context {
            map.insert(key, value);
        }
    }

    /// Mark completed
    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.success = true;
        self.pending = None;
        self.touch();
    }

    /// Mark failed at `step_id`
    pub fn fail(&mut self, step_id: &str, message: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.success = false;
        self.pending = None;
        self.error = Some(RunFailure {
            step_id: step_id.to_string(),
            message: message.into(),
        });
        self.touch();
    }

    /// Mark suspended on `task`
    pub fn suspend(&mut self, task: PendingTask) {
        self.status = RunStatus::Suspended;
        self.success = false;
        self.pending = Some(task);
        self.touch();
    }

    /// Whether the run has reached a final state
    pub fn is_finished(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
