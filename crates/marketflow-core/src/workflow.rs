//! Workflow definitions
//!
//! A workflow is either a linear list of steps or a graph of nodes joined by
//! connections. Both encodings share the same unit record; on the wire they
//! are told apart by which top-level key is populated.
//!
//! # Example
//!
//! ```json
//! {
//!   "id": "seo-report",
//!   "name": "SEO report",
//!   "nodes": [
//!     { "id": "serp", "type": "action", "connector_id": "dataforseo",
//!       "action_id": "serp_analysis", "parameters": { "keyword": "{{keyword}}" } },
//!     { "id": "summary", "connector_id": "openai", "action_id": "complete" }
//!   ],
//!   "connections": [
//!     { "source_node_id": "serp", "target_node_id": "summary",
//!       "mapping": [{ "source": "items", "target": "results" }] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::processor::DataProcessor;
use crate::transforms::{FieldMapping, Params, Transformation, ValidationRules};

/// What a unit does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Call a connector action (`action` or `connector`)
    Action,
    /// Evaluate a condition
    Decision,
    /// Render a template or run transformations
    Transformer,
    /// Validate data
    Validator,
    /// Apply a field mapping
    Mapper,
}

impl StepKind {
    /// Parse a declared `type`
    pub fn parse(step_type: &str) -> Option<Self> {
        Some(match step_type {
            "action" | "connector" => Self::Action,
            "decision" => Self::Decision,
            "transformer" => Self::Transformer,
            "validator" => Self::Validator,
            "mapper" => Self::Mapper,
            _ => return None,
        })
    }
}

/// What happens when a unit fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorHandling {
    /// Stop the run and report the error
    #[default]
    Abort,
    /// Record the error as the unit's result and carry on
    Continue,
    /// Re-run the unit a few times, then abort
    Retry,
}

impl ErrorHandling {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
            Self::Retry => "retry",
        }
    }
}

impl Serialize for ErrorHandling {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorHandling {
    /// Anything other than `abort` or `retry` lets the run continue.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref() {
            None | Some("") | Some("abort") => Self::Abort,
            Some("retry") => Self::Retry,
            Some(_) => Self::Continue,
        })
    }
}

/// A single unit of work: a linear step or a graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow
    #[serde(deserialize_with = "de_id")]
    pub id: String,

    /// Declared type, see [`StepKind`]
    #[serde(rename = "type", default = "default_step_type")]
    pub step_type: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Connector for action units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,

    /// Action for action units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,

    /// Action parameters; strings may hold `{{path}}` placeholders
    #[serde(alias = "params", default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Params,

    /// Failure policy
    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Decision condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Decision: step taken when the condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_path: Option<String>,

    /// Decision: step taken otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_path: Option<String>,

    /// Transformer template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Transformer functions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformations: Vec<Transformation>,

    /// Validator rules
    #[serde(default, skip_serializing_if = "ValidationRules::is_empty")]
    pub validation_rules: ValidationRules,

    /// Mapper entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_mapping: Vec<FieldMapping>,

    /// Data source for transformer/validator/mapper units. A string is a
    /// context path, anything else a literal. Defaults to the whole context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Value>,

    /// Fields this crate does not interpret, kept for round-tripping
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Graph nodes use the same record as linear steps
pub type NodeDefinition = StepDefinition;

fn default_step_type() -> String {
    "action".to_string()
}

impl StepDefinition {
    /// A unit of the given type with nothing else set
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            name: None,
            connector_id: None,
            action_id: None,
            parameters: Params::new(),
            error_handling: ErrorHandling::Abort,
            condition: None,
            true_path: None,
            false_path: None,
            template: None,
            transformations: Vec::new(),
            validation_rules: ValidationRules::new(),
            field_mapping: Vec::new(),
            input_data: None,
            extra: Map::new(),
        }
    }

    /// An action unit calling `connector`/`action`
    pub fn action(
        id: impl Into<String>,
        connector: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        let mut step = Self::new(id, "action");
        step.connector_id = Some(connector.into());
        step.action_id = Some(action.into());
        step
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Set the failure policy
    pub fn with_error_handling(mut self, policy: ErrorHandling) -> Self {
        self.error_handling = policy;
        self
    }

    /// Resolve the declared type
    pub fn kind(&self) -> Result<StepKind> {
        StepKind::parse(&self.step_type).ok_or_else(|| Error::UnknownStepType {
            step_type: self.step_type.clone(),
        })
    }

    /// Connector and action ids of an action unit
    pub fn connector_action(&self) -> Result<(&str, &str)> {
        let connector = non_empty(&self.connector_id)
            .ok_or_else(|| Error::missing_field(&self.id, "connector_id"))?;
        let action =
            non_empty(&self.action_id).ok_or_else(|| Error::missing_field(&self.id, "action_id"))?;
        Ok((connector, action))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Directed edge between two graph nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDefinition {
    /// Upstream node
    #[serde(alias = "source", deserialize_with = "de_id")]
    pub source_node_id: String,

    /// Downstream node
    #[serde(alias = "target", deserialize_with = "de_id")]
    pub target_node_id: String,

    /// Applied to the source node's result; empty passes it through
    #[serde(alias = "field_mapping", default, skip_serializing_if = "Vec::is_empty")]
    pub mapping: Vec<FieldMapping>,

    /// Fields this crate does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectionDefinition {
    /// Edge without a mapping
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            mapping: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Attach a field mapping
    pub fn with_mapping(mut self, mapping: Vec<FieldMapping>) -> Self {
        self.mapping = mapping;
        self
    }
}

/// The two workflow encodings
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowBody {
    /// Steps run in declared order
    Steps(Vec<StepDefinition>),
    /// Nodes ordered by the graph executor
    Graph {
        /// Graph nodes
        nodes: Vec<NodeDefinition>,
        /// Edges between them
        connections: Vec<ConnectionDefinition>,
    },
}

/// A loaded workflow. Read-only during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireWorkflow", into = "WireWorkflow")]
pub struct WorkflowDefinition {
    /// Unique id
    pub id: String,

    /// Display name
    pub name: String,

    /// Optional description
    pub description: Option<String>,

    /// Steps or graph
    pub body: WorkflowBody,

    /// Top-level fields this crate does not interpret
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct WireWorkflow {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    steps: Option<Vec<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodes: Option<Vec<NodeDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connections: Option<Vec<ConnectionDefinition>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<WireWorkflow> for WorkflowDefinition {
    fn from(wire: WireWorkflow) -> Self {
        let body = match wire.nodes {
            Some(nodes) if !nodes.is_empty() => WorkflowBody::Graph {
                nodes,
                connections: wire.connections.unwrap_or_default(),
            },
            _ => WorkflowBody::Steps(wire.steps.unwrap_or_default()),
        };
        Self {
            id: wire.id,
            name: wire.name,
            description: wire.description,
            body,
            extra: wire.extra,
        }
    }
}

impl From<WorkflowDefinition> for WireWorkflow {
    fn from(def: WorkflowDefinition) -> Self {
        let (steps, nodes, connections) = match def.body {
            WorkflowBody::Steps(steps) => (Some(steps), None, None),
            WorkflowBody::Graph { nodes, connections } => (None, Some(nodes), Some(connections)),
        };
        Self {
            id: def.id,
            name: def.name,
            description: def.description,
            steps,
            nodes,
            connections,
            extra: def.extra,
        }
    }
}

/// Accept string or numeric ids
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {}",
            other
        ))),
    }
}

impl WorkflowDefinition {
    /// A linear workflow
    pub fn steps(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            body: WorkflowBody::Steps(steps),
            extra: Map::new(),
        }
    }

    /// A graph workflow
    pub fn graph(
        id: impl Into<String>,
        nodes: Vec<NodeDefinition>,
        connections: Vec<ConnectionDefinition>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            body: WorkflowBody::Graph { nodes, connections },
            extra: Map::new(),
        }
    }

    /// Parse the JSON wire format
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    /// Steps or nodes, in declaration order
    pub fn units(&self) -> &[StepDefinition] {
        match &self.body {
            WorkflowBody::Steps(steps) => steps,
            WorkflowBody::Graph { nodes, .. } => nodes,
        }
    }

    /// Graph connections (empty for linear workflows)
    pub fn connections(&self) -> &[ConnectionDefinition] {
        match &self.body {
            WorkflowBody::Steps(_) => &[],
            WorkflowBody::Graph { connections, .. } => connections,
        }
    }

    /// Whether this is a graph workflow
    pub fn is_graph(&self) -> bool {
        matches!(self.body, WorkflowBody::Graph { .. })
    }

    /// Look up a unit by id
    pub fn unit(&self, id: &str) -> Option<&StepDefinition> {
        self.units().iter().find(|u| u.id == id)
    }

    /// SHA-256 of the canonical JSON form.
    ///
    /// Stored on suspended runs so a resume can tell the definition changed.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Static checks. Returns one message per problem; empty means valid.
    pub fn validate(&self, processor: &DataProcessor) -> Vec<String> {
        let mut problems = Vec::new();
        if self.id.trim().is_empty() {
            problems.push("workflow id is empty".to_string());
        }

        let mut seen = HashSet::new();
        for unit in self.units() {
            if !seen.insert(unit.id.as_str()) {
                problems.push(format!("duplicate unit id '{}'", unit.id));
            }
            let kind = match unit.kind() {
                Ok(kind) => kind,
                Err(e) => {
                    problems.push(format!("'{}': {}", unit.id, e));
                    continue;
                }
            };
            match kind {
                StepKind::Action => {
                    if let Err(e) = unit.connector_action() {
                        problems.push(e.to_string());
                    }
                }
                StepKind::Decision if unit.condition.is_none() => {
                    problems.push(Error::missing_field(&unit.id, "condition").to_string());
                }
                StepKind::Transformer
                    if unit.template.is_none() && unit.transformations.is_empty() =>
                {
                    problems.push(format!(
                        "'{}': transformer needs a template or transformations",
                        unit.id
                    ));
                }
                _ => {}
            }
            for t in &unit.transformations {
                if !processor.transforms().contains(&t.function_name) {
                    problems.push(format!(
                        "'{}': unknown transform function '{}'",
                        unit.id, t.function_name
                    ));
                }
            }
            for (path, rules) in unit.validation_rules.iter() {
                for rule in rules {
                    if !processor.rules().contains(&rule.rule_name) {
                        problems.push(format!(
                            "'{}': unknown validation rule '{}' on field '{}'",
                            unit.id, rule.rule_name, path
                        ));
                    }
                }
            }
        }

        for connection in self.connections() {
            for end in [&connection.source_node_id, &connection.target_node_id] {
                if !seen.contains(end.as_str()) {
                    problems.push(format!("connection references unknown node '{}'", end));
                }
            }
        }
        problems
    }

    /// [`WorkflowDefinition::validate`] as a `Result`
    pub fn ensure_valid(&self, processor: &DataProcessor) -> Result<()> {
        let problems = self.validate(processor);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidWorkflow {
                workflow_id: self.id.clone(),
                message: problems.join("; "),
            })
        }
    }
}
