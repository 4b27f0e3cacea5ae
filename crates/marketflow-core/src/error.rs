//! Error types for marketflow-core

use thiserror::Error;

/// Result type alias for marketflow-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in marketflow-core
#[derive(Error, Debug)]
pub enum Error {
    /// No connector is registered under the requested id
    #[error("connector not found: {connector}")]
    ConnectorNotFound {
        /// Connector id that was requested
        connector: String,
    },

    /// A step or node declared a type the engine does not know
    #[error("unknown step type: {step_type}")]
    UnknownStepType {
        /// The declared type
        step_type: String,
    },

    /// A transformation referenced a function missing from the registry
    #[error("unknown transform function: {function}")]
    UnknownTransform {
        /// Function name
        function: String,
    },

    /// A validation referenced a rule missing from the registry
    #[error("unknown validation rule: {rule}")]
    UnknownValidationRule {
        /// Rule name
        rule: String,
    },

    /// Data failed validation inside a validator step
    #[error("validation failed in '{step}': {message}")]
    Validation {
        /// Step or node id
        step: String,
        /// Joined per-field messages
        message: String,
    },

    /// A unit is missing a field it needs to run
    #[error("'{unit}' is missing required field '{field}'")]
    MissingRequiredField {
        /// Step or node id
        unit: String,
        /// Name of the missing field
        field: String,
    },

    /// An externally pending task ended in failure
    #[error("async task '{task_id}' failed: {message}")]
    AsyncTaskFailed {
        /// External task id
        task_id: String,
        /// Underlying cause
        message: String,
    },

    /// A connector call failed
    #[error("connector '{connector}' error: {message}")]
    Connector {
        /// Connector id
        connector: String,
        /// Description of the error
        message: String,
    },

    /// A transform function failed on its input
    #[error("transform error in '{transform}': {message}")]
    Transform {
        /// Transform function name
        transform: String,
        /// Description of the error
        message: String,
    },

    /// A connector call did not return in time
    #[error("connector '{connector}' action '{action}' timed out after {seconds}s")]
    Timeout {
        /// Connector id
        connector: String,
        /// Action id
        action: String,
        /// Configured limit
        seconds: u64,
    },

    /// Configuration file could not be found
    #[error("configuration file not found: {path}")]
    ConfigNotFound {
        /// Path that was searched
        path: String,
    },

    /// Failed to parse YAML configuration
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// Description of what's invalid
        message: String,
    },

    /// Workflow definition error
    #[error("invalid workflow '{workflow_id}': {message}")]
    InvalidWorkflow {
        /// Id of the workflow with the error
        workflow_id: String,
        /// Description of the error
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors that point at a broken workflow definition rather than bad
    /// runtime data. These abort a run whatever the unit's error policy says.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTransform { .. }
                | Self::UnknownValidationRule { .. }
                | Self::UnknownStepType { .. }
        )
    }

    /// Shorthand for a [`Error::Connector`] error
    pub fn connector(connector: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connector {
            connector: connector.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`Error::MissingRequiredField`] error
    pub fn missing_field(unit: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            unit: unit.into(),
            field: field.into(),
        }
    }
}
