//! CLI command implementations

use marketflow_core::{ConnectorRegistry, EchoConnector};

pub mod init;
pub mod run;
pub mod serve;
pub mod tasks;
pub mod validate;
pub mod workflow;

/// Connectors available to every command
pub fn connectors() -> ConnectorRegistry {
    ConnectorRegistry::new().with(EchoConnector)
}
