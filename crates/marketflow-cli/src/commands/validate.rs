//! Validate configuration command

use anyhow::{Context, Result};
use marketflow_core::workflow::StepKind;
use marketflow_core::{Config, DataProcessor};

use super::connectors;

/// Run the validate command
pub async fn run(config_path: &str) -> Result<()> {
    tracing::info!("Validating configuration: {}", config_path);

    let config = Config::load(config_path).context("Failed to load configuration")?;

    tracing::info!("✓ Project: {}", config.project.name);
    tracing::info!("✓ Version: {}", config.project.version);
    tracing::info!("✓ Storage mode: {:?}", config.project.storage.mode);

    let workflows = config
        .load_workflows()
        .context("Failed to load workflows")?;
    let processor = DataProcessor::new();
    let registry = connectors();
    let mut failed = 0;

    for workflow in &workflows {
        let problems = workflow.validate(&processor);
        if problems.is_empty() {
            tracing::info!("✓ Workflow {} ({} units)", workflow.id, workflow.units().len());
        } else {
            failed += 1;
            for problem in &problems {
                tracing::error!(workflow_id = %workflow.id, "{}", problem);
            }
        }

        // Connectors may be registered by the host, so unknown ids only warn
        for unit in workflow.units() {
            if matches!(unit.kind(), Ok(StepKind::Action))
                && let Some(connector) = unit.connector_id.as_deref()
                && !registry.contains(connector)
            {
                tracing::warn!(
                    workflow_id = %workflow.id,
                    step_id = %unit.id,
                    connector,
                    "Connector is not registered locally"
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} workflows are invalid", failed, workflows.len());
    }

    tracing::info!("✓ Configuration is valid");
    Ok(())
}
