//! Workflow inspection commands

use anyhow::{Context, Result};
use marketflow_core::Config;

/// List all workflows
pub async fn list(config_path: &str) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    let workflows = config
        .load_workflows()
        .context("Failed to load workflows")?;

    tracing::info!("Listing {} workflows", workflows.len());
    for workflow in workflows {
        let kind = if workflow.is_graph() { "graph" } else { "steps" };
        println!(
            "{}\t{}\t{}\t{} units",
            workflow.id,
            workflow.name,
            kind,
            workflow.units().len()
        );
    }
    Ok(())
}

/// Show a workflow definition
pub async fn show(config_path: &str, id: &str) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    let workflow = config
        .load_workflows()
        .context("Failed to load workflows")?
        .into_iter()
        .find(|w| w.id == id)
        .ok_or_else(|| anyhow::anyhow!("Workflow '{}' not found", id))?;

    println!("{}", serde_json::to_string_pretty(&workflow)?);
    Ok(())
}
