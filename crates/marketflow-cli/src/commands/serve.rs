//! Host the runtime

use std::time::Duration;

use anyhow::{Context, Result};
use marketflow_core::Config;
use marketflow_runtime::{Runtime, WorkflowJob};
use serde_json::json;

use super::connectors;

/// Parse `WORKFLOW:SECONDS`
fn parse_every(arg: &str) -> Result<(String, Duration)> {
    let (workflow, seconds) = arg
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected WORKFLOW:SECONDS, got '{arg}'"))?;
    let seconds: u64 = seconds
        .parse()
        .with_context(|| format!("invalid interval in '{arg}'"))?;
    if workflow.is_empty() || seconds == 0 {
        anyhow::bail!("expected WORKFLOW:SECONDS with a positive interval, got '{arg}'");
    }
    Ok((workflow.to_string(), Duration::from_secs(seconds)))
}

/// Run the runtime until Ctrl+C
pub async fn run(config_path: &str, every: &[String]) -> Result<()> {
    tracing::info!("Loading configuration from {}", config_path);
    let config = Config::load(config_path).context("Failed to load configuration")?;
    tracing::info!("Project: {}", config.project.name);

    let schedules = every
        .iter()
        .map(|arg| parse_every(arg))
        .collect::<Result<Vec<_>>>()?;

    let mut runtime = Runtime::new(config, connectors())
        .await
        .context("Failed to create runtime")?;
    runtime.start().await.context("Runtime error")?;

    for (workflow, interval) in schedules {
        tracing::info!(workflow_id = %workflow, every_secs = interval.as_secs(), "Scheduling workflow");
        runtime.jobs().schedule_every(
            WorkflowJob::new(workflow, json!({})).with_source("serve"),
            interval,
        );
    }

    tracing::info!("Runtime running (press Ctrl+C to stop)");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    tracing::info!("Received shutdown signal");

    runtime.shutdown().await.context("Shutdown error")?;
    tracing::info!("Marketflow stopped");
    Ok(())
}
