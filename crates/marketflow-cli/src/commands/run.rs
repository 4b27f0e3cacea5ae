//! Run one workflow

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use marketflow_core::engine::{RunStatus, WorkflowRun};
use marketflow_core::{Config, WorkflowDefinition};
use marketflow_runtime::Runtime;
use serde_json::Value;

use super::connectors;

/// Run a workflow by id or file path and print the run
pub async fn run(
    config_path: &str,
    workflow: &str,
    input: &str,
    wait: bool,
    timeout_secs: u64,
) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    let input: Value = serde_json::from_str(input).context("--input is not valid JSON")?;

    let mut runtime = Runtime::new(config, connectors())
        .await
        .context("Failed to create runtime")?;
    if wait {
        runtime.start().await?;
    }

    let runner = runtime.runner().clone();
    let run = if workflow.ends_with(".json") && Path::new(workflow).is_file() {
        let definition = WorkflowDefinition::from_file(workflow)
            .with_context(|| format!("Failed to read workflow {workflow}"))?;
        runner.run_definition(&definition, input).await?
    } else {
        runner.run_workflow(workflow, input).await?
    };

    let run = if wait && run.status == RunStatus::Suspended {
        tracing::info!(run_id = %run.run_id, "Waiting for external task");
        wait_for(&runtime, &run.run_id, Duration::from_secs(timeout_secs)).await?
    } else {
        run
    };

    println!("{}", serde_json::to_string_pretty(&run)?);
    runtime.shutdown().await?;

    if run.status == RunStatus::Failed {
        anyhow::bail!("Workflow run {} failed", run.run_id);
    }
    Ok(())
}

async fn wait_for(runtime: &Runtime, run_id: &str, timeout: Duration) -> Result<WorkflowRun> {
    let runs = runtime.runner().runs().clone();
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(run) = runs.get(run_id).await?
                && run.is_finished()
            {
                return Ok::<_, anyhow::Error>(run);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .with_context(|| format!("Run {run_id} did not finish within {}s", timeout.as_secs()))?
}
