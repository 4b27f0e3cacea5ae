//! Async task maintenance commands

use anyhow::{Context, Result};
use marketflow_core::Config;
use marketflow_runtime::Runtime;

use super::connectors;

/// Delete settled tasks older than `days` (or `tasks.cleanup_days`)
pub async fn cleanup(config_path: &str, days: Option<u32>) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    let days = days.unwrap_or(config.project.tasks.cleanup_days);

    let runtime = Runtime::new(config, connectors())
        .await
        .context("Failed to create runtime")?;
    let deleted = runtime.manager().cleanup_old_tasks(days).await?;
    runtime.shutdown().await?;

    println!("Deleted {deleted} tasks older than {days} days");
    Ok(())
}
