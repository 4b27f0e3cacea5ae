//! Initialize a new Marketflow project

use anyhow::Result;
use marketflow_core::config::CONFIG_FILE;
use std::fs;
use std::path::Path;

const EXAMPLE_WORKFLOW: &str = r#"{
  "id": "keyword_report",
  "name": "Keyword report",
  "description": "Example workflow using the local echo connector",
  "steps": [
    {
      "id": "fetch",
      "type": "action",
      "connector_id": "echo",
      "action_id": "echo",
      "parameters": {"keyword": "{{keyword}}", "volume": "{{volume}}"}
    },
    {
      "id": "check",
      "type": "validator",
      "input_data": "fetch",
      "validation_rules": {"keyword": [{"rule": "required"}]}
    },
    {
      "id": "normalize",
      "type": "transformer",
      "input_data": "fetch",
      "transformations": [{"field": "keyword", "function": "uppercase"}]
    },
    {
      "id": "route",
      "type": "decision",
      "condition": "{{fetch.volume}} >= 1000",
      "true_path": "publish",
      "false_path": "skip"
    },
    {
      "id": "summary",
      "type": "transformer",
      "template": "{{normalize.result.keyword}} gets {{fetch.volume}} searches"
    }
  ]
}
"#;

/// Run the init command
pub async fn run(path: &str, name: Option<&str>) -> Result<()> {
    let project_dir = Path::new(path);

    if !project_dir.exists() {
        fs::create_dir_all(project_dir)?;
    }

    // Get absolute path for deriving name
    let abs_path = project_dir.canonicalize()?;

    let project_name = match name {
        Some(n) => n.to_string(),
        None => abs_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Could not determine project name from path"))?,
    };

    if project_dir.join(CONFIG_FILE).exists() {
        anyhow::bail!(
            "Directory '{}' already contains a {}",
            project_dir.display(),
            CONFIG_FILE
        );
    }

    tracing::info!("Creating new Marketflow project: {}", project_name);

    fs::create_dir_all(project_dir.join("workflows"))?;

    let config = format!(
        r#"# Marketflow Project Configuration
name: {project_name}
version: "0.1.0"

engine:
  connector_timeout_secs: 30
  retry_attempts: 3
  retry_delay_ms: 1000
  graph_order: post_order

tasks:
  check_interval_secs: 30
  cleanup_days: 7

storage:
  mode: memory
  workflows_dir: workflows
  # mode: postgres
  # postgres_url: postgres://localhost/marketflow

# Connector credentials for local development. Prefer
# MARKETFLOW_CREDENTIALS_<CONNECTOR_ID> outside of local setups.
credentials: {{}}
"#
    );
    fs::write(project_dir.join(CONFIG_FILE), config)?;
    fs::write(
        project_dir.join("workflows/keyword_report.json"),
        EXAMPLE_WORKFLOW,
    )?;

    let gitignore = r#"# Local secrets
.env

# IDE
.idea/
.vscode/
*.swp
"#;
    fs::write(project_dir.join(".gitignore"), gitignore)?;

    tracing::info!(
        "✓ Created project '{}' at {}",
        project_name,
        abs_path.display()
    );
    tracing::info!("Next steps:");
    if path != "." {
        tracing::info!("  cd {}", project_dir.display());
    }
    tracing::info!("  marketflow validate");
    tracing::info!(r#"  marketflow run keyword_report --input '{{"keyword": "rust", "volume": 1200}}'"#);

    Ok(())
}
