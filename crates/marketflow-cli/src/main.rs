//! Marketflow CLI
//!
//! Developer tool for local projects: scaffold, validate and run workflows,
//! and host the runtime.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Marketflow - marketing automation workflows
#[derive(Parser)]
#[command(name = "marketflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project directory or marketflow.yaml path
    #[arg(short, long, default_value = ".", env = "MARKETFLOW_CONFIG")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new Marketflow project
    Init {
        /// Directory to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: String,

        /// Project name (defaults to directory name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Validate configuration and workflows without running
    Validate,

    /// Run one workflow and print the run as JSON
    Run {
        /// Workflow id, or path to a workflow JSON file
        workflow: String,

        /// Run input as a JSON document
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Keep polling external tasks until the run finishes
        #[arg(long)]
        wait: bool,

        /// Seconds to wait with --wait
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },

    /// Inspect workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// Host the runtime until interrupted
    Serve {
        /// Run a workflow periodically, as WORKFLOW:SECONDS
        #[arg(long = "every", value_name = "WORKFLOW:SECONDS")]
        every: Vec<String>,
    },

    /// Manage async task records
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// List all workflows
    List,

    /// Show a workflow definition
    Show {
        /// Workflow id
        id: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Delete settled tasks older than the given age
    Cleanup {
        /// Age in days (defaults to tasks.cleanup_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }

    match cli.command {
        Commands::Init { path, name } => {
            commands::init::run(&path, name.as_deref()).await?;
        }
        Commands::Validate => {
            commands::validate::run(&cli.config).await?;
        }
        Commands::Run {
            workflow,
            input,
            wait,
            timeout,
        } => {
            commands::run::run(&cli.config, &workflow, &input, wait, timeout).await?;
        }
        Commands::Workflow { command } => match command {
            WorkflowCommands::List => {
                commands::workflow::list(&cli.config).await?;
            }
            WorkflowCommands::Show { id } => {
                commands::workflow::show(&cli.config, &id).await?;
            }
        },
        Commands::Serve { every } => {
            commands::serve::run(&cli.config, &every).await?;
        }
        Commands::Tasks { command } => match command {
            TaskCommands::Cleanup { days } => {
                commands::tasks::cleanup(&cli.config, days).await?;
            }
        },
    }

    Ok(())
}
