//! Marketflow Core Library
//!
//! This crate provides the workflow execution core for Marketflow:
//! - Workflow definitions (linear steps or node graphs)
//! - Field mapping, transformation and validation between units
//! - Connector capability, registry and credential providers
//! - The flow engine, including suspension on external tasks
//! - Project configuration
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐     ┌────────────┐     ┌─────────────┐
//! │  Workflow  │────▶│ FlowEngine │────▶│  Connector  │
//! │   (JSON)   │     │            │◀────│  Registry   │
//! └────────────┘     └─────┬──────┘     └─────────────┘
//!                          │
//!                   ┌──────▼──────┐
//!                   │DataProcessor│
//!                   └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use marketflow_core::{FlowEngine, WorkflowDefinition};
//!
//! let workflow = WorkflowDefinition::from_file("workflows/seo.json")?;
//! let run = FlowEngine::default()
//!     .execute_workflow(&workflow, serde_json::json!({"keyword": "rust"}))
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&run)?);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod condition;
pub mod config;
pub mod connectors;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod processor;
pub mod template;
pub mod transforms;
pub mod workflow;

pub use config::{Config, ProjectConfig};
pub use connectors::{Connector, ConnectorRegistry, EchoConnector};
pub use engine::{FlowEngine, TaskOutcome, WorkflowRun};
pub use error::{Error, Result};
pub use processor::DataProcessor;
pub use workflow::WorkflowDefinition;
