//! Marketflow Runtime
//!
//! This crate hosts workflow runs for Marketflow: it keeps workflows, runs
//! and external tasks in storage, polls external tasks until they settle
//! and resumes the runs waiting on them.
//!
//! # Features
//!
//! - Async task polling with at most one check in flight per task
//! - Workflow runner with suspend/resume on external tasks
//! - In-memory, JSON directory and PostgreSQL storage
//! - One-off and recurring workflow jobs
//!
//! # Usage
//!
//! ```rust,ignore
//! use marketflow_runtime::Runtime;
//!
//! let mut runtime = Runtime::new(config, connectors).await?;
//! runtime.start().await?;
//! runtime.jobs().submit(WorkflowJob::new("seo", json!({"keyword": "rust"})))?;
//! runtime.shutdown().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod jobs;
pub mod manager;
pub mod postgres;
pub mod runner;
pub mod runtime;
pub mod storage;
pub mod tasks;

pub use error::{Error, Result};
pub use jobs::{JobScheduler, WorkflowJob};
pub use manager::{AsyncTaskManager, CheckOutcome, CheckScheduler, TaskEvent, TimerScheduler};
pub use runner::Runner;
pub use runtime::Runtime;
pub use storage::{RunStore, WorkflowStore};
pub use tasks::{AsyncTaskRecord, TaskStatus, TaskStore};
