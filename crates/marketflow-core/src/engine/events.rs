//! Execution events and notifiers
//!
//! The engine reports progress through an [`ExecutionNotifier`]. What
//! happens to the events (log, persist, stream to the builder UI) is up to
//! the implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Something that happened during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run began executing
    RunStarted {
        /// Run id
        run_id: String,
        /// Workflow id
        workflow_id: String,
    },

    /// A suspended run picked up again
    RunResumed {
        /// Run id
        run_id: String,
        /// Unit that was waiting
        step_id: String,
    },

    /// A unit started
    StepStarted {
        /// Run id
        run_id: String,
        /// Unit id
        step_id: String,
    },

    /// A unit produced a result
    StepCompleted {
        /// Run id
        run_id: String,
        /// Unit id
        step_id: String,
        /// The result
        result: Value,
    },

    /// A unit failed and the run carried on
    StepFailed {
        /// Run id
        run_id: String,
        /// Unit id
        step_id: String,
        /// Error text
        error: String,
    },

    /// The run is waiting on an external task
    RunSuspended {
        /// Run id
        run_id: String,
        /// Waiting unit
        step_id: String,
        /// External task id
        external_task_id: String,
    },

    /// Every unit ran
    RunCompleted {
        /// Run id
        run_id: String,
    },

    /// A unit aborted the run
    RunFailed {
        /// Run id
        run_id: String,
        /// Aborting unit
        step_id: String,
        /// Error text
        error: String,
    },
}

/// Receives [`RunEvent`]s
pub trait ExecutionNotifier: Send + Sync {
    /// Called for each event, in order
    fn notify(&self, event: RunEvent);
}

/// Discards every event
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
    fn notify(&self, _event: RunEvent) {}
}

/// Forwards events to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelNotifier {
    /// Wrap a sender
    pub fn new(sender: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { sender }
    }
}

impl ExecutionNotifier for ChannelNotifier {
    fn notify(&self, event: RunEvent) {
        // receiver may be gone
        let _ = self.sender.send(event);
    }
}
